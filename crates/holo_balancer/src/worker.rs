//! Dispatch worker: the single loop that moves requests through their
//! lifecycle.
//!
//! The loop owns the request registry. Lock acquisition and remote execution
//! run as futures in `inflight` and report back as [`DispatchEvent`]s, so the
//! loop never waits on a single request and many namespaces can have commands
//! submitted at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::command::{check_reply, CommandInfo};
use crate::command_log::{CommandLog, PersistedCommand};
use crate::dist_lock::{DistLockManager, LockError, ScopedDistLock};
use crate::error::SchedulerError;
use crate::registry::{Completion, RegistryView, RequestOutcome, RequestRegistry, RequestState};
use crate::remote::{RemoteCommandRequest, RemoteCommandRunner, ShardRegistry};
use crate::types::{HostAndPort, RequestId};

/// Database every balancer command is addressed to.
const ADMIN_DB: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Cancelled requests are forgotten: their records are deleted.
    Clean,
    /// Cancelled requests keep their records and are replayed by the next start.
    Interrupted,
}

pub(crate) enum WorkerMessage {
    Submit {
        request_id: RequestId,
        command: CommandInfo,
        remote_command: Value,
        completion: Completion,
    },
    Stop {
        mode: StopMode,
    },
}

/// Collaborators the worker drives.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub command_log: Arc<dyn CommandLog>,
    pub lock_manager: Arc<dyn DistLockManager>,
    pub runner: Arc<dyn RemoteCommandRunner>,
    pub shards: Arc<dyn ShardRegistry>,
    pub lock_timeout: Duration,
}

enum DispatchEvent {
    LockAcquired {
        request_id: RequestId,
        host: HostAndPort,
        lock: ScopedDistLock,
    },
    LockFailed {
        request_id: RequestId,
        error: LockError,
    },
    Finished {
        request_id: RequestId,
        outcome: RequestOutcome,
        // Held until the reply has been handled.
        lock: Option<ScopedDistLock>,
    },
}

pub(crate) struct DispatchWorker {
    ctx: WorkerContext,
    registry: RequestRegistry,
    queue: VecDeque<RequestId>,
    inflight: FuturesUnordered<BoxFuture<'static, DispatchEvent>>,
    paused: watch::Receiver<bool>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl DispatchWorker {
    pub fn new(
        ctx: WorkerContext,
        view: RegistryView,
        paused: watch::Receiver<bool>,
        rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ) -> Self {
        Self {
            ctx,
            registry: RequestRegistry::new(view),
            queue: VecDeque::new(),
            inflight: FuturesUnordered::new(),
            paused,
            rx,
        }
    }

    /// Re-admit persisted commands that have no live request.
    ///
    /// Each record is handled on its own; an unreadable one is dropped from
    /// the log without affecting the rest.
    pub fn recover(&mut self, records: Vec<PersistedCommand>) -> usize {
        let mut recovered = 0;
        for record in records {
            if self.registry.contains(record.request_id) {
                continue;
            }
            let command = match record.decode_command() {
                Ok(command) => command,
                Err(err) => {
                    tracing::warn!(
                        request_id = %record.request_id,
                        nss = %record.nss,
                        error = ?err,
                        "discarding unreadable persisted balancer command"
                    );
                    if let Err(err) = self.ctx.command_log.remove(record.request_id) {
                        tracing::warn!(
                            request_id = %record.request_id,
                            error = ?err,
                            "failed to delete unreadable persisted balancer command"
                        );
                    }
                    continue;
                }
            };
            tracing::debug!(
                request_id = %record.request_id,
                nss = %record.nss,
                shard = %record.target,
                command = command.kind().as_str(),
                "recovered persisted balancer command"
            );
            self.registry
                .admit(record.request_id, command, record.remote_command, None);
            self.queue.push_back(record.request_id);
            recovered += 1;
        }
        recovered
    }

    pub async fn run(mut self) {
        let mut paused = *self.paused.borrow_and_update();
        let mut paused_open = true;
        let mode = loop {
            if !paused {
                self.dispatch_ready();
            }

            tokio::select! {
                biased;
                msg = self.rx.recv() => match msg {
                    Some(WorkerMessage::Submit {
                        request_id,
                        command,
                        remote_command,
                        completion,
                    }) => {
                        self.registry
                            .admit(request_id, command, remote_command, Some(completion));
                        self.queue.push_back(request_id);
                    }
                    Some(WorkerMessage::Stop { mode }) => break mode,
                    // Scheduler dropped without stopping.
                    None => break StopMode::Interrupted,
                },
                Some(event) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.handle_event(event);
                }
                changed = self.paused.changed(), if paused_open => match changed {
                    Ok(()) => paused = *self.paused.borrow_and_update(),
                    Err(_) => paused_open = false,
                },
            }
        };
        self.drain(mode);
    }

    fn dispatch_ready(&mut self) {
        while let Some(request_id) = self.queue.pop_front() {
            let Some(entry) = self.registry.get(request_id) else {
                continue;
            };
            let target = entry.command.target().clone();
            let Some(host) = self.ctx.shards.host_for(&target) else {
                self.complete(request_id, Err(SchedulerError::ShardNotFound { shard: target }));
                continue;
            };

            if !entry.command.requires_distributed_lock() {
                self.submit(request_id, host, None);
                continue;
            }

            let manager = self.ctx.lock_manager.clone();
            let resource = entry.command.nss().to_string();
            let why = entry.command.lock_reason();
            let wait_for = self.ctx.lock_timeout;
            self.registry
                .set_state(request_id, RequestState::LockAcquiring);
            self.inflight.push(
                async move {
                    match ScopedDistLock::acquire(manager, &resource, &why, wait_for).await {
                        Ok(lock) => DispatchEvent::LockAcquired {
                            request_id,
                            host,
                            lock,
                        },
                        Err(error) => DispatchEvent::LockFailed { request_id, error },
                    }
                }
                .boxed(),
            );
        }
    }

    fn submit(&mut self, request_id: RequestId, host: HostAndPort, lock: Option<ScopedDistLock>) {
        let Some(entry) = self.registry.get(request_id) else {
            return;
        };
        let request = RemoteCommandRequest {
            shard: entry.command.target().clone(),
            host,
            db_name: ADMIN_DB.to_string(),
            cmd: entry.remote_command.clone(),
        };
        tracing::debug!(
            request_id = %request_id,
            nss = %entry.command.nss(),
            shard = %request.shard,
            host = %request.host,
            command = entry.command.kind().as_str(),
            recovered = entry.recovered(),
            "submitting balancer command"
        );
        self.registry.set_state(request_id, RequestState::Submitted);

        let runner = self.ctx.runner.clone();
        self.inflight.push(
            async move {
                let outcome = runner
                    .run_command(request)
                    .await
                    .map_err(SchedulerError::from);
                DispatchEvent::Finished {
                    request_id,
                    outcome,
                    lock,
                }
            }
            .boxed(),
        );
    }

    fn handle_event(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::LockAcquired {
                request_id,
                host,
                lock,
            } => self.submit(request_id, host, Some(lock)),
            DispatchEvent::LockFailed { request_id, error } => {
                if let LockError::Unavailable { message, .. } = &error {
                    tracing::warn!(
                        request_id = %request_id,
                        error = %message,
                        "lock service failure"
                    );
                }
                self.complete(request_id, Err(error.into()));
            }
            DispatchEvent::Finished {
                request_id,
                outcome,
                lock,
            } => {
                let outcome = outcome.and_then(|reply| check_reply(&reply).map(|()| reply));
                drop(lock);
                self.complete(request_id, outcome);
            }
        }
    }

    /// Terminal success or failure: answer the caller, then forget the record.
    fn complete(&mut self, request_id: RequestId, outcome: RequestOutcome) {
        if let Some(entry) = self.registry.get(request_id) {
            match &outcome {
                Ok(_) => tracing::debug!(
                    request_id = %request_id,
                    nss = %entry.command.nss(),
                    command = entry.command.kind().as_str(),
                    "balancer command completed"
                ),
                Err(err) => tracing::warn!(
                    request_id = %request_id,
                    nss = %entry.command.nss(),
                    shard = %entry.command.target(),
                    command = entry.command.kind().as_str(),
                    error = %err,
                    "balancer command failed"
                ),
            }
        }
        self.registry
            .resolve(request_id, RequestState::Completed, outcome);
        if let Err(err) = self.ctx.command_log.remove(request_id) {
            // The record stays behind and the command is re-issued on the next start.
            tracing::warn!(
                request_id = %request_id,
                error = ?err,
                "failed to delete persisted balancer command"
            );
        }
    }

    fn drain(mut self, mode: StopMode) {
        // Dropping in-flight futures releases any lock they hold.
        self.inflight = FuturesUnordered::new();
        self.queue.clear();

        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            if let WorkerMessage::Submit {
                request_id,
                command,
                remote_command,
                completion,
            } = msg
            {
                self.registry
                    .admit(request_id, command, remote_command, Some(completion));
            }
        }

        let cancelled = self.registry.len();
        for request_id in self.registry.ids() {
            if let Some(entry) = self.registry.get(request_id) {
                tracing::debug!(
                    request_id = %request_id,
                    nss = %entry.command.nss(),
                    state = ?entry.state,
                    "cancelling balancer command"
                );
            }
            if mode == StopMode::Clean {
                if let Err(err) = self.ctx.command_log.remove(request_id) {
                    tracing::warn!(
                        request_id = %request_id,
                        error = ?err,
                        "failed to delete cancelled balancer command"
                    );
                }
            }
            self.registry
                .resolve(request_id, RequestState::Cancelled, Err(SchedulerError::Cancelled));
        }
        tracing::info!(cancelled, mode = ?mode, "balancer dispatch worker stopped");
    }
}

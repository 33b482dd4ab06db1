//! Per-instrument session actor.
//!
//! Each instrument is owned by exactly one task. The actor holds the driver,
//! the current lease and the FIFO queue of waiting clients, so exclusive
//! access falls out of the ownership model instead of a lock: commands from
//! other tasks arrive as messages and are served one at a time.
//!
//! The actor also runs the fault policy. Transient transport errors during a
//! command trigger a bounded reconnect-and-retry loop; when the budget is
//! exhausted the holder and every queued waiter get `DeviceUnavailable`, the
//! lease is revoked, and the actor enters a draining phase where it keeps
//! probing the device on a capped backoff until the link comes back.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lease::{Lease, SessionToken};
use crate::config::{RetrySettings, SessionSettings};
use crate::driver::{ArgValue, CommandReply, Driver, DriverState, DriverStatus};
use crate::error::LabError;

use serde::{Deserialize, Serialize};

/// Snapshot of one instrument's session state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstrumentStatus {
    pub name: String,
    pub driver: DriverStatus,
    /// Identity of the current lease holder, if any.
    pub holder: Option<String>,
    /// Clients waiting in the FIFO queue.
    pub queue_len: usize,
    /// True while the actor is probing a failed link.
    pub draining: bool,
}

/// Messages understood by an instrument actor.
pub(crate) enum InstrumentRequest {
    Acquire {
        holder: String,
        waiter: Uuid,
        reply: oneshot::Sender<Result<SessionToken, LabError>>,
    },
    /// Withdraw a queued acquire whose client-side wait timed out.
    CancelAcquire { waiter: Uuid },
    Release {
        token: SessionToken,
        reply: oneshot::Sender<Result<(), LabError>>,
    },
    Execute {
        token: SessionToken,
        command: String,
        args: Vec<ArgValue>,
        reply: oneshot::Sender<Result<CommandReply, LabError>>,
    },
    Status {
        reply: oneshot::Sender<Result<InstrumentStatus, LabError>>,
    },
    Shutdown { reply: oneshot::Sender<()> },
}

struct Waiter {
    id: Uuid,
    holder: String,
    reply: oneshot::Sender<Result<SessionToken, LabError>>,
}

enum Phase {
    Idle,
    Leased(Lease),
    /// Link lost; probing reconnect on a capped backoff.
    Draining {
        next_attempt: Instant,
        backoff: Duration,
    },
}

pub(crate) struct InstrumentActor {
    name: String,
    driver: Box<dyn Driver>,
    rx: mpsc::Receiver<InstrumentRequest>,
    phase: Phase,
    queue: VecDeque<Waiter>,
    session: SessionSettings,
    retry: RetrySettings,
}

impl InstrumentActor {
    pub(crate) fn spawn(
        name: String,
        driver: Box<dyn Driver>,
        session: SessionSettings,
        retry: RetrySettings,
    ) -> (mpsc::Sender<InstrumentRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(session.actor_queue_depth);
        let actor = Self {
            name,
            driver,
            rx,
            phase: Phase::Idle,
            queue: VecDeque::new(),
            session,
            retry,
        };
        let handle = tokio::spawn(actor.run());
        (tx, handle)
    }

    async fn run(mut self) {
        debug!(instrument = %self.name, "session actor started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(InstrumentRequest::Shutdown { reply }) => {
                        self.shut_down().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request).await,
                    // All handles dropped.
                    None => {
                        self.shut_down().await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.on_deadline().await;
                }
            }
        }
        debug!(instrument = %self.name, "session actor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Leased(lease) => Some(lease.deadline),
            Phase::Draining { next_attempt, .. } => Some(*next_attempt),
        }
    }

    async fn handle(&mut self, request: InstrumentRequest) {
        match request {
            InstrumentRequest::Acquire { holder, waiter, reply } => {
                self.on_acquire(holder, waiter, reply).await;
            }
            InstrumentRequest::CancelAcquire { waiter } => {
                self.queue.retain(|w| w.id != waiter);
                // The grant may have raced the client-side wait timeout; a
                // cancel from the freshly granted waiter frees the lease
                // instead of stranding it until expiry.
                if matches!(&self.phase, Phase::Leased(lease) if lease.waiter == waiter) {
                    self.phase = Phase::Idle;
                    self.grant_next().await;
                }
            }
            InstrumentRequest::Release { token, reply } => {
                let _ = reply.send(self.on_release(token).await);
            }
            InstrumentRequest::Execute { token, command, args, reply } => {
                self.on_execute(token, &command, &args, reply).await;
            }
            InstrumentRequest::Status { reply } => {
                let _ = reply.send(self.on_status().await);
            }
            // Handled in run().
            InstrumentRequest::Shutdown { .. } => {}
        }
    }

    async fn on_acquire(
        &mut self,
        holder: String,
        waiter: Uuid,
        reply: oneshot::Sender<Result<SessionToken, LabError>>,
    ) {
        match &self.phase {
            Phase::Idle => {
                match self.ensure_ready().await {
                    Ok(()) => {
                        let lease = Lease::grant(holder, waiter, self.session.lease_timeout);
                        info!(
                            instrument = %self.name,
                            holder = %lease.holder,
                            token = %lease.token,
                            "session granted"
                        );
                        if reply.send(Ok(lease.token)).is_ok() {
                            self.phase = Phase::Leased(lease);
                        }
                    }
                    // Bring-up failed; the instrument stays acquirable so the
                    // next attempt retries initialization.
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Phase::Leased(_) => {
                debug!(instrument = %self.name, holder = %holder, "session busy, queueing");
                self.queue.push_back(Waiter { id: waiter, holder, reply });
            }
            Phase::Draining { .. } => {
                let _ = reply.send(Err(LabError::Unavailable(format!(
                    "'{}' is recovering from a link failure",
                    self.name
                ))));
            }
        }
    }

    async fn on_release(&mut self, token: SessionToken) -> Result<(), LabError> {
        match &self.phase {
            Phase::Leased(lease) if lease.token == token => {
                info!(instrument = %self.name, holder = %lease.holder, "session released");
                self.phase = Phase::Idle;
                self.grant_next().await;
                Ok(())
            }
            _ => Err(LabError::SessionExpired),
        }
    }

    async fn on_execute(
        &mut self,
        token: SessionToken,
        command: &str,
        args: &[ArgValue],
        reply: oneshot::Sender<Result<CommandReply, LabError>>,
    ) {
        let holds = matches!(&self.phase, Phase::Leased(lease) if lease.token == token);
        if !holds {
            let _ = reply.send(Err(LabError::SessionExpired));
            return;
        }

        match self.execute_with_retry(command, args).await {
            Ok(result) => {
                if let Phase::Leased(lease) = &mut self.phase {
                    lease.touch(self.session.lease_timeout);
                }
                let _ = reply.send(Ok(result));
            }
            Err(err @ LabError::DeviceUnavailable { .. }) => {
                // Retry budget exhausted: revoke the lease, fail everyone
                // waiting, and start probing the link.
                warn!(
                    instrument = %self.name,
                    error = %err,
                    "device unreachable, revoking session and draining queue"
                );
                for waiter in self.queue.drain(..) {
                    let _ = waiter.reply.send(Err(LabError::DeviceUnavailable {
                        attempts: self.retry.max_attempts,
                        reason: format!("'{}' is unreachable", self.name),
                    }));
                }
                self.phase = Phase::Draining {
                    next_attempt: Instant::now() + self.retry.backoff_base,
                    backoff: self.retry.backoff_base,
                };
                let _ = reply.send(Err(err));
            }
            Err(err) => {
                // Device rejections and other non-link faults do not end the
                // session.
                if let Phase::Leased(lease) = &mut self.phase {
                    lease.touch(self.session.lease_timeout);
                }
                let _ = reply.send(Err(err));
            }
        }
    }

    /// One execution plus up to `max_attempts - 1` reconnect-and-retry
    /// rounds, with exponential backoff capped at `backoff_max`.
    async fn execute_with_retry(
        &mut self,
        command: &str,
        args: &[ArgValue],
    ) -> Result<CommandReply, LabError> {
        let mut backoff = self.retry.backoff_base;
        let mut last_error: Option<LabError> = None;

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                sleep(backoff).await;
                backoff = (backoff * 2).min(self.retry.backoff_max);
                if let Err(e) = self.driver.reconnect().await {
                    warn!(
                        instrument = %self.name,
                        attempt,
                        error = %e,
                        "reconnect attempt failed"
                    );
                    last_error = Some(e);
                    continue;
                }
            }
            match self.driver.execute(command, args).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() => {
                    warn!(
                        instrument = %self.name,
                        command,
                        attempt,
                        error = %e,
                        "transient fault during command"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(LabError::DeviceUnavailable {
            attempts: self.retry.max_attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown fault".to_string()),
        })
    }

    async fn on_status(&mut self) -> Result<InstrumentStatus, LabError> {
        let driver = self.driver.query_status().await?;
        let holder = match &self.phase {
            Phase::Leased(lease) => Some(lease.holder.clone()),
            _ => None,
        };
        Ok(InstrumentStatus {
            name: self.name.clone(),
            driver,
            holder,
            queue_len: self.queue.len(),
            draining: matches!(self.phase, Phase::Draining { .. }),
        })
    }

    async fn on_deadline(&mut self) {
        match &self.phase {
            Phase::Leased(lease) => {
                warn!(
                    instrument = %self.name,
                    holder = %lease.holder,
                    "lease expired without activity, revoking"
                );
                self.phase = Phase::Idle;
                self.grant_next().await;
            }
            Phase::Draining { backoff, .. } => {
                let backoff = *backoff;
                match self.driver.reconnect().await {
                    Ok(()) => {
                        info!(instrument = %self.name, "link recovered");
                        self.phase = Phase::Idle;
                        self.grant_next().await;
                    }
                    Err(e) => {
                        let next = (backoff * 2).min(self.retry.backoff_max);
                        debug!(
                            instrument = %self.name,
                            error = %e,
                            retry_in = ?next,
                            "link still down"
                        );
                        self.phase = Phase::Draining {
                            next_attempt: Instant::now() + next,
                            backoff: next,
                        };
                    }
                }
            }
            Phase::Idle => {}
        }
    }

    /// Hand the instrument to the next live waiter, in arrival order.
    async fn grant_next(&mut self) {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            match self.ensure_ready().await {
                Ok(()) => {
                    let lease = Lease::grant(waiter.holder, waiter.id, self.session.lease_timeout);
                    info!(
                        instrument = %self.name,
                        holder = %lease.holder,
                        token = %lease.token,
                        "queued session granted"
                    );
                    if waiter.reply.send(Ok(lease.token)).is_ok() {
                        self.phase = Phase::Leased(lease);
                        return;
                    }
                }
                Err(e) => {
                    let _ = waiter.reply.send(Err(e));
                }
            }
        }
        self.phase = Phase::Idle;
    }

    /// Lazily bring the driver up; runs on first acquire and after faults.
    async fn ensure_ready(&mut self) -> Result<(), LabError> {
        match self.driver.state() {
            DriverState::Ready => Ok(()),
            DriverState::Uninitialized | DriverState::ShutDown => self.driver.initialize().await,
            DriverState::Fault => self.driver.reconnect().await,
        }
    }

    async fn shut_down(&mut self) {
        for waiter in self.queue.drain(..) {
            let _ = waiter.reply.send(Err(LabError::Unavailable(format!(
                "'{}' is shutting down",
                self.name
            ))));
        }
        self.phase = Phase::Idle;
        if let Err(e) = self.driver.shutdown().await {
            warn!(instrument = %self.name, error = %e, "driver shutdown failed");
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

//! Session management: exclusive, token-based access to instruments.
//!
//! [`SessionManager`] is the single entry point for acquiring, using and
//! releasing instruments. Each instrument is served by its own actor task
//! (see [`actor`]); the manager owns the command channels and translates
//! awaited replies into plain `Result`s for callers.
//!
//! Concurrency contract:
//! - at most one session per instrument at any time;
//! - contending acquirers wait in FIFO order, bounded by a timeout;
//! - a lease left idle past `session.lease_timeout` is revoked and the
//!   instrument passes to the next waiter;
//! - commands from a revoked or released token fail with `SessionExpired`.

pub mod actor;
pub mod lease;

pub use actor::InstrumentStatus;
pub use lease::SessionToken;

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::{RetrySettings, SessionSettings, Settings};
use crate::driver::{build_driver, ArgValue, CommandReply, Driver};
use crate::error::{AppResult, LabError};

use actor::{InstrumentActor, InstrumentRequest};

pub struct SessionManager {
    actors: HashMap<String, mpsc::Sender<InstrumentRequest>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    session: SessionSettings,
    retry: RetrySettings,
}

impl SessionManager {
    /// Manager with no instruments; populate with [`add_instrument`].
    ///
    /// [`add_instrument`]: SessionManager::add_instrument
    pub fn new(session: SessionSettings, retry: RetrySettings) -> Self {
        Self {
            actors: HashMap::new(),
            handles: Mutex::new(Vec::new()),
            session,
            retry,
        }
    }

    /// Build drivers for every configured instrument and spawn their actors.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let mut manager = Self::new(settings.session.clone(), settings.retry.clone());
        for (name, config) in &settings.instruments {
            let driver = build_driver(config, &settings.timeouts)?;
            manager.add_instrument(name, driver);
        }
        info!(
            instruments = manager.actors.len(),
            "session manager started"
        );
        Ok(manager)
    }

    /// Spawn an actor for one instrument. Replaces any existing actor under
    /// the same name.
    pub fn add_instrument(&mut self, name: &str, driver: Box<dyn Driver>) {
        let (tx, handle) = InstrumentActor::spawn(
            name.to_string(),
            driver,
            self.session.clone(),
            self.retry.clone(),
        );
        self.actors.insert(name.to_string(), tx);
        if let Ok(mut handles) = self.handles.try_lock() {
            handles.push(handle);
        }
    }

    /// Configured instrument names, unordered.
    pub fn instruments(&self) -> Vec<String> {
        self.actors.keys().cloned().collect()
    }

    /// Acquire an exclusive session, waiting in FIFO order if the instrument
    /// is held. `wait` bounds the queueing time; `None` uses the configured
    /// default. On timeout the queued request is withdrawn.
    pub async fn acquire(
        &self,
        instrument: &str,
        holder: &str,
        wait: Option<Duration>,
    ) -> AppResult<SessionToken> {
        let tx = self.actor(instrument)?;
        let waiter = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        tx.send(InstrumentRequest::Acquire {
            holder: holder.to_string(),
            waiter,
            reply,
        })
        .await
        .map_err(|_| LabError::Unavailable(instrument.to_string()))?;

        let wait = wait.unwrap_or(self.session.default_acquire_timeout);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LabError::Internal(format!(
                "session actor for '{instrument}' dropped the request"
            ))),
            Err(_) => {
                let _ = tx.send(InstrumentRequest::CancelAcquire { waiter }).await;
                Err(LabError::AcquireTimedOut(instrument.to_string()))
            }
        }
    }

    pub async fn release(&self, instrument: &str, token: SessionToken) -> AppResult<()> {
        let tx = self.actor(instrument)?;
        let (reply, rx) = oneshot::channel();
        tx.send(InstrumentRequest::Release { token, reply })
            .await
            .map_err(|_| LabError::Unavailable(instrument.to_string()))?;
        rx.await.map_err(|_| {
            LabError::Internal(format!("session actor for '{instrument}' dropped the request"))
        })?
    }

    /// Execute a command under a held session.
    pub async fn execute(
        &self,
        instrument: &str,
        token: SessionToken,
        command: &str,
        args: Vec<ArgValue>,
    ) -> AppResult<CommandReply> {
        let tx = self.actor(instrument)?;
        let (reply, rx) = oneshot::channel();
        tx.send(InstrumentRequest::Execute {
            token,
            command: command.to_string(),
            args,
            reply,
        })
        .await
        .map_err(|_| LabError::Unavailable(instrument.to_string()))?;
        rx.await.map_err(|_| {
            LabError::Internal(format!("session actor for '{instrument}' dropped the request"))
        })?
    }

    pub async fn status(&self, instrument: &str) -> AppResult<InstrumentStatus> {
        let tx = self.actor(instrument)?;
        let (reply, rx) = oneshot::channel();
        tx.send(InstrumentRequest::Status { reply })
            .await
            .map_err(|_| LabError::Unavailable(instrument.to_string()))?;
        rx.await.map_err(|_| {
            LabError::Internal(format!("session actor for '{instrument}' dropped the request"))
        })?
    }

    /// Stop every actor: queued waiters are failed, drivers shut down.
    pub async fn shutdown(&self) {
        for (name, tx) in &self.actors {
            let (reply, rx) = oneshot::channel();
            if tx.send(InstrumentRequest::Shutdown { reply }).await.is_ok() {
                let _ = rx.await;
            }
            info!(instrument = %name, "instrument actor stopped");
        }
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "instrument actor task panicked");
            }
        }
    }

    fn actor(&self, instrument: &str) -> AppResult<&mpsc::Sender<InstrumentRequest>> {
        self.actors
            .get(instrument)
            .ok_or_else(|| LabError::NotFound(instrument.to_string()))
    }
}

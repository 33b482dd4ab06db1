//! Mock transport for tests and dry runs.
//!
//! Behaves like a line-oriented instrument: queries are answered from a
//! reply table, and a step script can inject timeouts and disconnects ahead
//! of the table to exercise the retry and reconnection paths. A cloned
//! [`MockScript`] handle lets tests steer and inspect the transport after
//! ownership of the adapter has moved into a driver.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Transport, TransportError};

/// One scripted exchange step, consumed before the reply table.
#[derive(Debug, Clone)]
pub enum MockStep {
    Reply(String),
    Timeout,
    Disconnect,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    open_count: u32,
    fail_opens: u32,
    replies: HashMap<String, String>,
    script: VecDeque<MockStep>,
    sent: Vec<String>,
}

/// Test-side handle to a [`MockTransport`]'s shared state.
#[derive(Clone)]
pub struct MockScript {
    state: Arc<Mutex<MockState>>,
}

impl MockScript {
    /// Queue a scripted step ahead of the reply table.
    pub fn push(&self, step: MockStep) {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(step);
        }
    }

    /// Install or replace a canned reply for a command.
    pub fn set_reply(&self, command: &str, reply: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.replies.insert(command.to_string(), reply.to_string());
        }
    }

    /// Make the next `n` open() calls fail with a connection error.
    pub fn fail_next_opens(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_opens = n;
        }
    }

    /// Commands sent so far (trimmed).
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// How many times the channel has been opened.
    pub fn open_count(&self) -> u32 {
        self.state.lock().map(|s| s.open_count).unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().map(|s| s.open).unwrap_or(false)
    }
}

pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_replies(HashMap::new())
    }

    pub fn with_replies(replies: HashMap<String, String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                replies,
                ..MockState::default()
            })),
        }
    }

    /// Handle for scripting and inspection from tests.
    pub fn script(&self) -> MockScript {
        MockScript {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::ConnectionFailed("mock state poisoned".to_string()))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> &str {
        "mock"
    }

    fn is_open(&self) -> bool {
        self.state.lock().map(|s| s.open).unwrap_or(false)
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(TransportError::ConnectionFailed(
                "mock open failure".to_string(),
            ));
        }
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.lock()?.open = false;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        let line = String::from_utf8_lossy(bytes).trim().to_string();
        state.sent.push(line);
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        state.sent.push(command.trim().to_string());

        // Fault steps apply to writes too; reply steps wait for the next query.
        match state.script.front() {
            Some(MockStep::Timeout) => {
                state.script.pop_front();
                Err(TransportError::Timeout(Duration::from_millis(0)))
            }
            Some(MockStep::Disconnect) => {
                state.script.pop_front();
                state.open = false;
                Err(TransportError::UnexpectedEof)
            }
            _ => Ok(()),
        }
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock()?;
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        match state.script.pop_front() {
            Some(MockStep::Reply(reply)) => Ok(reply.into_bytes()),
            Some(MockStep::Timeout) | None => Err(TransportError::Timeout(timeout)),
            Some(MockStep::Disconnect) => {
                state.open = false;
                Err(TransportError::UnexpectedEof)
            }
        }
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let mut state = self.lock()?;
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        let command = command.trim().to_string();
        state.sent.push(command.clone());

        match state.script.pop_front() {
            Some(MockStep::Reply(reply)) => return Ok(reply),
            Some(MockStep::Timeout) => {
                return Err(TransportError::Timeout(Duration::from_millis(0)))
            }
            Some(MockStep::Disconnect) => {
                state.open = false;
                return Err(TransportError::UnexpectedEof);
            }
            None => {}
        }

        if let Some(reply) = state.replies.get(&command) {
            return Ok(reply.clone());
        }
        if command == "*IDN?" {
            return Ok("MOCK,LABHOST,0,1.0".to_string());
        }
        if command.ends_with('?') {
            return Ok("0".to_string());
        }
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_uses_reply_table() {
        let mut transport = MockTransport::new();
        let script = transport.script();
        script.set_reply("WAV?", "1550.0");

        transport.open().await.unwrap();
        assert_eq!(transport.query("WAV?").await.unwrap(), "1550.0");
        assert_eq!(transport.query("*IDN?").await.unwrap(), "MOCK,LABHOST,0,1.0");
        assert_eq!(script.sent(), vec!["WAV?", "*IDN?"]);
    }

    #[tokio::test]
    async fn test_scripted_timeout_then_reply() {
        let mut transport = MockTransport::new();
        let script = transport.script();
        script.push(MockStep::Timeout);
        script.push(MockStep::Reply("ok".to_string()));

        transport.open().await.unwrap();
        assert!(matches!(
            transport.query("CMD").await,
            Err(TransportError::Timeout(_))
        ));
        assert_eq!(transport.query("CMD").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_disconnect_closes_channel() {
        let mut transport = MockTransport::new();
        let script = transport.script();
        script.push(MockStep::Disconnect);

        transport.open().await.unwrap();
        assert!(matches!(
            transport.query("CMD").await,
            Err(TransportError::UnexpectedEof)
        ));
        assert!(!transport.is_open());
        assert!(matches!(
            transport.query("CMD").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failed_opens_are_counted_down() {
        let mut transport = MockTransport::new();
        let script = transport.script();
        script.fail_next_opens(2);

        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_err());
        transport.open().await.unwrap();
        assert_eq!(script.open_count(), 1);
    }
}

//! A mock transport that replays scripted responses.
//!
//! Stands in for a serial controller in tests and mock-only builds. Responses
//! are queued per command string; a latched response repeats once its queue is
//! exhausted, which is how position polls are made to converge. Every outgoing
//! command is recorded so tests can assert on exactly what reached "hardware".

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Transport, TransportError, ERROR_QUERY};

#[derive(Default)]
struct MockState {
    sent: Vec<String>,
    scripted: HashMap<String, VecDeque<String>>,
    latched: HashMap<String, String>,
}

/// Scripted in-memory transport.
///
/// Clones share state, so a test can keep one clone for assertions after
/// handing the other to a [`CommandChannel`](super::CommandChannel).
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create an empty mock. Error queries answer "0" until scripted otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for `command`.
    pub fn push_response(&self, command: &str, response: &str) {
        let mut state = self.lock();
        state
            .scripted
            .entry(command.to_string())
            .or_default()
            .push_back(response.to_string());
    }

    /// Set the response repeated for `command` once its queue is empty.
    pub fn latch_response(&self, command: &str, response: &str) {
        let mut state = self.lock();
        state
            .latched
            .insert(command.to_string(), response.to_string());
    }

    /// Every command written so far, queries included, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// True if any sent command starts with `prefix`.
    pub fn sent_with_prefix(&self, prefix: &str) -> bool {
        self.lock().sent.iter().any(|c| c.starts_with(prefix))
    }

    /// Number of sent commands starting with `prefix`.
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn next_response(&self, command: &str) -> Option<String> {
        let mut state = self.lock();
        if let Some(queue) = state.scripted.get_mut(command) {
            if let Some(response) = queue.pop_front() {
                return Some(response);
            }
        }
        if let Some(latched) = state.latched.get(command) {
            return Some(latched.clone());
        }
        if command == ERROR_QUERY {
            return Some("0".to_string());
        }
        None
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        self.lock().sent.push(command.to_string());
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.lock().sent.push(command.to_string());
        match self.next_response(command) {
            Some(response) => Ok(response),
            // An unscripted query behaves like a silent device.
            None => Err(TransportError::Timeout {
                elapsed: Duration::from_millis(0),
            }),
        }
    }
}

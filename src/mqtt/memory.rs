//! In-memory transport
//!
//! Records every request and replays a scripted queue of network events.
//! Used by the test suites to drive connections without a live broker.

use super::transport::{NetworkEvent, Transport};
use crate::error::TransportError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

/// A request the connection handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Bytes },
    Disconnect,
}

#[derive(Default)]
struct Shared {
    requests: Vec<Request>,
    script: VecDeque<Result<NetworkEvent, String>>,
    failures: Vec<Instant>,
    accept_requests: Option<usize>,
}

/// Transport half, owned by the connection
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    wakeup: Arc<Notify>,
}

/// Control half, kept by the test
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Mutex<Shared>>,
    wakeup: Arc<Notify>,
}

pub fn memory_transport() -> (MemoryTransport, MemoryRemote) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    let wakeup = Arc::new(Notify::new());
    (
        MemoryTransport {
            shared: shared.clone(),
            wakeup: wakeup.clone(),
        },
        MemoryRemote { shared, wakeup },
    )
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryRemote {
    /// Queues the next network event
    pub fn push(&self, event: NetworkEvent) {
        lock(&self.shared).script.push_back(Ok(event));
        self.wakeup.notify_one();
    }

    /// Queues a failed poll (refused or dropped connection)
    pub fn push_failure(&self, reason: &str) {
        lock(&self.shared).script.push_back(Err(reason.to_string()));
        self.wakeup.notify_one();
    }

    pub fn push_message(&self, topic: &str, payload: &[u8]) {
        self.push(NetworkEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Lets `n` more requests through, then rejects every following one
    pub fn accept_only(&self, n: usize) {
        lock(&self.shared).accept_requests = Some(n);
    }

    /// Lifts any limit set by [`Self::accept_only`]
    pub fn accept_all(&self) {
        lock(&self.shared).accept_requests = None;
    }

    pub fn requests(&self) -> Vec<Request> {
        lock(&self.shared).requests.clone()
    }

    pub fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut lock(&self.shared).requests)
    }

    /// Instants at which a scripted failure was consumed
    pub fn failure_times(&self) -> Vec<Instant> {
        lock(&self.shared).failures.clone()
    }

    pub fn pending_events(&self) -> usize {
        lock(&self.shared).script.len()
    }
}

impl MemoryTransport {
    fn record(&mut self, request: Request) -> Result<(), TransportError> {
        let mut shared = lock(&self.shared);
        if let Some(remaining) = shared.accept_requests.as_mut() {
            if *remaining == 0 {
                return Err(TransportError::Failure("request queue closed".to_string()));
            }
            *remaining -= 1;
        }
        shared.requests.push(request);
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.record(Request::Subscribe(topic.to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.record(Request::Unsubscribe(topic.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.record(Request::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        lock(&self.shared).requests.push(Request::Disconnect);
        Ok(())
    }

    fn poll(&mut self) -> impl Future<Output = Result<NetworkEvent, TransportError>> + Send {
        async move {
            loop {
                let next = {
                    let mut shared = lock(&self.shared);
                    let next = shared.script.pop_front();
                    if let Some(Err(_)) = next {
                        shared.failures.push(Instant::now());
                    }
                    next
                };
                match next {
                    Some(event) => return event.map_err(TransportError::Failure),
                    None => self.wakeup.notified().await,
                }
            }
        }
    }
}

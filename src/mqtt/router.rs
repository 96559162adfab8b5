//! Inbound message routing
//!
//! Topics are resolved once through [`match_topic`]; the resulting kind picks
//! the handler from a fixed table. Unknown topics and handler failures are
//! logged, counted and dropped. Nothing here can stop the driving loop.

use super::topic::{match_topic, BrokerId, DeviceId, TopicKind, TopicMatch};
use crate::error::{HandlerError, HubError};
use crate::handlers::{MessageHandler, RouterStats};
use bytes::Bytes;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

type HandlerFn = fn(
    &(dyn MessageHandler + 'static),
    BrokerId,
    DeviceId,
    &Bytes,
) -> Result<(), HandlerError>;

/// Handler for each inbound kind; outbound kinds have none
fn handler_for(kind: TopicKind) -> Option<HandlerFn> {
    match kind {
        TopicKind::SysGreet => Some(<dyn MessageHandler as MessageHandler>::on_sys_greeting),
        TopicKind::BioInfo => Some(<dyn MessageHandler as MessageHandler>::on_bio_info),
        TopicKind::AutoAction => Some(<dyn MessageHandler as MessageHandler>::on_auto_action),
        TopicKind::Greet | TopicKind::Action | TopicKind::Setting => None,
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    handler: Arc<dyn MessageHandler>,
    stats: Arc<RouterStats>,
}

impl MessageRouter {
    pub fn new(handler: Arc<dyn MessageHandler>, stats: Arc<RouterStats>) -> Self {
        Self { handler, stats }
    }

    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    /// Dispatches one inbound message.
    ///
    /// The error is informational; it has already been logged and counted.
    pub fn route(&self, broker: BrokerId, topic: &str, payload: &Bytes) -> Result<(), HubError> {
        let (kind, device, handler) = match match_topic(topic) {
            Some(TopicMatch::Device(kind, device)) => match handler_for(kind) {
                Some(handler) => (kind, device, handler),
                None => return Err(self.unroutable(broker, topic)),
            },
            _ => return Err(self.unroutable(broker, topic)),
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler(self.handler.as_ref(), broker, device, payload)
        }))
        .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

        match outcome {
            Ok(()) => {
                self.stats.routed.fetch_add(1, Ordering::Relaxed);
                debug!(broker = %broker, device = %device, kind = %kind, "Routed message");
                Ok(())
            }
            Err(source) => {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                let err = HubError::HandlerFailure {
                    kind,
                    device,
                    source,
                };
                warn!(broker = %broker, "{}", err);
                Err(err)
            }
        }
    }

    fn unroutable(&self, broker: BrokerId, topic: &str) -> HubError {
        self.stats.unroutable.fetch_add(1, Ordering::Relaxed);
        warn!(broker = %broker, topic = %topic, "Dropping message on unroutable topic");
        HubError::UnroutableTopic(topic.to_string())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

//! Push delivery: hand a notification payload to the external push-delivery
//! provider and classify the outcome.
//!
//! Delivery is strictly best-effort.  Transient provider failures are logged
//! and dropped: a per-notification retry combined with multiple relay sources
//! could double-notify, and a lost notification is acceptable because clients
//! also maintain a foreground in-app delivery path.  A permanently-gone
//! endpoint removes the registration so dead devices stop being aggregated
//! into relay filters.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::logging;
use crate::registry::{PushEndpoint, Subscriber, SubscriberRegistry};

/// What happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Payload handed to the provider.
    Delivered,
    /// Provider reported the endpoint no longer exists; the registration has
    /// been removed.
    PermanentlyInvalid,
    /// Provider unreachable, rate-limited, or timed out.  Logged and dropped.
    TransientFailure,
}

/// JSON payload handed to the provider.  The bridge cannot read message
/// contents (they are end-to-end encrypted), so the text is generic and the
/// `data` map carries just enough for the client to focus the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub tag: String,
    pub data: Value,
}

pub struct PushDispatcher {
    timeout: Duration,
    registry: Arc<SubscriberRegistry>,
    refresh_tx: UnboundedSender<Vec<String>>,
}

impl PushDispatcher {
    /// `refresh_tx` receives the affected relay urls whenever a permanent
    /// failure removes a registration, so the owning bridge can re-issue
    /// filters without the dead subscriber.
    pub fn new(
        timeout: Duration,
        registry: Arc<SubscriberRegistry>,
        refresh_tx: UnboundedSender<Vec<String>>,
    ) -> Self {
        Self {
            timeout,
            registry,
            refresh_tx,
        }
    }

    /// Deliver one notification.  The provider call runs on the blocking
    /// pool so a slow provider never stalls the relay task that matched the
    /// event.
    pub async fn deliver(
        &self,
        subscriber: &Subscriber,
        payload: NotificationPayload,
    ) -> DeliveryOutcome {
        let endpoint = subscriber.endpoint.clone();
        let timeout = self.timeout;
        let outcome =
            tokio::task::spawn_blocking(move || post_notification(&endpoint, &payload, timeout))
                .await
                .unwrap_or(DeliveryOutcome::TransientFailure);

        if outcome == DeliveryOutcome::PermanentlyInvalid {
            let affected = self
                .registry
                .remove_on_permanent_failure(&subscriber.subscriber_id);
            crate::nlog!(
                "push: endpoint gone for {}, registration removed",
                logging::sub_id(&subscriber.subscriber_id)
            );
            if !affected.is_empty() {
                let _ = self.refresh_tx.send(affected);
            }
        }

        outcome
    }
}

fn post_notification(
    endpoint: &PushEndpoint,
    payload: &NotificationPayload,
    timeout: Duration,
) -> DeliveryOutcome {
    let body = match serde_json::to_value(payload) {
        Ok(body) => body,
        Err(error) => {
            crate::nlog!("push: failed to serialize payload: {}", error);
            return DeliveryOutcome::TransientFailure;
        }
    };

    match ureq::post(&endpoint.url).timeout(timeout).send_json(body) {
        Ok(_) => DeliveryOutcome::Delivered,
        Err(ureq::Error::Status(404 | 410, _)) => DeliveryOutcome::PermanentlyInvalid,
        Err(ureq::Error::Status(code, _)) => {
            crate::nlog!("push: provider returned {} for {}", code, endpoint.url);
            DeliveryOutcome::TransientFailure
        }
        Err(error) => {
            crate::nlog!("push: delivery failed: {}", error);
            DeliveryOutcome::TransientFailure
        }
    }
}

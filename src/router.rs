//! Event routing: match one inbound relay event to every interested
//! subscriber and dispatch at most one notification per pair.
//!
//! Invoked once per event per relay connection, from each relay's own task.
//! The router never iterates relay connections: interest is resolved through
//! the registry's channel index, and cross-relay duplicates are suppressed by
//! the dedup table.  Deliveries are spawned so they complete independently of
//! the connection that triggered them.

use std::sync::Arc;

use crate::dedup::{DedupDecision, DedupTable};
use crate::logging;
use crate::protocol::Event;
use crate::push::{NotificationPayload, PushDispatcher};
use crate::registry::SubscriberRegistry;

const NOTIFICATION_TITLE: &str = "New message";
const NOTIFICATION_BODY: &str = "You have a new message";

pub struct EventRouter {
    registry: Arc<SubscriberRegistry>,
    dedup: Arc<DedupTable>,
    dispatcher: Arc<PushDispatcher>,
}

impl EventRouter {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        dedup: Arc<DedupTable>,
        dispatcher: Arc<PushDispatcher>,
    ) -> Self {
        Self {
            registry,
            dedup,
            dispatcher,
        }
    }

    /// Route one event delivered by `source_relay`.  Returns how many
    /// notifications were dispatched.
    pub fn route(&self, event: &Event, source_relay: &str) -> usize {
        let Some(channel_id) = event.channel_id() else {
            // Identity-tagged events without a channel (e.g. welcomes) are
            // matched relay-side but carry nothing the router can key on.
            return 0;
        };

        let interested = self.registry.find_interested(channel_id);
        if interested.is_empty() {
            return 0;
        }

        let mut dispatched = 0;
        for subscriber in interested {
            // Never notify a user about their own action.
            if subscriber.subscriber_id == event.pubkey {
                continue;
            }
            match self
                .dedup
                .record(&event.id, &subscriber.subscriber_id, source_relay)
            {
                DedupDecision::Fresh => {}
                DedupDecision::Duplicate { first_relay } => {
                    crate::nlog!(
                        "route: duplicate of {} for {} via {} (first seen via {})",
                        logging::event_id(&event.id),
                        logging::sub_id(&subscriber.subscriber_id),
                        source_relay,
                        first_relay
                    );
                    continue;
                }
            }

            let payload = notification_payload(event, channel_id);
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                dispatcher.deliver(&subscriber, payload).await;
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            crate::nlog!(
                "route: event {} on channel {} -> {} notification(s)",
                logging::event_id(&event.id),
                channel_id,
                dispatched
            );
        }
        dispatched
    }
}

fn notification_payload(event: &Event, channel_id: &str) -> NotificationPayload {
    NotificationPayload {
        title: NOTIFICATION_TITLE.to_string(),
        body: NOTIFICATION_BODY.to_string(),
        // Collapse key: one visible notification per conversation.
        tag: channel_id.to_string(),
        data: serde_json::json!({
            "event_id": event.id,
            "channel_id": channel_id,
        }),
    }
}

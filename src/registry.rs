//! Subscriber registry: the authoritative mapping from subscriber to
//! interest set (channels, relays, push endpoint).
//!
//! The registry is a shared, internally-synchronized service invoked from the
//! HTTP surface and from every relay task.  Mutations return the set of relay
//! urls whose aggregate filter they affected so the caller can re-issue
//! subscriptions; the registry itself never talks to relays.  A channel →
//! subscriber index is maintained alongside the record map so per-event
//! lookups never scan the full registry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::util::now_secs;

/// Opaque push-delivery-provider handle for one device registration.
///
/// Replaced wholesale on re-subscribe; the bridge never edits individual
/// fields.  The key material is forwarded to the provider as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEndpoint {
    pub url: String,
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub p256dh: String,
}

/// One end-user device registration.
#[derive(Debug, Clone, Serialize)]
pub struct Subscriber {
    pub subscriber_id: String,
    pub endpoint: PushEndpoint,
    pub channel_ids: HashSet<String>,
    pub relay_urls: HashSet<String>,
    pub registered_at: u64,
}

/// Input to [`SubscriberRegistry::subscribe`].
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub subscriber_id: String,
    pub endpoint: PushEndpoint,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    pub relay_urls: Vec<String>,
}

/// Rejection reasons for a subscribe call.  Nothing is mutated when one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidRequest {
    EmptySubscriberId,
    EmptyEndpoint,
    NoRelays,
}

impl std::fmt::Display for InvalidRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidRequest::EmptySubscriberId => write!(f, "subscriber_id must not be empty"),
            InvalidRequest::EmptyEndpoint => write!(f, "endpoint url must not be empty"),
            InvalidRequest::NoRelays => write!(f, "relay_urls must not be empty"),
        }
    }
}

impl std::error::Error for InvalidRequest {}

/// Union of interest across all subscribers referencing one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInterest {
    pub channels: BTreeSet<String>,
    pub recipients: BTreeSet<String>,
}

#[derive(Default)]
struct RegistryInner {
    subscribers: HashMap<String, Arc<Subscriber>>,
    by_channel: HashMap<String, HashSet<String>>,
}

pub struct SubscriberRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Insert or wholesale-replace a subscriber record.
    ///
    /// Returns the relay urls whose aggregate filter changed: the new relay
    /// set plus, when replacing, the old one, so relays the subscriber
    /// dropped stop carrying its interest.
    pub fn subscribe(&self, request: SubscribeRequest) -> Result<Vec<String>, InvalidRequest> {
        if request.subscriber_id.trim().is_empty() {
            return Err(InvalidRequest::EmptySubscriberId);
        }
        if request.endpoint.url.trim().is_empty() {
            return Err(InvalidRequest::EmptyEndpoint);
        }
        let relay_urls: HashSet<String> = request
            .relay_urls
            .into_iter()
            .filter(|url| !url.trim().is_empty())
            .collect();
        if relay_urls.is_empty() {
            return Err(InvalidRequest::NoRelays);
        }

        let subscriber = Arc::new(Subscriber {
            subscriber_id: request.subscriber_id,
            endpoint: request.endpoint,
            channel_ids: request.channel_ids.into_iter().collect(),
            relay_urls,
            registered_at: now_secs(),
        });

        let mut affected: BTreeSet<String> = subscriber.relay_urls.iter().cloned().collect();
        {
            let mut inner = self.inner.write().unwrap();
            let RegistryInner {
                subscribers,
                by_channel,
            } = &mut *inner;
            if let Some(old) = subscribers.remove(&subscriber.subscriber_id) {
                deindex(by_channel, &old);
                affected.extend(old.relay_urls.iter().cloned());
            }
            for channel in &subscriber.channel_ids {
                by_channel
                    .entry(channel.clone())
                    .or_default()
                    .insert(subscriber.subscriber_id.clone());
            }
            subscribers.insert(subscriber.subscriber_id.clone(), subscriber);
        }
        Ok(affected.into_iter().collect())
    }

    /// Remove a subscriber.  Idempotent: an absent subscriber returns an
    /// empty affected-relay list rather than an error.
    pub fn unsubscribe(&self, subscriber_id: &str) -> Vec<String> {
        let mut inner = self.inner.write().unwrap();
        let RegistryInner {
            subscribers,
            by_channel,
        } = &mut *inner;
        let Some(old) = subscribers.remove(subscriber_id) else {
            return Vec::new();
        };
        deindex(by_channel, &old);
        let affected: BTreeSet<String> = old.relay_urls.iter().cloned().collect();
        affected.into_iter().collect()
    }

    /// Remove a registration whose push endpoint the provider reported gone.
    /// Same effect as [`unsubscribe`](Self::unsubscribe).
    pub fn remove_on_permanent_failure(&self, subscriber_id: &str) -> Vec<String> {
        self.unsubscribe(subscriber_id)
    }

    /// All subscribers interested in a channel.  Indexed lookup; called once
    /// per inbound event.
    pub fn find_interested(&self, channel_id: &str) -> Vec<Arc<Subscriber>> {
        let inner = self.inner.read().unwrap();
        let Some(ids) = inner.by_channel.get(channel_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.subscribers.get(id).cloned())
            .collect()
    }

    /// Consistent snapshot of the interest union for one relay, for filter
    /// aggregation.  Holds the read lock for the duration of one scan; no
    /// lock spans more than one relay.
    pub fn relay_interest(&self, relay_url: &str) -> RelayInterest {
        let inner = self.inner.read().unwrap();
        let mut channels = BTreeSet::new();
        let mut recipients = BTreeSet::new();
        for subscriber in inner.subscribers.values() {
            if !subscriber.relay_urls.contains(relay_url) {
                continue;
            }
            channels.extend(subscriber.channel_ids.iter().cloned());
            recipients.insert(subscriber.subscriber_id.clone());
        }
        RelayInterest {
            channels,
            recipients,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read().unwrap().subscribers.len()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn deindex(by_channel: &mut HashMap<String, HashSet<String>>, subscriber: &Subscriber) {
    for channel in &subscriber.channel_ids {
        if let Some(ids) = by_channel.get_mut(channel) {
            ids.remove(&subscriber.subscriber_id);
            if ids.is_empty() {
                by_channel.remove(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> PushEndpoint {
        PushEndpoint {
            url: url.to_string(),
            auth: "auth-key".to_string(),
            p256dh: "p256dh-key".to_string(),
        }
    }

    fn request(subscriber_id: &str, channels: &[&str], relays: &[&str]) -> SubscribeRequest {
        SubscribeRequest {
            subscriber_id: subscriber_id.to_string(),
            endpoint: endpoint("https://push.example/token"),
            channel_ids: channels.iter().map(|c| c.to_string()).collect(),
            relay_urls: relays.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn subscribe_rejects_empty_fields() {
        let registry = SubscriberRegistry::new();

        let result = registry.subscribe(request("", &["c1"], &["r1"]));
        assert_eq!(result, Err(InvalidRequest::EmptySubscriberId));

        let mut req = request("alice", &["c1"], &["r1"]);
        req.endpoint = endpoint("  ");
        assert_eq!(registry.subscribe(req), Err(InvalidRequest::EmptyEndpoint));

        let result = registry.subscribe(request("alice", &["c1"], &[]));
        assert_eq!(result, Err(InvalidRequest::NoRelays));

        // Nothing was mutated by the rejected calls.
        assert_eq!(registry.subscriber_count(), 0);
        assert!(registry.find_interested("c1").is_empty());
    }

    #[test]
    fn subscribe_indexes_by_channel() {
        let registry = SubscriberRegistry::new();
        registry
            .subscribe(request("alice", &["c1", "c2"], &["r1"]))
            .unwrap();
        registry.subscribe(request("bob", &["c2"], &["r1"])).unwrap();

        assert_eq!(registry.find_interested("c1").len(), 1);
        assert_eq!(registry.find_interested("c2").len(), 2);
        assert!(registry.find_interested("c3").is_empty());
    }

    #[test]
    fn duplicate_channels_and_relays_collapse() {
        let registry = SubscriberRegistry::new();
        let affected = registry
            .subscribe(request("alice", &["c1", "c1"], &["r1", "r1"]))
            .unwrap();
        assert_eq!(affected, vec!["r1".to_string()]);
        let interest = registry.relay_interest("r1");
        assert_eq!(interest.channels.len(), 1);
    }

    #[test]
    fn resubscribe_replaces_wholesale_and_reports_dropped_relays() {
        let registry = SubscriberRegistry::new();
        registry
            .subscribe(request("alice", &["c1"], &["r1", "r2"]))
            .unwrap();

        let affected = registry
            .subscribe(request("alice", &["c2"], &["r2", "r3"]))
            .unwrap();
        // Dropped r1 must also be refreshed so it stops carrying alice.
        assert_eq!(
            affected,
            vec!["r1".to_string(), "r2".to_string(), "r3".to_string()]
        );

        assert!(registry.find_interested("c1").is_empty());
        assert_eq!(registry.find_interested("c2").len(), 1);
        assert!(registry.relay_interest("r1").recipients.is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = SubscriberRegistry::new();
        registry
            .subscribe(request("alice", &["c1"], &["r1", "r2"]))
            .unwrap();

        let affected = registry.unsubscribe("alice");
        assert_eq!(affected, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(registry.subscriber_count(), 0);
        assert!(registry.find_interested("c1").is_empty());

        assert!(registry.unsubscribe("alice").is_empty());
        assert!(registry.unsubscribe("never-existed").is_empty());
    }

    #[test]
    fn permanent_failure_removal_matches_unsubscribe() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(request("bob", &["c1"], &["r1"])).unwrap();

        let affected = registry.remove_on_permanent_failure("bob");
        assert_eq!(affected, vec!["r1".to_string()]);
        assert!(registry.find_interested("c1").is_empty());
    }

    #[test]
    fn relay_interest_covers_exactly_referencing_subscribers() {
        let registry = SubscriberRegistry::new();
        registry
            .subscribe(request("alice", &["c1"], &["r1", "r2"]))
            .unwrap();
        registry.subscribe(request("bob", &["c2"], &["r2"])).unwrap();

        let r1 = registry.relay_interest("r1");
        assert_eq!(r1.channels, BTreeSet::from(["c1".to_string()]));
        assert_eq!(r1.recipients, BTreeSet::from(["alice".to_string()]));

        let r2 = registry.relay_interest("r2");
        assert_eq!(
            r2.channels,
            BTreeSet::from(["c1".to_string(), "c2".to_string()])
        );
        assert_eq!(
            r2.recipients,
            BTreeSet::from(["alice".to_string(), "bob".to_string()])
        );

        let unknown = registry.relay_interest("r9");
        assert!(unknown.channels.is_empty());
        assert!(unknown.recipients.is_empty());
    }
}

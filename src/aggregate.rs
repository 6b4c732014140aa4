//! Filter aggregation: collapse all per-subscriber interest referencing one
//! relay into the single subscription filter that connection carries.

use crate::protocol::{Filter, GROUP_MESSAGE_KIND, WELCOME_KIND};
use crate::registry::SubscriberRegistry;
use crate::util::now_secs;

/// Compute the aggregate filter for one relay.
///
/// `since` is the computation time: the bridge never requests backfilled
/// history, because notifications are only meaningful for live events and a
/// replay would race the dedup window with stale matches.  An empty interest
/// set still yields a valid (no-op) filter so the relay-side subscription
/// always exists.
///
/// Recomputing against an unchanged registry returns an identical filter
/// apart from `since`, so a re-send is always safe.
pub fn relay_filter(registry: &SubscriberRegistry, relay_url: &str) -> Filter {
    let interest = registry.relay_interest(relay_url);
    Filter {
        kinds: vec![WELCOME_KIND, GROUP_MESSAGE_KIND],
        channels: interest.channels,
        recipients: interest.recipients,
        since: now_secs(),
    }
}

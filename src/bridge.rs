//! The bridge: owns the registry, the router, and the relay link set, and
//! wires registry mutations to filter re-issue on every affected relay.
//!
//! All connection and subscriber state lives in explicit owned services with
//! internal synchronization; there are no ambient globals.  The subscribe /
//! unsubscribe entry points are the observer seam: every mutation reports the
//! relays it touched and the bridge synchronously recomputes and re-issues
//! those relays' filters.  Permanent push failures discovered inside delivery
//! tasks arrive over a refresh queue and take the same path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::aggregate::relay_filter;
use crate::config::Config;
use crate::dedup::DedupTable;
use crate::link::{LinkConfig, RelayLink};
use crate::push::PushDispatcher;
use crate::registry::{InvalidRequest, SubscribeRequest, SubscriberRegistry};
use crate::router::EventRouter;

/// Read-only snapshot for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub subscribers: usize,
    pub relays: Vec<RelayStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub url: String,
    pub state: &'static str,
}

pub struct Bridge {
    config: Config,
    registry: Arc<SubscriberRegistry>,
    router: Arc<EventRouter>,
    links: RwLock<HashMap<String, RelayLink>>,
    sweeper_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Bridge {
    /// Construct the bridge and spawn its background tasks (dedup sweeper and
    /// the permanent-failure refresh drain).  Requires a running tokio
    /// runtime.
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Arc::new(SubscriberRegistry::new());
        let dedup = Arc::new(DedupTable::new(config.dedup_retention()));
        let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(PushDispatcher::new(
            config.push_timeout(),
            Arc::clone(&registry),
            refresh_tx,
        ));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            Arc::clone(&dedup),
            dispatcher,
        ));

        let (sweeper_tx, sweeper_rx) = oneshot::channel();
        let sweep_every = (config.dedup_retention() / 2).max(Duration::from_secs(1));
        dedup.spawn_sweeper(sweep_every, sweeper_rx);

        let bridge = Arc::new(Self {
            config,
            registry,
            router,
            links: RwLock::new(HashMap::new()),
            sweeper_shutdown: Mutex::new(Some(sweeper_tx)),
        });

        // Drain filter refreshes queued by delivery tasks.  Holds only a weak
        // handle: the drain exits once the bridge (and with it the dispatcher
        // side of the queue) is gone.
        let weak = Arc::downgrade(&bridge);
        tokio::spawn(async move {
            while let Some(affected) = refresh_rx.recv().await {
                let Some(bridge) = weak.upgrade() else { break };
                bridge.refresh_filters(&affected).await;
            }
        });

        bridge
    }

    /// Register or wholesale-replace a subscriber, then re-issue filters on
    /// every relay the change touched.  Links for newly-referenced relays are
    /// created here, on first reference.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<(), InvalidRequest> {
        let subscriber_id = request.subscriber_id.clone();
        let affected = self.registry.subscribe(request)?;
        crate::nlog!(
            "subscribe: {} across {} relay(s)",
            crate::logging::sub_id(&subscriber_id),
            affected.len()
        );
        self.refresh_filters(&affected).await;
        Ok(())
    }

    /// Remove a subscriber (idempotent) and re-issue filters on the relays it
    /// referenced.  Links stay up with an empty filter.
    pub async fn unsubscribe(&self, subscriber_id: &str) {
        let affected = self.registry.unsubscribe(subscriber_id);
        if affected.is_empty() {
            return;
        }
        crate::nlog!(
            "unsubscribe: {} ({} relay(s) affected)",
            crate::logging::sub_id(subscriber_id),
            affected.len()
        );
        self.refresh_filters(&affected).await;
    }

    /// Recompute and push the aggregate filter for each listed relay,
    /// creating links for relays seen for the first time.
    async fn refresh_filters(&self, relay_urls: &[String]) {
        let mut links = self.links.write().await;
        for url in relay_urls {
            match links.get(url) {
                Some(link) => link.update_filter(relay_filter(&self.registry, url)),
                None => {
                    crate::nlog!("relay {}: first reference, opening link", url);
                    let link = RelayLink::spawn(
                        url.clone(),
                        Arc::clone(&self.registry),
                        Arc::clone(&self.router),
                        self.link_config(),
                    );
                    links.insert(url.clone(), link);
                }
            }
        }
    }

    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: self.config.connect_timeout(),
            reconnect_delay_secs: self.config.reconnect_delay_secs,
            reconnect_max_delay_secs: self.config.reconnect_max_delay_secs,
        }
    }

    /// Read-only snapshot: subscriber count and per-relay connection state.
    pub async fn stats(&self) -> BridgeStats {
        let links = self.links.read().await;
        let mut relays: Vec<RelayStats> = links
            .values()
            .map(|link| RelayStats {
                url: link.url().to_string(),
                state: link.state().as_str(),
            })
            .collect();
        relays.sort_by(|a, b| a.url.cmp(&b.url));
        BridgeStats {
            subscribers: self.registry.subscriber_count(),
            relays,
        }
    }

    /// Administrative shutdown: stop the sweeper and close every link.
    /// Pending connects and reads are cancelled; in-flight deliveries run to
    /// completion on their own tasks.
    pub async fn shutdown(&self) {
        if let Some(sweeper_tx) = self.sweeper_shutdown.lock().unwrap().take() {
            let _ = sweeper_tx.send(());
        }
        let mut links = self.links.write().await;
        let count = links.len();
        for (_, link) in links.drain() {
            link.close();
        }
        if count > 0 {
            crate::nlog!("shutdown: closed {} relay link(s)", count);
        }
    }
}

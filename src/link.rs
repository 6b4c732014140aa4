//! One managed WebSocket connection to one relay.
//!
//! Each link runs in its own task so a slow or wedged relay never blocks
//! processing of other relays' events.  The connection walks
//! `Disconnected → Connecting → Connected` and drops back to `Disconnected`
//! on any socket error or relay-initiated close, then reconnects after a
//! bounded exponential backoff, forever.  There is no give-up state: links
//! are torn down only by administrative shutdown, and an empty interest set
//! keeps the link alive with a no-op filter, since a subscriber may reappear.
//!
//! On every (re)connect the link recomputes the relay's aggregate filter and
//! sends a fresh `REQ` before reading: a reconnected link never assumes
//! relay-side subscription state survived the outage.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use rand::rngs::OsRng;
use rand::RngCore as _;
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::aggregate::relay_filter;
use crate::protocol::{close_frame, subscribe_frame, Filter, RelayFrame};
use crate::registry::SubscriberRegistry;
use crate::router::EventRouter;

/// Connection state, as reported by the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        }
    }
}

/// Reconnect and timeout tuning for a link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connect_timeout: Duration,
    pub reconnect_delay_secs: u64,
    pub reconnect_max_delay_secs: u64,
}

struct LinkShared {
    url: String,
    state: Mutex<LinkState>,
    active_filter: Mutex<Option<Filter>>,
}

impl LinkShared {
    fn set_state(&self, state: LinkState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_filter(&self, filter: Option<Filter>) {
        *self.active_filter.lock().unwrap() = filter;
    }
}

/// Handle to a spawned relay connection task.
pub struct RelayLink {
    shared: Arc<LinkShared>,
    filter_tx: watch::Sender<Filter>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl RelayLink {
    /// Spawn the connection task for `url`.  The task owns its socket and
    /// reconnect loop; this handle only observes state and pushes commands.
    pub fn spawn(
        url: String,
        registry: Arc<SubscriberRegistry>,
        router: Arc<EventRouter>,
        config: LinkConfig,
    ) -> Self {
        let shared = Arc::new(LinkShared {
            url,
            state: Mutex::new(LinkState::Disconnected),
            active_filter: Mutex::new(None),
        });
        let (filter_tx, filter_rx) = watch::channel(relay_filter(&registry, &shared.url));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(run_link(
            Arc::clone(&shared),
            registry,
            router,
            config,
            filter_rx,
            shutdown_rx,
        ));

        Self {
            shared,
            filter_tx,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.lock().unwrap()
    }

    /// The filter last sent on this connection, if currently connected.
    pub fn active_filter(&self) -> Option<Filter> {
        self.shared.active_filter.lock().unwrap().clone()
    }

    /// Push a recomputed aggregate filter to the connection.  While
    /// disconnected the value is simply superseded: the reconnect path
    /// recomputes a fresh filter of its own.
    pub fn update_filter(&self, filter: Filter) {
        let _ = self.filter_tx.send(filter);
    }

    /// Administrative shutdown: cancel any pending connect or read
    /// immediately and stop the reconnect loop for good.
    pub fn close(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

async fn run_link(
    shared: Arc<LinkShared>,
    registry: Arc<SubscriberRegistry>,
    router: Arc<EventRouter>,
    config: LinkConfig,
    mut filter_rx: watch::Receiver<Filter>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let subscription_id = format!("nudge-{:08x}", OsRng.next_u32());
    let mut backoff_secs = config.reconnect_delay_secs;

    loop {
        shared.set_state(LinkState::Connecting);
        let connecting = tokio::time::timeout(
            config.connect_timeout,
            connect_async(shared.url.as_str()),
        );

        let connected = tokio::select! {
            _ = &mut shutdown_rx => {
                shared.set_state(LinkState::Disconnected);
                return;
            }
            result = connecting => result,
        };

        match connected {
            Ok(Ok((stream, _response))) => {
                backoff_secs = config.reconnect_delay_secs;
                shared.set_state(LinkState::Connected);
                crate::nlog!("relay connected: {}", shared.url);

                let (mut write, mut read) = stream.split();

                // Mark any queued filter update as seen before recomputing:
                // the recomputation below already reflects it, and a spurious
                // re-send later is harmless while a missed update is not.
                let _ = filter_rx.borrow_and_update();
                let filter = relay_filter(&registry, &shared.url);
                let frame = subscribe_frame(&subscription_id, &filter);
                if write.send(WsMessage::Text(frame)).await.is_err() {
                    shared.set_state(LinkState::Disconnected);
                    crate::nlog!(
                        "relay {}: failed to send subscription, reconnecting in {}s",
                        shared.url,
                        backoff_secs
                    );
                    if sleep_or_shutdown(backoff_secs, &mut shutdown_rx).await {
                        return;
                    }
                    backoff_secs = next_backoff(backoff_secs, &config);
                    continue;
                }
                shared.set_filter(Some(filter));

                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => {
                            let _ = write
                                .send(WsMessage::Text(close_frame(&subscription_id)))
                                .await;
                            let _ = write.send(WsMessage::Close(None)).await;
                            shared.set_state(LinkState::Disconnected);
                            return;
                        }
                        changed = filter_rx.changed() => {
                            if changed.is_err() {
                                // Handle dropped without close; treat as shutdown.
                                shared.set_state(LinkState::Disconnected);
                                return;
                            }
                            let filter = filter_rx.borrow_and_update().clone();
                            let frame = subscribe_frame(&subscription_id, &filter);
                            if write.send(WsMessage::Text(frame)).await.is_err() {
                                break;
                            }
                            crate::nlog!(
                                "relay {}: filter updated ({} channel(s), {} subscriber(s))",
                                shared.url,
                                filter.channels.len(),
                                filter.recipients.len()
                            );
                            shared.set_filter(Some(filter));
                        }
                        message = read.next() => {
                            match message {
                                Some(Ok(WsMessage::Text(text))) => {
                                    handle_frame(&shared, &router, &text);
                                }
                                Some(Ok(WsMessage::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(error)) => {
                                    crate::nlog!("relay {}: socket error: {}", shared.url, error);
                                    break;
                                }
                            }
                        }
                    }
                }

                shared.set_state(LinkState::Disconnected);
                shared.set_filter(None);
                crate::nlog!(
                    "relay disconnected: {} (reconnecting in {}s)",
                    shared.url,
                    backoff_secs
                );
            }
            Ok(Err(error)) => {
                shared.set_state(LinkState::Disconnected);
                crate::nlog!(
                    "relay {}: connect failed (retry in {}s): {}",
                    shared.url,
                    backoff_secs,
                    error
                );
            }
            Err(_elapsed) => {
                shared.set_state(LinkState::Disconnected);
                crate::nlog!(
                    "relay {}: connect timed out (retry in {}s)",
                    shared.url,
                    backoff_secs
                );
            }
        }

        if sleep_or_shutdown(backoff_secs, &mut shutdown_rx).await {
            return;
        }
        backoff_secs = next_backoff(backoff_secs, &config);
    }
}

/// Sleep the backoff delay; returns true if shutdown fired first.
async fn sleep_or_shutdown(delay_secs: u64, shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown_rx => true,
        _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => false,
    }
}

fn next_backoff(current_secs: u64, config: &LinkConfig) -> u64 {
    (current_secs.saturating_mul(2))
        .min(config.reconnect_max_delay_secs)
        .max(config.reconnect_delay_secs)
}

fn handle_frame(shared: &LinkShared, router: &EventRouter, text: &str) {
    match RelayFrame::parse(text) {
        Ok(RelayFrame::Event { event, .. }) => {
            router.route(&event, &shared.url);
        }
        Ok(RelayFrame::EndOfStored { .. }) => {
            // Informational; the bridge never requests stored events.
        }
        Ok(RelayFrame::Notice { message }) => {
            crate::nlog!("relay {}: notice: {}", shared.url, message);
        }
        Err(error) => {
            // Malformed frames never terminate the connection.
            crate::nlog!("relay {}: dropped malformed frame: {}", shared.url, error);
        }
    }
}

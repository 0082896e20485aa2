pub mod replay;
pub mod source;

pub use replay::ReplaySource;
pub use source::{InboundEvent, UpdateSource};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::EventBus;

/// Spawns a background task that polls every source concurrently at
/// `poll_interval` and publishes each inbound event on its bus topic.
///
/// A source that errors or times out is logged and skipped for that round.
/// Publishing waits on a full subscriber, so a busy pipeline slows the feed
/// down instead of losing events.
/// The task ends once every source reports itself exhausted.
pub fn start_feed(
    sources: Vec<Arc<dyn UpdateSource>>,
    poll_interval: Duration,
    bus: EventBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
        info!(
            "Feed started ({} source(s): {:?}, interval={:?})",
            sources.len(),
            names,
            poll_interval
        );

        let source_timeout = poll_interval.max(Duration::from_millis(100)).min(Duration::from_secs(2));
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let fetches: Vec<_> = sources
                .iter()
                .map(|s| {
                    let s = Arc::clone(s);
                    async move {
                        let res = tokio::time::timeout(source_timeout, s.fetch_events()).await;
                        let out = match res {
                            Ok(result) => result,
                            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", source_timeout)),
                        };
                        (s.name().to_string(), out)
                    }
                })
                .collect();

            let results = futures_util::future::join_all(fetches).await;

            for (name, result) in results {
                match result {
                    Ok(events) => {
                        if !events.is_empty() {
                            debug!("{}: {} event(s)", name, events.len());
                        }
                        for event in events {
                            let topic = event.topic();
                            // Inbound events feed the ledger; wait rather than drop.
                            if bus.publish_reliable(topic, event.into_payload()).await == 0 {
                                warn!("{}: no subscriber took '{}' event", name, topic);
                            }
                        }
                    }
                    Err(e) => warn!("Source {} failed: {}", name, e),
                }
            }

            if !sources.is_empty() && sources.iter().all(|s| s.exhausted()) {
                info!("All feed sources exhausted, feed stopping");
                break;
            }
        }
    })
}

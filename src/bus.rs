//! Process-local publish/subscribe hub.
//!
//! Every subscriber owns a bounded channel. `publish` never blocks: when a
//! subscriber's channel is full the delivery is dropped and logged.
//! `publish_reliable` waits for room instead, so a slow consumer pushes
//! back on the publisher. Subscribers whose receiver has been dropped are
//! pruned on the next publish.
//! Delivery order is preserved per topic per subscriber.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::models::{
    BankrollUpdate, BetPlacement, BetSettlement, BettingOpportunity, MarketUpdate,
    RiskAssessment, RiskMetrics, RiskViolation, ValidationResult,
};
use crate::risk::RiskProfile;

/// Topic names shared by producers and consumers.
pub mod topics {
    pub const WILDCARD: &str = "*";

    // Inbound
    pub const MARKET_UPDATE: &str = "market:update";
    pub const BET_PLACED: &str = "bet:placed";
    pub const BET_SETTLED: &str = "bet:settled";
    pub const BANKROLL_UPDATE: &str = "bankroll:update";

    // Outbound
    pub const PREDICTION_GENERATED: &str = "prediction:generated";
    pub const PREDICTION_UPDATE: &str = "prediction:update";
    pub const PREDICTION_VALIDATED: &str = "prediction:validated";
    pub const RISK_ASSESSMENT: &str = "risk:assessment";
    pub const RISK_VIOLATION: &str = "risk:violation";
    pub const METRICS_UPDATE: &str = "metrics:update";
    pub const RISK_PROFILE: &str = "risk:profile";
    pub const PIPELINE_ERROR: &str = "monitoring:error";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum BusPayload {
    MarketUpdate(MarketUpdate),
    BetPlaced(BetPlacement),
    BetSettled(BetSettlement),
    BankrollUpdate(BankrollUpdate),
    Opportunity(BettingOpportunity),
    Validation(ValidationResult),
    Assessment(RiskAssessment),
    RiskViolation(RiskViolation),
    Metrics(RiskMetrics),
    Profile(RiskProfile),
    PipelineError { stage: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: BusPayload,
    pub published_at: DateTime<Utc>,
}

type Subscribers = HashMap<String, Vec<mpsc::Sender<BusMessage>>>;

/// Cheap to clone; all clones share the same subscriber table.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, Subscribers> {
        // A panic while holding the lock cannot leave the table half-updated:
        // every mutation is a single push or retain.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to one topic, or to everything with `topics::WILDCARD`.
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<BusMessage> {
        self.subscribe_topics(&[topic])
    }

    /// Subscribe a single receiver to several topics.
    pub fn subscribe_topics(&self, topics: &[&str]) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut table = self.table();
        for topic in topics {
            table.entry((*topic).to_string()).or_default().push(tx.clone());
        }
        rx
    }

    fn message(topic: &str, payload: BusPayload) -> BusMessage {
        BusMessage {
            topic: topic.to_string(),
            payload,
            published_at: Utc::now(),
        }
    }

    /// Deliver `payload` to every subscriber of `topic` and every wildcard
    /// subscriber. Returns how many subscribers accepted the message.
    pub fn publish(&self, topic: &str, payload: BusPayload) -> usize {
        let message = Self::message(topic, payload);
        self.try_deliver(&[topic, topics::WILDCARD], &message)
    }

    /// Like `publish`, but waits for room in each `topic` subscriber's
    /// channel instead of dropping. Wildcard observers are still served
    /// without waiting. Used for inbound events the ledger must not lose.
    pub async fn publish_reliable(&self, topic: &str, payload: BusPayload) -> usize {
        let message = Self::message(topic, payload);
        let senders: Vec<mpsc::Sender<BusMessage>> =
            self.table().get(topic).cloned().unwrap_or_default();

        let mut delivered = 0usize;
        for tx in &senders {
            if tx.capacity() == 0 {
                debug!("Bus subscriber on '{}' full, waiting", topic);
            }
            match tx.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => debug!("Subscriber on '{}' closed during send", topic),
            }
        }
        if !senders.is_empty() {
            let mut table = self.table();
            if let Some(current) = table.get_mut(topic) {
                current.retain(|tx| !tx.is_closed());
            }
            table.retain(|_, senders| !senders.is_empty());
        }

        delivered + self.try_deliver(&[topics::WILDCARD], &message)
    }

    fn try_deliver(&self, keys: &[&str], message: &BusMessage) -> usize {
        let mut table = self.table();
        let mut delivered = 0usize;
        for key in keys {
            let Some(senders) = table.get_mut(*key) else {
                continue;
            };
            senders.retain(|tx| match tx.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    error!(
                        "Bus subscriber on '{}' full, '{}' event DROPPED",
                        key, message.topic
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Pruning closed subscriber on '{}'", key);
                    false
                }
            });
        }
        table.retain(|_, senders| !senders.is_empty());
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.table().get(topic).map(Vec::len).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

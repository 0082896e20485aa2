use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::{topics, BusPayload};
use crate::models::{BankrollUpdate, BetPlacement, BetSettlement, MarketUpdate};

/// One event arriving from outside the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    MarketUpdate(MarketUpdate),
    BetPlaced(BetPlacement),
    BetSettled(BetSettlement),
    BankrollUpdate(BankrollUpdate),
}

impl InboundEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            InboundEvent::MarketUpdate(_) => topics::MARKET_UPDATE,
            InboundEvent::BetPlaced(_) => topics::BET_PLACED,
            InboundEvent::BetSettled(_) => topics::BET_SETTLED,
            InboundEvent::BankrollUpdate(_) => topics::BANKROLL_UPDATE,
        }
    }

    pub fn into_payload(self) -> BusPayload {
        match self {
            InboundEvent::MarketUpdate(u) => BusPayload::MarketUpdate(u),
            InboundEvent::BetPlaced(b) => BusPayload::BetPlaced(b),
            InboundEvent::BetSettled(s) => BusPayload::BetSettled(s),
            InboundEvent::BankrollUpdate(b) => BusPayload::BankrollUpdate(b),
        }
    }
}

/// Trait that every inbound event source must implement.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Events that arrived since the previous call.
    async fn fetch_events(&self) -> Result<Vec<InboundEvent>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// A finite source returns true once it has nothing left to deliver.
    fn exhausted(&self) -> bool {
        false
    }
}

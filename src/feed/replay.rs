use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;

use super::source::{InboundEvent, UpdateSource};

/// Replays a recorded list of inbound events, `batch_size` per poll.
pub struct ReplaySource {
    name: String,
    events: Vec<InboundEvent>,
    cursor: Mutex<usize>,
    batch_size: usize,
}

impl ReplaySource {
    pub fn new(name: &str, events: Vec<InboundEvent>, batch_size: usize) -> Self {
        Self {
            name: name.to_string(),
            events,
            cursor: Mutex::new(0),
            batch_size: batch_size.max(1),
        }
    }

    /// Load a JSON array of events, e.g.
    /// `[{"type": "market_update", "id": "u1", "subject_id": "P1", ...}]`.
    pub fn from_file(path: impl AsRef<Path>, batch_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading feed file {}", path.display()))?;
        let events: Vec<InboundEvent> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing feed file {}", path.display()))?;
        Ok(Self::new(&format!("replay:{}", path.display()), events, batch_size))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    fn position(&self) -> std::sync::MutexGuard<'_, usize> {
        self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl UpdateSource for ReplaySource {
    async fn fetch_events(&self) -> Result<Vec<InboundEvent>> {
        let mut cursor = self.position();
        let start = *cursor;
        let end = (start + self.batch_size).min(self.events.len());
        *cursor = end;
        Ok(self.events[start..end].to_vec())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn exhausted(&self) -> bool {
        *self.position() >= self.events.len()
    }
}

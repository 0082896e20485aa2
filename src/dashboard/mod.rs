use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::bus::{topics, BusMessage, BusPayload, EventBus};
use crate::models::{
    BettingOpportunity, RiskAssessment, RiskMetrics, RiskViolation, ValidationResult,
};
use crate::risk::RiskProfile;

#[derive(Debug, Default)]
struct Activity {
    metrics: Option<RiskMetrics>,
    profile: Option<RiskProfile>,
    opportunities: VecDeque<BettingOpportunity>,
    assessments: VecDeque<RiskAssessment>,
    validations: VecDeque<ValidationResult>,
    violations: VecDeque<RiskViolation>,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, capacity: usize) {
    buf.push_back(item);
    while buf.len() > capacity {
        buf.pop_front();
    }
}

/// Most recent pipeline output, newest last, as seen on the bus.
#[derive(Clone)]
pub struct ActivityLog {
    inner: Arc<RwLock<Activity>>,
    capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub validation_rate: f64,
    pub recent: Vec<ValidationResult>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Activity::default())),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, msg: &BusMessage) {
        let mut a = self.inner.write().await;
        match &msg.payload {
            BusPayload::Metrics(m) => a.metrics = Some(m.clone()),
            BusPayload::Profile(p) => a.profile = Some(p.clone()),
            // prediction:generated carries the same opportunity before
            // enrichment; only the published update is kept.
            BusPayload::Opportunity(o) if msg.topic == topics::PREDICTION_UPDATE => {
                push_bounded(&mut a.opportunities, o.clone(), self.capacity)
            }
            BusPayload::Assessment(r) => push_bounded(&mut a.assessments, r.clone(), self.capacity),
            BusPayload::Validation(v) => push_bounded(&mut a.validations, v.clone(), self.capacity),
            BusPayload::RiskViolation(v) => push_bounded(&mut a.violations, v.clone(), self.capacity),
            _ => {}
        }
    }

    pub async fn metrics(&self) -> Option<RiskMetrics> {
        self.inner.read().await.metrics.clone()
    }

    pub async fn profile(&self) -> Option<RiskProfile> {
        self.inner.read().await.profile.clone()
    }

    pub async fn opportunities(&self) -> Vec<BettingOpportunity> {
        self.inner.read().await.opportunities.iter().cloned().collect()
    }

    pub async fn assessments(&self) -> Vec<RiskAssessment> {
        self.inner.read().await.assessments.iter().cloned().collect()
    }

    pub async fn violations(&self) -> Vec<RiskViolation> {
        self.inner.read().await.violations.iter().cloned().collect()
    }

    pub async fn validation_summary(&self) -> ValidationSummary {
        let a = self.inner.read().await;
        let total = a.validations.len();
        let valid = a.validations.iter().filter(|v| v.is_valid).count();
        ValidationSummary {
            total,
            valid,
            invalid: total - valid,
            validation_rate: if total > 0 {
                valid as f64 / total as f64
            } else {
                0.0
            },
            recent: a.validations.iter().cloned().collect(),
        }
    }
}

/// Spawns the task that copies every bus message into the log.
pub fn spawn_recorder(bus: &EventBus, log: ActivityLog) -> JoinHandle<()> {
    let mut rx = bus.subscribe(topics::WILDCARD);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            log.record(&msg).await;
        }
        debug!("Activity recorder stopped");
    })
}

#[derive(Clone)]
pub struct AppState {
    pub log: ActivityLog,
    pub bus: EventBus,
}

/// Build the Axum router for the status API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/metrics", get(metrics_handler))
        .route("/api/profile", get(profile_handler))
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/assessments", get(assessments_handler))
        .route("/api/validations", get(validations_handler))
        .route("/api/violations", get(violations_handler))
        .route("/ws/events", get(events_ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// GET /api/metrics (null until the first ledger snapshot)
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<Option<RiskMetrics>> {
    Json(state.log.metrics().await)
}

/// GET /api/profile (the active risk profile, null before the first snapshot)
async fn profile_handler(State(state): State<Arc<AppState>>) -> Json<Option<RiskProfile>> {
    Json(state.log.profile().await)
}

/// GET /api/opportunities
async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<BettingOpportunity>> {
    Json(state.log.opportunities().await)
}

/// GET /api/assessments
async fn assessments_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RiskAssessment>> {
    Json(state.log.assessments().await)
}

/// GET /api/validations
async fn validations_handler(State(state): State<Arc<AppState>>) -> Json<ValidationSummary> {
    Json(state.log.validation_summary().await)
}

/// GET /api/violations
async fn violations_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RiskViolation>> {
    Json(state.log.violations().await)
}

/// GET /ws/events – live stream of every bus message as JSON text frames.
async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rx = state.bus.subscribe(topics::WILDCARD);
    ws.on_upgrade(move |socket| stream_events(socket, rx))
}

async fn stream_events(mut socket: WebSocket, mut rx: mpsc::Receiver<BusMessage>) {
    info!("Event stream client connected");
    while let Some(msg) = rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode '{}' event: {}", msg.topic, e);
                continue;
            }
        };
        if socket.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    info!("Event stream client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BetSide, OpportunityMetadata, Provenance, ValidationMetrics};
    use crate::risk::ProfileRegistry;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn message(topic: &str, payload: BusPayload) -> BusMessage {
        BusMessage {
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        }
    }

    fn validation(is_valid: bool) -> ValidationResult {
        ValidationResult {
            is_valid,
            errors: if is_valid { vec![] } else { vec!["value_range: bad".into()] },
            warnings: vec![],
            metrics: ValidationMetrics::default(),
            rule_context: BTreeMap::new(),
            validated_at: Utc::now(),
        }
    }

    fn opportunity(id: &str) -> BettingOpportunity {
        let now = Utc::now();
        BettingOpportunity {
            id: id.into(),
            subject_id: "P1".into(),
            metric: "points".into(),
            side: BetSide::Under,
            line: Some(20.5),
            odds: -110,
            projected_value: 19.0,
            probability: 0.58,
            confidence: 0.7,
            expected_value: 0.056,
            kelly_fraction: 0.04,
            timestamp: now,
            expires_at: now + Duration::minutes(15),
            event_time: None,
            metadata: OpportunityMetadata {
                factors: vec![],
                risk_factors: vec![],
                source: Provenance::SingleSource,
                contributors: vec!["line_momentum".into()],
                coverage: 1.0,
                volatility: 0.5,
                market_efficiency: 0.5,
                experiment_variant: None,
            },
        }
    }

    #[tokio::test]
    async fn records_only_published_opportunities() {
        let log = ActivityLog::new(10);
        log.record(&message(
            topics::PREDICTION_GENERATED,
            BusPayload::Opportunity(opportunity("raw")),
        ))
        .await;
        log.record(&message(
            topics::PREDICTION_UPDATE,
            BusPayload::Opportunity(opportunity("final")),
        ))
        .await;
        let opps = log.opportunities().await;
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].id, "final");
    }

    #[tokio::test]
    async fn validation_summary_counts_and_bounds() {
        let log = ActivityLog::new(3);
        for ok in [false, true, true, true] {
            log.record(&message(
                topics::PREDICTION_VALIDATED,
                BusPayload::Validation(validation(ok)),
            ))
            .await;
        }
        let summary = log.validation_summary().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.valid, 3);
        assert_eq!(summary.validation_rate, 1.0);
    }

    #[tokio::test]
    async fn handlers_serve_recorded_state() {
        let bus = EventBus::new(16);
        let log = ActivityLog::new(10);
        let recorder = spawn_recorder(&bus, log.clone());
        let state = Arc::new(AppState {
            log: log.clone(),
            bus: bus.clone(),
        });

        assert!(metrics_handler(State(state.clone())).await.0.is_none());

        bus.publish(
            topics::METRICS_UPDATE,
            BusPayload::Metrics(RiskMetrics::new(5_000.0, 1.0)),
        );
        // Let the recorder drain its channel.
        for _ in 0..50 {
            if log.metrics().await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let Json(metrics) = metrics_handler(State(state.clone())).await;
        assert_eq!(metrics.map(|m| m.bankroll), Some(5_000.0));
        assert!(profile_handler(State(state.clone())).await.0.is_none());
        let Json(assessments) = assessments_handler(State(state)).await;
        assert!(assessments.is_empty());
        recorder.abort();
    }

    #[tokio::test]
    async fn profile_route_serves_the_published_profile() {
        let bus = EventBus::new(16);
        let log = ActivityLog::new(10);
        let state = Arc::new(AppState { log: log.clone(), bus });

        let registry = ProfileRegistry::with_defaults("conservative").unwrap();
        log.record(&message(
            topics::RISK_PROFILE,
            BusPayload::Profile(registry.active().clone()),
        ))
        .await;

        let Json(profile) = profile_handler(State(state)).await;
        assert_eq!(profile.map(|p| p.id), Some("conservative".to_string()));
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod bus;
mod config;
mod dashboard;
mod engine;
mod error;
mod feed;
mod gate;
mod models;
mod pipeline;
mod risk;
mod validation;

use bus::{topics, EventBus};
use config::Config;
use dashboard::{ActivityLog, AppState};
use engine::{EnsembleEngine, FeatureBlendModel, HistoricalTrendModel, LineMomentumModel};
use feed::{start_feed, ReplaySource, UpdateSource};
use gate::{FeatureGate, GateDefinitions};
use pipeline::Pipeline;
use risk::{CustomRule, ProfileRegistry, RiskManager};
use validation::PredictionValidator;

/// Feature that switches the blend producer on per subject.
const FEATURE_BLEND_FLAG: &str = "feature_blend_model";

fn load_gate(path: Option<&str>) -> Result<FeatureGate> {
    let Some(path) = path else {
        return Ok(FeatureGate::new());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading gate file {}", path))?;
    let defs: GateDefinitions =
        serde_json::from_str(&raw).with_context(|| format!("parsing gate file {}", path))?;
    info!(
        "Gate loaded: {} feature(s), {} experiment(s)",
        defs.features.len(),
        defs.experiments.len()
    );
    Ok(FeatureGate::from_definitions(defs)?)
}

fn load_risk_rules(registry: &mut ProfileRegistry, path: Option<&str>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading risk rules file {}", path))?;
    let by_profile: BTreeMap<String, Vec<CustomRule>> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing risk rules file {}", path))?;
    for (profile_id, rules) in by_profile {
        registry.replace_rules(&profile_id, rules)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialise tracing / logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    config.validate()?;
    info!(
        "Starting propbet-engine: profile={} bankroll=${:.2} kelly_ceiling={:.2}",
        config.risk_profile, config.bankroll, config.kelly_ceiling
    );

    let bus = EventBus::new(config.bus_capacity);
    let gate = load_gate(config.gate_file.as_deref())?;

    // Model producers
    let mut engine = EnsembleEngine::new(config.ensemble()?, bus.clone());
    engine
        .register(Arc::new(LineMomentumModel::new()), 1.0)
        .register(Arc::new(HistoricalTrendModel::new()), 1.2);
    if gate.has_feature(FEATURE_BLEND_FLAG) {
        engine.register_gated(Arc::new(FeatureBlendModel::new()), 0.8, FEATURE_BLEND_FLAG);
    } else {
        engine.register(Arc::new(FeatureBlendModel::new()), 0.8);
    }
    info!("Configured {} model producer(s)", engine.producer_count());

    let validator = PredictionValidator::with_default_rules(config.validator(), bus.clone());
    info!("Validation rules: {:?}", validator.rule_names());

    let mut registry = ProfileRegistry::with_defaults(&config.risk_profile)?;
    load_risk_rules(&mut registry, config.risk_rules_file.as_deref())?;
    let risk = RiskManager::new(registry, config.risk(), bus.clone());

    let pipeline = Pipeline::new(engine, validator, risk, gate, bus.clone(), config.pipeline());

    // Subscribe before anything can publish.
    let inbound = bus.subscribe_topics(&[
        topics::MARKET_UPDATE,
        topics::BET_PLACED,
        topics::BET_SETTLED,
        topics::BANKROLL_UPDATE,
    ]);
    let log = ActivityLog::new(200);
    dashboard::spawn_recorder(&bus, log.clone());

    let metrics_interval = Duration::from_secs(config.metrics_interval_secs);
    tokio::spawn(pipeline.run(inbound, metrics_interval));

    match config.feed_file.as_deref() {
        Some(path) => {
            let replay = ReplaySource::from_file(path, config.feed_batch_size)?;
            info!("Replaying {} event(s) from {}", replay.len(), path);
            let sources: Vec<Arc<dyn UpdateSource>> = vec![Arc::new(replay)];
            start_feed(
                sources,
                Duration::from_millis(config.feed_poll_interval_ms),
                bus.clone(),
            );
        }
        None => warn!("No --feed-file given; waiting for events published in-process"),
    }

    // Start the status API
    let app = dashboard::router(AppState {
        log,
        bus: bus.clone(),
    });
    let addr: SocketAddr = config.dashboard_addr.parse()?;
    info!("Status API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run the status API (blocks until shutdown)
    axum::serve(listener, app).await?;

    Ok(())
}

//! Trunk Gateway Daemon
//!
//! Drives every span listed in the configuration file against its gateway
//! over UDP and logs the call notifications it would hand to a switch.

use anyhow::Context;
use brivas_trunkgw::telemetry::{init_tracing, TelemetryConfig};
use brivas_trunkgw::{
    SignalEvent, SignalKind, SignalListener, SignalRejected, SpanEngine, SpanRegistry,
    TrunkGwConfig, UdpConnector,
};
use std::sync::Arc;
use tracing::info;

/// Logs notifications and accepts every offered call
struct LoggingListener;

impl SignalListener for LoggingListener {
    fn on_signal(&self, event: &SignalEvent) -> Result<(), SignalRejected> {
        match event.kind {
            SignalKind::Start => info!(
                span_id = event.span_id,
                channel = event.channel,
                position = %event.position,
                calling = %event.caller.cid_num,
                called = %event.caller.dnis,
                "Incoming call offered"
            ),
            kind => info!(
                span_id = event.span_id,
                channel = event.channel,
                position = %event.position,
                ?kind,
                "Channel signal"
            ),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&TelemetryConfig::from_env()?)?;

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TRUNKGW_CONFIG").ok())
        .unwrap_or_else(|| "trunkgw.json".to_string());
    let config = TrunkGwConfig::load(&path)
        .with_context(|| format!("loading configuration from {}", path))?;

    info!(
        version = brivas_trunkgw::VERSION,
        spans = config.spans.len(),
        "Starting trunk gateway signaling"
    );

    let listener: Arc<dyn SignalListener> = Arc::new(LoggingListener);
    let registry = SpanRegistry::new();
    for span in &config.spans {
        let engine = SpanEngine::new(
            span,
            config.engine.clone(),
            Arc::new(UdpConnector::new(span.link.clone())),
            Arc::clone(&listener),
        )
        .with_context(|| format!("creating engine for span {}", span.span_id))?;
        registry.start(engine);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    registry.shutdown_all().await;

    Ok(())
}

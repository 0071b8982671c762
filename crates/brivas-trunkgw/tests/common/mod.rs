//! Shared harness: a span engine on in-memory links with a scripted gateway

#![allow(dead_code)]

use brivas_trunkgw::protocol::{EventKind, ProtocolEvent};
use brivas_trunkgw::transport::{link_pair, GatewayEnd, Link, LinkKind};
use brivas_trunkgw::{
    EngineConfig, Position, SignalEvent, SignalKind, SignalListener, SignalRejected, SpanConfig,
    SpanEngine, SpanStatus,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(2);

/// Records every notification; can be told to refuse incoming calls
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<SignalEvent>>,
    refuse_start: AtomicBool,
}

impl Recorder {
    pub fn refuse_calls(&self) {
        self.refuse_start.store(true, Ordering::SeqCst);
    }

    pub fn kinds(&self, channel: usize) -> Vec<SignalKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.kind)
            .collect()
    }

    pub fn first(&self, kind: SignalKind) -> Option<SignalEvent> {
        self.events.lock().iter().find(|e| e.kind == kind).cloned()
    }

    pub fn count(&self, kind: SignalKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub async fn wait_for(&self, kind: SignalKind) -> SignalEvent {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(event) = self.first(kind) {
                return event;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no {:?} notification",
                kind
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl SignalListener for Recorder {
    fn on_signal(&self, event: &SignalEvent) -> Result<(), SignalRejected> {
        self.events.lock().push(event.clone());
        if event.kind == SignalKind::Start && self.refuse_start.load(Ordering::SeqCst) {
            return Err(SignalRejected("refused".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<SpanEngine>,
    pub gateway: GatewayEnd,
    pub signals: Arc<Recorder>,
    pub task: JoinHandle<brivas_trunkgw::Result<()>>,
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 5,
        request_timeout_ms: 1_000,
        request_poll_ms: 5,
        locator_retries: 5,
        locator_wait_ms: 5,
        restart_backoff_ms: 50,
        max_requests: 16,
        ..Default::default()
    }
}

/// Start an engine for span 1 (physical trunk 1) and complete the restart
/// handshake
pub async fn start(slots: u32, config: EngineConfig) -> Harness {
    start_span(SpanConfig::single_trunk(1, 1, slots), config).await
}

pub async fn start_span(span: SpanConfig, config: EngineConfig) -> Harness {
    let (connector, gateway) = link_pair();
    let signals = Arc::new(Recorder::default());
    let listener: Arc<dyn SignalListener> = signals.clone();
    let engine = SpanEngine::new(&span, config, Arc::new(connector), listener).unwrap();
    let task = engine.spawn();

    let harness = Harness {
        engine,
        gateway,
        signals,
        task,
    };
    harness.handshake().await;
    harness
}

impl Harness {
    /// Engine announces a restart; the gateway restarts the span and the
    /// engine acknowledges on the control link
    pub async fn handshake(&self) {
        self.expect(LinkKind::Heartbeat, EventKind::SystemRestart).await;
        self.send(LinkKind::Heartbeat, ProtocolEvent::system(EventKind::SystemRestart))
            .await;
        self.expect(LinkKind::Control, EventKind::SystemRestartAck).await;
        self.wait_status(|s| s.running && s.link_up && !s.suspended).await;
    }

    pub async fn send(&self, link: LinkKind, event: ProtocolEvent) {
        self.gateway.get(link).send(&event).await.unwrap();
    }

    /// Next event on `link`, which must be of `kind`
    pub async fn expect(&self, link: LinkKind, kind: EventKind) -> ProtocolEvent {
        let event = self
            .gateway
            .get(link)
            .recv_timeout(WAIT)
            .await
            .unwrap_or_else(|| panic!("no {:?} on {:?} link", kind, link));
        assert_eq!(
            event.kind_name(),
            kind.name(),
            "unexpected event on {:?} link: {:?}",
            link,
            event
        );
        event
    }

    /// Assert nothing arrives on `link` for `wait`
    pub async fn expect_silence(&self, link: LinkKind, wait: Duration) {
        if let Some(event) = self.gateway.get(link).recv_timeout(wait).await {
            panic!("unexpected event on {:?} link: {:?}", link, event);
        }
    }

    pub async fn wait_status(&self, check: impl Fn(&SpanStatus) -> bool) -> SpanStatus {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let status = self.engine.status();
            if check(&status) {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "span never reached expected status: {:?}",
                status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Network originated call on a wire position
    pub async fn offer_call(&self, position: Position, calling: &str, called: &str) {
        let mut event = ProtocolEvent::command(EventKind::CallStart, position, 0, 0);
        event.calling_digits = calling.to_string();
        event.called_digits = called.to_string();
        self.send(LinkKind::Control, event).await;
    }

    pub async fn command(&self, kind: EventKind, position: Position, request_id: u16, cause: u8) {
        self.send(
            LinkKind::Control,
            ProtocolEvent::command(kind, position, request_id, cause),
        )
        .await;
    }

    pub async fn stop(self) {
        self.engine.shutdown();
        let result = tokio::time::timeout(WAIT, self.task)
            .await
            .expect("engine did not stop")
            .expect("engine task panicked");
        assert!(result.is_ok());
    }
}

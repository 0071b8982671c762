//! Heartbeat/Restart Supervisor
//!
//! Runs once per engine loop iteration. Heartbeat timing only runs while the
//! link is up and the span is not suspended; the gateway's heartbeats are
//! echoed by the dispatcher.

use crate::protocol::{EventKind, ProtocolEvent};
use crate::span::Span;
use crate::transport::LinkKind;
use std::time::Duration;
use tracing::{error, info};

/// What the supervisor did on one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Healthy,
    /// Heartbeat timing paused (link down or span suspended)
    Paused,
    /// Waiting for every channel to reach `Down`
    Restarting,
    HeartbeatLost,
    RestartComplete,
}

pub struct Supervisor<'a> {
    span: &'a Span,
    heartbeat_timeout: Duration,
}

impl<'a> Supervisor<'a> {
    pub fn new(span: &'a Span, heartbeat_timeout: Duration) -> Self {
        Self {
            span,
            heartbeat_timeout,
        }
    }

    pub fn tick(&self) -> Tick {
        if self.span.is_restarting() {
            self.span.reset_heartbeat();
            if self.span.all_down() {
                self.complete_restart();
                return Tick::RestartComplete;
            }
            return Tick::Restarting;
        }

        if self.span.is_suspended() || !self.span.is_link_up() {
            self.span.reset_heartbeat();
            return Tick::Paused;
        }

        if self.span.heartbeat_elapsed() >= self.heartbeat_timeout {
            self.heartbeat_lost();
            return Tick::HeartbeatLost;
        }
        Tick::Healthy
    }

    fn heartbeat_lost(&self) {
        error!(
            span_id = self.span.id(),
            elapsed_ms = self.span.heartbeat_elapsed().as_millis() as u64,
            "Heartbeat lost, restarting span"
        );
        metrics::counter!("trunkgw_heartbeat_lost_total").increment(1);
        self.local_restart();
        self.span.send(
            LinkKind::Heartbeat,
            ProtocolEvent::system(EventKind::SystemRestart),
        );
    }

    /// Suspend the span and force every channel through `Restart`
    pub fn local_restart(&self) {
        self.span.set_link_up(false);
        self.span.set_suspended(true);
        self.span.set_restarting(true);
        self.span.restart_channels();
        self.span.reset_heartbeat();
    }

    fn complete_restart(&self) {
        self.span.send(
            LinkKind::Control,
            ProtocolEvent::system(EventKind::SystemRestartAck),
        );
        self.span.set_restarting(false);
        self.span.set_suspended(false);
        self.span.set_link_up(true);
        self.span.reset_heartbeat();
        let released = self.span.pool().reset_span(self.span.id());
        self.span.congestion().clear();

        metrics::counter!("trunkgw_restarts_completed_total").increment(1);
        info!(span_id = self.span.id(), released, "Span restart complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpanConfig;
    use crate::fsm::ChannelState;
    use crate::pool::RequestPool;
    use crate::signal::{SignalEvent, SignalListener, SignalRejected};
    use crate::transport::Outgoing;
    use crate::types::Direction;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn span() -> (Span, mpsc::UnboundedReceiver<Outgoing>) {
        let listener: Arc<dyn SignalListener> =
            Arc::new(|_: &SignalEvent| -> Result<(), SignalRejected> { Ok(()) });
        Span::new(
            &SpanConfig::single_trunk(1, 1, 2),
            Arc::new(RequestPool::new(8)),
            listener,
        )
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<(LinkKind, u8)> {
        let mut sent = Vec::new();
        while let Ok(out) = rx.try_recv() {
            sent.push((out.link, out.event.kind));
        }
        sent
    }

    #[test]
    fn test_timing_paused_until_link_up() {
        let (span, _rx) = span();
        let supervisor = Supervisor::new(&span, Duration::ZERO);
        assert_eq!(supervisor.tick(), Tick::Paused);

        span.set_link_up(true);
        span.set_suspended(true);
        assert_eq!(supervisor.tick(), Tick::Paused);
    }

    #[test]
    fn test_heartbeat_loss_restarts_then_acks_once() {
        let (span, mut rx) = span();
        span.set_link_up(true);
        span.claim(0, Direction::Inbound, 0);
        span.update(0, |c| c.set_state(ChannelState::Ring)).unwrap().unwrap();

        let supervisor = Supervisor::new(&span, Duration::ZERO);
        assert_eq!(supervisor.tick(), Tick::HeartbeatLost);
        assert!(span.is_suspended());
        assert!(span.all_down());
        assert_eq!(
            drain(&mut rx),
            vec![(LinkKind::Heartbeat, EventKind::SystemRestart as u8)]
        );

        assert_eq!(supervisor.tick(), Tick::RestartComplete);
        assert!(!span.is_suspended());
        assert!(!span.is_restarting());
        assert_eq!(
            drain(&mut rx),
            vec![(LinkKind::Control, EventKind::SystemRestartAck as u8)]
        );

        let relaxed = Supervisor::new(&span, Duration::from_secs(60));
        assert_eq!(relaxed.tick(), Tick::Healthy);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_restart_waits_for_channels() {
        let (span, mut rx) = span();
        span.claim(1, Direction::Inbound, 0);
        span.update(1, |c| c.set_state(ChannelState::Ring)).unwrap().unwrap();
        span.update(1, |c| c.set_state(ChannelState::Hangup)).unwrap().unwrap();
        drain(&mut rx);

        span.set_restarting(true);
        span.set_suspended(true);
        let supervisor = Supervisor::new(&span, Duration::from_secs(20));
        assert_eq!(supervisor.tick(), Tick::Restarting);
        assert!(drain(&mut rx).is_empty());

        span.update(1, |c| c.set_state(ChannelState::HangupComplete))
            .unwrap()
            .unwrap();
        assert_eq!(supervisor.tick(), Tick::RestartComplete);
        assert!(span.is_link_up());
    }
}

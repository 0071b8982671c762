//! Channel object and state entry side effects

use crate::errors::StateError;
use crate::fsm::{self, ChannelState};
use crate::pool::RequestPool;
use crate::protocol::{EventKind, ProtocolEvent};
use crate::signal::{SignalEvent, SignalKind, SignalListener};
use crate::transport::{LinkKind, Outgoing};
use crate::types::{cause, CallerData, Direction, Position, RequestId, SpanId};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, error, warn};

/// Feature flags on a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags {
    pub in_use: bool,
    pub answered: bool,
    pub media: bool,
    pub progress: bool,
}

/// Cleanup sequencing that survives across handler invocations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Release the slot binding and request id when the channel reaches `Down`
    pub free_request_on_down: bool,
    /// The final reply for this call has been sent to the gateway
    pub final_response_sent: bool,
    /// CALL_START_ACK has been sent for an inbound call
    pub start_ack_sent: bool,
    /// Gateway answered before the outbound channel left `Down`
    pub answer_pending: bool,
}

/// Side-effect sink used while advancing a channel
pub(crate) struct Effects<'a> {
    pub pool: &'a RequestPool,
    pub listener: &'a dyn SignalListener,
    pub outbox: Vec<Outgoing>,
    /// Some channel reached `Down` during this pass
    pub became_idle: bool,
}

impl<'a> Effects<'a> {
    pub fn new(pool: &'a RequestPool, listener: &'a dyn SignalListener) -> Self {
        Self {
            pool,
            listener,
            outbox: Vec::new(),
            became_idle: false,
        }
    }

    pub fn reply(&mut self, event: ProtocolEvent) {
        self.outbox.push(Outgoing::new(LinkKind::Control, event));
    }
}

/// One physical trunk position on a span
#[derive(Debug)]
pub struct Channel {
    pub index: usize,
    pub span_id: SpanId,
    pub position: Position,
    state: ChannelState,
    last_state: ChannelState,
    direction: Direction,
    extra_id: RequestId,
    pub flags: ChannelFlags,
    pub ctx: CallContext,
    pub caller: CallerData,
    pending: bool,
    dtmf: VecDeque<char>,
    last_change: DateTime<Utc>,
}

impl Channel {
    pub fn new(index: usize, span_id: SpanId, position: Position) -> Self {
        Self {
            index,
            span_id,
            position,
            state: ChannelState::Down,
            last_state: ChannelState::Down,
            direction: Direction::Inbound,
            extra_id: 0,
            flags: ChannelFlags::default(),
            ctx: CallContext::default(),
            caller: CallerData::default(),
            pending: false,
            dtmf: VecDeque::new(),
            last_change: Utc::now(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn last_state(&self) -> ChannelState {
        self.last_state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Request id that originated this call, 0 if none
    pub fn extra_id(&self) -> RequestId {
        self.extra_id
    }

    pub fn last_change(&self) -> DateTime<Utc> {
        self.last_change
    }

    /// Whether a state change is waiting for its side effects
    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Free for a new call
    pub fn is_idle(&self) -> bool {
        self.state == ChannelState::Down && !self.flags.in_use
    }

    /// Claim the position for a new call
    pub fn open(&mut self, direction: Direction, extra_id: RequestId) {
        self.direction = direction;
        self.extra_id = extra_id;
        self.flags = ChannelFlags {
            in_use: true,
            ..Default::default()
        };
        self.ctx = CallContext::default();
        self.caller = CallerData::default();
        self.dtmf.clear();
    }

    /// Validate and apply a transition. Side effects run on the next
    /// [`Channel::advance`].
    ///
    /// A transition to the current state is accepted and changes nothing.
    pub fn set_state(&mut self, to: ChannelState) -> Result<(), StateError> {
        if to == self.state {
            return Ok(());
        }
        if !fsm::is_legal(self.direction, self.state, to) {
            metrics::counter!("trunkgw_illegal_transitions_total").increment(1);
            error!(
                span_id = self.span_id,
                channel = self.index,
                position = %self.position,
                direction = ?self.direction,
                from = ?self.state,
                to = ?to,
                "Illegal state transition"
            );
            return Err(StateError::IllegalTransition {
                direction: self.direction,
                from: self.state,
                to,
            });
        }

        debug!(
            span_id = self.span_id,
            channel = self.index,
            from = ?self.state,
            to = ?to,
            "State change"
        );
        self.last_state = self.state;
        self.state = to;
        self.pending = true;
        self.last_change = Utc::now();
        Ok(())
    }

    /// Re-run the `Down` cleanup for a channel claimed but never started
    pub(crate) fn release_claim(&mut self) -> bool {
        if self.state != ChannelState::Down || !self.flags.in_use {
            return false;
        }
        self.pending = true;
        true
    }

    /// Drop a claim still held for request `id` that never started a call.
    /// The id is left to its owner, so the `Down` cleanup does not retire it.
    pub(crate) fn abandon_claim(&mut self, id: RequestId) -> bool {
        if id == 0 || self.extra_id != id || !self.release_claim() {
            return false;
        }
        self.extra_id = 0;
        true
    }

    pub fn queue_dtmf(&mut self, digits: &str) {
        self.dtmf.extend(digits.chars());
    }

    pub fn take_dtmf(&mut self) -> String {
        self.dtmf.drain(..).collect()
    }

    fn command(&self, kind: EventKind, cause: u8) -> ProtocolEvent {
        ProtocolEvent::command(kind, self.position, 0, cause)
    }

    fn notify(&self, fx: &Effects<'_>, kind: SignalKind) -> bool {
        let event = SignalEvent {
            span_id: self.span_id,
            channel: self.index,
            position: self.position,
            kind,
            caller: self.caller.clone(),
        };
        match fx.listener.on_signal(&event) {
            Ok(()) => true,
            Err(e) => {
                warn!(span_id = self.span_id, channel = self.index, ?kind, error = %e, "Switch rejected signal");
                false
            }
        }
    }

    /// Follow-up transition issued from inside a side effect
    fn chain(&mut self, to: ChannelState) {
        // Errors are already logged by set_state
        let _ = self.set_state(to);
    }

    /// Run entry side effects until no state change is pending
    pub(crate) fn advance(&mut self, fx: &mut Effects<'_>) {
        while self.pending {
            self.pending = false;
            self.enter_state(fx);
        }
    }

    fn enter_state(&mut self, fx: &mut Effects<'_>) {
        let outbound = self.direction == Direction::Outbound;

        match self.state {
            ChannelState::Down => {
                if self.extra_id != 0 {
                    fx.pool.retire(self.extra_id);
                    self.extra_id = 0;
                }
                if self.ctx.free_request_on_down {
                    fx.pool.release_slot(self.position);
                    self.ctx.free_request_on_down = false;
                }
                self.flags = ChannelFlags::default();
                self.ctx = CallContext::default();
                self.notify(fx, SignalKind::Idle);
                fx.became_idle = true;
            }
            ChannelState::Progress | ChannelState::ProgressMedia => {
                self.flags.progress = true;
                if self.state == ChannelState::ProgressMedia {
                    self.flags.media = true;
                }
                if outbound {
                    if !self.notify(fx, SignalKind::ProgressMedia) {
                        self.chain(ChannelState::Hangup);
                    } else if self.ctx.answer_pending {
                        self.ctx.answer_pending = false;
                        self.chain(ChannelState::Up);
                    }
                } else if !self.ctx.start_ack_sent {
                    self.ctx.start_ack_sent = true;
                    fx.reply(self.command(EventKind::CallStartAck, 0));
                }
            }
            ChannelState::Ring => {
                if !outbound && !self.notify(fx, SignalKind::Start) {
                    self.chain(ChannelState::Hangup);
                }
            }
            ChannelState::Up => {
                self.flags.answered = true;
                if outbound {
                    if !self.notify(fx, SignalKind::Up) {
                        self.chain(ChannelState::Hangup);
                    }
                } else {
                    if !self.ctx.start_ack_sent {
                        self.ctx.start_ack_sent = true;
                        fx.reply(self.command(EventKind::CallStartAck, 0));
                    }
                    fx.reply(self.command(EventKind::CallAnswered, 0));
                }
            }
            ChannelState::Hangup => {
                if self.ctx.final_response_sent || self.last_state == ChannelState::Terminating {
                    self.chain(ChannelState::HangupComplete);
                } else {
                    self.ctx.final_response_sent = true;
                    self.notify(fx, SignalKind::Stop);
                    let hangup_cause = match self.caller.hangup_cause {
                        0 => cause::NORMAL_CLEARING,
                        c => c,
                    };
                    let kind = if self.flags.answered || self.flags.progress || self.flags.media {
                        EventKind::CallStopped
                    } else {
                        EventKind::CallStartNack
                    };
                    fx.reply(self.command(kind, hangup_cause));
                }
            }
            ChannelState::Cancel => {
                self.notify(fx, SignalKind::Stop);
                self.ctx.final_response_sent = true;
                fx.reply(self.command(EventKind::CallStartNackAck, 0));
                self.chain(ChannelState::Down);
            }
            ChannelState::Terminating => {
                self.notify(fx, SignalKind::Stop);
                self.ctx.final_response_sent = true;
                fx.reply(self.command(EventKind::CallStoppedAck, 0));
                self.chain(ChannelState::HangupComplete);
            }
            ChannelState::HangupComplete => {
                self.chain(ChannelState::Down);
            }
            ChannelState::Restart => {
                self.notify(fx, SignalKind::Restart);
                self.ctx.final_response_sent = true;
                self.ctx.free_request_on_down = true;
                self.chain(ChannelState::Down);
            }
            ChannelState::Dialing => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalRejected;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<SignalKind>>,
        reject: Option<SignalKind>,
    }

    impl SignalListener for Recorder {
        fn on_signal(&self, event: &SignalEvent) -> Result<(), SignalRejected> {
            self.seen.lock().push(event.kind);
            if self.reject == Some(event.kind) {
                return Err(SignalRejected("busy".to_string()));
            }
            Ok(())
        }
    }

    fn kinds(outbox: &[Outgoing]) -> Vec<u8> {
        outbox.iter().map(|o| o.event.kind).collect()
    }

    #[test]
    fn test_down_to_down_is_noop() {
        let mut chan = Channel::new(0, 1, Position::new(0, 0));
        assert!(chan.set_state(ChannelState::Down).is_ok());
        assert!(!chan.has_pending());
        assert_eq!(chan.state(), ChannelState::Down);
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let mut chan = Channel::new(0, 1, Position::new(0, 0));
        chan.open(Direction::Inbound, 0);
        let err = chan.set_state(ChannelState::Up).unwrap_err();
        assert_eq!(
            err,
            StateError::IllegalTransition {
                direction: Direction::Inbound,
                from: ChannelState::Down,
                to: ChannelState::Up,
            }
        );
        assert_eq!(chan.state(), ChannelState::Down);
        assert!(!chan.has_pending());
    }

    #[test]
    fn test_inbound_ring_then_local_reject() {
        let pool = RequestPool::new(4);
        let listener = Recorder::default();
        let mut chan = Channel::new(3, 1, Position::new(1, 4));
        chan.open(Direction::Inbound, 0);

        let mut fx = Effects::new(&pool, &listener);
        chan.set_state(ChannelState::Ring).unwrap();
        chan.advance(&mut fx);
        assert_eq!(*listener.seen.lock(), vec![SignalKind::Start]);

        chan.set_state(ChannelState::Hangup).unwrap();
        chan.advance(&mut fx);
        assert_eq!(chan.state(), ChannelState::Hangup);
        assert!(chan.ctx.final_response_sent);
        assert_eq!(kinds(&fx.outbox), vec![EventKind::CallStartNack as u8]);
    }

    #[test]
    fn test_ring_rejected_by_switch_hangs_up() {
        let pool = RequestPool::new(4);
        let listener = Recorder {
            reject: Some(SignalKind::Start),
            ..Default::default()
        };
        let mut chan = Channel::new(0, 1, Position::new(0, 0));
        chan.open(Direction::Inbound, 0);

        let mut fx = Effects::new(&pool, &listener);
        chan.set_state(ChannelState::Ring).unwrap();
        chan.advance(&mut fx);
        assert_eq!(chan.state(), ChannelState::Hangup);
        assert_eq!(kinds(&fx.outbox), vec![EventKind::CallStartNack as u8]);
    }

    #[test]
    fn test_inbound_answer_sends_ack_once() {
        let pool = RequestPool::new(4);
        let listener = Recorder::default();
        let mut chan = Channel::new(0, 1, Position::new(0, 0));
        chan.open(Direction::Inbound, 0);

        let mut fx = Effects::new(&pool, &listener);
        chan.set_state(ChannelState::Ring).unwrap();
        chan.set_state(ChannelState::ProgressMedia).unwrap();
        chan.advance(&mut fx);
        chan.set_state(ChannelState::Up).unwrap();
        chan.advance(&mut fx);
        assert_eq!(
            kinds(&fx.outbox),
            vec![EventKind::CallStartAck as u8, EventKind::CallAnswered as u8]
        );
    }

    #[test]
    fn test_terminating_runs_to_down_and_releases() {
        let pool = RequestPool::new(4);
        let listener = Recorder::default();
        let id = pool.issue(1).unwrap();
        let pos = Position::new(2, 7);
        pool.bind_slot(pos, id).unwrap();
        pool.bind(id, 0).unwrap();

        let mut chan = Channel::new(0, 1, pos);
        chan.open(Direction::Outbound, id);
        let mut fx = Effects::new(&pool, &listener);
        chan.set_state(ChannelState::ProgressMedia).unwrap();
        chan.set_state(ChannelState::Up).unwrap();
        chan.advance(&mut fx);

        chan.set_state(ChannelState::Terminating).unwrap();
        chan.ctx.free_request_on_down = true;
        chan.advance(&mut fx);

        assert_eq!(chan.state(), ChannelState::Down);
        assert_eq!(chan.extra_id(), 0);
        assert!(chan.is_idle());
        assert!(fx.became_idle);
        assert_eq!(pool.slot_owner(pos), None);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(kinds(&fx.outbox), vec![EventKind::CallStoppedAck as u8]);
    }

    #[test]
    fn test_restart_clears_call() {
        let pool = RequestPool::new(4);
        let listener = Recorder::default();
        let mut chan = Channel::new(0, 1, Position::new(0, 0));
        chan.open(Direction::Inbound, 0);
        let mut fx = Effects::new(&pool, &listener);
        chan.set_state(ChannelState::Ring).unwrap();
        chan.advance(&mut fx);

        chan.set_state(ChannelState::Restart).unwrap();
        chan.advance(&mut fx);
        assert_eq!(chan.state(), ChannelState::Down);
        assert_eq!(
            *listener.seen.lock(),
            vec![SignalKind::Start, SignalKind::Restart, SignalKind::Idle]
        );
        assert!(fx.outbox.is_empty());
    }

    #[test]
    fn test_abandoned_claim_keeps_request_id() {
        let pool = RequestPool::new(4);
        let listener = Recorder::default();
        let id = pool.issue(1).unwrap();
        let mut chan = Channel::new(0, 1, Position::new(0, 0));
        chan.open(Direction::Outbound, id);

        assert!(!chan.abandon_claim(id + 1));
        assert!(chan.abandon_claim(id));
        assert_eq!(chan.extra_id(), 0);

        let mut fx = Effects::new(&pool, &listener);
        chan.advance(&mut fx);
        assert!(chan.is_idle());
        assert_eq!(*listener.seen.lock(), vec![SignalKind::Idle]);
        // Retiring the id is left to the request that owns it
        assert_eq!(pool.status(id), Some(crate::pool::RequestStatus::Waiting));
        assert!(!chan.abandon_claim(id));
    }
}

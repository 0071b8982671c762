//! Event Dispatcher
//!
//! Routes decoded gateway events to their handlers. Handlers resolve every
//! event they accept themselves (reply, state change, or log) and never
//! return errors to the engine loop.

use crate::fsm::ChannelState;
use crate::locator::{ChannelLocator, WaitPolicy};
use crate::pool::RequestStatus;
use crate::protocol::{EventKind, ProtocolEvent};
use crate::span::Span;
use crate::transport::LinkKind;
use crate::types::{cause, CallerData, Direction, Position};
use tracing::{debug, error, info, instrument, warn};

enum StopOutcome {
    /// The channel acknowledges through its `Terminating` side effects
    Terminating,
    AckOnly,
    ReleaseAndAck,
}

pub struct Dispatcher<'a> {
    span: &'a Span,
    locator: ChannelLocator<'a>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(span: &'a Span, policy: WaitPolicy) -> Self {
        Self {
            span,
            locator: ChannelLocator::new(span, policy),
        }
    }

    /// Handle one event received on `link`
    #[instrument(skip(self, event), fields(span_id = self.span.id(), event = event.kind_name(), position = %event.position, request_id = event.request_id))]
    pub async fn dispatch(&self, link: LinkKind, event: ProtocolEvent) {
        metrics::counter!("trunkgw_events_received_total", "kind" => event.kind_name()).increment(1);

        if !self.span.is_running() {
            warn!("Engine is shutting down, dropping event");
            metrics::counter!("trunkgw_events_dropped_total", "reason" => "shutdown").increment(1);
            return;
        }

        let Some(kind) = event.event_kind() else {
            warn!(kind = event.kind, "No handler for event");
            metrics::counter!("trunkgw_events_dropped_total", "reason" => "unknown").increment(1);
            return;
        };

        if self.span.is_suspended() && !kind.allowed_while_suspended() {
            debug!("Span suspended, dropping event");
            metrics::counter!("trunkgw_events_dropped_total", "reason" => "suspended").increment(1);
            return;
        }

        match kind {
            EventKind::CallStart => self.call_start(&event).await,
            EventKind::CallStartAck => self.outbound_ack(&event).await,
            EventKind::CallProgress => self.outbound_ack(&event).await,
            EventKind::CallStartNack => self.call_start_nack(&event).await,
            EventKind::CallAnswered => self.call_answered(&event).await,
            EventKind::CallStopped => self.call_stopped(&event).await,
            EventKind::CallStoppedAck | EventKind::CallStartNackAck => self.call_done(&event).await,
            EventKind::DigitIn => self.digit_in(&event).await,
            EventKind::Heartbeat => self.heartbeat(link, &event),
            EventKind::SystemRestart => self.restart(),
            EventKind::SystemRestartAck => {
                debug!("Restart acknowledged");
                self.span.reset_heartbeat();
            }
            EventKind::CallReleased
            | EventKind::InsertCheckLoop
            | EventKind::RemoveCheckLoop
            | EventKind::AutoCallGapAbate => {
                debug!("Event ignored");
            }
        }
    }

    fn reply(&self, kind: EventKind, position: Position, request_id: u16, release_cause: u8) {
        self.span.send(
            LinkKind::Control,
            ProtocolEvent::command(kind, position, request_id, release_cause),
        );
    }

    async fn call_start(&self, event: &ProtocolEvent) {
        let position = event.position;
        let Some(index) = self.locator.find(position, false).await else {
            error!("Call start for a channel that is not available");
            self.reply(EventKind::CallStartNack, position, 0, 0);
            return;
        };

        if !self.span.claim(index, Direction::Inbound, 0) {
            error!("Call start could not open channel");
            self.reply(EventKind::CallStartNack, position, 0, 0);
            return;
        }

        let caller = caller_from_event(event);
        info!(
            channel = index,
            calling = %caller.cid_num,
            called = %caller.dnis,
            "Incoming call"
        );
        self.span.update(index, |chan| {
            chan.caller = caller;
            if chan.set_state(ChannelState::Ring).is_err() {
                // Claimed above, so the channel can only be in Down
                chan.release_claim();
            }
        });
    }

    /// CALL_START_ACK and CALL_PROGRESS for a locally originated request
    async fn outbound_ack(&self, event: &ProtocolEvent) {
        let id = event.request_id;
        let position = event.position;
        let pool = self.span.pool();

        if pool.is_ignored(id) {
            debug!("Acknowledgement for an abandoned request, dropping");
            return;
        }

        let Some(request) = pool.request(id) else {
            warn!("Acknowledgement for an unknown request id");
            return;
        };
        if request.span != Some(self.span.id()) {
            warn!(owner = ?request.span, "Acknowledgement for a request of another span");
            return;
        }
        match request.status {
            RequestStatus::Waiting => {}
            RequestStatus::Ready if event.is(EventKind::CallProgress) => {
                pool.record_event(id, event);
                if event.media_ready() {
                    self.upgrade_media(request.channel, id);
                }
                return;
            }
            status => {
                warn!(status = status.name(), "Acknowledgement for a request that is not waiting");
                return;
            }
        }

        pool.record_event(id, event);
        if let Err(e) = pool.bind_slot(position, id) {
            warn!(error = %e, "Could not bind slot");
        }

        let mut index = self.locator.find(position, false).await;
        if let Some(found) = index {
            if !self.span.claim(found, Direction::Outbound, id) {
                index = None;
            }
        }

        let Some(index) = index else {
            if let Some(busy) = self.locator.lookup(position, true).index() {
                let state = self.span.inspect(busy, |c| (c.state(), c.extra_id()));
                error!(channel = busy, ?state, "Acknowledged channel is busy");
            } else {
                error!("Acknowledged position has no channel");
            }
            let mut failed = event.clone();
            failed.release_cause = cause::DESTINATION_OUT_OF_ORDER;
            pool.record_event(id, &failed);
            pool.mark_ignored(id);
            self.reply(
                EventKind::CallStartNack,
                position,
                id,
                cause::DESTINATION_OUT_OF_ORDER,
            );
            if let Err(e) = pool.fail(id) {
                warn!(error = %e, "Could not fail request");
            }
            return;
        };

        if let Err(e) = pool.bind(id, index) {
            warn!(error = %e, "Could not bind request to channel");
            self.span.update(index, |chan| chan.release_claim());
            return;
        }
        debug!(channel = index, "Request bound to channel");
    }

    fn upgrade_media(&self, channel: Option<usize>, id: u16) {
        let Some(index) = channel else {
            return;
        };
        self.span.update(index, |chan| {
            if chan.extra_id() == id && chan.state() == ChannelState::Progress {
                let _ = chan.set_state(ChannelState::ProgressMedia);
            }
        });
    }

    async fn call_start_nack(&self, event: &ProtocolEvent) {
        let id = event.request_id;
        let mut release_cause = event.release_cause;

        if release_cause == cause::SETUP_NACK_ALL_CKTS_BUSY {
            self.span
                .congestion()
                .mark(event.trunk_group, self.span.in_use_count());
            release_cause = cause::USER_BUSY;
        } else if release_cause == cause::SETUP_NACK_CSUPID_DBL_USE {
            release_cause = cause::USER_BUSY;
        }

        if id != 0 {
            let pool = self.span.pool();
            let mut recorded = event.clone();
            recorded.release_cause = release_cause;
            pool.record_event(id, &recorded);
            if let Err(e) = pool.fail(id) {
                debug!(error = %e, "Rejection for a request that is not waiting");
            }
            self.reply(EventKind::CallStartNackAck, Position::new(0, 0), id, 0);
            return;
        }

        if let Some(index) = self.locator.find(event.position, true).await {
            let cancelled = self.span.update(index, |chan| {
                let moved = chan.set_state(ChannelState::Cancel).is_ok();
                if moved {
                    chan.caller.hangup_cause = release_cause;
                }
                moved
            });
            if cancelled == Some(true) {
                return;
            }
        }

        // Nobody else will acknowledge it
        warn!("Rejection with no channel to cancel");
        self.reply(EventKind::CallStartNackAck, event.position, 0, 0);
    }

    async fn call_answered(&self, event: &ProtocolEvent) {
        let Some(index) = self.locator.find(event.position, true).await else {
            error!("Answer for a position with no channel");
            return;
        };

        self.span.update(index, |chan| {
            if chan.extra_id() != event.request_id || chan.direction() != Direction::Outbound {
                warn!(channel = index, extra_id = chan.extra_id(), "Answer does not match channel");
                return;
            }
            if chan.state() == ChannelState::Down {
                chan.ctx.answer_pending = true;
                return;
            }
            let _ = chan.set_state(ChannelState::Up);
        });
    }

    async fn call_stopped(&self, event: &ProtocolEvent) {
        let position = event.position;
        let Some(index) = self.locator.find(position, true).await else {
            error!("Stop for a position with no channel");
            self.span.pool().release_slot(position);
            self.reply(EventKind::CallStoppedAck, position, 0, 0);
            return;
        };

        let outcome = self.span.update(index, |chan| match chan.state() {
            ChannelState::Hangup => {
                // Both sides hung up; the local hangup finishes the call
                debug!(channel = index, "Hangup glare");
                StopOutcome::AckOnly
            }
            ChannelState::Down => {
                if chan.release_claim() {
                    chan.ctx.free_request_on_down = true;
                }
                StopOutcome::ReleaseAndAck
            }
            _ => {
                if chan.set_state(ChannelState::Terminating).is_err() {
                    return StopOutcome::ReleaseAndAck;
                }
                chan.caller.hangup_cause = event.release_cause;
                chan.ctx.free_request_on_down = true;
                StopOutcome::Terminating
            }
        });

        match outcome {
            Some(StopOutcome::Terminating) => {}
            Some(StopOutcome::AckOnly) => {
                self.reply(EventKind::CallStoppedAck, position, 0, 0);
            }
            Some(StopOutcome::ReleaseAndAck) | None => {
                self.span.pool().release_slot(position);
                self.reply(EventKind::CallStoppedAck, position, 0, 0);
            }
        }
    }

    /// CALL_STOPPED_ACK and CALL_START_NACK_ACK
    async fn call_done(&self, event: &ProtocolEvent) {
        let id = event.request_id;
        let pool = self.span.pool();

        if event.is(EventKind::CallStartNackAck) && id != 0 {
            // Acknowledges a rejection we sent for our own request
            pool.clear_ignored(id);
            return;
        }

        if let Some(index) = self.locator.find(event.position, true).await {
            let completed = self.span.update(index, |chan| {
                if matches!(chan.state(), ChannelState::Down | ChannelState::HangupComplete) {
                    return false;
                }
                if chan.set_state(ChannelState::HangupComplete).is_err() {
                    return false;
                }
                chan.ctx.free_request_on_down = true;
                true
            });
            if completed == Some(true) {
                return;
            }
        }

        if id != 0 {
            pool.retire(id);
        } else {
            pool.release_slot(event.position);
        }
    }

    async fn digit_in(&self, event: &ProtocolEvent) {
        let Some(index) = self.locator.find(event.position, true).await else {
            error!("Digits for a position with no channel");
            return;
        };
        if event.called_digits.is_empty() {
            warn!("Digit event without digits");
            return;
        }
        debug!(channel = index, digits = %event.called_digits, "Incoming digits");
        self.span
            .modify(index, |chan| chan.queue_dtmf(&event.called_digits));
    }

    fn heartbeat(&self, link: LinkKind, event: &ProtocolEvent) {
        self.span.send(link, event.clone());
        self.span.reset_heartbeat();
    }

    fn restart(&self) {
        warn!("Gateway requested restart");
        self.span.set_suspended(true);
        self.span.set_restarting(true);
        self.span.restart_channels();
        self.span.reset_heartbeat();
    }
}

/// Caller data carried by a network originated call start
fn caller_from_event(event: &ProtocolEvent) -> CallerData {
    let mut caller = CallerData {
        cid_num: event.calling_digits.clone(),
        cid_name: event.calling_digits.clone(),
        ani: event.calling_digits.clone(),
        dnis: event.called_digits.clone(),
        screen: event.screening,
        pres: event.presentation,
        ..Default::default()
    };
    if !event.calling_name.is_empty() {
        caller.cid_name = event.calling_name.clone();
    }
    caller.apply_redirecting(&event.redirecting);
    caller
}

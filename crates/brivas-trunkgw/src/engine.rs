//! Span Engine
//!
//! One engine per span: opens the link pair, announces a restart, then loops
//! polling both links, dispatching events, advancing channels with pending
//! state changes and running the heartbeat supervisor. Outgoing events from
//! every source are queued on the span outbox and written by the loop.

use crate::config::{EngineConfig, SpanConfig};
use crate::dispatcher::Dispatcher;
use crate::errors::{Result, TransportError, TrunkGwError};
use crate::fsm::ChannelState;
use crate::locator::WaitPolicy;
use crate::pool::{RequestPool, RequestStatus};
use crate::protocol::{encode_event, EventKind, ProtocolEvent};
use crate::signal::SignalListener;
use crate::span::{Span, SpanStatus};
use crate::supervisor::Supervisor;
use crate::transport::{Connector, LinkKind, LinkPair, Outgoing};
use crate::types::{cause, CallerData, DialTarget, Position, RequestId, SpanId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Why a loop session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    LinkFailed,
}

enum Activity {
    Received(LinkKind, std::result::Result<ProtocolEvent, TransportError>),
    Queued(Outgoing),
    Idle,
}

/// Signaling engine for one span
pub struct SpanEngine {
    span: Span,
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    outbox: Mutex<mpsc::UnboundedReceiver<Outgoing>>,
    stop_requested: AtomicBool,
    stop: Notify,
}

impl SpanEngine {
    pub fn new(
        span_config: &SpanConfig,
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        listener: Arc<dyn SignalListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = Arc::new(RequestPool::new(config.max_requests));
        let (span, outbox) = Span::new(span_config, pool, listener)?;
        info!(
            span_id = span.id(),
            channels = span.channel_count(),
            "Span engine created"
        );
        Ok(Arc::new(Self {
            span,
            config,
            connector,
            outbox: Mutex::new(outbox),
            stop_requested: AtomicBool::new(false),
            stop: Notify::new(),
        }))
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn span_id(&self) -> SpanId {
        self.span.id()
    }

    pub fn is_running(&self) -> bool {
        self.span.is_running()
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Start the engine on its own task.
    ///
    /// After a link failure the links are re-opened once the restart
    /// back-off has passed. Failing to open them at start ends the task
    /// with that error.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.supervise().await })
    }

    async fn supervise(&self) -> Result<()> {
        let mut exit = self.run().await?;
        while exit == LoopExit::LinkFailed && !self.stopping() {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.restart_backoff()) => {}
                    _ = self.stop.notified() => {}
                }
                if self.stopping() {
                    return Ok(());
                }
                match self.run().await {
                    Ok(next) => {
                        exit = next;
                        break;
                    }
                    Err(e) => {
                        warn!(span_id = self.span_id(), error = %e, "Re-opening links failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one loop session until shutdown or link failure
    #[instrument(skip(self), fields(span_id = self.span.id()))]
    pub async fn run(&self) -> Result<LoopExit> {
        let links = self.connector.open().await.map_err(|e| {
            error!(error = %e, "Failed to open gateway links");
            e
        })?;

        let mut outbox = self.outbox.lock().await;
        let mut stale = 0;
        while outbox.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "Discarded events queued before the links opened");
        }

        self.span.set_link_up(false);
        self.span.reset_heartbeat();
        self.span.set_running(true);
        info!("Span engine running");

        let exit = match links
            .heartbeat
            .send(&ProtocolEvent::system(EventKind::SystemRestart))
            .await
        {
            Ok(()) => self.poll_loop(&links, &mut outbox).await,
            Err(e) => {
                error!(error = %e, "Failed to announce restart");
                LoopExit::LinkFailed
            }
        };

        self.span.set_running(false);
        match exit {
            LoopExit::Shutdown => {
                if let Err(e) = links
                    .heartbeat
                    .send(&ProtocolEvent::system(EventKind::SystemRestart))
                    .await
                {
                    debug!(error = %e, "Could not announce shutdown");
                }
            }
            LoopExit::LinkFailed => {
                metrics::counter!("trunkgw_link_failures_total").increment(1);
                Supervisor::new(&self.span, self.config.heartbeat_timeout()).local_restart();
            }
        }
        links.close().await;
        info!(?exit, "Span engine stopped");
        Ok(exit)
    }

    async fn poll_loop(
        &self,
        links: &LinkPair,
        outbox: &mut mpsc::UnboundedReceiver<Outgoing>,
    ) -> LoopExit {
        let dispatcher = Dispatcher::new(&self.span, WaitPolicy::from_config(&self.config));
        let supervisor = Supervisor::new(&self.span, self.config.heartbeat_timeout());

        loop {
            if self.stopping() {
                return LoopExit::Shutdown;
            }

            let activity = tokio::select! {
                received = links.control.recv() => Activity::Received(LinkKind::Control, received),
                received = links.heartbeat.recv() => Activity::Received(LinkKind::Heartbeat, received),
                Some(queued) = outbox.recv() => Activity::Queued(queued),
                _ = tokio::time::sleep(self.config.poll_interval()) => Activity::Idle,
                _ = self.stop.notified() => Activity::Idle,
            };

            match activity {
                Activity::Received(link, Ok(event)) => dispatcher.dispatch(link, event).await,
                Activity::Received(_, Err(TransportError::Codec(_))) => {}
                Activity::Received(link, Err(e)) => {
                    error!(link = link.name(), error = %e, "Link failed");
                    return LoopExit::LinkFailed;
                }
                Activity::Queued(queued) => {
                    if !self.transmit(links, &queued).await {
                        return LoopExit::LinkFailed;
                    }
                }
                Activity::Idle => {}
            }

            self.span.advance_pending();
            supervisor.tick();

            while let Ok(queued) = outbox.try_recv() {
                if !self.transmit(links, &queued).await {
                    return LoopExit::LinkFailed;
                }
            }
        }
    }

    /// Send one queued event. An event that cannot be encoded is dropped and
    /// the link stays up; false means the link is dead.
    async fn transmit(&self, links: &LinkPair, queued: &Outgoing) -> bool {
        match links.send(queued).await {
            Ok(()) => true,
            Err(TransportError::Codec(e)) => {
                metrics::counter!("trunkgw_events_dropped_total", "reason" => "encode").increment(1);
                warn!(
                    link = queued.link.name(),
                    kind = queued.event.kind,
                    request_id = queued.event.request_id,
                    error = %e,
                    "Dropping event that cannot be encoded"
                );
                true
            }
            Err(e) => {
                error!(link = queued.link.name(), error = %e, "Send failed");
                false
            }
        }
    }

    /// Stop the engine loop
    pub fn shutdown(&self) {
        info!(span_id = self.span_id(), "Shutdown requested");
        self.stop_requested.store(true, Ordering::Release);
        self.stop.notify_one();
    }

    /// Originate a call and wait for the gateway to assign a channel.
    ///
    /// `dial` may carry a `@<hunt><group>` suffix. Returns the channel index.
    #[instrument(skip(self, caller), fields(span_id = self.span.id()))]
    pub async fn request_channel(&self, caller: &CallerData, dial: &str) -> Result<usize> {
        if !self.span.is_running() || self.stopping() {
            return Err(TrunkGwError::Shutdown);
        }
        if self.span.is_suspended() {
            error!("Span is not online");
            return Err(TrunkGwError::SpanSuspended(self.span.id()));
        }

        let target = DialTarget::parse(dial);
        if self.span.congestion().is_congested(target.trunk_group) {
            warn!(trunk_group = target.trunk_group + 1, "Trunk group backing off");
            return Err(TrunkGwError::Congested(target.trunk_group));
        }
        if self.span.in_use_count() >= self.span.channel_count() {
            warn!("All circuits are busy");
            return Err(TrunkGwError::AllCircuitsBusy);
        }

        let mut caller = caller.clone();
        caller.dnis = target.digits.clone();
        let mut start = ProtocolEvent::call_start(
            0,
            &caller,
            &target.digits,
            target.trunk_group,
            target.hunt_group,
        );
        if let Err(e) = encode_event(&start) {
            warn!(error = %e, "Call start cannot be encoded");
            return Err(e.into());
        }

        let pool = self.span.pool();
        let id = pool.issue(self.span.id())?;
        start.request_id = id;
        self.span.send(LinkKind::Control, start);
        debug!(request_id = id, called = %target.digits, "Call start sent");

        for _ in 0..self.config.request_poll_budget() {
            if pool.status(id) != Some(RequestStatus::Waiting) || self.stopping() {
                break;
            }
            tokio::time::sleep(self.config.request_poll()).await;
        }

        if pool.abandon(id) {
            error!(request_id = id, "Timed out waiting for the gateway");
            self.span.send(
                LinkKind::Control,
                ProtocolEvent::command(EventKind::CallStartNack, Position::new(0, 0), id, 0),
            );
            self.release_request(id);
            return Err(TrunkGwError::Timeout);
        }

        let Some(request) = pool.request(id) else {
            return Err(TrunkGwError::Rejected {
                cause: cause::NORMAL_UNSPECIFIED,
            });
        };

        match (request.status, request.channel) {
            (RequestStatus::Ready, Some(index)) => {
                let media = request
                    .event
                    .as_ref()
                    .map(|e| e.is(EventKind::CallStartAck) || e.media_ready())
                    .unwrap_or(true);
                let state = if media {
                    ChannelState::ProgressMedia
                } else {
                    ChannelState::Progress
                };
                let started = self.span.modify(index, |chan| {
                    if chan.extra_id() != id {
                        return false;
                    }
                    chan.caller = caller;
                    chan.set_state(state).is_ok()
                });
                if started == Some(true) {
                    info!(request_id = id, channel = index, ?state, "Outbound call assigned");
                    Ok(index)
                } else {
                    warn!(request_id = id, channel = index, "Assigned channel was released");
                    self.release_request(id);
                    Err(TrunkGwError::Rejected {
                        cause: cause::NORMAL_CLEARING,
                    })
                }
            }
            (RequestStatus::Failed, _) => {
                let release_cause = request
                    .event
                    .map(|e| e.release_cause)
                    .filter(|c| *c != 0)
                    .unwrap_or(cause::NORMAL_UNSPECIFIED);
                warn!(request_id = id, cause = release_cause, "Call setup rejected");
                self.release_request(id);
                Err(TrunkGwError::Rejected {
                    cause: release_cause,
                })
            }
            (status, _) => {
                warn!(request_id = id, status = status.name(), "Request ended without a channel");
                self.release_request(id);
                Err(TrunkGwError::Rejected {
                    cause: cause::NORMAL_CLEARING,
                })
            }
        }
    }

    /// Return a request that never produced a call: drop any channel still
    /// claimed for it, then free the id and its slot binding
    fn release_request(&self, id: RequestId) {
        let released = self.span.release_abandoned(id);
        if released > 0 {
            debug!(request_id = id, released, "Released claim of an unfinished request");
        }
        self.span.pool().retire(id);
    }

    fn transition(&self, index: usize, f: impl FnOnce(&mut crate::channel::Channel) -> Result<()>) -> Result<()> {
        self.span
            .modify(index, f)
            .ok_or(TrunkGwError::UnknownChannel(index))?
    }

    /// Answer an inbound call
    pub fn answer(&self, index: usize) -> Result<()> {
        self.transition(index, |chan| {
            if chan.state() == ChannelState::Ring {
                chan.set_state(ChannelState::ProgressMedia)?;
            }
            chan.set_state(ChannelState::Up)?;
            Ok(())
        })
    }

    /// Signal progress on an inbound call
    pub fn progress(&self, index: usize, media: bool) -> Result<()> {
        let state = if media {
            ChannelState::ProgressMedia
        } else {
            ChannelState::Progress
        };
        self.transition(index, |chan| Ok(chan.set_state(state)?))
    }

    /// Hang a call up from the switch side
    pub fn hangup(&self, index: usize, release_cause: u8) -> Result<()> {
        self.transition(index, |chan| {
            chan.set_state(ChannelState::Hangup)?;
            chan.caller.hangup_cause = release_cause;
            Ok(())
        })
    }

    /// Drain digits received for a channel
    pub fn take_dtmf(&self, index: usize) -> Result<String> {
        self.span
            .modify(index, |chan| chan.take_dtmf())
            .ok_or(TrunkGwError::UnknownChannel(index))
    }

    pub fn status(&self) -> SpanStatus {
        self.span.status()
    }
}

//! Span: the channel array of one trunk group and its link flags
//!
//! Lock order is span signal lock, then channel lock, then request pool.
//! Outgoing events produced under those locks are queued on the span outbox
//! and sent by the engine loop after the locks are gone.

use crate::channel::{Channel, Effects};
use crate::config::SpanConfig;
use crate::congestion::CongestionTable;
use crate::errors::TrunkGwError;
use crate::fsm::ChannelState;
use crate::pool::RequestPool;
use crate::signal::SignalListener;
use crate::transport::{LinkKind, Outgoing};
use crate::types::{Direction, Position, RequestId, SpanId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

/// Diagnostic view of one channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub index: usize,
    pub position: String,
    pub state: ChannelState,
    pub direction: Direction,
    pub request_id: RequestId,
    pub in_use: bool,
    pub last_change: DateTime<Utc>,
}

/// Diagnostic view of a span
#[derive(Debug, Clone, Serialize)]
pub struct SpanStatus {
    pub span_id: SpanId,
    pub running: bool,
    pub suspended: bool,
    pub restarting: bool,
    pub link_up: bool,
    pub heartbeat_elapsed_ms: u64,
    pub requests_in_flight: usize,
    pub channels: Vec<ChannelStatus>,
}

/// One span and everything the engine shares about it
pub struct Span {
    id: SpanId,
    /// Signal lock over the channel array
    channels: RwLock<Vec<Mutex<Channel>>>,
    positions: HashMap<Position, usize>,
    suspended: AtomicBool,
    restarting: AtomicBool,
    running: AtomicBool,
    /// Restart handshake with the gateway completed
    link_up: AtomicBool,
    /// Last heartbeat or restart exchange
    heartbeat_at: Mutex<Instant>,
    idle: Notify,
    outbox: mpsc::UnboundedSender<Outgoing>,
    pool: Arc<RequestPool>,
    congestion: CongestionTable,
    listener: Arc<dyn SignalListener>,
}

impl Span {
    /// Build the channel array from the configured physical positions.
    ///
    /// Returns the span and the receiving end of its outbox.
    pub fn new(
        config: &SpanConfig,
        pool: Arc<RequestPool>,
        listener: Arc<dyn SignalListener>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Outgoing>), TrunkGwError> {
        config.validate()?;
        let mut channels = Vec::new();
        let mut positions = HashMap::new();
        for (index, (trunk, slot)) in config.physical_positions().into_iter().enumerate() {
            let position = Position::from_physical(trunk, slot).ok_or_else(|| {
                TrunkGwError::Config(format!(
                    "span {}: invalid physical position {}:{}",
                    config.span_id, trunk, slot
                ))
            })?;
            if positions.insert(position, index).is_some() {
                return Err(TrunkGwError::Config(format!(
                    "span {}: position {} configured twice",
                    config.span_id, position
                )));
            }
            channels.push(Mutex::new(Channel::new(index, config.span_id, position)));
        }

        let (outbox, rx) = mpsc::unbounded_channel();
        let span = Self {
            id: config.span_id,
            channels: RwLock::new(channels),
            positions,
            suspended: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            running: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            heartbeat_at: Mutex::new(Instant::now()),
            idle: Notify::new(),
            outbox,
            pool,
            congestion: CongestionTable::new(),
            listener,
        };
        Ok((span, rx))
    }

    pub fn id(&self) -> SpanId {
        self.id
    }

    pub fn pool(&self) -> &RequestPool {
        &self.pool
    }

    pub fn congestion(&self) -> &CongestionTable {
        &self.congestion
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Channel configured at a wire position
    pub fn index_of(&self, position: Position) -> Option<usize> {
        self.positions.get(&position).copied()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn set_suspended(&self, value: bool) {
        self.suspended.store(value, Ordering::Release);
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::Acquire)
    }

    pub fn set_restarting(&self, value: bool) {
        self.restarting.store(value, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::Release);
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    pub fn set_link_up(&self, value: bool) {
        self.link_up.store(value, Ordering::Release);
    }

    pub fn heartbeat_elapsed(&self) -> Duration {
        self.heartbeat_at.lock().elapsed()
    }

    pub fn reset_heartbeat(&self) {
        *self.heartbeat_at.lock() = Instant::now();
    }

    /// Queue an event for the engine loop to send
    pub fn send(&self, link: LinkKind, event: crate::protocol::ProtocolEvent) {
        if self.outbox.send(Outgoing::new(link, event)).is_err() {
            warn!(span_id = self.id, "Outbox closed, dropping event");
        }
    }

    /// Read-only access to a channel under its lock
    pub fn inspect<R>(&self, index: usize, f: impl FnOnce(&Channel) -> R) -> Option<R> {
        let channels = self.channels.read();
        let chan = channels.get(index)?.lock();
        Some(f(&chan))
    }

    /// Mutate a channel without running side effects; they run on the next
    /// maintenance pass
    pub fn modify<R>(&self, index: usize, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let channels = self.channels.read();
        let mut chan = channels.get(index)?.lock();
        Some(f(&mut chan))
    }

    /// Mutate a channel and run its entry side effects right away.
    ///
    /// Side effects still pending from earlier changes run before `f`.
    pub fn update<R>(&self, index: usize, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let (result, outbox, became_idle) = {
            let channels = self.channels.read();
            let mut chan = channels.get(index)?.lock();
            let mut fx = Effects::new(&self.pool, self.listener.as_ref());
            chan.advance(&mut fx);
            let result = f(&mut chan);
            chan.advance(&mut fx);
            (result, fx.outbox, fx.became_idle)
        };
        self.flush(outbox, became_idle);
        Some(result)
    }

    /// Claim an idle channel for a new call under the signal write lock
    pub fn claim(&self, index: usize, direction: Direction, extra_id: RequestId) -> bool {
        let channels = self.channels.write();
        let Some(chan) = channels.get(index) else {
            return false;
        };
        let mut chan = chan.lock();
        if !chan.is_idle() {
            return false;
        }
        chan.open(direction, extra_id);
        true
    }

    /// Run side effects for every channel with a pending state change
    pub fn advance_pending(&self) -> usize {
        let mut advanced = 0;
        for index in 0..self.channel_count() {
            let pending = self.inspect(index, |c| c.has_pending()).unwrap_or(false);
            if pending {
                self.update(index, |_| ());
                advanced += 1;
            }
        }
        advanced
    }

    /// Force every channel that is not `Down` into `Restart`. Channels
    /// claimed for a call that never started are released as well.
    pub fn restart_channels(&self) -> usize {
        let mut forced = 0;
        for index in 0..self.channel_count() {
            let moved = self.update(index, |chan| {
                if chan.state() != ChannelState::Down {
                    return chan.set_state(ChannelState::Restart).is_ok();
                }
                if chan.release_claim() {
                    chan.ctx.free_request_on_down = true;
                    return true;
                }
                false
            });
            if moved == Some(true) {
                forced += 1;
            }
        }
        if forced > 0 {
            info!(span_id = self.id, forced, "Channels forced to restart");
        }
        forced
    }

    /// Drop claims still held for request `id`. The `Down` cleanup runs on
    /// the next maintenance pass.
    pub fn release_abandoned(&self, id: RequestId) -> usize {
        (0..self.channel_count())
            .filter(|&index| self.modify(index, |chan| chan.abandon_claim(id)) == Some(true))
            .count()
    }

    pub fn all_down(&self) -> bool {
        self.channels
            .read()
            .iter()
            .all(|c| c.lock().state() == ChannelState::Down)
    }

    pub fn in_use_count(&self) -> usize {
        self.channels
            .read()
            .iter()
            .filter(|c| c.lock().flags.in_use)
            .count()
    }

    /// Future resolved the next time any channel reaches `Down`
    pub fn idle_notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.idle.notified()
    }

    pub fn status(&self) -> SpanStatus {
        let channels = self
            .channels
            .read()
            .iter()
            .map(|c| {
                let chan = c.lock();
                ChannelStatus {
                    index: chan.index,
                    position: chan.position.to_string(),
                    state: chan.state(),
                    direction: chan.direction(),
                    request_id: chan.extra_id(),
                    in_use: chan.flags.in_use,
                    last_change: chan.last_change(),
                }
            })
            .collect();

        SpanStatus {
            span_id: self.id,
            running: self.is_running(),
            suspended: self.is_suspended(),
            restarting: self.is_restarting(),
            link_up: self.is_link_up(),
            heartbeat_elapsed_ms: self.heartbeat_elapsed().as_millis() as u64,
            requests_in_flight: self.pool.in_flight(),
            channels,
        }
    }

    fn flush(&self, outbox: Vec<Outgoing>, became_idle: bool) {
        for outgoing in outbox {
            if self.outbox.send(outgoing).is_err() {
                warn!(span_id = self.id, "Outbox closed, dropping event");
            }
        }
        if became_idle {
            self.idle.notify_waiters();
        }
    }
}

//! Channel Locator
//!
//! Maps the zero-based position carried by an event to the span's channel.
//! Without `force`, a channel still busy with a previous call is waited on
//! for a bounded time before giving up.

use crate::config::EngineConfig;
use crate::fsm::ChannelState;
use crate::span::Span;
use crate::types::Position;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded wait for a busy channel
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub retries: u32,
    pub wait: Duration,
}

impl WaitPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retries: config.locator_retries,
            wait: config.locator_wait(),
        }
    }

    /// Fail immediately when busy
    pub const fn none() -> Self {
        Self {
            retries: 0,
            wait: Duration::ZERO,
        }
    }
}

/// Outcome of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Located {
    Found(usize),
    /// Configured, but still carrying a call
    Busy(usize),
    /// No channel at that position on this span
    Unknown,
}

impl Located {
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Found(index) => Some(*index),
            _ => None,
        }
    }
}

pub struct ChannelLocator<'a> {
    span: &'a Span,
    policy: WaitPolicy,
}

impl<'a> ChannelLocator<'a> {
    pub fn new(span: &'a Span, policy: WaitPolicy) -> Self {
        Self { span, policy }
    }

    /// Look a position up without waiting
    pub fn lookup(&self, position: Position, force: bool) -> Located {
        let Some(index) = self.span.index_of(position) else {
            return Located::Unknown;
        };
        if force {
            return Located::Found(index);
        }
        match self.span.inspect(index, |c| c.is_idle()) {
            Some(true) => Located::Found(index),
            Some(false) => Located::Busy(index),
            None => Located::Unknown,
        }
    }

    /// Resolve `position`, waiting for a busy channel unless `force` is set
    pub async fn find(&self, position: Position, force: bool) -> Option<usize> {
        let index = match self.lookup(position, force) {
            Located::Found(index) => return Some(index),
            Located::Unknown => {
                warn!(span_id = self.span.id(), %position, "No channel at position");
                return None;
            }
            Located::Busy(index) => index,
        };

        // A call that is still tearing down may only be missing its pending
        // side effects
        if self.span.inspect(index, |c| c.has_pending()).unwrap_or(false) {
            self.span.update(index, |_| ());
        }

        for attempt in 0..=self.policy.retries {
            let notified = self.span.idle_notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (idle, state) = match self.span.inspect(index, |c| (c.is_idle(), c.state())) {
                Some(found) => found,
                None => return None,
            };
            if idle {
                debug!(span_id = self.span.id(), %position, attempt, "Channel freed up");
                return Some(index);
            }
            if !waitable(state) || attempt == self.policy.retries {
                break;
            }
            let _ = tokio::time::timeout(self.policy.wait, notified).await;
        }

        warn!(span_id = self.span.id(), %position, "Channel already in use");
        metrics::counter!("trunkgw_channel_contention_total").increment(1);
        None
    }
}

/// States a channel passes through on its way back to idle
fn waitable(state: ChannelState) -> bool {
    matches!(
        state,
        ChannelState::Down
            | ChannelState::Terminating
            | ChannelState::Hangup
            | ChannelState::HangupComplete
            | ChannelState::Cancel
            | ChannelState::Restart
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpanConfig;
    use crate::pool::RequestPool;
    use crate::signal::{SignalEvent, SignalListener, SignalRejected};
    use crate::types::Direction;
    use std::sync::Arc;
    use std::time::Instant;

    fn span() -> Arc<Span> {
        let listener: Arc<dyn SignalListener> =
            Arc::new(|_: &SignalEvent| -> Result<(), SignalRejected> { Ok(()) });
        let (span, _rx) = Span::new(
            &SpanConfig::single_trunk(1, 1, 4),
            Arc::new(RequestPool::new(8)),
            listener,
        )
        .unwrap();
        Arc::new(span)
    }

    #[tokio::test]
    async fn test_find_idle_and_unknown() {
        let span = span();
        let locator = ChannelLocator::new(&span, WaitPolicy::none());
        assert_eq!(locator.find(Position::new(0, 2), false).await, Some(2));
        assert_eq!(locator.find(Position::new(5, 2), true).await, None);
    }

    #[tokio::test]
    async fn test_force_ignores_busy() {
        let span = span();
        span.claim(1, Direction::Inbound, 0);
        let locator = ChannelLocator::new(&span, WaitPolicy::none());
        assert_eq!(locator.lookup(Position::new(0, 1), false), Located::Busy(1));
        assert_eq!(locator.find(Position::new(0, 1), false).await, None);
        assert_eq!(locator.find(Position::new(0, 1), true).await, Some(1));
    }

    #[tokio::test]
    async fn test_pending_teardown_is_completed() {
        let span = span();
        span.claim(0, Direction::Inbound, 0);
        span.update(0, |c| c.set_state(ChannelState::Ring)).unwrap().unwrap();
        span.modify(0, |c| c.set_state(ChannelState::Terminating)).unwrap().unwrap();

        let locator = ChannelLocator::new(&span, WaitPolicy::none());
        assert_eq!(locator.find(Position::new(0, 0), false).await, Some(0));
    }

    #[tokio::test]
    async fn test_waits_for_channel_to_free() {
        let span = span();
        span.claim(3, Direction::Inbound, 0);
        span.update(3, |c| c.set_state(ChannelState::Ring)).unwrap().unwrap();
        span.update(3, |c| c.set_state(ChannelState::Hangup)).unwrap().unwrap();

        let releaser = span.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.update(3, |c| c.set_state(ChannelState::HangupComplete));
        });

        let policy = WaitPolicy {
            retries: 50,
            wait: Duration::from_millis(10),
        };
        let locator = ChannelLocator::new(&span, policy);
        let started = Instant::now();
        assert_eq!(locator.find(Position::new(0, 3), false).await, Some(3));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_live_call_is_not_waited_on() {
        let span = span();
        span.claim(0, Direction::Inbound, 0);
        span.update(0, |c| c.set_state(ChannelState::Ring)).unwrap().unwrap();

        let policy = WaitPolicy {
            retries: 100,
            wait: Duration::from_millis(50),
        };
        let locator = ChannelLocator::new(&span, policy);
        let started = Instant::now();
        assert_eq!(locator.find(Position::new(0, 0), false).await, None);
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}

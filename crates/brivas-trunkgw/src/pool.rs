//! Outbound Request Pool
//!
//! Fixed-capacity arena of call-setup correlation ids plus the slot-binding
//! grid that maps a physical position back to the request that owns it.
//! Everything sits behind one mutex that is only held for the scan or update,
//! never across I/O.

use crate::errors::PoolError;
use crate::protocol::ProtocolEvent;
use crate::types::{Position, RequestId, SpanId};
use parking_lot::Mutex;
use tracing::{debug, warn};

const GRID_DIM: usize = 256;

/// Lifecycle of a request id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Free,
    Waiting,
    Ready,
    Failed,
}

impl RequestStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Waiting => "Waiting",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        }
    }
}

/// Snapshot of one pool entry
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: RequestId,
    pub status: RequestStatus,
    pub span: Option<SpanId>,
    /// Channel index within the owning span, set on success
    pub channel: Option<usize>,
    /// Position bound through the slot grid
    pub position: Option<Position>,
    /// Last acknowledgement received for this id
    pub event: Option<ProtocolEvent>,
}

#[derive(Debug, Clone)]
struct RequestEntry {
    status: RequestStatus,
    span: Option<SpanId>,
    channel: Option<usize>,
    position: Option<Position>,
    event: Option<ProtocolEvent>,
    /// We gave up on this id and told the gateway so; late replies are dropped
    ignored: bool,
}

impl RequestEntry {
    const fn free() -> Self {
        Self {
            status: RequestStatus::Free,
            span: None,
            channel: None,
            position: None,
            event: None,
            ignored: false,
        }
    }
}

struct PoolInner {
    /// Index 0 is never issued
    entries: Vec<RequestEntry>,
    last_issued: RequestId,
    grid: Vec<RequestId>,
}

impl PoolInner {
    fn entry(&self, id: RequestId) -> Result<&RequestEntry, PoolError> {
        if id == 0 || id as usize >= self.entries.len() {
            return Err(PoolError::OutOfRange(id));
        }
        Ok(&self.entries[id as usize])
    }

    fn entry_mut(&mut self, id: RequestId) -> Result<&mut RequestEntry, PoolError> {
        if id == 0 || id as usize >= self.entries.len() {
            return Err(PoolError::OutOfRange(id));
        }
        Ok(&mut self.entries[id as usize])
    }

    fn retire(&mut self, id: RequestId) {
        let Ok(entry) = self.entry_mut(id) else {
            return;
        };
        let position = entry.position.take();
        let ignored = entry.ignored;
        *entry = RequestEntry::free();
        entry.ignored = ignored;

        if let Some(pos) = position {
            let cell = grid_index(pos);
            if self.grid[cell] == id {
                self.grid[cell] = 0;
            }
        }
    }
}

fn grid_index(pos: Position) -> usize {
    pos.trunk as usize * GRID_DIM + pos.slot as usize
}

/// Pool of outbound call-setup request ids
pub struct RequestPool {
    capacity: u16,
    inner: Mutex<PoolInner>,
}

impl RequestPool {
    /// Create a pool issuing ids `1..=capacity`
    pub fn new(capacity: u16) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(PoolInner {
                entries: vec![RequestEntry::free(); capacity as usize + 1],
                last_issued: 0,
                grid: vec![0; GRID_DIM * GRID_DIM],
            }),
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Issue the next free id after the last one issued, wrapping around.
    ///
    /// Fails with [`PoolError::Exhausted`] after one full cycle without a free id.
    pub fn issue(&self, span: SpanId) -> Result<RequestId, PoolError> {
        let mut inner = self.inner.lock();
        for _ in 0..self.capacity {
            let next = if inner.last_issued >= self.capacity {
                1
            } else {
                inner.last_issued + 1
            };
            inner.last_issued = next;

            let entry = &mut inner.entries[next as usize];
            if entry.status != RequestStatus::Free || entry.ignored {
                continue;
            }
            entry.status = RequestStatus::Waiting;
            entry.span = Some(span);
            entry.channel = None;
            entry.position = None;
            entry.event = None;
            debug!(request_id = next, span_id = span, "Issued request id");
            return Ok(next);
        }

        metrics::counter!("trunkgw_pool_exhausted_total").increment(1);
        Err(PoolError::Exhausted(self.capacity as usize))
    }

    /// Return an id to `Free`. Idempotent; out-of-range ids are ignored.
    pub fn retire(&self, id: RequestId) {
        self.inner.lock().retire(id);
    }

    /// `Waiting` -> `Ready`, recording the channel that now carries the call
    pub fn bind(&self, id: RequestId, channel: usize) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;
        if entry.status != RequestStatus::Waiting {
            return Err(PoolError::InvalidStatus {
                id,
                expected: RequestStatus::Waiting.name(),
                actual: entry.status.name(),
            });
        }
        entry.status = RequestStatus::Ready;
        entry.channel = Some(channel);
        Ok(())
    }

    /// `Waiting` -> `Failed`
    pub fn fail(&self, id: RequestId) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;
        if entry.status != RequestStatus::Waiting {
            return Err(PoolError::InvalidStatus {
                id,
                expected: RequestStatus::Waiting.name(),
                actual: entry.status.name(),
            });
        }
        entry.status = RequestStatus::Failed;
        Ok(())
    }

    /// Give up on an id still `Waiting`: mark it ignored and return it to
    /// `Free` in one step. Returns false if the gateway answered first.
    pub fn abandon(&self, id: RequestId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entry_mut(id) {
            Ok(entry) if entry.status == RequestStatus::Waiting => entry.ignored = true,
            _ => return false,
        }
        inner.retire(id);
        true
    }

    pub fn status(&self, id: RequestId) -> Option<RequestStatus> {
        self.inner.lock().entry(id).ok().map(|e| e.status)
    }

    pub fn request(&self, id: RequestId) -> Option<RequestInfo> {
        let inner = self.inner.lock();
        let entry = inner.entry(id).ok()?;
        Some(RequestInfo {
            id,
            status: entry.status,
            span: entry.span,
            channel: entry.channel,
            position: entry.position,
            event: entry.event.clone(),
        })
    }

    /// Keep the latest acknowledgement seen for an id
    pub fn record_event(&self, id: RequestId, event: &ProtocolEvent) {
        if let Ok(entry) = self.inner.lock().entry_mut(id) {
            entry.event = Some(event.clone());
        }
    }

    /// Mark an id whose late replies must be dropped. The id is not issued
    /// again until [`RequestPool::clear_ignored`].
    pub fn mark_ignored(&self, id: RequestId) {
        if let Ok(entry) = self.inner.lock().entry_mut(id) {
            entry.ignored = true;
        }
    }

    pub fn is_ignored(&self, id: RequestId) -> bool {
        self.inner
            .lock()
            .entry(id)
            .map(|e| e.ignored)
            .unwrap_or(false)
    }

    pub fn clear_ignored(&self, id: RequestId) {
        if let Ok(entry) = self.inner.lock().entry_mut(id) {
            entry.ignored = false;
        }
    }

    /// Record that `id` owns the physical position `pos`
    pub fn bind_slot(&self, pos: Position, id: RequestId) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        inner.entry(id)?;
        let cell = grid_index(pos);
        let previous = inner.grid[cell];
        if previous != 0 && previous != id {
            warn!(%pos, previous, request_id = id, "Slot already bound, rebinding");
            if let Ok(stale) = inner.entry_mut(previous) {
                stale.position = None;
            }
        }
        inner.grid[cell] = id;
        inner.entry_mut(id)?.position = Some(pos);
        Ok(())
    }

    pub fn slot_owner(&self, pos: Position) -> Option<RequestId> {
        match self.inner.lock().grid[grid_index(pos)] {
            0 => None,
            id => Some(id),
        }
    }

    /// Clear the binding for `pos` and retire the id that owned it
    pub fn release_slot(&self, pos: Position) -> Option<RequestId> {
        let mut inner = self.inner.lock();
        let cell = grid_index(pos);
        let id = inner.grid[cell];
        if id == 0 {
            return None;
        }
        inner.grid[cell] = 0;
        inner.retire(id);
        debug!(%pos, request_id = id, "Released slot binding");
        Some(id)
    }

    /// Retire every id owned by `span`, e.g. once a restart completes
    pub fn reset_span(&self, span: SpanId) -> usize {
        let mut inner = self.inner.lock();
        let owned: Vec<RequestId> = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status != RequestStatus::Free && e.span == Some(span))
            .map(|(id, _)| id as RequestId)
            .collect();
        for id in &owned {
            inner.retire(*id);
        }
        owned.len()
    }

    /// Number of ids not currently `Free`
    pub fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.status != RequestStatus::Free)
            .count()
    }
}

//! Running span engines keyed by span id

use crate::engine::SpanEngine;
use crate::errors::Result;
use crate::span::SpanStatus;
use crate::types::SpanId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

struct Running {
    engine: Arc<SpanEngine>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

#[derive(Default)]
pub struct SpanRegistry {
    spans: DashMap<SpanId, Running>,
}

impl SpanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `engine` and keep it. An engine already registered for the same
    /// span is shut down first.
    pub fn start(&self, engine: Arc<SpanEngine>) {
        let span_id = engine.span_id();
        let task = engine.spawn();
        let previous = self.spans.insert(
            span_id,
            Running {
                engine,
                task: Mutex::new(Some(task)),
            },
        );
        if let Some(previous) = previous {
            previous.engine.shutdown();
        }
        info!(span_id, "Span started");
    }

    pub fn get(&self, span_id: SpanId) -> Option<Arc<SpanEngine>> {
        self.spans.get(&span_id).map(|r| Arc::clone(&r.engine))
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn status(&self) -> Vec<SpanStatus> {
        let mut status: Vec<_> = self.spans.iter().map(|r| r.engine.status()).collect();
        status.sort_by_key(|s| s.span_id);
        status
    }

    /// Stop one span and wait for its loop to finish
    pub async fn stop(&self, span_id: SpanId) -> bool {
        let Some((_, running)) = self.spans.remove(&span_id) else {
            return false;
        };
        running.engine.shutdown();
        let task = running.task.lock().take();
        Self::join(span_id, task).await;
        true
    }

    /// Stop every span and wait for their loops to finish
    pub async fn shutdown_all(&self) {
        let ids: Vec<SpanId> = self.spans.iter().map(|r| *r.key()).collect();
        for span_id in ids {
            self.stop(span_id).await;
        }
    }

    async fn join(span_id: SpanId, task: Option<JoinHandle<Result<()>>>) {
        let Some(task) = task else {
            return;
        };
        match task.await {
            Ok(Ok(())) => info!(span_id, "Span stopped"),
            Ok(Err(e)) => error!(span_id, error = %e, "Span engine failed"),
            Err(e) => error!(span_id, error = %e, "Span task panicked"),
        }
    }
}

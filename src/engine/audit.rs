//! Fire-and-forget audit emission
//!
//! Decisions are pushed onto a bounded in-memory queue drained by a
//! background task. The hot path never waits on the sink: when the queue is
//! full the oldest event is dropped and counted, so a slow or down audit
//! collaborator cannot add latency or backpressure to authorization.

use crate::error::Result;
use crate::types::{Decision, DecisionReason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Append-only audit event handed to the external collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tenant_id: String,
    pub subject_id: String,
    pub resource: String,
    pub action: String,
    pub allowed: bool,
    pub reason: DecisionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_policy: Option<String>,
    /// Data-quality and SoD flags surfaced during evaluation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn from_decision(
        tenant_id: &str,
        subject_id: &str,
        resource: &str,
        action: &str,
        decision: &Decision,
        flags: Vec<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            subject_id: subject_id.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            allowed: decision.allowed,
            reason: decision.reason.clone(),
            matched_policy: decision.matched_policy.clone(),
            flags,
            timestamp: Utc::now(),
        }
    }
}

/// External audit collaborator boundary
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn deliver(&self, event: AuditEvent) -> Result<()>;
}

/// In-memory sink for tests and diagnostics
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn deliver(&self, event: AuditEvent) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        Ok(())
    }
}

/// Bounded queue + background drain task
pub struct AuditPipeline {
    queue: Arc<Mutex<VecDeque<AuditEvent>>>,
    notify: Arc<Notify>,
    capacity: usize,
    dropped: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl AuditPipeline {
    /// Spawn the drain task on the current tokio runtime
    pub fn new(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let queue: Arc<Mutex<VecDeque<AuditEvent>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());

        let worker_queue = Arc::clone(&queue);
        let worker_notify = Arc::clone(&notify);
        let worker = tokio::spawn(async move {
            loop {
                worker_notify.notified().await;
                loop {
                    let event = {
                        let Ok(mut q) = worker_queue.lock() else { break };
                        q.pop_front()
                    };
                    let Some(event) = event else { break };
                    if let Err(e) = sink.deliver(event).await {
                        warn!("audit delivery failed: {}", e);
                    }
                }
            }
        });

        Self {
            queue,
            notify,
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicUsize::new(0)),
            worker,
        }
    }

    /// Enqueue an event without blocking. Drops the oldest queued event on
    /// overflow.
    pub fn emit(&self, event: AuditEvent) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(event);
            if queue.len() > self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "audit queue full, dropped oldest event");
            }
        }
        self.notify.notify_one();
    }

    /// Events dropped due to overflow
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until the queue is drained (test helper)
    pub async fn flush(&self) {
        loop {
            let empty = self.queue.lock().map(|q| q.is_empty()).unwrap_or(true);
            if empty {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

impl Drop for AuditPipeline {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

//! In-memory registry of live runs.
//!
//! Holds fast-changing progress for runs this process is executing. It is
//! never the source of truth: after a restart it is empty and status reads
//! fall back to the durable store. Terminal entries linger for a grace
//! period so that late pollers still see the final step. Once an entry is
//! settled on a terminal step, later progress writes are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Live progress of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    /// Substage marker (mirrors `current_step`)
    pub step: String,
    /// Coarse completion percentage, 0..=100
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    settled: bool,
}

/// Concurrent map of run id -> progress
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    entries: Arc<DashMap<Uuid, RunProgress>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step, keeping the original start time. No-op once the
    /// entry is settled.
    pub fn set_progress(&self, id: Uuid, step: impl Into<String>, progress: u8) {
        self.write(id, step.into(), progress, None, false);
    }

    /// Record the terminal step of a run
    pub fn settle(&self, id: Uuid, step: impl Into<String>, progress: u8) {
        self.write(id, step.into(), progress, None, true);
    }

    /// Mark a run as failed; progress drops to zero
    pub fn set_error(&self, id: Uuid, step: impl Into<String>, error: impl Into<String>) {
        self.write(id, step.into(), 0, Some(error.into()), true);
    }

    fn write(&self, id: Uuid, step: String, progress: u8, error: Option<String>, settle: bool) {
        let now = Utc::now();
        let progress = progress.min(100);
        self.entries
            .entry(id)
            .and_modify(|entry| {
                if entry.settled {
                    return;
                }
                entry.step = step.clone();
                entry.progress = progress;
                entry.updated_at = now;
                if error.is_some() {
                    entry.error = error.clone();
                }
                entry.settled = settle;
            })
            .or_insert_with(|| RunProgress {
                step,
                progress,
                started_at: now,
                updated_at: now,
                error,
                settled: settle,
            });
    }

    pub fn get(&self, id: Uuid) -> Option<RunProgress> {
        self.entries.get(&id).map(|entry| entry.clone())
    }

    /// Snapshot of every tracked run
    pub fn list_active(&self) -> HashMap<Uuid, RunProgress> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn remove(&self, id: Uuid) -> Option<RunProgress> {
        self.entries.remove(&id).map(|(_, progress)| progress)
    }

    /// Drop the entry after `delay`
    pub fn expire_after(&self, id: Uuid, delay: Duration) {
        if !self.entries.contains_key(&id) {
            return;
        }
        let entries = self.entries.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if entries.remove(&id).is_some() {
                debug!(project_id = %id, "Progress entry expired");
            }
        });
    }
}

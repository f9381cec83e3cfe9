use crate::store::{RecordKey, Store};
use pkgbuilderd_common::errors::*;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const STATUS_IDLE: &str = "Idle";

/// Server wide state shared by every worker.
///
/// Consistency of the display fields is best effort, none of the build or
/// repository logic depends on them. The transaction queue is the durable
/// handoff between `enqueue` and the workers.
#[derive(Clone)]
pub struct ClusterState {
    store: Arc<dyn Store>,
    key: RecordKey,
}

impl ClusterState {
    pub fn new(store: Arc<dyn Store>) -> ClusterState {
        ClusterState {
            store,
            key: RecordKey::new("status", "server"),
        }
    }

    pub fn is_idle(&self) -> Result<bool> {
        Ok(self.store.get(&self.key, "idle")?.is_none() || self.store.get_bool(&self.key, "idle")?)
    }

    pub fn set_idle(&self, idle: bool) -> Result<()> {
        self.store.set_bool(&self.key, "idle", idle)?;
        if idle {
            self.set_status(STATUS_IDLE)?;
        }
        Ok(())
    }

    pub fn current_status(&self) -> Result<String> {
        let status = self.store.get_str(&self.key, "current_status")?;
        Ok(if status.is_empty() { STATUS_IDLE.to_string() } else { status })
    }

    pub fn set_status(&self, status: &str) -> Result<()> {
        debug!("Status: {}", status);
        self.store.set(&self.key, "current_status", status)
    }

    /// Show `status` until the returned guard is dropped, then restore the
    /// previous one.
    pub fn status_guard(&self, status: &str) -> Result<StatusGuard> {
        let previous = self.current_status()?;
        self.set_status(status)?;
        Ok(StatusGuard {
            state: self.clone(),
            previous,
        })
    }

    pub fn enqueue_transaction(&self, tnum: i64) -> Result<()> {
        self.store.list_push(&self.key, "transaction_queue", &tnum.to_string())
    }

    pub fn next_transaction(&self) -> Result<Option<i64>> {
        match self.store.list_pop_front(&self.key, "transaction_queue")? {
            Some(tnum) => Ok(Some(tnum.parse()
                .with_context(|| anyhow!("Invalid transaction number in queue: {:?}", tnum))?)),
            None => Ok(None),
        }
    }

    /// Claim a specific queued transaction. Returns false if a worker got to
    /// it first.
    pub fn take_transaction(&self, tnum: i64) -> Result<bool> {
        Ok(self.store.list_remove(&self.key, "transaction_queue", &tnum.to_string())? > 0)
    }

    pub fn queued_transactions(&self) -> Result<Vec<String>> {
        self.store.list_items(&self.key, "transaction_queue")
    }

    pub fn add_running_transaction(&self, tnum: i64) -> Result<()> {
        self.store.list_push(&self.key, "transactions_running", &tnum.to_string())
    }

    pub fn remove_running_transaction(&self, tnum: i64) -> Result<()> {
        self.store.list_remove(&self.key, "transactions_running", &tnum.to_string())?;
        Ok(())
    }

    pub fn running_transactions(&self) -> Result<Vec<String>> {
        self.store.list_items(&self.key, "transactions_running")
    }

    pub fn add_now_building(&self, bnum: i64) -> Result<()> {
        self.store.set_add(&self.key, "now_building", &bnum.to_string())?;
        Ok(())
    }

    pub fn remove_now_building(&self, bnum: i64) -> Result<()> {
        self.store.set_remove(&self.key, "now_building", &bnum.to_string())?;
        Ok(())
    }

    pub fn now_building(&self) -> Result<BTreeSet<String>> {
        self.store.set_members(&self.key, "now_building")
    }

    pub fn add_completed(&self, bnum: i64) -> Result<()> {
        self.store.list_push(&self.key, "completed", &bnum.to_string())
    }

    pub fn remove_completed(&self, bnum: i64) -> Result<()> {
        self.store.list_remove(&self.key, "completed", &bnum.to_string())?;
        Ok(())
    }

    pub fn add_failed(&self, bnum: i64) -> Result<()> {
        self.store.list_push(&self.key, "failed", &bnum.to_string())
    }

    pub fn completed(&self) -> Result<Vec<String>> {
        self.store.list_items(&self.key, "completed")
    }

    pub fn failed(&self) -> Result<Vec<String>> {
        self.store.list_items(&self.key, "failed")
    }

    pub fn add_pending_review(&self, bnum: i64) -> Result<()> {
        self.store.set_add(&self.key, "pending_review", &bnum.to_string())?;
        Ok(())
    }

    pub fn remove_pending_review(&self, bnum: i64) -> Result<()> {
        self.store.set_remove(&self.key, "pending_review", &bnum.to_string())?;
        Ok(())
    }

    pub fn pending_review(&self) -> Result<BTreeSet<String>> {
        self.store.set_members(&self.key, "pending_review")
    }
}

pub struct StatusGuard {
    state: ClusterState,
    previous: String,
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        if let Err(err) = self.state.set_status(&self.previous) {
            warn!("Failed to restore status: {:#}", err);
        }
    }
}

//! Bookkeeping for the worker fleet.
//!
//! One entry per managed worker plus the supervisor's own entry (id 0,
//! registered at construction and permanently exempt from tracing). Entries
//! are created when a worker process is attached and dropped when its
//! control channel closes.

use std::time::Instant;

use dashmap::DashMap;

use crate::bridge::protocol::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub is_tracing: bool,
    /// When the latest status broadcast for this worker went out.
    pub last_status_at: Option<Instant>,
}

#[derive(Debug)]
struct Worker {
    is_tracing: bool,
    last_status_at: Option<Instant>,
}

#[derive(Debug)]
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        let registry = Self {
            workers: DashMap::new(),
        };
        registry.workers.insert(
            WorkerId::SUPERVISOR,
            Worker {
                is_tracing: false,
                last_status_at: None,
            },
        );
        registry
    }

    /// Create an entry for a worker. Idempotent: re-registering an id keeps
    /// its existing state.
    pub fn register(&self, id: WorkerId, trace_at_launch: bool) {
        self.workers.entry(id).or_insert_with(|| Worker {
            is_tracing: trace_at_launch && !id.is_supervisor(),
            last_status_at: None,
        });
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    pub fn get(&self, id: WorkerId) -> Result<WorkerStatus, RegistryError> {
        self.workers
            .get(&id)
            .map(|w| WorkerStatus {
                id,
                is_tracing: w.is_tracing,
                last_status_at: w.last_status_at,
            })
            .ok_or(RegistryError::UnknownWorker(id))
    }

    /// Set the tracing flag for a worker.
    ///
    /// Worker 0 never traces: the call succeeds without changing anything,
    /// so callers need no special casing for the supervisor entry.
    pub fn set_tracing(&self, id: WorkerId, enabled: bool) -> Result<(), RegistryError> {
        if id.is_supervisor() {
            return Ok(());
        }
        match self.workers.get_mut(&id) {
            Some(mut worker) => {
                worker.is_tracing = enabled;
                Ok(())
            }
            None => Err(RegistryError::UnknownWorker(id)),
        }
    }

    /// Stamp the time of the latest status broadcast for a worker.
    pub fn touch(&self, id: WorkerId) {
        if let Some(mut worker) = self.workers.get_mut(&id) {
            worker.last_status_at = Some(Instant::now());
        }
    }

    /// Drop a worker entry. The supervisor's own entry is permanent.
    pub fn remove(&self, id: WorkerId) {
        if !id.is_supervisor() {
            self.workers.remove(&id);
        }
    }

    /// Snapshot of all current entries, ordered by id.
    ///
    /// Each call re-reads live state, so iterating again observes any
    /// changes made in between.
    pub fn all(&self) -> Vec<WorkerStatus> {
        let mut entries: Vec<WorkerStatus> = self
            .workers
            .iter()
            .map(|entry| WorkerStatus {
                id: *entry.key(),
                is_tracing: entry.is_tracing,
                last_status_at: entry.last_status_at,
            })
            .collect();
        entries.sort_by_key(|w| w.id);
        entries
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

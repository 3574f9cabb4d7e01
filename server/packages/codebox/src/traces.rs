//! Bounded in-memory store of recent execution traces.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use codebox_agent_schema::{ExecutionTrace, TraceEvent};
use thiserror::Error;
use tracing::debug;

pub const MAX_TRACES: usize = 25;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("trace {id} belongs to a run that is still in progress")]
pub struct TraceInFlight {
    pub id: String,
}

/// Shared by every request for the life of the process.
///
/// Eviction happens only in [`TraceStore::start`], oldest insertion first,
/// so a trace that is accepting events is never evicted by its own appends.
#[derive(Debug)]
pub struct TraceStore {
    capacity: usize,
    inner: Mutex<TraceIndex>,
}

#[derive(Debug, Default)]
struct TraceIndex {
    order: VecDeque<String>,
    traces: HashMap<String, ExecutionTrace>,
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_TRACES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(TraceIndex::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TraceIndex> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a new in-flight trace. A finished trace with the same id is
    /// replaced; one that is still in flight is left alone and the call fails.
    pub fn start(
        &self,
        id: impl Into<String>,
        prompt: impl Into<String>,
        model: impl Into<String>,
        sandbox_id: impl Into<String>,
    ) -> Result<ExecutionTrace, TraceInFlight> {
        let trace = ExecutionTrace::new(id.into(), prompt.into(), model.into(), sandbox_id.into());
        let mut index = self.lock();
        match index.traces.get(&trace.id).map(ExecutionTrace::is_in_flight) {
            Some(true) => return Err(TraceInFlight { id: trace.id }),
            Some(false) => {
                index.traces.remove(&trace.id);
                index.order.retain(|existing| existing != &trace.id);
            }
            None => {}
        }
        while index.order.len() >= self.capacity {
            let Some(oldest) = index.order.pop_front() else {
                break;
            };
            index.traces.remove(&oldest);
            debug!(trace_id = %oldest, "evicted trace");
        }
        index.order.push_back(trace.id.clone());
        index.traces.insert(trace.id.clone(), trace.clone());
        Ok(trace)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.lock()
            .traces
            .get(id)
            .is_some_and(ExecutionTrace::is_in_flight)
    }

    /// Returns `false` when the trace is unknown; the event is dropped.
    pub fn append(&self, id: &str, event: TraceEvent) -> bool {
        let mut index = self.lock();
        match index.traces.get_mut(id) {
            Some(trace) => {
                trace.append(event);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, id: &str) -> bool {
        let mut index = self.lock();
        index
            .traces
            .get_mut(id)
            .map(ExecutionTrace::finish)
            .unwrap_or(false)
    }

    pub fn get(&self, id: &str) -> Option<ExecutionTrace> {
        self.lock().traces.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Per-`(function_id, version)` scheduling state: the warm pool, the busy
//! count, and the admission semaphore (§4.E).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::model::WarmEntry;

pub struct FunctionState {
    pub runtime: String,
    pub warm_pool: AsyncMutex<VecDeque<WarmEntry>>,
    pub busy_count: AtomicU32,
    /// `None` when the function's `max_concurrency` is 0 (unbounded, per §4.E).
    pub admission: Option<Arc<Semaphore>>,
    pub warm_cap: usize,
    pub idle_ttl: Duration,
    pub max_concurrency: u32,
}

impl FunctionState {
    pub fn new(runtime: String, max_concurrency: u32, warm_cap: usize, idle_ttl: Duration) -> Self {
        let admission = (max_concurrency > 0).then(|| Arc::new(Semaphore::new(max_concurrency as usize)));
        Self {
            runtime,
            warm_pool: AsyncMutex::new(VecDeque::new()),
            busy_count: AtomicU32::new(0),
            admission,
            warm_cap,
            idle_ttl,
            max_concurrency,
        }
    }

    pub fn mark_busy(&self) {
        self.busy_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_idle(&self) {
        self.busy_count.fetch_sub(1, Ordering::AcqRel);
    }
}

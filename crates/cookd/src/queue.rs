//! The build request queue and its worker pool.
//!
//! One mutex plus one condition variable guard a FIFO of requests; a fixed
//! set of long-lived builder threads drains it. Requests execute in FIFO
//! order across the pool with no fairness guarantee between workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chef_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One build job as accepted from the orchestrator. Immutable after
/// creation; owned by the queue until a worker pops it, then by that
/// worker's executor until completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: String,
    pub url: String,
    pub recipe_path: String,
    pub platform: String,
    pub architecture: String,
}

/// Observable lifecycle of one builder thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Done,
}

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DONE: u8 = 2;

/// Executes one popped request; implemented by the build executor.
pub trait BuildHandler: Send + Sync + 'static {
    fn execute(&self, request: BuildRequest);
}

struct QueueState {
    active: bool,
    queue: VecDeque<BuildRequest>,
}

struct Shared {
    state: Mutex<QueueState>,
    signal: Condvar,
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    state: Arc<AtomicU8>,
}

impl WorkerHandle {
    fn state(&self) -> WorkerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CREATED => WorkerState::Created,
            STATE_RUNNING => WorkerState::Running,
            _ => WorkerState::Done,
        }
    }
}

/// The worker pool: N builder threads over one shared FIFO.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawn `count` builders that feed requests to `handler`.
    pub fn start(count: usize, handler: Arc<dyn BuildHandler>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                active: true,
                queue: VecDeque::new(),
            }),
            signal: Condvar::new(),
        });

        let workers = (0..count)
            .map(|index| {
                let state = Arc::new(AtomicU8::new(STATE_CREATED));
                let thread_state = Arc::clone(&state);
                let thread_shared = Arc::clone(&shared);
                let thread_handler = Arc::clone(&handler);
                let thread = std::thread::Builder::new()
                    .name(format!("builder-{index}"))
                    .spawn(move || builder_main(thread_shared, thread_handler, thread_state))
                    .expect("spawning builder thread");
                WorkerHandle { thread, state }
            })
            .collect();

        info!(builders = count, "worker pool started");
        Self { shared, workers }
    }

    /// Append a request and wake one idle builder.
    pub fn enqueue(&self, request: BuildRequest) -> Result<()> {
        enqueue_into(&self.shared, request)
    }

    /// A cloneable enqueue handle for the intake transport.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(WorkerHandle::state).collect()
    }

    /// Stop accepting work and drain: in-flight builds run to completion,
    /// builders are polled until every one reports done.
    pub fn shutdown(self) {
        self.shutdown_with_poll_interval(Duration::from_secs(10));
    }

    /// `shutdown` with a configurable poll interval between drain passes.
    pub fn shutdown_with_poll_interval(mut self, interval: Duration) {
        {
            let mut state = match self.shared.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.active = false;
        }
        self.shared.signal.notify_all();

        loop {
            let busy = self
                .workers
                .iter()
                .filter(|worker| worker.state() != WorkerState::Done)
                .count();
            if busy == 0 {
                break;
            }
            debug!(busy, "waiting for builders to drain");
            std::thread::sleep(interval);
        }

        for worker in self.workers.drain(..) {
            if worker.thread.join().is_err() {
                warn!("builder thread panicked during drain");
            }
        }
        info!("worker pool drained");
    }
}

/// Enqueue side of the pool, safe to hand to the transport tasks.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl QueueHandle {
    pub fn enqueue(&self, request: BuildRequest) -> Result<()> {
        enqueue_into(&self.shared, request)
    }
}

fn enqueue_into(shared: &Shared, request: BuildRequest) -> Result<()> {
    let mut state = shared
        .state
        .lock()
        .map_err(|_| Error::internal("build queue mutex poisoned"))?;
    if !state.active {
        return Err(Error::Unavailable(
            "build queue is shutting down".to_string(),
        ));
    }
    debug!(build = %request.id, depth = state.queue.len(), "build queued");
    state.queue.push_back(request);
    shared.signal.notify_one();
    Ok(())
}

fn builder_main(shared: Arc<Shared>, handler: Arc<dyn BuildHandler>, state: Arc<AtomicU8>) {
    state.store(STATE_RUNNING, Ordering::SeqCst);
    loop {
        let request = {
            let mut guard = match shared.state.lock() {
                Ok(guard) => guard,
                Err(_) => break,
            };
            loop {
                if !guard.active {
                    drop(guard);
                    state.store(STATE_DONE, Ordering::SeqCst);
                    return;
                }
                // The request moves out of the shared deque while the lock
                // is held; after this point no other worker can see it.
                if let Some(request) = guard.queue.pop_front() {
                    break request;
                }
                guard = match shared.signal.wait(guard) {
                    Ok(guard) => guard,
                    Err(_) => {
                        state.store(STATE_DONE, Ordering::SeqCst);
                        return;
                    }
                };
            }
        };
        handler.execute(request);
    }
    state.store(STATE_DONE, Ordering::SeqCst);
}

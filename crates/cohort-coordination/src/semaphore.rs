use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::{debug, info};

struct SemaphoreState {
    permits: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A queued `acquire` call. Dropping it before the permit was observed hands
/// any permit already sent to it on to the next waiter.
struct PendingAcquire<'a> {
    semaphore: &'a Semaphore,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            debug!(semaphore = %self.semaphore.name, "Abandoned acquirer returns its permit");
            self.semaphore.release();
        }
    }
}

/// A counting semaphore with a strict FIFO wait list.
///
/// `release` hands the permit straight to the oldest waiter instead of
/// returning it to the pool, so a caller arriving between release and wake-up
/// cannot overtake a queued waiter.
pub struct Semaphore {
    name: String,
    state: Mutex<SemaphoreState>,
}

impl Semaphore {
    /// Create a semaphore with `permits` initially available.
    pub fn new(name: impl Into<String>, permits: usize) -> Self {
        let name = name.into();
        info!(semaphore = %name, permits, "Semaphore initialized");
        Self {
            name,
            state: Mutex::new(SemaphoreState {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Semaphore name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire a permit, suspending until one is handed over if none is free.
    pub async fn acquire(&self) {
        let rx = {
            let mut state = self.state.lock();
            if state.permits > 0 {
                state.permits -= 1;
                debug!(semaphore = %self.name, available = state.permits, "Permit acquired");
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(
                semaphore = %self.name,
                waiting = state.waiters.len(),
                "Waiting for permit"
            );
            rx
        };
        let mut pending = PendingAcquire {
            semaphore: self,
            rx,
            granted: false,
        };
        // Senders are only dropped together with the semaphore.
        let _ = (&mut pending.rx).await;
        pending.granted = true;
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Release a permit: wake the oldest live waiter, or return it to the pool.
    pub fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            // A closed receiver means that acquirer gave up; try the next one.
            if waiter.send(()).is_ok() {
                debug!(
                    semaphore = %self.name,
                    waiting = state.waiters.len(),
                    "Permit granted to waiting acquirer"
                );
                return;
            }
        }
        state.permits += 1;
        debug!(semaphore = %self.name, available = state.permits, "Permit released");
    }

    /// Permits currently in the pool.
    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    /// Acquirers currently suspended.
    pub fn waiting_count(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("permits", &state.permits)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

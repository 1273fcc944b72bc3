//! Cancellable background tasks and single-resolution completion slots.
//!
//! Each background job runs on its own thread, driven by
//! `futures_lite::future::block_on`.  Delays are `embassy-time` timers;
//! cancellation is an atomic flag plus an `embassy-sync` waker, raced
//! against the job.
//!
//! ```text
//!  caller ──spawn──▶ ┌─────────────────────────────────────┐
//!                    │ thread: block_on(or(cancelled, job))│
//!  TaskHandle ─cancel▶ CancelToken ──▶ job aborts at next │
//!                    │                 await point         │
//!                    └───────────────┬─────────────────────┘
//!                                    ▼
//!                          CompletionSlot::fulfill (once)
//! ```

use core::cell::Cell;
use core::future::Future;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::{Duration, Timer};
use futures_lite::future;
use log::warn;

// ── Cancellation ─────────────────────────────────────────────

struct CancelInner {
    cancelled: AtomicBool,
    waker: AtomicWaker,
}

/// Shared cancellation flag.  Cloning shares the flag.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                waker: AtomicWaker::new(),
            }),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    ///
    /// Any number of futures on the task's own thread may await this; they
    /// share the executor's waker.
    pub async fn cancelled(&self) {
        future::poll_fn(|cx| {
            if self.is_cancelled() {
                return Poll::Ready(());
            }
            self.inner.waker.register(cx.waker());
            if self.is_cancelled() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `duration` unless cancelled first.  Returns `false` on
/// cancellation.
pub async fn sleep(token: &CancelToken, duration: Duration) -> bool {
    future::or(
        async {
            Timer::after(duration).await;
            true
        },
        async {
            token.cancelled().await;
            false
        },
    )
    .await
}

// ── Completion slot ──────────────────────────────────────────

/// Returned by [`CompletionSlot::fulfill`] on the second write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyResolved;

/// A value written exactly once and read any number of times.
///
/// The first `fulfill` wins; later writes are rejected, never overwrite.
pub struct CompletionSlot<T: Copy> {
    value: Mutex<CriticalSectionRawMutex, Cell<Option<T>>>,
    ready: Signal<CriticalSectionRawMutex, ()>,
}

impl<T: Copy> CompletionSlot<T> {
    pub const fn new() -> Self {
        Self {
            value: Mutex::new(Cell::new(None)),
            ready: Signal::new(),
        }
    }

    pub fn fulfill(&self, value: T) -> Result<(), AlreadyResolved> {
        let first = self.value.lock(|cell| {
            if cell.get().is_some() {
                false
            } else {
                cell.set(Some(value));
                true
            }
        });
        if !first {
            return Err(AlreadyResolved);
        }
        self.ready.signal(());
        Ok(())
    }

    pub fn peek(&self) -> Option<T> {
        self.value.lock(Cell::get)
    }

    pub fn is_resolved(&self) -> bool {
        self.peek().is_some()
    }

    /// Resolves with the stored value.  Intended for a single consumer.
    pub async fn wait(&self) -> T {
        loop {
            if let Some(value) = self.peek() {
                return value;
            }
            self.ready.wait().await;
        }
    }

    /// Block the calling thread until resolved.
    pub fn wait_blocking(&self) -> T {
        future::block_on(self.wait())
    }

    /// Block for at most `timeout`; `None` if still unresolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        future::block_on(future::or(async { Some(self.wait().await) }, async {
            Timer::after(timeout).await;
            None
        }))
    }
}

impl<T: Copy> Default for CompletionSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Background task ──────────────────────────────────────────

/// Handle to a running background job.  Dropping it does **not** cancel
/// the job.
pub struct TaskHandle {
    token: CancelToken,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(std::thread::JoinHandle::is_finished)
    }

    /// Wait for the job thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("task: background job panicked");
            }
        }
    }
}

/// Spawn `job` on a dedicated thread.  The job receives the task's
/// [`CancelToken`]; it is also dropped at its next await point once the
/// token fires.
pub fn spawn<F, Fut>(name: &str, job: F) -> std::io::Result<TaskHandle>
where
    F: FnOnce(CancelToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    let token = CancelToken::new();
    let job_token = token.clone();
    let thread = std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let race_token = job_token.clone();
            future::block_on(future::or(job(job_token), async move {
                race_token.cancelled().await;
            }));
        })?;
    Ok(TaskHandle {
        token,
        thread: Some(thread),
    })
}

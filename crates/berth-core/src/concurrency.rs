use crate::CoreError;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nstopping, press Ctrl+C again to force");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Cooperative cancellation flag shared by the tasks of one group.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Cancelled explicitly or by Ctrl+C.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || shutdown_requested()
    }

    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Upper bound on worker threads for [`try_join_all`].
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, NonZeroUsize::get).clamp(2, 16)
}

/// Run `f` for every item on [`default_workers`] threads. The first error
/// cancels the group; running tasks observe it through the [`Cancel`] they
/// are handed and queued items are never started. Returns the results in
/// item order, or the first error.
pub fn try_join_all<T, R, F>(items: &[T], f: F) -> Result<Vec<R>, CoreError>
where
    T: Sync,
    R: Send,
    F: Fn(&T, &Cancel) -> Result<R, CoreError> + Sync,
{
    try_join_bounded(items, default_workers(), f)
}

/// [`try_join_all`] with at most `workers` threads pulling from a shared queue.
pub fn try_join_bounded<T, R, F>(items: &[T], workers: usize, f: F) -> Result<Vec<R>, CoreError>
where
    T: Sync,
    R: Send,
    F: Fn(&T, &Cancel) -> Result<R, CoreError> + Sync,
{
    let cancel = Cancel::new();
    let next = AtomicUsize::new(0);
    let first_error: Mutex<Option<CoreError>> = Mutex::new(None);
    let workers = workers.clamp(1, items.len().max(1));
    let done: Vec<(usize, R)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let (cancel, next, first_error, f) = (&cancel, &next, &first_error, &f);
                scope.spawn(move || {
                    let mut out = Vec::new();
                    while !cancel.is_cancelled() {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(item) = items.get(i) else {
                            break;
                        };
                        match f(item, cancel) {
                            Ok(r) => out.push((i, r)),
                            Err(e) => {
                                cancel.cancel();
                                if let Ok(mut slot) = first_error.lock() {
                                    if slot.is_none() {
                                        *slot = Some(e);
                                    } else {
                                        debug!("suppressed error after cancellation: {e}");
                                    }
                                }
                            }
                        }
                    }
                    out
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let first = first_error
        .into_inner()
        .map_err(|e| CoreError::Precondition(format!("mutex poisoned: {e}")))?;
    if let Some(e) = first {
        return Err(e);
    }
    let mut results: Vec<Option<R>> = items.iter().map(|_| None).collect();
    for (i, r) in done {
        results[i] = Some(r);
    }
    results
        .into_iter()
        .map(|r| r.ok_or(CoreError::Cancelled))
        .collect()
}

/// Run `f` for every item concurrently and collect every outcome.
pub fn join_all<T, R, F>(items: &[T], f: F) -> Vec<Result<R, CoreError>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R, CoreError> + Sync,
{
    std::thread::scope(|scope| {
        let handles: Vec<_> = items
            .iter()
            .map(|item| {
                let f = &f;
                scope.spawn(move || f(item))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(CoreError::Precondition("worker panicked".to_owned())))
            })
            .collect()
    })
}

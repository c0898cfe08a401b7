// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker jobs pulling from a shared source.

use crate::cancel::CancellationToken;
use crate::error::JobError;
use crate::macros::{log_debug, log_error, log_warn};
use crate::source::SharedSource;
use crate::util::Status;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long [`Job::dispose()`] waits for the worker thread to acknowledge a
/// stop request before detaching it.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a job's worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    /// The thread is pulling from the shared source.
    Running,
    /// The thread has permanently stopped pulling: the source was exhausted,
    /// cancellation was observed, or an error was recorded.
    Finished,
}

/// Handle to one worker job. Jobs are created fresh for each execution and
/// never reused.
pub struct Job<T> {
    /// Job index.
    #[cfg(feature = "log")]
    id: usize,
    /// Cancellation token shared with the worker thread.
    token: CancellationToken,
    /// Worker thread handle, taken by [`dispose()`](Self::dispose).
    handle: Option<JoinHandle<()>>,
    /// State shared with the worker thread.
    shared: Arc<JobShared<T>>,
}

/// State shared between a job handle and its worker thread.
struct JobShared<T> {
    /// Buffered results, pushed by the worker thread and popped by the drain
    /// loop.
    results: Mutex<VecDeque<T>>,
    /// Number of results produced so far. Monotonically non-decreasing.
    results_count: CachePadded<AtomicUsize>,
    /// Error slot, set at most once; the first failure wins.
    error: Mutex<Option<JobError>>,
    /// Lifecycle state, used by the drain loop's finish checks and by the
    /// bounded wait in [`Job::dispose()`].
    state: Status<JobState>,
}

impl<T> JobShared<T> {
    fn set_error(&self, error: JobError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

impl<T: Send + 'static> Job<T> {
    /// Spawns a worker thread pulling from the given shared source, applying
    /// the given transform and observing the given cancellation token.
    pub fn spawn<I>(
        id: usize,
        source: Arc<SharedSource<I>>,
        transform: Arc<dyn Fn(I::Item) -> T + Send + Sync>,
        token: CancellationToken,
    ) -> Self
    where
        I: Iterator + Send + 'static,
        I::Item: 'static,
    {
        let shared = Arc::new(JobShared {
            results: Mutex::new(VecDeque::new()),
            results_count: CachePadded::new(AtomicUsize::new(0)),
            error: Mutex::new(None),
            state: Status::new(JobState::Running),
        });
        let context = JobContext {
            id,
            source,
            transform,
            token: token.clone(),
            shared: shared.clone(),
        };
        let handle = std::thread::spawn(move || context.run());
        Self {
            #[cfg(feature = "log")]
            id,
            token,
            handle: Some(handle),
            shared,
        }
    }
}

impl<T> Job<T> {
    /// Dequeues at most one buffered result, without blocking.
    pub fn try_get_result(&self) -> Option<T> {
        self.shared.results.lock().unwrap().pop_front()
    }

    /// Number of results this job has produced so far.
    pub fn results_count(&self) -> usize {
        self.shared.results_count.load(Ordering::SeqCst)
    }

    /// Takes the job's error if one was recorded and not yet observed.
    pub fn take_error(&self) -> Option<JobError> {
        self.shared.error.lock().unwrap().take()
    }

    /// Returns whether the job has permanently stopped pulling.
    pub fn is_finished(&self) -> bool {
        self.shared.state.get() == JobState::Finished
    }

    /// Requests the worker thread to stop and releases it, with a bounded
    /// wait. Idempotent.
    ///
    /// The stop request is the shared cancellation token, so a thread blocked
    /// on the source's lock makes progress once the lock holder's pull
    /// completes. A thread still busy after [`DISPOSE_TIMEOUT`] (a transform
    /// that won't return) is detached rather than joined.
    pub fn dispose(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.token.cancel();

        let (guard, timed_out) = self
            .shared
            .state
            .wait_timeout_while(DISPOSE_TIMEOUT, |state| *state == JobState::Running);
        drop(guard);

        if timed_out {
            log_warn!(
                "[job {}] Worker thread still busy after {DISPOSE_TIMEOUT:?}, detaching it",
                self.id
            );
            drop(handle);
        } else {
            match handle.join() {
                Ok(()) => log_debug!("[job {}] Worker thread joined", self.id),
                Err(_) => log_warn!("[job {}] Worker thread panicked before joining", self.id),
            }
        }
    }
}

impl<T> Drop for Job<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Context object owned by a job's worker thread.
struct JobContext<I: Iterator, T> {
    /// Job index.
    id: usize,
    /// Source shared with the other jobs of this execution.
    source: Arc<SharedSource<I>>,
    /// Composed per-element transform.
    transform: Arc<dyn Fn(I::Item) -> T + Send + Sync>,
    /// Cancellation token shared with the drain loop and the other jobs.
    token: CancellationToken,
    /// State shared with the job handle.
    shared: Arc<JobShared<T>>,
}

impl<I: Iterator, T> JobContext<I, T> {
    /// Main function run by the worker thread: pull, transform, buffer, until
    /// cancelled, exhausted or failed.
    fn run(self) {
        // Marks the job finished on every exit path, including an unexpected
        // panic, so that the drain loop and dispose() observe termination.
        let guard = FinishGuard {
            id: self.id,
            shared: &self.shared,
        };

        loop {
            if self.token.is_cancelled() {
                log_debug!("[job {}] Observed cancellation, stopping", self.id);
                break;
            }
            match self.source.pull() {
                Ok(Some(item)) => {
                    match catch_unwind(AssertUnwindSafe(|| (self.transform)(item))) {
                        Ok(value) => {
                            self.shared.results.lock().unwrap().push_back(value);
                            self.shared.results_count.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(payload) => {
                            log_debug!("[job {}] Transform panicked, stopping", self.id);
                            self.shared.set_error(JobError::from_panic(self.id, payload));
                            break;
                        }
                    }
                }
                Ok(None) => {
                    log_debug!("[job {}] Source exhausted, stopping", self.id);
                    break;
                }
                Err(payload) => {
                    log_debug!("[job {}] Source failed to advance, stopping", self.id);
                    self.shared.set_error(JobError::from_panic(self.id, payload));
                    break;
                }
            }
        }

        // Explicit drop for clarity.
        drop(guard);
    }
}

/// Object whose destructor marks a job finished, whether its worker thread
/// returned normally or is unwinding from a panic.
struct FinishGuard<'a, T> {
    /// Job index.
    id: usize,
    /// State shared with the job handle.
    shared: &'a JobShared<T>,
}

impl<T> Drop for FinishGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log_error!(
                "[job {}] Worker thread panicked outside of a pull, marking it failed",
                self.id
            );
            self.shared
                .set_error(JobError::new(self.id, "worker thread panicked"));
        }
        self.shared.state.notify_all(JobState::Finished);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn wait_until_finished<T>(job: &Job<T>) {
        for _ in 0..1_000 {
            if job.is_finished() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("job did not finish in time");
    }

    #[test]
    fn pulls_and_buffers_all_elements() {
        let source = Arc::new(SharedSource::new(0..10u64));
        let transform: Arc<dyn Fn(u64) -> u64 + Send + Sync> = Arc::new(|x| x * 2);
        let job = Job::spawn(0, source, transform, CancellationToken::new());

        wait_until_finished(&job);
        assert_eq!(job.results_count(), 10);
        assert!(job.take_error().is_none());

        let mut results = Vec::new();
        while let Some(value) = job.try_get_result() {
            results.push(value);
        }
        assert_eq!(results, (0..10u64).map(|x| x * 2).collect::<Vec<_>>());
        assert!(job.try_get_result().is_none());
    }

    #[test]
    fn records_the_first_transform_failure() {
        let source = Arc::new(SharedSource::new(0..10u64));
        let transform: Arc<dyn Fn(u64) -> u64 + Send + Sync> = Arc::new(|x| {
            if x == 3 {
                panic!("bad element");
            }
            x
        });
        let job = Job::spawn(7, source, transform, CancellationToken::new());

        wait_until_finished(&job);
        let error = job.take_error().unwrap();
        assert_eq!(error.job_id(), 7);
        assert_eq!(error.message(), "bad element");
        // The error was observed once; the slot stays empty.
        assert!(job.take_error().is_none());
        // The job stopped at its first error.
        assert_eq!(job.results_count(), 3);
    }

    #[test]
    fn observes_cancellation_between_pulls() {
        let token = CancellationToken::new();
        token.cancel();
        let source = Arc::new(SharedSource::new(0..1_000_000u64));
        let transform: Arc<dyn Fn(u64) -> u64 + Send + Sync> = Arc::new(|x| x);
        let job = Job::spawn(0, source, transform, token);

        wait_until_finished(&job);
        // Cancelled before the first pull: nothing was produced.
        assert_eq!(job.results_count(), 0);
        assert!(job.take_error().is_none());
    }

    #[test]
    fn dispose_is_idempotent() {
        let source = Arc::new(SharedSource::new(0..10u64));
        let transform: Arc<dyn Fn(u64) -> u64 + Send + Sync> = Arc::new(|x| x);
        let mut job = Job::spawn(0, source, transform, CancellationToken::new());

        job.dispose();
        job.dispose();
    }
}

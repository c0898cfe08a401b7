// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Parallel contexts composing per-element transforms over a source, and the
//! drain loop executing them.

use crate::cancel::CancellationToken;
use crate::error::{AggregateError, ErrorCollector};
use crate::job::Job;
use crate::macros::{log_debug, log_error};
use crate::source::SharedSource;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// How long the drain loop pauses after a cycle that drained nothing.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Trait for wrapping a sequential source into a [`ParallelContext`].
pub trait AsParallel: IntoIterator + Sized {
    /// Wraps this source into a [`ParallelContext`] pulling it from
    /// `job_count` parallel jobs.
    ///
    /// ```rust
    /// use parapull::AsParallel;
    ///
    /// let mut squares = (1..=6u64)
    ///     .as_parallel(2)
    ///     .map(|x| x * x)
    ///     .run()
    ///     .collect::<Result<Vec<_>, _>>()
    ///     .unwrap();
    ///
    /// // The order across jobs is unspecified.
    /// squares.sort_unstable();
    /// assert_eq!(squares, vec![1, 4, 9, 16, 25, 36]);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `job_count` is zero.
    fn as_parallel(self, job_count: usize) -> ParallelContext<Self, Self::Item> {
        ParallelContext::new(self, job_count)
    }
}

impl<S: IntoIterator> AsParallel for S {}

/// An immutable description of a parallel execution: a source, a lazily
/// composed per-element transform, and a job count.
///
/// Contexts are cheap to build and pure to compose: [`map()`](Self::map) and
/// [`inspect()`](Self::inspect) return a new context and never execute the
/// transform. Each call to [`run()`](Self::run) is an independent execution
/// over a fresh set of jobs.
#[must_use = "a parallel context is lazy and does nothing unless run"]
pub struct ParallelContext<S: IntoIterator, T> {
    /// The underlying source, cloned into a fresh iterator for each run.
    source: S,
    /// Composed transform, applied per element inside a job at pull time.
    transform: Arc<dyn Fn(S::Item) -> T + Send + Sync>,
    /// Number of jobs pulling from the shared source.
    job_count: usize,
}

impl<S: IntoIterator + Clone, T> Clone for ParallelContext<S, T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            transform: self.transform.clone(),
            job_count: self.job_count,
        }
    }
}

impl<S: IntoIterator> ParallelContext<S, S::Item> {
    /// Creates a context over the given source, with the identity transform.
    ///
    /// # Panics
    ///
    /// Panics if `job_count` is zero.
    pub fn new(source: S, job_count: usize) -> Self {
        assert!(job_count > 0, "job count must be positive");
        Self {
            source,
            transform: Arc::new(|item| item),
            job_count,
        }
    }
}

impl<S: IntoIterator, T> ParallelContext<S, T>
where
    S::Item: 'static,
    T: 'static,
{
    /// Returns a new context with the given transform appended to the
    /// transform chain.
    ///
    /// The transform is applied lazily, once per element, inside whichever
    /// job pulls that element. A panic raised by the transform is captured as
    /// that job's failure and surfaces in the execution's
    /// [`AggregateError`], never at composition time.
    ///
    /// ```rust
    /// use parapull::AsParallel;
    ///
    /// let context = vec!["1", "2", "3"].as_parallel(2).map(|s| {
    ///     s.parse::<u64>().unwrap()
    /// });
    /// let sum: u64 = context.run().map(Result::unwrap).sum();
    /// assert_eq!(sum, 6);
    /// ```
    pub fn map<U, F>(self, f: F) -> ParallelContext<S, U>
    where
        U: 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let transform = self.transform;
        ParallelContext {
            source: self.source,
            transform: Arc::new(move |item| f(transform(item))),
            job_count: self.job_count,
        }
    }

    /// Returns a new context running the given action for its side effect on
    /// each element, passing the element through unchanged.
    ///
    /// This is sugar over [`map()`](Self::map), with the same laziness and
    /// failure semantics.
    pub fn inspect<F>(self, f: F) -> ParallelContext<S, T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.map(move |value| {
            f(&value);
            value
        })
    }
}

impl<S, T> ParallelContext<S, T>
where
    S: IntoIterator + Clone,
    S::IntoIter: Send + 'static,
    S::Item: 'static,
    T: Send + 'static,
{
    /// Starts an execution with default options: a fresh cancellation token,
    /// no progress observer.
    ///
    /// The returned [`Drain`] is lazy: jobs are spawned, and the first
    /// element pulled, when it is first polled.
    pub fn run(&self) -> Drain<S::IntoIter, T> {
        self.run_with(RunOptions::default())
    }

    /// Starts an execution with the given options.
    ///
    /// ```rust
    /// use parapull::{AsParallel, CancellationToken, RunOptions};
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    /// use std::sync::Arc;
    ///
    /// let produced = Arc::new(AtomicUsize::new(0));
    /// let token = CancellationToken::new();
    ///
    /// let context = (0..100u64).as_parallel(4).map(|x| x + 1);
    /// let results = context
    ///     .run_with(RunOptions {
    ///         cancellation: Some(token.clone()),
    ///         progress: Some(Box::new({
    ///             let produced = produced.clone();
    ///             move |count| produced.store(count, Ordering::SeqCst)
    ///         })),
    ///         ..RunOptions::default()
    ///     })
    ///     .collect::<Result<Vec<_>, _>>()
    ///     .unwrap();
    ///
    /// assert_eq!(results.len(), 100);
    /// assert_eq!(produced.load(Ordering::SeqCst), 100);
    /// ```
    pub fn run_with(&self, options: RunOptions) -> Drain<S::IntoIter, T> {
        Drain {
            state: DrainState::Pending {
                source: self.source.clone().into_iter(),
                transform: self.transform.clone(),
                job_count: self.job_count,
            },
            ready: VecDeque::new(),
            token: options.cancellation.unwrap_or_default(),
            progress: options.progress,
            poll_interval: options.poll_interval,
            collector: ErrorCollector::new(),
        }
    }
}

/// Options controlling one execution of a [`ParallelContext`].
pub struct RunOptions {
    /// Cancellation token observed by all the jobs of the execution. A fresh
    /// token is created if none is supplied. Supplying one lets an external
    /// caller (e.g. a timeout) cancel the execution.
    pub cancellation: Option<CancellationToken>,
    /// Observer invoked once per drain cycle with the total number of
    /// elements produced so far across all jobs. Purely observational.
    pub progress: Option<Box<dyn FnMut(usize)>>,
    /// How long the drain loop pauses after an idle cycle. Defaults to 5ms.
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cancellation: None,
            progress: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A lazy, single-pass iterator over the results of one execution.
///
/// Yields `Ok(value)` for each transformed element, in an unspecified order
/// across jobs. If any job failed, yields one final `Err` carrying every
/// captured [`JobError`](crate::JobError), after all jobs have been disposed.
///
/// Dropping the iterator before exhaustion cancels the execution and disposes
/// all of its jobs; no background thread outlives it beyond the bounded
/// disposal wait.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Drain<I: Iterator, T> {
    /// Execution state.
    state: DrainState<I, T>,
    /// Results drained in the current cycle, not yet yielded downstream.
    ready: VecDeque<T>,
    /// Cancellation token shared with the jobs.
    token: CancellationToken,
    /// Progress observer, invoked once per cycle.
    progress: Option<Box<dyn FnMut(usize)>>,
    /// Pause between idle cycles.
    poll_interval: Duration,
    /// Errors observed so far in this execution.
    collector: ErrorCollector,
}

enum DrainState<I: Iterator, T> {
    /// Not polled yet: no job spawned, no element pulled.
    Pending {
        source: I,
        transform: Arc<dyn Fn(I::Item) -> T + Send + Sync>,
        job_count: usize,
    },
    /// Jobs running, the drain loop cycling.
    Running { jobs: Vec<Job<T>> },
    /// Execution over, every job disposed.
    Done,
}

impl<I, T> Drain<I, T>
where
    I: Iterator + Send + 'static,
    I::Item: 'static,
    T: Send + 'static,
{
    /// Materializes the shared source and spawns the jobs.
    fn start(&mut self) {
        match std::mem::replace(&mut self.state, DrainState::Done) {
            DrainState::Pending {
                source,
                transform,
                job_count,
            } => {
                log_debug!("[drain loop] Spawning {job_count} jobs");
                let source = Arc::new(SharedSource::new(source));
                let jobs = (0..job_count)
                    .map(|id| Job::spawn(id, source.clone(), transform.clone(), self.token.clone()))
                    .collect();
                self.state = DrainState::Running { jobs };
            }
            other => self.state = other,
        }
    }

    /// Disposes every job of the execution, then converts the recorded errors
    /// (if any) into the final item.
    fn finish(&mut self) -> Option<Result<T, AggregateError>> {
        if let DrainState::Running { jobs } = &mut self.state {
            log_debug!("[drain loop] Disposing {} jobs", jobs.len());
            for job in jobs.iter_mut() {
                job.dispose();
            }
        }
        self.state = DrainState::Done;
        self.collector.take().map(Err)
    }
}

impl<I, T> Iterator for Drain<I, T>
where
    I: Iterator + Send + 'static,
    I::Item: 'static,
    T: Send + 'static,
{
    type Item = Result<T, AggregateError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(value) = self.ready.pop_front() {
            return Some(Ok(value));
        }
        if matches!(self.state, DrainState::Pending { .. }) {
            self.start();
        }
        loop {
            let DrainState::Running { jobs } = &mut self.state else {
                return None;
            };

            // Scan all jobs for newly-observed errors: the first observed
            // failure cancels the whole execution. Elements already yielded
            // stay delivered; elements still buffered are discarded.
            let mut failed = false;
            for job in jobs.iter() {
                if let Some(error) = job.take_error() {
                    self.collector.handle(error);
                    failed = true;
                }
            }
            if failed {
                log_error!("[drain loop] Observed failed job(s), cancelling the execution");
                self.token.cancel();
                return self.finish();
            }

            if let Some(observer) = &mut self.progress {
                observer(jobs.iter().map(|job| job.results_count()).sum());
            }

            // Drain at most one buffered result per job, in job creation
            // order.
            for job in jobs.iter() {
                if let Some(value) = job.try_get_result() {
                    self.ready.push_back(value);
                }
            }
            if let Some(value) = self.ready.pop_front() {
                return Some(Ok(value));
            }

            if jobs.iter().all(|job| job.is_finished()) {
                // A job may have failed between the scan above and its finish.
                for job in jobs.iter() {
                    if let Some(error) = job.take_error() {
                        self.collector.handle(error);
                    }
                }
                return self.finish();
            }

            std::thread::sleep(self.poll_interval);
        }
    }
}

impl<I: Iterator, T> Drop for Drain<I, T> {
    /// Cancels and disposes the jobs if the consumer abandoned the iteration
    /// early.
    fn drop(&mut self) {
        if let DrainState::Running { jobs } = &mut self.state {
            log_debug!(
                "[drain loop] Drain abandoned, cancelling and disposing {} jobs",
                jobs.len()
            );
            self.token.cancel();
            for job in jobs.iter_mut() {
                job.dispose();
            }
        }
    }
}

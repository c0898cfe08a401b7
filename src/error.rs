// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types surfaced by parallel executions.

use std::any::Any;
use thiserror::Error;

/// A failure captured from one job, with the panic message of the transform
/// (or source) that caused it.
#[derive(Debug, Clone, Error)]
#[error("job #{id} failed: {message}")]
pub struct JobError {
    id: usize,
    message: String,
}

impl JobError {
    pub(crate) fn new(id: usize, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
        }
    }

    /// Converts a caught panic payload into a job error, extracting the
    /// message for the common `&str` and `String` payloads.
    pub(crate) fn from_panic(id: usize, payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self::new(id, message)
    }

    /// Identity of the job that failed, in `0..job_count`.
    pub fn job_id(&self) -> usize {
        self.id
    }

    /// Message extracted from the captured panic.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The combined failure of one execution, carrying every job error observed
/// before teardown.
///
/// This is raised at most once per execution, as the final item of the
/// [`Drain`](crate::Drain) iterator, after all jobs have been disposed.
#[derive(Debug, Clone, Error)]
#[error("{} job(s) failed during parallel execution", .errors.len())]
pub struct AggregateError {
    errors: Vec<JobError>,
}

impl AggregateError {
    /// The individual job errors, in the order they were observed.
    pub fn errors(&self) -> &[JobError] {
        &self.errors
    }
}

/// Accumulates job errors as the drain loop first observes them. Scoped to a
/// single execution.
pub(crate) struct ErrorCollector {
    errors: Vec<JobError>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Records one newly-observed job error.
    pub fn handle(&mut self, error: JobError) {
        self.errors.push(error);
    }

    /// Converts the recorded errors into a combined failure, or [`None`] if
    /// nothing was recorded. Leaves the collector empty.
    pub fn take(&mut self) -> Option<AggregateError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(AggregateError {
                errors: std::mem::take(&mut self.errors),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_error_display() {
        let error = JobError::new(3, "division by zero");
        assert_eq!(error.to_string(), "job #3 failed: division by zero");
        assert_eq!(error.job_id(), 3);
        assert_eq!(error.message(), "division by zero");
    }

    #[test]
    fn from_panic_extracts_str_payload() {
        let payload: Box<dyn Any + Send> = Box::new("oh no");
        assert_eq!(JobError::from_panic(0, payload).message(), "oh no");
    }

    #[test]
    fn from_panic_extracts_string_payload() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("oh no"));
        assert_eq!(JobError::from_panic(0, payload).message(), "oh no");
    }

    #[test]
    fn from_panic_handles_opaque_payload() {
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(JobError::from_panic(0, payload).message(), "unknown panic payload");
    }

    #[test]
    fn collector_take_is_none_without_errors() {
        assert!(ErrorCollector::new().take().is_none());
    }

    #[test]
    fn collector_take_drains_recorded_errors() {
        let mut collector = ErrorCollector::new();
        collector.handle(JobError::new(0, "first"));
        collector.handle(JobError::new(2, "second"));

        let aggregate = collector.take().unwrap();
        assert_eq!(aggregate.errors().len(), 2);
        assert_eq!(aggregate.errors()[0].job_id(), 0);
        assert_eq!(aggregate.errors()[1].job_id(), 2);
        assert_eq!(
            aggregate.to_string(),
            "2 job(s) failed during parallel execution"
        );

        assert!(collector.take().is_none());
    }
}

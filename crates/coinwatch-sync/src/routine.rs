//! A named unit of periodic work with its due-check and bounded retry loop.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use coinwatch_adapters::AdapterError;
use coinwatch_storage::StoreError;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

use crate::retry::RetryPolicy;
use crate::sink::{OutcomeSink, TracingSink, Warning};

/// Interval gate consulted on every scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuePolicy {
    interval: Duration,
    last_run: Option<DateTime<Utc>>,
}

impl DuePolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now - last >= self.interval,
        }
    }

    pub fn mark(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
    }
}

/// What one execution of the work function produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed(Option<String>),
    /// The fetch came back empty or failed; worth another attempt.
    Retry(String),
    /// Partial enrichment; nothing was written and retrying now will not help.
    Insufficient,
}

#[derive(Debug, Error)]
pub enum RoutineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("missing capability: {0}")]
    MissingCapability(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait RoutineWork: Send + Sync {
    async fn execute(&self) -> Result<WorkOutcome, RoutineError>;
}

/// Terminal state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReport {
    Succeeded,
    GaveUp,
    Insufficient,
}

pub struct Routine {
    name: String,
    due: DuePolicy,
    retry: RetryPolicy,
    work: Box<dyn RoutineWork>,
    sink: Arc<dyn OutcomeSink>,
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("name", &self.name)
            .field("due", &self.due)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Routine {
    pub fn new(name: impl Into<String>, interval: Duration, work: impl RoutineWork + 'static) -> Self {
        Self {
            name: name.into(),
            due: DuePolicy::new(interval),
            retry: RetryPolicy::default(),
            work: Box::new(work),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.due = DuePolicy::new(interval);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn due(&self) -> &DuePolicy {
        &self.due
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub(crate) fn sink(&self) -> &Arc<dyn OutcomeSink> {
        &self.sink
    }

    /// Runs the work when due. The last-run time is taken before the work starts, so a
    /// run that gives up still waits a full interval.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Option<Result<RunReport, RoutineError>> {
        if !self.due.is_due(now) {
            return None;
        }
        self.due.mark(now);
        Some(self.run(self.retry.attempts).await)
    }

    /// Executes the work with an attempt budget, ignoring the interval.
    pub async fn run(&self, attempts: u32) -> Result<RunReport, RoutineError> {
        let span = info_span!("routine", name = %self.name);
        async {
            let mut remaining = attempts;
            loop {
                match self.work.execute().await? {
                    WorkOutcome::Completed(message) => {
                        self.sink.success(&self.name, message.as_deref());
                        return Ok(RunReport::Succeeded);
                    }
                    WorkOutcome::Insufficient => {
                        self.sink.warn(&self.name, &Warning::InsufficientData);
                        return Ok(RunReport::Insufficient);
                    }
                    WorkOutcome::Retry(reason) => match self.retry.wait_for(remaining) {
                        Some(wait) => {
                            debug!(remaining, wait_secs = wait.as_secs(), %reason, "retrying");
                            tokio::time::sleep(wait).await;
                            remaining -= 1;
                        }
                        None => {
                            self.sink.warn(&self.name, &Warning::FetchFailure);
                            return Ok(RunReport::GaveUp);
                        }
                    },
                }
            }
        }
        .instrument(span)
        .await
    }
}

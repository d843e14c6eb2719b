use std::fmt;
use std::sync::Mutex;

use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    FetchFailure,
    InsufficientData,
    Message(String),
}

impl Warning {
    pub fn category(&self) -> &str {
        match self {
            Warning::FetchFailure => "fetch_failure",
            Warning::InsufficientData => "insufficient_data",
            Warning::Message(_) => "message",
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::FetchFailure => f.write_str("unable to fetch data, retries exhausted"),
            Warning::InsufficientData => {
                f.write_str("insufficient data collected, nothing was saved")
            }
            Warning::Message(text) => f.write_str(text),
        }
    }
}

/// Where routine outcomes are reported.
pub trait OutcomeSink: Send + Sync {
    fn success(&self, routine: &str, message: Option<&str>);
    fn warn(&self, routine: &str, warning: &Warning);
    fn error(&self, routine: &str, message: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutcomeSink for TracingSink {
    fn success(&self, routine: &str, message: Option<&str>) {
        info!(routine, message = message.unwrap_or("ok"), "routine succeeded");
    }

    fn warn(&self, routine: &str, warning: &Warning) {
        warn!(routine, category = warning.category(), "{warning}");
    }

    fn error(&self, routine: &str, message: &str) {
        error!(routine, "{message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reported {
    Success(String, Option<String>),
    Warn(String, Warning),
    Error(String, String),
}

/// Keeps every reported outcome in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Reported>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Reported> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: Reported) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl OutcomeSink for RecordingSink {
    fn success(&self, routine: &str, message: Option<&str>) {
        self.push(Reported::Success(
            routine.to_string(),
            message.map(str::to_string),
        ));
    }

    fn warn(&self, routine: &str, warning: &Warning) {
        self.push(Reported::Warn(routine.to_string(), warning.clone()));
    }

    fn error(&self, routine: &str, message: &str) {
        self.push(Reported::Error(routine.to_string(), message.to_string()));
    }
}

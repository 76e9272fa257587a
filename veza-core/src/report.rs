//! Partial-failure reports for multi-service commands.

use crate::error::{Step, StepFailure, VezaError};

/// Outcome of running one step across several services.
///
/// Independent services are always all attempted; each either lands in
/// `succeeded` or contributes one [`StepFailure`].
#[derive(Debug)]
pub struct StepReport<T> {
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<StepFailure>,
}

impl<T> Default for StepReport<T> {
    fn default() -> Self {
        Self { succeeded: Vec::new(), failed: Vec::new() }
    }
}

impl<T> StepReport<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, service: impl Into<String>, step: Step, result: Result<T, VezaError>) {
        let service = service.into();
        match result {
            Ok(value) => self.succeeded.push((service, value)),
            Err(error) => self.failed.push(StepFailure::new(service, step, error)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_services(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.service.as_str())
    }

    pub fn succeeded_services(&self) -> impl Iterator<Item = &str> {
        self.succeeded.iter().map(|(s, _)| s.as_str())
    }

    pub fn get(&self, service: &str) -> Option<&T> {
        self.succeeded.iter().find(|(s, _)| s == service).map(|(_, v)| v)
    }

    /// Highest exit code among failures (0 when everything succeeded).
    pub fn exit_code(&self) -> i32 {
        self.failed.iter().map(|f| f.error.exit_code()).max().unwrap_or(0)
    }
}

//! Structured logging utilities.
//!
//! Provides operation timing helpers used during startup (store connection,
//! driver setup) and around slow control-plane operations.

use std::time::Instant;

/// Operation timer for measuring and logging execution duration.
///
/// Logs the operation start on creation and the duration on completion.
#[derive(Debug)]
pub struct OpTimer {
    /// Component being timed (e.g. "store", "dispatcher").
    component: String,
    /// Operation being performed (e.g. "connect", "shutdown").
    operation: String,
    /// Start time of the operation.
    start: Instant,
}

impl OpTimer {
    /// Creates a new operation timer and logs the start.
    #[must_use]
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        let component = component.into();
        let operation = operation.into();

        tracing::debug!(
            component = %component,
            operation = %operation,
            "operation started"
        );

        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Finishes the timer and logs the duration.
    pub fn finish(self) {
        let duration_ms = self.start.elapsed().as_millis();

        tracing::info!(
            component = %self.component,
            operation = %self.operation,
            duration_ms = duration_ms,
            "operation completed"
        );
    }

    /// Finishes the timer with result-aware logging.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) {
        let duration_ms = self.start.elapsed().as_millis();

        match result {
            Ok(_) => {
                tracing::info!(
                    component = %self.component,
                    operation = %self.operation,
                    duration_ms = duration_ms,
                    "operation completed successfully"
                );
            }
            Err(e) => {
                tracing::error!(
                    component = %self.component,
                    operation = %self.operation,
                    duration_ms = duration_ms,
                    error = %e,
                    "operation failed"
                );
            }
        }
    }
}

//! Error collector shared by every validation and iteration pass.
//!
//! A [`Diagnostics`] holds at most one error. The first error recorded wins
//! and later ones are dropped, so a walk can keep reporting without call
//! sites having to guard every `error()` call. Non-fatal findings go to a
//! separate warning list.

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Accumulates the first error and any warnings from an analysis pass.
#[derive(Debug, Default)]
pub struct Diagnostics {
    error: Option<Error>,
    warnings: Vec<String>,
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    pub verbosity: u8,
}

impl Diagnostics {
    /// Creates an empty collector with warnings enabled.
    pub fn new() -> Self {
        Self {
            error: None,
            warnings: Vec::new(),
            verbosity: 1,
        }
    }

    /// Sets the verbosity level.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Records an error unless one is already present.
    pub fn error(&mut self, err: Error) {
        match &self.error {
            Some(first) => debug!("dropping secondary error '{}' (first: '{}')", err, first),
            None => {
                debug!("error: {}", err);
                self.error = Some(err);
            }
        }
    }

    /// Records a non-fatal warning.
    pub fn warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.verbosity >= 1 {
            warn!("{}", message);
        }
        self.warnings.push(message);
    }

    /// Logs an informational message if verbosity is high enough.
    pub fn info(&self, message: &str) {
        if self.verbosity >= 2 {
            info!("{}", message);
        }
    }

    /// Returns true if an error has been recorded.
    #[inline]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns true if no error has been recorded.
    #[inline]
    pub fn no_error(&self) -> bool {
        self.error.is_none()
    }

    /// Returns the recorded error, if any.
    pub fn error_ref(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Returns the recorded error message, or an empty string.
    pub fn error_message(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }

    /// Forgets the recorded error. Warnings are kept.
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Removes and returns the recorded error.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Returns the warnings recorded so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Converts the recorded error into a `Result`, leaving the collector clean.
    pub fn check(&mut self) -> Result<()> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Consumes the collector, returning the warnings or the first error.
    pub fn into_result(self) -> Result<Vec<String>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.warnings),
        }
    }
}

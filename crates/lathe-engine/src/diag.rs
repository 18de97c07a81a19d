//! Diagnostics shared across the pipeline.

use std::fmt;

use thiserror::Error;

use crate::lexer::Location;

/// A fatal lex/parse error carrying the offending source span.
#[derive(Debug, Clone, Error)]
#[error("{loc}: {message}")]
pub struct SyntaxError {
    /// Where the error was detected.
    pub loc: Location,
    /// Human-readable reason.
    pub message: String,
}

impl SyntaxError {
    /// Creates a new syntax error.
    pub fn new(loc: Location, message: impl Into<String>) -> Self {
        Self {
            loc,
            message: message.into(),
        }
    }
}

/// A non-fatal diagnostic recorded during transformation or code generation.
///
/// Warnings never abort compilation; they accumulate on the translation unit
/// (name-resolution issues) or on the generator run and are surfaced by the
/// driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    /// Primary location of the diagnostic.
    pub loc: Location,
    /// Secondary location, e.g. the earlier occurrence of a duplicated
    /// assignment.
    pub other_loc: Option<Location>,
    /// What went wrong.
    pub message: String,
}

impl Warning {
    /// Warning with a single location.
    pub fn new(loc: Location, message: impl Into<String>) -> Self {
        Self {
            loc,
            other_loc: None,
            message: message.into(),
        }
    }

    /// Warning relating two locations.
    pub fn with_other(loc: Location, other: Location, message: impl Into<String>) -> Self {
        Self {
            loc,
            other_loc: Some(other),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.other_loc {
            Some(other) => write!(f, "{}: {} (see {})", self.loc, self.message, other),
            None => write!(f, "{}: {}", self.loc, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let err = SyntaxError::new(Location::default(), "unexpected token");
        assert_eq!(err.to_string(), "0:1:1 - 0:1:1: unexpected token");
    }

    #[test]
    fn test_warning_with_two_locations() {
        let warning = Warning::with_other(
            Location::default(),
            Location::default(),
            "duplicated variable declaration",
        );
        assert!(warning.to_string().contains("see"));
    }
}

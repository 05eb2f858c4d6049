// Error taxonomy for the mapping engine and event pipeline.
//
// Mirrors the semantic kinds of spec §7. The mapping engine and
// allocators return `MappingResult` directly; callers above them
// (control surface, httpd) fold this into `anyhow::Result` the way
// every other module in this crate does.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    InvalidGeometry,
    InsufficientCoverage,
    NotFound,
    DeviceUnavailable,
    Conflict,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidGeometry => "invalid_geometry",
            ErrorKind::InsufficientCoverage => "insufficient_coverage",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: ErrorKind,
    pub message: String,
    pub field: Option<String>,
}

impl MappingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        MappingError {
            kind,
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        MappingError::new(ErrorKind::InvalidInput, message).with_field(field)
    }

    pub fn invalid_geometry(message: impl Into<String>) -> Self {
        MappingError::new(ErrorKind::InvalidGeometry, message)
    }

    pub fn insufficient_coverage(message: impl Into<String>) -> Self {
        MappingError::new(ErrorKind::InsufficientCoverage, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        MappingError::new(ErrorKind::NotFound, message)
    }

    pub fn device_unavailable(message: impl Into<String>) -> Self {
        MappingError::new(ErrorKind::DeviceUnavailable, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        MappingError::new(ErrorKind::Conflict, message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {} (field: {})", self.kind, self.message, field),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for MappingError {}

/// Result type threaded through the mapping engine and allocators.
///
/// Distinct from `anyhow::Result`: callers that need to branch on the
/// error kind (the control surface, mainly) match on `.kind` instead of
/// downcasting.
pub type MappingResult<T> = Result<T, MappingError>;

/// A successful mapping build can still carry non-fatal warnings
/// (spec §7: InsufficientCoverage reported as a warning when the
/// mapping still succeeds).
#[derive(Debug, Clone, Default)]
pub struct Warnings(pub Vec<String>);

impl Warnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_field_when_present() {
        let err = MappingError::invalid_input("start_led", "out of range");
        assert_eq!(err.to_string(), "invalid_input: out of range (field: start_led)");
    }

    #[test]
    fn display_without_field() {
        let err = MappingError::invalid_geometry("zero piano width");
        assert_eq!(err.to_string(), "invalid_geometry: zero piano width");
    }
}

use converge_schema::FaultKind;
use std::fmt;

/// An abnormal signal raised by an external call or by local validation.
///
/// Faults carry just enough identity for classification: a broad [`FaultKind`]
/// and, for service faults, the error code the service reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    kind: FaultKind,
    code: Option<String>,
    message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Service, Some(code.into()), message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Client, None, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(FaultKind::AccessDenied, None, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Validation, None, message)
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// The service error code with surrounding whitespace removed.
    /// Blank codes read as absent.
    pub fn error_code(&self) -> Option<&str> {
        self.code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code() {
            Some(code) if self.message.is_empty() => f.write_str(code),
            Some(code) => write!(f, "{code}: {}", self.message),
            None if self.message.is_empty() => write!(f, "{} fault", self.kind),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Fault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_is_trimmed() {
        let f = Fault::service("  Throttling \n", "slow down");
        assert_eq!(f.error_code(), Some("Throttling"));
    }

    #[test]
    fn blank_code_reads_as_absent() {
        let f = Fault::service("   ", "odd");
        assert_eq!(f.error_code(), None);
    }

    #[test]
    fn display_prefers_code_and_message() {
        assert_eq!(
            Fault::service("DBInstanceNotFound", "no such instance").to_string(),
            "DBInstanceNotFound: no such instance"
        );
        assert_eq!(Fault::service("Throttling", "").to_string(), "Throttling");
        assert_eq!(Fault::client("connection reset").to_string(), "connection reset");
        assert_eq!(Fault::client("").to_string(), "client fault");
    }

    #[test]
    fn constructors_set_kind() {
        assert_eq!(Fault::client("x").kind(), FaultKind::Client);
        assert_eq!(Fault::access_denied("x").kind(), FaultKind::AccessDenied);
        assert_eq!(Fault::validation("x").kind(), FaultKind::Validation);
        assert_eq!(Fault::service("C", "x").kind(), FaultKind::Service);
    }
}

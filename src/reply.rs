use std::fmt;

use thiserror::Error;

/// RFC 3463 enhanced status code, e.g. `5.7.8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode(pub u8, pub u16, pub u16);

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// A negative SMTP reply.
///
/// The text is always a fixed string so that nothing from a collaborator's
/// error ever reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{code} {enhanced} {message}")]
pub struct SmtpError {
    pub code: u16,
    pub enhanced: EnhancedCode,
    pub message: &'static str,
}

impl SmtpError {
    pub const fn new(code: u16, enhanced: EnhancedCode, message: &'static str) -> Self {
        Self {
            code,
            enhanced,
            message,
        }
    }

    pub const AUTH_REQUIRED: SmtpError =
        SmtpError::new(530, EnhancedCode(5, 7, 0), "Authentication required");
    pub const AUTH_FAILED: SmtpError =
        SmtpError::new(535, EnhancedCode(5, 7, 8), "Authentication failed");
    pub const ALREADY_AUTHENTICATED: SmtpError =
        SmtpError::new(503, EnhancedCode(5, 5, 1), "Already authenticated");
    pub const AUTH_IN_TRANSACTION: SmtpError =
        SmtpError::new(503, EnhancedCode(5, 5, 1), "AUTH not permitted during a mail transaction");
    pub const NESTED_MAIL: SmtpError =
        SmtpError::new(503, EnhancedCode(5, 5, 1), "Nested MAIL command");
    pub const MISSING_MAIL: SmtpError =
        SmtpError::new(503, EnhancedCode(5, 5, 1), "Missing MAIL FROM command");
    pub const MISSING_RCPT: SmtpError =
        SmtpError::new(503, EnhancedCode(5, 5, 1), "Missing RCPT TO command");
    pub const TOO_MANY_RECIPIENTS: SmtpError =
        SmtpError::new(452, EnhancedCode(4, 5, 3), "Too many recipients");
    pub const READ_FAILED: SmtpError =
        SmtpError::new(451, EnhancedCode(4, 0, 0), "Failed to read message");
    pub const QUEUE_FAILED: SmtpError =
        SmtpError::new(451, EnhancedCode(4, 3, 0), "Failed to queue message");
    pub const MESSAGE_TOO_LARGE: SmtpError =
        SmtpError::new(552, EnhancedCode(5, 3, 4), "Message size exceeds maximum");

    /// Wire form, CRLF terminated.
    pub fn to_wire(&self) -> String {
        format!("{} {} {}\r\n", self.code, self.enhanced, self.message)
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        assert_eq!(
            SmtpError::AUTH_REQUIRED.to_wire(),
            "530 5.7.0 Authentication required\r\n"
        );
        assert_eq!(
            SmtpError::QUEUE_FAILED.to_wire(),
            "451 4.3.0 Failed to queue message\r\n"
        );
    }

    #[test]
    fn queue_and_read_failures_are_transient() {
        assert!(SmtpError::READ_FAILED.is_transient());
        assert!(SmtpError::QUEUE_FAILED.is_transient());
        assert!(!SmtpError::AUTH_FAILED.is_transient());
    }
}

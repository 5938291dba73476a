//! Error taxonomy for the transfer engine.
//!
//! Every driver entry point returns [`TftpError`]. Recoverable events
//! (a single timeout, a duplicate packet, a packet from a foreign endpoint)
//! are handled inside the state machines and never surface here.

use std::fmt;
use std::io;

use thiserror::Error;

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350, plus code 8 from the option
/// negotiation extension (RFC 2347).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Error code 0: Not defined
    ///
    /// Generic error condition. The error message should provide details.
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    ///
    /// Includes attempts to reach files outside the server's root directory.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    ///
    /// Packet received from a source endpoint other than the session peer.
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,

    /// Error code 8: Option negotiation failed
    ///
    /// Extension error code from RFC 2347, not in the original RFC.
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    /// Convert a u16 value to an ErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::from_u16(1), Some(ErrorCode::FileNotFound));
    /// assert_eq!(ErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::OptionNegotiationFailed),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Typed failure surfaced by [`Client`](crate::Client) and server entry points.
///
/// The taxonomy mirrors where a transfer can break down: caller misuse,
/// a TFTP-level rejection (received from the peer or synthesised locally),
/// a source/sink stream failure, a socket failure, or an exhausted retry
/// budget.
#[derive(Debug, Error)]
pub enum TftpError {
    /// Invariant violated: caller misuse or corrupt internal state.
    #[error("library error: {0}")]
    Library(String),

    /// TFTP-level rejection carrying the wire error code and message.
    #[error("tftp error <code: {}>: {message}", .code.as_u16())]
    Protocol { code: ErrorCode, message: String },

    /// Source or sink stream failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Socket or syscall failure, carrying the OS error code.
    #[error("os error <code: {code}>: {message}")]
    Os { code: i32, message: String },

    /// The per-session retry budget ran out.
    #[error("timeout: no response after {attempts} attempts")]
    Timeout { attempts: u16 },
}

impl TftpError {
    /// A protocol error with the code's default message.
    pub fn protocol(code: ErrorCode) -> Self {
        Self::Protocol {
            code,
            message: code.default_message().to_string(),
        }
    }

    /// A protocol error with a custom message.
    pub fn protocol_msg(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Malformed wire data: surfaced as a protocol error with code 0,
    /// matching how peers report undecodable packets.
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::Protocol {
            code: ErrorCode::NotDefined,
            message: format!("malformed packet: {}", detail.into()),
        }
    }

    /// An ERROR packet received from the peer. Unknown codes map to 0.
    pub(crate) fn from_peer(code: u16, message: String) -> Self {
        Self::Protocol {
            code: ErrorCode::from_u16(code).unwrap_or(ErrorCode::NotDefined),
            message,
        }
    }

    /// A socket-level failure, keeping the OS error code when there is one.
    pub(crate) fn os(err: io::Error, context: &str) -> Self {
        Self::Os {
            code: err.raw_os_error().unwrap_or(0),
            message: format!("{context}: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::FileNotFound.as_u16(), 1);
        assert_eq!(ErrorCode::from_u16(1), Some(ErrorCode::FileNotFound));
        assert_eq!(ErrorCode::from_u16(8), Some(ErrorCode::OptionNegotiationFailed));
        assert_eq!(ErrorCode::from_u16(9), None);
        assert_eq!(ErrorCode::FileNotFound.default_message(), "File not found");
    }

    #[test]
    fn test_display_includes_type_code_and_message() {
        let err = TftpError::protocol(ErrorCode::AccessViolation);
        assert_eq!(err.to_string(), "tftp error <code: 2>: Access violation");

        let err = TftpError::Os {
            code: 111,
            message: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "os error <code: 111>: connection refused");

        let err = TftpError::Timeout { attempts: 5 };
        assert_eq!(err.to_string(), "timeout: no response after 5 attempts");
    }

    #[test]
    fn test_peer_error_with_unknown_code() {
        let err = TftpError::from_peer(42, "weird".to_string());
        match err {
            TftpError::Protocol { code, message } => {
                assert_eq!(code, ErrorCode::NotDefined);
                assert_eq!(message, "weird");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#![forbid(unsafe_code)]
//! Error types for the tagline driver.
//!
//! Defines `TagError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all tagline driver operations.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus is not connected (no INIT exchange has run)")]
    NotConnected,

    #[error("malformed response: {field} mismatch (request {expected:#x}, response {actual:#x})")]
    MalformedResponse {
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("server reported failure for {request} request")]
    ServerFault { request: &'static str },

    #[error("unknown request type {0:#04x} in opcode")]
    UnknownRequestType(u8),

    #[error("initialization failed: {0}")]
    Init(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no disk has room for {blocks} more block(s)")]
    DiskFull { blocks: u32 },

    #[error("tagline {tag} block {block} has never been written")]
    Unmapped { tag: u32, block: u32 },

    #[error("recovery of disk {disk} failed: {source}")]
    RecoveryFailed {
        disk: u8,
        #[source]
        source: Box<TagError>,
    },
}

impl TagError {
    /// True for errors that leave the bus socket unusable until a fresh init.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::NotConnected
                | Self::MalformedResponse { .. }
                | Self::ServerFault { .. }
                | Self::UnknownRequestType(_)
        )
    }
}

/// Result alias using `TagError`.
pub type Result<T> = std::result::Result<T, TagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(TagError::NotConnected.is_transport());
        assert!(TagError::MalformedResponse {
            field: "type",
            expected: 1,
            actual: 2
        }
        .is_transport());
        assert!(!TagError::DiskFull { blocks: 3 }.is_transport());
        assert!(!TagError::Unmapped { tag: 0, block: 7 }.is_transport());
    }

    #[test]
    fn recovery_failure_carries_source() {
        let err = TagError::RecoveryFailed {
            disk: 3,
            source: Box::new(TagError::NotConnected),
        };
        let text = err.to_string();
        assert!(text.contains("disk 3"));
        assert!(text.contains("not connected"));
    }
}

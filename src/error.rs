use std::io;
use thiserror::Error;

use crate::crypto::{CryptoError, StreamError};

/// Category of a failed operation, as reported to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    File,
    Crypto,
}

/// Errors produced by transfer and discovery operations
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("ConnectionError: {context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("ConnectionError: {0}")]
    Protocol(String),
    #[error("FileError: {context}: {source}")]
    File {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("FileError: {0}")]
    InvalidFile(String),
    #[error("CryptoError: {0}")]
    Crypto(#[from] CryptoError),
}

impl TransferError {
    pub fn connection(context: impl Into<String>, source: io::Error) -> Self {
        Self::Connection {
            context: context.into(),
            source,
        }
    }

    pub fn file(context: impl Into<String>, source: io::Error) -> Self {
        Self::File {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Protocol(_) => ErrorKind::Connection,
            Self::File { .. } | Self::InvalidFile(_) => ErrorKind::File,
            Self::Crypto(_) => ErrorKind::Crypto,
        }
    }

    /// Map a stream failure whose input is the network and output is a file
    pub(crate) fn from_inbound_stream(err: StreamError) -> Self {
        match err {
            StreamError::Source(e) => Self::connection("failed to receive file content", e),
            StreamError::Sink(e) => Self::file("failed to write received file", e),
            StreamError::Crypto(e) => Self::Crypto(e),
        }
    }

    /// Map a stream failure whose input is a file and output is the network
    pub(crate) fn from_outbound_stream(err: StreamError) -> Self {
        match err {
            StreamError::Source(e) => Self::file("failed to read the file", e),
            StreamError::Sink(e) => Self::connection("failed to send file content", e),
            StreamError::Crypto(e) => Self::Crypto(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_messages() {
        let err = TransferError::connection(
            "failed to connect to the server",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().starts_with("ConnectionError:"));

        let err = TransferError::InvalidFile("empty filename".to_string());
        assert_eq!(err.kind(), ErrorKind::File);
        assert!(err.to_string().starts_with("FileError:"));

        let err = TransferError::from(CryptoError::BadPadding);
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert!(err.to_string().starts_with("CryptoError:"));
    }

    #[test]
    fn test_stream_errors_map_by_direction() {
        let inbound = TransferError::from_inbound_stream(StreamError::Source(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert_eq!(inbound.kind(), ErrorKind::Connection);

        let outbound = TransferError::from_outbound_stream(StreamError::Source(io::Error::new(
            io::ErrorKind::Other,
            "disk",
        )));
        assert_eq!(outbound.kind(), ErrorKind::File);
    }
}

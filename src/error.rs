//! Error types for QUIC endpoint operations.

use thiserror::Error;

/// QUIC transport error codes as carried in CONNECTION_CLOSE frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No error (0x00).
    NoError,
    /// Internal error (0x01).
    InternalError,
    /// Connection refused (0x02).
    ConnectionRefused,
    /// Flow control error (0x03).
    FlowControlError,
    /// Stream limit error (0x04).
    StreamLimitError,
    /// Stream state error (0x05).
    StreamStateError,
    /// Final size error (0x06).
    FinalSizeError,
    /// Frame encoding error (0x07).
    FrameEncodingError,
    /// Transport parameter error (0x08).
    TransportParameterError,
    /// Protocol violation (0x0A).
    ProtocolViolation,
    /// Crypto error (0x0100-0x01FF) with the TLS alert in the low byte.
    CryptoError(u8),
}

impl TransportError {
    /// Convert to the wire error code.
    pub fn to_wire(self) -> u64 {
        match self {
            TransportError::NoError => 0x00,
            TransportError::InternalError => 0x01,
            TransportError::ConnectionRefused => 0x02,
            TransportError::FlowControlError => 0x03,
            TransportError::StreamLimitError => 0x04,
            TransportError::StreamStateError => 0x05,
            TransportError::FinalSizeError => 0x06,
            TransportError::FrameEncodingError => 0x07,
            TransportError::TransportParameterError => 0x08,
            TransportError::ProtocolViolation => 0x0A,
            TransportError::CryptoError(alert) => 0x0100 + alert as u64,
        }
    }

    /// Convert a wire error code back. Unknown codes collapse to
    /// `InternalError`.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportError::NoError,
            0x01 => TransportError::InternalError,
            0x02 => TransportError::ConnectionRefused,
            0x03 => TransportError::FlowControlError,
            0x04 => TransportError::StreamLimitError,
            0x05 => TransportError::StreamStateError,
            0x06 => TransportError::FinalSizeError,
            0x07 => TransportError::FrameEncodingError,
            0x08 => TransportError::TransportParameterError,
            0x0A => TransportError::ProtocolViolation,
            0x0100..=0x01FF => TransportError::CryptoError((code - 0x0100) as u8),
            _ => TransportError::InternalError,
        }
    }
}

/// Errors surfaced by the endpoint core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A packet payload failed AEAD verification. Dropped silently by the
    /// inbound path, never fatal.
    #[error("packet decryption failed")]
    DecryptionFailure,

    /// Malformed packet or frame encoding.
    #[error("frame encoding error")]
    FrameEncoding,

    /// Peer behavior that must close the connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// TLS handshake failure, carrying the alert to report.
    #[error("TLS error: {reason}")]
    Tls {
        /// TLS alert code for the CRYPTO_ERROR wire mapping.
        alert: u8,
        /// Human-readable reason.
        reason: &'static str,
    },

    /// Local caller error: the operation is not allowed in the current
    /// connection state.
    #[error("invalid connection state")]
    InvalidState,

    /// The connection closed before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// Flow-control credit exhausted.
    #[error("flow control limit exceeded")]
    FlowControl,

    /// Transport parameters failed validation.
    #[error("invalid transport parameters")]
    TransportParameter,
}

impl Error {
    /// The transport error code this error maps to when it closes the
    /// connection.
    pub fn transport_error(&self) -> TransportError {
        match self {
            Error::Tls { alert, .. } => TransportError::CryptoError(*alert),
            Error::FrameEncoding => TransportError::FrameEncodingError,
            Error::FlowControl => TransportError::FlowControlError,
            Error::TransportParameter => TransportError::TransportParameterError,
            _ => TransportError::ProtocolViolation,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        assert_eq!(TransportError::NoError.to_wire(), 0x00);
        assert_eq!(TransportError::ProtocolViolation.to_wire(), 0x0A);
        assert_eq!(TransportError::CryptoError(0x28).to_wire(), 0x0128);

        assert_eq!(TransportError::from_wire(0x03), TransportError::FlowControlError);
        assert_eq!(TransportError::from_wire(0x0128), TransportError::CryptoError(0x28));
        assert_eq!(TransportError::from_wire(0xdead), TransportError::InternalError);
    }

    #[test]
    fn tls_error_maps_to_crypto_code() {
        let err = Error::Tls { alert: 0x2f, reason: "bad record mac" };
        assert_eq!(err.transport_error(), TransportError::CryptoError(0x2f));
    }
}

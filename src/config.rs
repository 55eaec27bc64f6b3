//! Endpoint configuration.

use crate::transport::TransportParameters;
use crate::version::Version;
use std::time::Duration;

/// Configuration shared by client and server endpoints. Every field has
/// a default; the values feed the transport parameters advertised during
/// the handshake.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Protocol version spoken by this endpoint.
    pub version: Version,
    /// Connection-level flow control window.
    pub initial_max_data: u64,
    /// Stream window for bidirectional streams opened locally.
    pub initial_max_stream_data_bidi_local: u64,
    /// Stream window for bidirectional streams opened by the peer.
    pub initial_max_stream_data_bidi_remote: u64,
    /// Stream window for unidirectional streams.
    pub initial_max_stream_data_uni: u64,
    /// Bidirectional stream count limit.
    pub initial_max_streams_bidi: u64,
    /// Unidirectional stream count limit.
    pub initial_max_streams_uni: u64,
    /// Idle timeout; the connection closes silently when it expires.
    pub max_idle_timeout: Duration,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: Duration,
    pub active_connection_id_limit: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            version: Version::CURRENT,
            initial_max_data: 15 * 1024 * 1024,
            initial_max_stream_data_bidi_local: 6 * 1024 * 1024,
            initial_max_stream_data_bidi_remote: 6 * 1024 * 1024,
            initial_max_stream_data_uni: 6 * 1024 * 1024,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_idle_timeout: Duration::from_secs(30),
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            active_connection_id_limit: 2,
        }
    }
}

impl Configuration {
    /// The transport parameters this endpoint advertises.
    pub fn transport_parameters(&self) -> TransportParameters {
        TransportParameters {
            max_idle_timeout: self.max_idle_timeout.as_millis() as u64,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            initial_max_streams_uni: self.initial_max_streams_uni,
            ack_delay_exponent: self.ack_delay_exponent,
            max_ack_delay: self.max_ack_delay.as_millis() as u64,
            active_connection_id_limit: self.active_connection_id_limit,
            ..TransportParameters::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_valid_parameters() {
        let params = Configuration::default().transport_parameters();
        assert!(params.validate().is_ok());
        assert_eq!(params.max_idle_timeout, 30_000);
        assert_eq!(params.initial_max_streams_bidi, 100);
    }
}

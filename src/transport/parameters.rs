//! Transport parameter codec.
//!
//! Parameters ride in a TLS extension: the ClientHello flavor carries
//! the initial version, the EncryptedExtensions flavor the negotiated
//! version plus the supported-version list, followed in both cases by a
//! `(varint id, varint length, value)` sequence.

use crate::error::{Error, Result};
use crate::types::{get_varint, put_varint, ConnectionId};
use crate::version::Version;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_connection_id: Option<ConnectionId>,
    /// Idle timeout in milliseconds; 0 disables the timeout.
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// Maximum ACK delay in milliseconds.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
        }
    }
}

impl TransportParameters {
    /// Encode for the ClientHello extension: initial version, then the
    /// parameter sequence.
    pub fn encode_for_client_hello(&self, version: Version) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(version.as_u32());
        self.encode_params(&mut buf);
        buf.freeze()
    }

    /// Encode for the EncryptedExtensions extension: negotiated version,
    /// supported-version list, then the parameter sequence.
    pub fn encode_for_encrypted_extensions(&self, version: Version) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(version.as_u32());
        buf.put_u8(4);
        buf.put_u32(version.as_u32());
        self.encode_params(&mut buf);
        buf.freeze()
    }

    /// Decode the ClientHello flavor, returning the client's initial
    /// version alongside the parameters.
    pub fn decode_from_client_hello(mut buf: &[u8]) -> Result<(Version, Self)> {
        if buf.remaining() < 4 {
            return Err(Error::TransportParameter);
        }
        let version = Version(buf.get_u32());
        let params = Self::decode_params(&mut buf)?;
        Ok((version, params))
    }

    /// Decode the EncryptedExtensions flavor.
    pub fn decode_from_encrypted_extensions(mut buf: &[u8]) -> Result<(Version, Self)> {
        if buf.remaining() < 4 {
            return Err(Error::TransportParameter);
        }
        let version = Version(buf.get_u32());
        if !buf.has_remaining() {
            return Err(Error::TransportParameter);
        }
        let list_len = buf.get_u8() as usize;
        if buf.remaining() < list_len || list_len % 4 != 0 {
            return Err(Error::TransportParameter);
        }
        buf.advance(list_len);
        let params = Self::decode_params(&mut buf)?;
        Ok((version, params))
    }

    fn encode_params(&self, buf: &mut BytesMut) {
        fn write_param(buf: &mut BytesMut, id: u64, value: &[u8]) {
            put_varint(buf, id);
            put_varint(buf, value.len() as u64);
            buf.put_slice(value);
        }

        fn write_varint_param(buf: &mut BytesMut, id: u64, value: u64) {
            // Defaults are elided on the wire.
            match id {
                0x01 if value == 0 => return,
                0x03 if value == 65527 => return,
                0x04..=0x09 if value == 0 => return,
                0x0a if value == 3 => return,
                0x0b if value == 25 => return,
                0x0e if value == 2 => return,
                _ => {}
            }
            let mut tmp = BytesMut::new();
            put_varint(&mut tmp, value);
            write_param(buf, id, &tmp);
        }

        if let Some(cid) = &self.original_connection_id {
            write_param(buf, 0x00, cid.as_bytes());
        }
        write_varint_param(buf, 0x01, self.max_idle_timeout);
        if let Some(token) = &self.stateless_reset_token {
            write_param(buf, 0x02, token);
        }
        write_varint_param(buf, 0x03, self.max_udp_payload_size);
        write_varint_param(buf, 0x04, self.initial_max_data);
        write_varint_param(buf, 0x05, self.initial_max_stream_data_bidi_local);
        write_varint_param(buf, 0x06, self.initial_max_stream_data_bidi_remote);
        write_varint_param(buf, 0x07, self.initial_max_stream_data_uni);
        write_varint_param(buf, 0x08, self.initial_max_streams_bidi);
        write_varint_param(buf, 0x09, self.initial_max_streams_uni);
        write_varint_param(buf, 0x0a, self.ack_delay_exponent);
        write_varint_param(buf, 0x0b, self.max_ack_delay);
        if self.disable_active_migration {
            write_param(buf, 0x0c, &[]);
        }
        write_varint_param(buf, 0x0e, self.active_connection_id_limit);
    }

    fn decode_params(buf: &mut &[u8]) -> Result<Self> {
        let mut params = Self::default();

        while buf.has_remaining() {
            let id = get_varint(buf).map_err(|_| Error::TransportParameter)?;
            let len = get_varint(buf).map_err(|_| Error::TransportParameter)? as usize;
            if buf.remaining() < len {
                return Err(Error::TransportParameter);
            }
            let mut value = &buf[..len];
            buf.advance(len);

            fn varint_value(value: &mut &[u8]) -> Result<u64> {
                get_varint(value).map_err(|_| Error::TransportParameter)
            }

            match id {
                0x00 => {
                    params.original_connection_id = Some(
                        ConnectionId::from_slice(value).map_err(|_| Error::TransportParameter)?,
                    )
                }
                0x01 => params.max_idle_timeout = varint_value(&mut value)?,
                0x02 => {
                    if value.len() != 16 {
                        return Err(Error::TransportParameter);
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(value);
                    params.stateless_reset_token = Some(token);
                }
                0x03 => params.max_udp_payload_size = varint_value(&mut value)?,
                0x04 => params.initial_max_data = varint_value(&mut value)?,
                0x05 => params.initial_max_stream_data_bidi_local = varint_value(&mut value)?,
                0x06 => params.initial_max_stream_data_bidi_remote = varint_value(&mut value)?,
                0x07 => params.initial_max_stream_data_uni = varint_value(&mut value)?,
                0x08 => params.initial_max_streams_bidi = varint_value(&mut value)?,
                0x09 => params.initial_max_streams_uni = varint_value(&mut value)?,
                0x0a => params.ack_delay_exponent = varint_value(&mut value)?,
                0x0b => params.max_ack_delay = varint_value(&mut value)?,
                0x0c => params.disable_active_migration = true,
                0x0e => params.active_connection_id_limit = varint_value(&mut value)?,
                _ => {} // unknown parameters are ignored
            }
        }

        params.validate()?;
        Ok(params)
    }

    /// Validate received parameters.
    pub fn validate(&self) -> Result<()> {
        if self.ack_delay_exponent > 20 {
            return Err(Error::TransportParameter);
        }
        if self.max_ack_delay >= (1 << 14) {
            return Err(Error::TransportParameter);
        }
        if self.active_connection_id_limit < 2 {
            return Err(Error::TransportParameter);
        }
        if self.max_udp_payload_size < 1200 {
            return Err(Error::TransportParameter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransportParameters {
        TransportParameters {
            max_idle_timeout: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 16,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 15,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 10,
            ..TransportParameters::default()
        }
    }

    #[test]
    fn client_hello_round_trip() {
        let params = sample();
        let encoded = params.encode_for_client_hello(Version::DRAFT_18);
        let (version, decoded) = TransportParameters::decode_from_client_hello(&encoded).unwrap();
        assert_eq!(version, Version::DRAFT_18);
        assert_eq!(decoded, params);
    }

    #[test]
    fn encrypted_extensions_round_trip() {
        let params = sample();
        let encoded = params.encode_for_encrypted_extensions(Version::DRAFT_18);
        let (version, decoded) =
            TransportParameters::decode_from_encrypted_extensions(&encoded).unwrap();
        assert_eq!(version, Version::DRAFT_18);
        assert_eq!(decoded, params);
    }

    #[test]
    fn defaults_are_elided() {
        let params = TransportParameters::default();
        let encoded = params.encode_for_client_hello(Version::DRAFT_18);
        // Only the version prelude remains.
        assert_eq!(encoded.len(), 4);
    }

    #[test]
    fn unknown_parameters_are_ignored() {
        let mut buf = BytesMut::new();
        buf.put_u32(Version::DRAFT_18.as_u32());
        put_varint(&mut buf, 0x40); // unknown id
        put_varint(&mut buf, 1);
        buf.put_u8(0xff);
        let (_, decoded) = TransportParameters::decode_from_client_hello(&buf).unwrap();
        assert_eq!(decoded, TransportParameters::default());
    }

    #[test]
    fn invalid_ack_delay_exponent_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(Version::DRAFT_18.as_u32());
        put_varint(&mut buf, 0x0a);
        put_varint(&mut buf, 1);
        put_varint(&mut buf, 21);
        assert!(TransportParameters::decode_from_client_hello(&buf).is_err());
    }
}

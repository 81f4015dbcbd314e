use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed part of the RTP header this engine cares about. CSRC lists and
/// header extensions are skipped on parse and never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("packet too short ({len} bytes)")]
    TooShort { len: usize },

    #[error("unsupported RTP version {version}")]
    BadVersion { version: u8 },
}

pub const RTP_HEADER_SIZE: usize = 12;

impl RtpHeader {
    /// Serialize the header followed by `payload` into one packet.
    pub fn serialize(&self, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());
        out.put_u8(0x80); // version 2, no padding, no extension, no CSRC
        out.put_u8((u8::from(self.marker) << 7) | (self.payload_type & 0x7F));
        out.put_u16(self.sequence_number);
        out.put_u32(self.timestamp);
        out.put_u32(self.ssrc);
        out.extend_from_slice(payload);
        out.freeze()
    }

    /// Parse a packet; returns the header and the payload offset.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), RtpError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(RtpError::TooShort { len: data.len() });
        }

        let version = data[0] >> 6;
        if version != 2 {
            return Err(RtpError::BadVersion { version });
        }

        let csrc_count = (data[0] & 0x0F) as usize;
        let has_extension = data[0] & 0x10 != 0;
        let mut offset = RTP_HEADER_SIZE + csrc_count * 4;

        if has_extension {
            if data.len() < offset + 4 {
                return Err(RtpError::TooShort { len: data.len() });
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
        }

        if data.len() < offset {
            return Err(RtpError::TooShort { len: data.len() });
        }

        let header = Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };
        Ok((header, offset))
    }
}

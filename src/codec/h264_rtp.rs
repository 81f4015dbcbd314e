use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use super::rtp::RtpHeader;
use crate::core::error::CodecError;

/// RTP clock rate for H.264 (RFC 6184).
pub const H264_CLOCK_RATE: u32 = 90_000;

/// Maximum RTP payload size (conservative Ethernet MTU budget).
const MAX_PAYLOAD_SIZE: usize = 1460;

/// FU-A NAL unit type (RFC 6184 section 5.8).
const FU_A_TYPE: u8 = 28;

/// RFC 6184 payloader: single NAL unit mode for small NALUs, FU-A
/// fragmentation for large ones. The marker bit is set only on the final
/// packet of each access unit; the caller relies on this to know which
/// fragment completes the unit.
#[derive(Debug)]
pub struct H264RtpEncoder {
    payload_type: u8,
    ssrc: u32,
    sequence_number: u16,
    max_payload: usize,
}

impl H264RtpEncoder {
    pub fn new(payload_type: u8) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            payload_type,
            ssrc: rng.gen(),
            sequence_number: rng.gen(),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    #[cfg(test)]
    fn with_max_payload(payload_type: u8, max_payload: usize) -> Self {
        let mut enc = Self::new(payload_type);
        enc.max_payload = max_payload;
        enc
    }

    /// Packetize one access unit at the given PTS.
    pub fn encode(&mut self, nalus: &[Bytes], pts: Duration) -> Result<Vec<Bytes>, CodecError> {
        if nalus.is_empty() {
            return Err(CodecError::EmptyNaluList);
        }

        let timestamp =
            (pts.as_nanos() * u128::from(H264_CLOCK_RATE) / 1_000_000_000) as u32;

        let mut payloads: Vec<BytesMut> = Vec::new();
        for nalu in nalus {
            if nalu.is_empty() {
                continue;
            }
            if nalu.len() <= self.max_payload {
                payloads.push(BytesMut::from(&nalu[..]));
            } else {
                self.fragment(nalu, &mut payloads);
            }
        }
        if payloads.is_empty() {
            return Err(CodecError::EmptyNaluList);
        }

        let last = payloads.len() - 1;
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let header = RtpHeader {
                    marker: i == last,
                    payload_type: self.payload_type,
                    sequence_number: self.sequence_number,
                    timestamp,
                    ssrc: self.ssrc,
                };
                self.sequence_number = self.sequence_number.wrapping_add(1);
                header.serialize(&payload)
            })
            .collect();
        Ok(packets)
    }

    /// FU-A fragmentation (RFC 6184 section 5.8).
    fn fragment(&self, nalu: &Bytes, payloads: &mut Vec<BytesMut>) {
        let nal_header = nalu[0];
        let fu_indicator = (nal_header & 0x60) | FU_A_TYPE;
        let chunk_size = self.max_payload - 2;
        let body = &nalu[1..];
        let num_fragments = body.len().div_ceil(chunk_size);

        for (i, chunk) in body.chunks(chunk_size).enumerate() {
            let mut fu_header = nal_header & 0x1F;
            if i == 0 {
                fu_header |= 0x80; // S bit
            }
            if i == num_fragments - 1 {
                fu_header |= 0x40; // E bit
            }

            let mut payload = BytesMut::with_capacity(2 + chunk.len());
            payload.put_u8(fu_indicator);
            payload.put_u8(fu_header);
            payload.extend_from_slice(chunk);
            payloads.push(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(pkt: &[u8]) -> (RtpHeader, Vec<u8>) {
        let (header, offset) = RtpHeader::parse(pkt).unwrap();
        (header, pkt[offset..].to_vec())
    }

    #[test]
    fn small_nalus_use_single_nal_mode() {
        let mut enc = H264RtpEncoder::new(96);
        let nalus = vec![
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE]),
        ];
        let packets = enc.encode(&nalus, Duration::from_millis(40)).unwrap();
        assert_eq!(packets.len(), 2);

        let (h0, p0) = parse(&packets[0]);
        let (h1, p1) = parse(&packets[1]);
        assert_eq!(p0, nalus[0].to_vec());
        assert_eq!(p1, nalus[1].to_vec());
        assert!(!h0.marker);
        assert!(h1.marker, "final packet of the AU must carry the marker");
        assert_eq!(h1.sequence_number, h0.sequence_number.wrapping_add(1));
        assert_eq!(h0.timestamp, 40 * 90); // 90 kHz
    }

    #[test]
    fn large_nalu_is_fragmented_with_start_end_bits() {
        let mut enc = H264RtpEncoder::with_max_payload(96, 100);
        let mut nalu = vec![0x65u8];
        nalu.extend(std::iter::repeat(0xC7).take(250));
        let packets = enc
            .encode(&[Bytes::from(nalu)], Duration::ZERO)
            .unwrap();
        assert!(packets.len() > 1);

        let (_, first) = parse(&packets[0]);
        assert_eq!(first[0] & 0x1F, FU_A_TYPE);
        assert_eq!(first[1] & 0x80, 0x80, "first fragment sets S");
        assert_eq!(first[1] & 0x1F, 0x05, "FU header keeps the NALU type");

        let (last_header, last) = parse(packets.last().unwrap());
        assert_eq!(last[1] & 0x40, 0x40, "last fragment sets E");
        assert!(last_header.marker);

        for pkt in &packets[..packets.len() - 1] {
            let (h, _) = parse(pkt);
            assert!(!h.marker);
        }
    }

    #[test]
    fn empty_access_unit_is_an_error() {
        let mut enc = H264RtpEncoder::new(96);
        assert!(enc.encode(&[], Duration::ZERO).is_err());
    }
}

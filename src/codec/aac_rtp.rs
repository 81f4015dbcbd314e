use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use super::rtp::RtpHeader;
use crate::core::error::{AacDecodeError, CodecError};

/// Samples per AAC access unit.
pub const SAMPLES_PER_AU: u32 = 1024;

/// Maximum RTP payload size (conservative Ethernet MTU budget).
const MAX_PAYLOAD_SIZE: usize = 1460;

/// AU sizes are carried in 13 bits (RFC 3640, AAC-hbr mode).
const MAX_AU_SIZE: usize = 0x1FFF;

// ---------------------------------------------------------------------------
// AudioSpecificConfig
// ---------------------------------------------------------------------------

/// Decoded MPEG-4 AudioSpecificConfig (ISO 14496-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

impl AudioSpecificConfig {
    /// Parse the first two bytes of an AudioSpecificConfig:
    /// audioObjectType (5 bits) + samplingFrequencyIndex (4 bits) +
    /// channelConfiguration (4 bits).
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::InvalidAudioConfig {
                reason: "config shorter than 2 bytes".to_string(),
            });
        }

        let object_type = data[0] >> 3;
        let freq_index = (((data[0] & 0x07) << 1) | (data[1] >> 7)) as usize;
        let channels = (data[1] >> 3) & 0x0F;

        let sample_rate = *SAMPLE_RATES.get(freq_index).ok_or_else(|| {
            CodecError::InvalidAudioConfig {
                reason: format!("reserved sampling frequency index {}", freq_index),
            }
        })?;

        Ok(Self {
            object_type,
            sample_rate,
            channels,
        })
    }
}

// ---------------------------------------------------------------------------
// Payloader
// ---------------------------------------------------------------------------

/// RFC 3640 AAC-hbr payloader: one access unit per packet, with
/// fragmentation for units larger than the payload budget. The RTP clock
/// equals the AAC sampling rate, so consecutive units are 1024 ticks apart.
#[derive(Debug)]
pub struct AacRtpEncoder {
    payload_type: u8,
    clock_rate: u32,
    ssrc: u32,
    sequence_number: u16,
    max_payload: usize,
}

impl AacRtpEncoder {
    pub fn new(payload_type: u8, clock_rate: u32) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            payload_type,
            clock_rate,
            ssrc: rng.gen(),
            sequence_number: rng.gen(),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    #[cfg(test)]
    fn with_max_payload(payload_type: u8, clock_rate: u32, max_payload: usize) -> Self {
        let mut enc = Self::new(payload_type, clock_rate);
        enc.max_payload = max_payload;
        enc
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Packetize access units starting at the given PTS.
    pub fn encode(&mut self, aus: &[Bytes], pts: Duration) -> Result<Vec<Bytes>, CodecError> {
        let mut timestamp =
            (pts.as_nanos() * u128::from(self.clock_rate) / 1_000_000_000) as u32;
        let mut packets = Vec::with_capacity(aus.len());

        for au in aus {
            if au.len() > MAX_AU_SIZE {
                return Err(CodecError::OversizedAu { len: au.len() });
            }

            let budget = self.max_payload - 4; // AU-headers section
            if au.len() <= budget {
                packets.push(self.packet(timestamp, au.len(), au, true));
            } else {
                let chunks: Vec<&[u8]> = au.chunks(budget).collect();
                let last = chunks.len() - 1;
                for (i, chunk) in chunks.into_iter().enumerate() {
                    packets.push(self.packet(timestamp, au.len(), chunk, i == last));
                }
            }

            timestamp = timestamp.wrapping_add(SAMPLES_PER_AU);
        }

        Ok(packets)
    }

    fn packet(&mut self, timestamp: u32, au_size: usize, data: &[u8], marker: bool) -> Bytes {
        let mut payload = BytesMut::with_capacity(4 + data.len());
        payload.put_u16(16); // AU-headers-length in bits
        payload.put_u16((au_size as u16) << 3); // 13-bit size, 3-bit index 0
        payload.extend_from_slice(data);

        let header = RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence_number: self.sequence_number,
            timestamp,
            ssrc: self.ssrc,
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        header.serialize(&payload)
    }
}

// ---------------------------------------------------------------------------
// Depayloader
// ---------------------------------------------------------------------------

/// RFC 3640 AAC-hbr depayloader. Reassembles fragmented access units and
/// reports the PTS of each packet relative to the first one seen.
#[derive(Debug)]
pub struct AacRtpDecoder {
    clock_rate: u32,
    first_timestamp: Option<u32>,
    fragment: BytesMut,
    /// Full size of the access unit being reassembled; 0 when idle.
    fragment_expected: usize,
    fragment_timestamp: u32,
}

impl AacRtpDecoder {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            first_timestamp: None,
            fragment: BytesMut::new(),
            fragment_expected: 0,
            fragment_timestamp: 0,
        }
    }

    /// Feed one RTP packet. Returns the completed access units and the PTS
    /// of the first of them.
    pub fn decode(&mut self, pkt: &[u8]) -> Result<(Vec<Bytes>, Duration), AacDecodeError> {
        let (header, offset) =
            RtpHeader::parse(pkt).map_err(|e| AacDecodeError::InvalidPacket {
                reason: e.to_string(),
            })?;
        let payload = &pkt[offset..];

        if payload.len() < 2 {
            return Err(AacDecodeError::InvalidAuHeaders {
                reason: "payload too short for AU-headers-length".to_string(),
            });
        }

        let au_headers_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if au_headers_bits == 0 || au_headers_bits % 16 != 0 {
            return Err(AacDecodeError::InvalidAuHeaders {
                reason: format!("unsupported AU-headers-length {} bits", au_headers_bits),
            });
        }
        let au_count = au_headers_bits / 16;
        let data_start = 2 + au_count * 2;
        if payload.len() < data_start {
            return Err(AacDecodeError::InvalidAuHeaders {
                reason: "payload too short for AU headers".to_string(),
            });
        }

        let mut sizes = Vec::with_capacity(au_count);
        for i in 0..au_count {
            let raw = u16::from_be_bytes([payload[2 + i * 2], payload[3 + i * 2]]);
            sizes.push((raw >> 3) as usize);
        }
        let data = &payload[data_start..];

        if self.fragment_expected > 0 {
            return self.continue_fragment(&header, au_count, &sizes, data);
        }

        // a single AU larger than the packet data starts a fragment
        if au_count == 1 && sizes[0] > data.len() {
            if header.marker {
                return Err(AacDecodeError::InvalidAuHeaders {
                    reason: "truncated access unit".to_string(),
                });
            }
            self.fragment.clear();
            self.fragment.extend_from_slice(data);
            self.fragment_expected = sizes[0];
            self.fragment_timestamp = header.timestamp;
            return Err(AacDecodeError::MorePacketsNeeded);
        }

        let mut aus = Vec::with_capacity(au_count);
        let mut pos = 0;
        for size in sizes {
            if pos + size > data.len() {
                return Err(AacDecodeError::InvalidAuHeaders {
                    reason: "AU size exceeds payload".to_string(),
                });
            }
            aus.push(Bytes::copy_from_slice(&data[pos..pos + size]));
            pos += size;
        }

        Ok((aus, self.pts_of(header.timestamp)))
    }

    fn continue_fragment(
        &mut self,
        header: &RtpHeader,
        au_count: usize,
        sizes: &[usize],
        data: &[u8],
    ) -> Result<(Vec<Bytes>, Duration), AacDecodeError> {
        if au_count != 1 || sizes[0] != self.fragment_expected {
            self.fragment_expected = 0;
            return Err(AacDecodeError::InvalidAuHeaders {
                reason: "fragment sequence interrupted".to_string(),
            });
        }

        self.fragment.extend_from_slice(data);
        if self.fragment.len() > self.fragment_expected {
            self.fragment_expected = 0;
            return Err(AacDecodeError::InvalidAuHeaders {
                reason: "fragments exceed announced AU size".to_string(),
            });
        }

        if !header.marker {
            return Err(AacDecodeError::MorePacketsNeeded);
        }

        if self.fragment.len() != self.fragment_expected {
            self.fragment_expected = 0;
            return Err(AacDecodeError::InvalidAuHeaders {
                reason: "access unit ended short".to_string(),
            });
        }

        self.fragment_expected = 0;
        let au = self.fragment.split().freeze();
        let ts = self.fragment_timestamp;
        Ok((vec![au], self.pts_of(ts)))
    }

    fn pts_of(&mut self, timestamp: u32) -> Duration {
        let base = *self.first_timestamp.get_or_insert(timestamp);
        let elapsed = timestamp.wrapping_sub(base);
        Duration::from_nanos(u64::from(elapsed) * 1_000_000_000 / u64::from(self.clock_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_specific_config_parsing() {
        // AAC-LC, 44100 Hz, stereo: objectType=2, freqIndex=4, channels=2
        let cfg = AudioSpecificConfig::parse(&[0x12, 0x10]).unwrap();
        assert_eq!(cfg.object_type, 2);
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.channels, 2);

        // AAC-LC, 48000 Hz, stereo: objectType=2, freqIndex=3, channels=2
        let cfg = AudioSpecificConfig::parse(&[0x11, 0x90]).unwrap();
        assert_eq!(cfg.sample_rate, 48_000);
    }

    #[test]
    fn audio_specific_config_rejects_short_input() {
        assert!(AudioSpecificConfig::parse(&[0x12]).is_err());
    }

    #[test]
    fn single_au_per_packet() {
        let mut enc = AacRtpEncoder::new(97, 48_000);
        let aus = vec![
            Bytes::from_static(&[0x01; 300]),
            Bytes::from_static(&[0x02; 280]),
        ];
        let packets = enc.encode(&aus, Duration::ZERO).unwrap();
        assert_eq!(packets.len(), 2);

        let (h0, _) = RtpHeader::parse(&packets[0]).unwrap();
        let (h1, _) = RtpHeader::parse(&packets[1]).unwrap();
        assert!(h0.marker && h1.marker);
        assert_eq!(h1.timestamp, h0.timestamp.wrapping_add(SAMPLES_PER_AU));

        let mut dec = AacRtpDecoder::new(48_000);
        let (decoded, pts) = dec.decode(&packets[0]).unwrap();
        assert_eq!(decoded, vec![aus[0].clone()]);
        assert_eq!(pts, Duration::ZERO);

        let (decoded, pts) = dec.decode(&packets[1]).unwrap();
        assert_eq!(decoded, vec![aus[1].clone()]);
        // second AU sits 1024 samples later on the 48 kHz clock
        assert_eq!(pts, Duration::from_nanos(1024 * 1_000_000_000 / 48_000));
    }

    #[test]
    fn fragmented_au_needs_more_packets() {
        let mut enc = AacRtpEncoder::with_max_payload(97, 44_100, 100);
        let au = Bytes::from(vec![0xEEu8; 250]);
        let packets = enc.encode(&[au.clone()], Duration::ZERO).unwrap();
        assert!(packets.len() > 1);

        let mut dec = AacRtpDecoder::new(44_100);
        for pkt in &packets[..packets.len() - 1] {
            assert!(matches!(
                dec.decode(pkt),
                Err(AacDecodeError::MorePacketsNeeded)
            ));
        }

        let (decoded, pts) = dec.decode(packets.last().unwrap()).unwrap();
        assert_eq!(decoded, vec![au]);
        assert_eq!(pts, Duration::ZERO);
    }

    #[test]
    fn oversized_au_is_an_error() {
        let mut enc = AacRtpEncoder::new(97, 48_000);
        let au = Bytes::from(vec![0u8; MAX_AU_SIZE + 1]);
        assert!(matches!(
            enc.encode(&[au], Duration::ZERO),
            Err(CodecError::OversizedAu { .. })
        ));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let mut dec = AacRtpDecoder::new(48_000);
        let header = RtpHeader {
            marker: true,
            payload_type: 97,
            sequence_number: 1,
            timestamp: 0,
            ssrc: 1,
        };
        // AU header announces 100 bytes with the marker already set
        let mut payload = vec![0x00, 0x10];
        payload.extend_from_slice(&((100u16) << 3).to_be_bytes());
        payload.extend_from_slice(&[0xAA; 10]);
        let pkt = header.serialize(&payload);
        assert!(matches!(
            dec.decode(&pkt),
            Err(AacDecodeError::InvalidAuHeaders { .. })
        ));
    }
}

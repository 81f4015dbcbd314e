use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::error::CodecError;

// ---------------------------------------------------------------------------
// NALU helpers
// ---------------------------------------------------------------------------

/// H.264 NAL unit type: IDR slice.
pub const NAL_TYPE_IDR: u8 = 5;

/// H.264 NAL unit type: SPS.
pub const NAL_TYPE_SPS: u8 = 7;

/// H.264 NAL unit type: PPS.
pub const NAL_TYPE_PPS: u8 = 8;

/// Extract the NAL unit type from the first header byte.
pub fn nalu_type(header: u8) -> u8 {
    header & 0x1F
}

/// Whether an access unit contains an IDR slice.
pub fn idr_present(nalus: &[Bytes]) -> bool {
    nalus
        .iter()
        .any(|n| !n.is_empty() && nalu_type(n[0]) == NAL_TYPE_IDR)
}

// ---------------------------------------------------------------------------
// AVCC packaging
// ---------------------------------------------------------------------------

/// Encode a NALU list as AVCC (4-byte big-endian length prefixes).
pub fn encode_avcc(nalus: &[Bytes]) -> Result<Bytes, CodecError> {
    if nalus.is_empty() {
        return Err(CodecError::EmptyNaluList);
    }

    let total: usize = nalus.iter().map(|n| 4 + n.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for nalu in nalus {
        out.put_u32(nalu.len() as u32);
        out.extend_from_slice(nalu);
    }
    Ok(out.freeze())
}

/// Decode AVCC data into its NALU list.
pub fn decode_avcc(data: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    let mut nalus = Vec::new();
    let mut pos = 0;

    while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += 4;

        if pos + len > data.len() {
            return Err(CodecError::InvalidAvcc {
                reason: format!(
                    "NALU length {} exceeds remaining data {} at offset {}",
                    len,
                    data.len() - pos,
                    pos
                ),
            });
        }
        if len > 0 {
            nalus.push(Bytes::copy_from_slice(&data[pos..pos + len]));
        }
        pos += len;
    }

    if pos != data.len() {
        return Err(CodecError::InvalidAvcc {
            reason: "trailing bytes after last NALU".to_string(),
        });
    }
    if nalus.is_empty() {
        return Err(CodecError::EmptyNaluList);
    }
    Ok(nalus)
}

/// Whether AVCC-packaged data contains an IDR slice, without unpacking.
pub fn avcc_idr_present(data: &[u8]) -> bool {
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += 4;
        if pos >= data.len() || pos + len > data.len() {
            return false;
        }
        if len > 0 && nalu_type(data[pos]) == NAL_TYPE_IDR {
            return true;
        }
        pos += len;
    }
    false
}

// ---------------------------------------------------------------------------
// AVCDecoderConfigurationRecord
// ---------------------------------------------------------------------------

/// The FLV/MP4 sequence-header record carrying one SPS and one PPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub sps: Bytes,
    pub pps: Bytes,
}

impl DecoderConfig {
    /// Serialize into an AVCDecoderConfigurationRecord.
    pub fn marshal(&self) -> Result<Bytes, CodecError> {
        if self.sps.len() < 4 {
            return Err(CodecError::InvalidDecoderConfig {
                reason: "SPS shorter than 4 bytes".to_string(),
            });
        }
        if self.pps.is_empty() {
            return Err(CodecError::InvalidDecoderConfig {
                reason: "empty PPS".to_string(),
            });
        }

        let mut out = BytesMut::with_capacity(11 + self.sps.len() + self.pps.len());
        out.put_u8(1); // configurationVersion
        out.put_u8(self.sps[1]); // AVCProfileIndication
        out.put_u8(self.sps[2]); // profile_compatibility
        out.put_u8(self.sps[3]); // AVCLevelIndication
        out.put_u8(0xFF); // lengthSizeMinusOne = 3
        out.put_u8(0xE1); // numOfSequenceParameterSets = 1
        out.put_u16(self.sps.len() as u16);
        out.extend_from_slice(&self.sps);
        out.put_u8(1); // numOfPictureParameterSets
        out.put_u16(self.pps.len() as u16);
        out.extend_from_slice(&self.pps);
        Ok(out.freeze())
    }

    /// Parse an AVCDecoderConfigurationRecord, taking the first SPS and PPS.
    pub fn unmarshal(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 7 {
            return Err(CodecError::InvalidDecoderConfig {
                reason: "record too short".to_string(),
            });
        }

        let num_sps = (data[5] & 0x1F) as usize;
        let mut pos = 6;
        let mut sps = None;

        for _ in 0..num_sps {
            let len = Self::read_len(data, pos)?;
            pos += 2;
            if pos + len > data.len() {
                return Err(CodecError::InvalidDecoderConfig {
                    reason: "SPS length exceeds record".to_string(),
                });
            }
            if sps.is_none() {
                sps = Some(Bytes::copy_from_slice(&data[pos..pos + len]));
            }
            pos += len;
        }

        if pos >= data.len() {
            return Err(CodecError::InvalidDecoderConfig {
                reason: "missing PPS count".to_string(),
            });
        }
        let num_pps = data[pos] as usize;
        pos += 1;
        let mut pps = None;

        for _ in 0..num_pps {
            let len = Self::read_len(data, pos)?;
            pos += 2;
            if pos + len > data.len() {
                return Err(CodecError::InvalidDecoderConfig {
                    reason: "PPS length exceeds record".to_string(),
                });
            }
            if pps.is_none() {
                pps = Some(Bytes::copy_from_slice(&data[pos..pos + len]));
            }
            pos += len;
        }

        match (sps, pps) {
            (Some(sps), Some(pps)) if !sps.is_empty() && !pps.is_empty() => {
                Ok(Self { sps, pps })
            }
            _ => Err(CodecError::InvalidDecoderConfig {
                reason: "record carries no SPS/PPS pair".to_string(),
            }),
        }
    }

    fn read_len(data: &[u8], pos: usize) -> Result<usize, CodecError> {
        if pos + 2 > data.len() {
            return Err(CodecError::InvalidDecoderConfig {
                reason: "truncated length field".to_string(),
            });
        }
        Ok(u16::from_be_bytes([data[pos], data[pos + 1]]) as usize)
    }
}

// ---------------------------------------------------------------------------
// DTS estimation
// ---------------------------------------------------------------------------

/// Estimates DTS from the PTS sequence of decoded access units.
///
/// Streams without reordering get DTS == PTS. Once a reordered frame is
/// observed (PTS below its predecessor) the estimate holds back so DTS
/// stays non-decreasing.
#[derive(Debug, Default)]
pub struct DtsEstimator {
    initialized: bool,
    reordering: bool,
    prev_pts: Duration,
    prev_dts: Duration,
}

impl DtsEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next PTS in decode order; returns the estimated DTS.
    pub fn feed(&mut self, pts: Duration) -> Duration {
        let dts = if !self.initialized {
            self.initialized = true;
            pts
        } else if pts >= self.prev_pts {
            if self.reordering {
                self.prev_dts.max(self.prev_pts)
            } else {
                pts
            }
        } else {
            self.reordering = true;
            self.prev_dts
        };

        self.prev_pts = pts;
        self.prev_dts = dts;
        dts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn idr_detection() {
        let idr = Bytes::from_static(&[0x65, 0x88]);
        let slice = Bytes::from_static(&[0x41, 0x9A]);
        let sps = Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E]);

        assert!(idr_present(&[sps.clone(), idr]));
        assert!(!idr_present(&[sps, slice]));
        assert!(!idr_present(&[]));
    }

    #[test]
    fn avcc_round_trip() {
        let nalus = vec![
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1E]),
            Bytes::from_static(&[0x68, 0xCE]),
            Bytes::from_static(&[0x65, 0x88, 0x84]),
        ];
        let avcc = encode_avcc(&nalus).unwrap();
        assert_eq!(&avcc[..4], &[0, 0, 0, 4]);
        assert!(avcc_idr_present(&avcc));
        assert_eq!(decode_avcc(&avcc).unwrap(), nalus);
    }

    #[test]
    fn avcc_rejects_truncated_data() {
        // length prefix claims 255 bytes but only one follows
        let data = [0x00, 0x00, 0x00, 0xFF, 0x65];
        assert!(decode_avcc(&data).is_err());
    }

    #[test]
    fn decoder_config_round_trip() {
        let cfg = DecoderConfig {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F, 0xAC]),
            pps: Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]),
        };
        let record = cfg.marshal().unwrap();
        assert_eq!(record[0], 1);
        assert_eq!(record[1], 0x64); // profile copied from SPS
        assert_eq!(DecoderConfig::unmarshal(&record).unwrap(), cfg);
    }

    #[test]
    fn decoder_config_rejects_empty_record() {
        assert!(DecoderConfig::unmarshal(&[1, 0x64, 0, 0x1F, 0xFF, 0xE0, 0]).is_err());
    }

    #[test]
    fn dts_follows_pts_on_monotonic_streams() {
        let mut est = DtsEstimator::new();
        assert_eq!(est.feed(ms(0)), ms(0));
        assert_eq!(est.feed(ms(40)), ms(40));
        assert_eq!(est.feed(ms(80)), ms(80));
    }

    #[test]
    fn dts_stays_monotonic_under_reordering() {
        let mut est = DtsEstimator::new();
        // decode order I P B P B with presentation 0, 80, 40, 160, 120
        let mut prev = est.feed(ms(0));
        for pts in [80u64, 40, 160, 120] {
            let dts = est.feed(ms(pts));
            assert!(dts >= prev, "DTS regressed: {:?} -> {:?}", prev, dts);
            prev = dts;
        }
    }
}

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a connection (UUIDv7 for time-sortability).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tracks
// ---------------------------------------------------------------------------

/// A media track announced on a path, carrying codec-specific metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Track {
    H264 {
        sps: Bytes,
        pps: Bytes,
    },
    Aac {
        /// RTP clock rate, equal to the AAC sampling rate.
        clock_rate: u32,
        /// MPEG-4 AudioSpecificConfig bytes.
        config: Bytes,
    },
}

impl Track {
    pub fn clock_rate(&self) -> u32 {
        match self {
            Track::H264 { .. } => 90_000,
            Track::Aac { clock_rate, .. } => *clock_rate,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Track::H264 { .. })
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Track::H264 { .. } => write!(f, "video(h264)"),
            Track::Aac { clock_rate, .. } => write!(f, "audio(aac, {}Hz)", clock_rate),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus items
// ---------------------------------------------------------------------------

/// A decoded H.264 access unit, attached to the final RTP fragment that
/// completes it on the bus.
#[derive(Debug, Clone)]
pub struct H264AccessUnit {
    pub nalus: Vec<Bytes>,
    pub pts: Duration,
}

/// One unit on the internal stream bus.
#[derive(Debug, Clone)]
pub struct Data {
    pub track_id: usize,
    pub payload: DataPayload,
}

/// Payload of a bus item.
///
/// An H.264 access unit may span several RTP fragments; only the final
/// fragment carries the decoded access unit. Audio packets always map one
/// RTP packet to one item.
#[derive(Debug, Clone)]
pub enum DataPayload {
    Video {
        rtp: Bytes,
        /// Whether this fragment's PTS equals its DTS. False on every
        /// non-final fragment of an access unit.
        pts_equals_dts: bool,
        access_unit: Option<H264AccessUnit>,
    },
    Audio {
        rtp: Bytes,
    },
}

impl Data {
    pub fn pts_equals_dts(&self) -> bool {
        match &self.payload {
            DataPayload::Video { pts_equals_dts, .. } => *pts_equals_dts,
            DataPayload::Audio { .. } => true,
        }
    }
}

// ---------------------------------------------------------------------------
// API describe payloads
// ---------------------------------------------------------------------------

/// Identity payload exposed through the introspection API.
#[derive(Debug, Clone, Serialize)]
pub struct ApiDescribe {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
}

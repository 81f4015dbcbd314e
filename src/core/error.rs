use thiserror::Error;

// ---------------------------------------------------------------------------
// Authentication errors
// ---------------------------------------------------------------------------

/// Authentication failures.
///
/// Every authentication failure is critical: the connection must pause
/// before closing so that credential guessing stays expensive.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{message}")]
    Critical { message: String },
}

// ---------------------------------------------------------------------------
// Path-manager errors
// ---------------------------------------------------------------------------

/// Errors returned by path-manager operations.
#[derive(Debug, Error)]
pub enum PathError {
    /// Authentication failed; the caller owes the anti-brute-force pause.
    #[error("{message}")]
    AuthCritical { message: String },

    #[error("no one is publishing to path '{name}'")]
    NoPublisher { name: String },

    #[error("someone is already publishing to path '{name}'")]
    AlreadyPublishing { name: String },
}

// ---------------------------------------------------------------------------
// RTMP framer errors
// ---------------------------------------------------------------------------

/// Errors originating from the RTMP framer.
#[derive(Debug, Error)]
pub enum FramerError {
    #[error("invalid RTMP version: expected 3, got {version}")]
    InvalidVersion { version: u8 },

    #[error("read timed out")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("malformed AMF data: {reason}")]
    MalformedAmf { reason: String },

    #[error("unexpected command '{name}' during {phase}")]
    UnexpectedCommand { name: String, phase: &'static str },

    #[error("unsupported video codec id {codec_id}")]
    UnsupportedVideoCodec { codec_id: u8 },

    #[error("unsupported audio format {sound_format}")]
    UnsupportedAudioCodec { sound_format: u8 },

    #[error("metadata declares no supported tracks")]
    NoTracks,

    #[error("invalid sequence header: {reason}")]
    InvalidSequenceHeader { reason: String },

    #[error("video tag too short")]
    ShortVideoTag,

    #[error("stream closed by peer")]
    StreamClosed,

    #[error("framer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Codec reshaping errors. Fatal to the session that hits them.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid AVCC data: {reason}")]
    InvalidAvcc { reason: String },

    #[error("invalid H264 decoder configuration: {reason}")]
    InvalidDecoderConfig { reason: String },

    #[error("invalid audio configuration: {reason}")]
    InvalidAudioConfig { reason: String },

    #[error("AAC access unit too large ({len} bytes)")]
    OversizedAu { len: usize },

    #[error("empty NALU list")]
    EmptyNaluList,
}

/// AAC RTP depayloader outcomes.
///
/// `MorePacketsNeeded` is part of normal operation (a fragmented access
/// unit) and must stay silent; the remaining kinds are logged at warn
/// level and the packet is skipped.
#[derive(Debug, Error)]
pub enum AacDecodeError {
    #[error("more packets needed")]
    MorePacketsNeeded,

    #[error("invalid RTP packet: {reason}")]
    InvalidPacket { reason: String },

    #[error("invalid AU headers: {reason}")]
    InvalidAuHeaders { reason: String },
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Final error of one RTMP session, logged when the connection closes.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Synthetic error produced when the parent cancels the connection.
    #[error("terminated")]
    Terminated,

    /// Critical authentication failure, reported after the mandatory pause.
    #[error("{message}")]
    Auth { message: String },

    #[error("can't read track {n} with RTMP: too many tracks")]
    TooManyTracks { n: usize },

    #[error("the stream doesn't contain an H264 track or an AAC track")]
    NoSuitableTracks,

    #[error("received an H264 packet, but track is not set up")]
    UnexpectedVideoPacket,

    #[error("received an AAC packet, but track is not set up")]
    UnexpectedAudioPacket,

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Framer(#[from] FramerError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

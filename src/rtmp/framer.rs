use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use rml_amf0::Amf0Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::codec::aac_rtp::AudioSpecificConfig;
use crate::codec::h264::{self, DecoderConfig};
use crate::core::error::FramerError;
use crate::core::types::Track;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const RTMP_VERSION: u8 = 3;
const HANDSHAKE_SIZE: usize = 1536;
const DEFAULT_CHUNK_SIZE: usize = 128;
const OUT_CHUNK_SIZE: usize = 65536;
const MAX_IN_CHUNK_SIZE: usize = 0xFF_FFFF;
const WINDOW_ACK_SIZE: u32 = 2_500_000;

/// RTMP message type ids.
const MSG_SET_CHUNK_SIZE: u8 = 1;
const MSG_ACK: u8 = 3;
const MSG_USER_CONTROL: u8 = 4;
const MSG_WINDOW_ACK_SIZE: u8 = 5;
const MSG_SET_PEER_BW: u8 = 6;
const MSG_AUDIO: u8 = 8;
const MSG_VIDEO: u8 = 9;
const MSG_COMMAND_AMF3: u8 = 17;
const MSG_DATA_AMF0: u8 = 18;
const MSG_COMMAND_AMF0: u8 = 20;

/// Chunk stream ids used for outbound messages.
const CSID_CONTROL: u8 = 2;
const CSID_COMMAND: u8 = 3;
const CSID_DATA: u8 = 4;
const CSID_VIDEO: u8 = 6;
const CSID_AUDIO: u8 = 7;

/// FLV tag body constants.
const FLV_CODEC_ID_H264: u8 = 7;
const FLV_SOUND_FORMAT_AAC: u8 = 10;
const AVC_PACKET_TYPE_SEQ_HEADER: u8 = 0;
const AVC_PACKET_TYPE_NALU: u8 = 1;
const AAC_PACKET_TYPE_SEQ_HEADER: u8 = 0;
const AAC_PACKET_TYPE_RAW: u8 = 1;

/// Message stream id announced by createStream.
const MEDIA_STREAM_ID: u32 = 1;

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    H264DecoderConfig,
    H264,
    Aac,
}

/// One media packet on the RTMP side of the bridge.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub data: Bytes,
    /// DTS.
    pub time: Duration,
    /// PTS − DTS (composition offset).
    pub ctime: Duration,
}

// ---------------------------------------------------------------------------
// Chunk stream assembly
// ---------------------------------------------------------------------------

/// A fully reassembled RTMP message.
#[derive(Debug)]
struct Message {
    msg_type: u8,
    timestamp: u32,
    #[allow(dead_code)]
    stream_id: u32,
    data: Bytes,
}

#[derive(Debug, Default)]
struct InChunkState {
    timestamp: u32,
    ts_delta: u32,
    length: usize,
    type_id: u8,
    stream_id: u32,
    ext_ts: bool,
    buf: BytesMut,
}

// ---------------------------------------------------------------------------
// Framer
// ---------------------------------------------------------------------------

/// Server side of one RTMP connection: handshake, chunk codec, command
/// phase, track exchange and media packets.
///
/// Not thread-safe: a single task owns the framer for the whole session.
/// Deadlines apply per public operation; `None` disables the deadline.
pub struct Framer<S> {
    io: S,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    in_chunk_size: usize,
    out_chunk_size: usize,
    in_streams: HashMap<u32, InChunkState>,
    url: String,
    publishing: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Framer<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            read_deadline: None,
            write_deadline: None,
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            in_streams: HashMap::new(),
            url: String::new(),
            publishing: false,
        }
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// The reconstructed client URL, valid after the handshake.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the client issued `publish` rather than `play`. Valid after
    /// the handshake.
    pub fn is_publishing(&self) -> bool {
        self.publishing
    }

    // -- handshake ----------------------------------------------------------

    /// Run the byte handshake and the command phase, up to the point where
    /// the client has committed to publishing or playing.
    pub async fn server_handshake(&mut self) -> Result<(), FramerError> {
        match self.read_deadline {
            Some(d) => timeout_at(d, self.server_handshake_inner())
                .await
                .map_err(|_| FramerError::ReadTimeout)?,
            None => self.server_handshake_inner().await,
        }
    }

    async fn server_handshake_inner(&mut self) -> Result<(), FramerError> {
        let version = self.io.read_u8().await?; // C0
        if version != RTMP_VERSION {
            return Err(FramerError::InvalidVersion { version });
        }

        let mut c1 = vec![0u8; HANDSHAKE_SIZE];
        self.io.read_exact(&mut c1).await?;

        // S1 carries a zero timestamp, a zero reserved field and a random
        // tail the client echoes back; S2 echoes C1 in full
        let mut s1 = [0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill(&mut s1[8..]);

        let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
        response.put_u8(RTMP_VERSION); // S0
        response.extend_from_slice(&s1);
        response.extend_from_slice(&c1);
        self.io.write_all(&response).await?;
        self.io.flush().await?;

        // C2: the client's echo of S1; not validated
        let mut c2 = vec![0u8; HANDSHAKE_SIZE];
        self.io.read_exact(&mut c2).await?;

        self.command_phase().await
    }

    /// Process commands until the client commits to publish or play.
    async fn command_phase(&mut self) -> Result<(), FramerError> {
        loop {
            let msg = self.read_message().await?;
            match msg.msg_type {
                MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3 => {
                    let data = command_body(msg.msg_type, &msg.data);
                    let values = decode_amf(data)?;
                    let (name, transaction_id) = command_header(&values)?;

                    match name.as_str() {
                        "connect" => self.handle_connect(transaction_id, &values).await?,
                        "releaseStream" | "FCPublish" => {
                            self.send_simple_result(transaction_id).await?;
                        }
                        "createStream" => {
                            self.send_create_stream_result(transaction_id).await?;
                        }
                        "publish" => {
                            let key = first_string_arg(&values).unwrap_or_default();
                            self.finish_url(&key);
                            self.send_publish_start().await?;
                            self.publishing = true;
                            return Ok(());
                        }
                        "play" => {
                            let name = first_string_arg(&values).unwrap_or_default();
                            self.finish_url(&name);
                            self.send_play_start().await?;
                            self.publishing = false;
                            return Ok(());
                        }
                        "deleteStream" | "closeStream" => {
                            return Err(FramerError::StreamClosed);
                        }
                        other => {
                            debug!(command = other, "ignoring RTMP command");
                        }
                    }
                }
                MSG_SET_CHUNK_SIZE => self.handle_set_chunk_size(&msg.data),
                MSG_WINDOW_ACK_SIZE | MSG_SET_PEER_BW | MSG_ACK | MSG_USER_CONTROL => {}
                other => {
                    debug!(msg_type = other, "ignoring RTMP message during command phase");
                }
            }
        }
    }

    async fn handle_connect(
        &mut self,
        transaction_id: f64,
        values: &[Amf0Value],
    ) -> Result<(), FramerError> {
        let mut app = String::new();
        let mut tc_url = None;
        if let Some(Amf0Value::Object(props)) = values.get(2) {
            if let Some(Amf0Value::Utf8String(v)) = props.get("app") {
                app = v.clone();
            }
            if let Some(Amf0Value::Utf8String(v)) = props.get("tcUrl") {
                tc_url = Some(v.clone());
            }
        }
        self.url = match tc_url {
            Some(u) => u.trim_end_matches('/').to_string(),
            None => format!("rtmp://localhost/{}", app),
        };

        // Window Acknowledgement Size
        self.write_message(
            CSID_CONTROL,
            MSG_WINDOW_ACK_SIZE,
            0,
            0,
            &WINDOW_ACK_SIZE.to_be_bytes(),
        )
        .await?;

        // Set Peer Bandwidth (dynamic)
        let mut bw = [0u8; 5];
        bw[..4].copy_from_slice(&WINDOW_ACK_SIZE.to_be_bytes());
        bw[4] = 2;
        self.write_message(CSID_CONTROL, MSG_SET_PEER_BW, 0, 0, &bw).await?;

        // Set Chunk Size, then switch the outbound splitter over
        self.write_message(
            CSID_CONTROL,
            MSG_SET_CHUNK_SIZE,
            0,
            0,
            &(OUT_CHUNK_SIZE as u32).to_be_bytes(),
        )
        .await?;
        self.out_chunk_size = OUT_CHUNK_SIZE;

        let mut fms = HashMap::new();
        fms.insert("fmsVer".to_string(), Amf0Value::Utf8String("FMS/3,0,1,123".to_string()));
        fms.insert("capabilities".to_string(), Amf0Value::Number(31.0));

        let mut info = HashMap::new();
        info.insert("level".to_string(), Amf0Value::Utf8String("status".to_string()));
        info.insert(
            "code".to_string(),
            Amf0Value::Utf8String("NetConnection.Connect.Success".to_string()),
        );
        info.insert(
            "description".to_string(),
            Amf0Value::Utf8String("Connection succeeded.".to_string()),
        );
        info.insert("objectEncoding".to_string(), Amf0Value::Number(0.0));

        let body = encode_amf(&vec![
            Amf0Value::Utf8String("_result".to_string()),
            Amf0Value::Number(transaction_id),
            Amf0Value::Object(fms),
            Amf0Value::Object(info),
        ])?;
        self.write_message(CSID_COMMAND, MSG_COMMAND_AMF0, 0, 0, &body).await
    }

    fn finish_url(&mut self, stream_key: &str) {
        if self.url.is_empty() {
            self.url = "rtmp://localhost".to_string();
        }
        if !stream_key.is_empty() {
            self.url = format!("{}/{}", self.url, stream_key);
        }
    }

    async fn send_simple_result(&mut self, transaction_id: f64) -> Result<(), FramerError> {
        let body = encode_amf(&vec![
            Amf0Value::Utf8String("_result".to_string()),
            Amf0Value::Number(transaction_id),
            Amf0Value::Null,
        ])?;
        self.write_message(CSID_COMMAND, MSG_COMMAND_AMF0, 0, 0, &body).await
    }

    async fn send_create_stream_result(&mut self, transaction_id: f64) -> Result<(), FramerError> {
        let body = encode_amf(&vec![
            Amf0Value::Utf8String("_result".to_string()),
            Amf0Value::Number(transaction_id),
            Amf0Value::Null,
            Amf0Value::Number(MEDIA_STREAM_ID as f64),
        ])?;
        self.write_message(CSID_COMMAND, MSG_COMMAND_AMF0, 0, 0, &body).await
    }

    async fn send_stream_begin(&mut self) -> Result<(), FramerError> {
        let mut payload = [0u8; 6];
        payload[..2].copy_from_slice(&0u16.to_be_bytes()); // StreamBegin
        payload[2..].copy_from_slice(&MEDIA_STREAM_ID.to_be_bytes());
        self.write_message(CSID_CONTROL, MSG_USER_CONTROL, 0, 0, &payload).await
    }

    async fn send_on_status(&mut self, code: &str, description: &str) -> Result<(), FramerError> {
        let mut info = HashMap::new();
        info.insert("level".to_string(), Amf0Value::Utf8String("status".to_string()));
        info.insert("code".to_string(), Amf0Value::Utf8String(code.to_string()));
        info.insert(
            "description".to_string(),
            Amf0Value::Utf8String(description.to_string()),
        );

        let body = encode_amf(&vec![
            Amf0Value::Utf8String("onStatus".to_string()),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
            Amf0Value::Object(info),
        ])?;
        self.write_message(CSID_COMMAND, MSG_COMMAND_AMF0, MEDIA_STREAM_ID, 0, &body)
            .await
    }

    async fn send_publish_start(&mut self) -> Result<(), FramerError> {
        self.send_stream_begin().await?;
        self.send_on_status("NetStream.Publish.Start", "publish started").await
    }

    async fn send_play_start(&mut self) -> Result<(), FramerError> {
        self.send_stream_begin().await?;
        self.send_on_status("NetStream.Play.Reset", "play reset").await?;
        self.send_on_status("NetStream.Play.Start", "play started").await
    }

    fn handle_set_chunk_size(&mut self, data: &[u8]) {
        if data.len() >= 4 {
            let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            self.in_chunk_size = size.clamp(1, MAX_IN_CHUNK_SIZE);
            debug!(size = self.in_chunk_size, "inbound chunk size updated");
        }
    }

    // -- tracks -------------------------------------------------------------

    /// Read metadata and sequence headers from a publishing client.
    pub async fn read_tracks(&mut self) -> Result<(Option<Track>, Option<Track>), FramerError> {
        match self.read_deadline {
            Some(d) => timeout_at(d, self.read_tracks_inner())
                .await
                .map_err(|_| FramerError::ReadTimeout)?,
            None => self.read_tracks_inner().await,
        }
    }

    async fn read_tracks_inner(&mut self) -> Result<(Option<Track>, Option<Track>), FramerError> {
        let mut got_metadata = false;
        let mut expect_video = false;
        let mut expect_audio = false;
        let mut video = None;
        let mut audio = None;

        loop {
            let msg = self.read_message_raw().await?;
            match msg.msg_type {
                MSG_DATA_AMF0 => {
                    let values = decode_amf(&msg.data)?;
                    if !is_metadata(&values) {
                        continue;
                    }
                    let props = metadata_object(&values).ok_or_else(|| {
                        FramerError::MalformedAmf {
                            reason: "onMetaData carries no object".to_string(),
                        }
                    })?;

                    expect_video = matches_codec(props.get("videocodecid"), 7.0, "avc1");
                    expect_audio = matches_codec(props.get("audiocodecid"), 10.0, "mp4a");
                    if !expect_video && !expect_audio {
                        return Err(FramerError::NoTracks);
                    }
                    got_metadata = true;
                }
                MSG_VIDEO => {
                    if msg.data.len() >= 5
                        && msg.data[0] & 0x0F == FLV_CODEC_ID_H264
                        && msg.data[1] == AVC_PACKET_TYPE_SEQ_HEADER
                    {
                        let config = DecoderConfig::unmarshal(&msg.data[5..]).map_err(|e| {
                            FramerError::InvalidSequenceHeader {
                                reason: e.to_string(),
                            }
                        })?;
                        video = Some(Track::H264 {
                            sps: config.sps,
                            pps: config.pps,
                        });
                    }
                }
                MSG_AUDIO => {
                    if msg.data.len() >= 2
                        && msg.data[0] >> 4 == FLV_SOUND_FORMAT_AAC
                        && msg.data[1] == AAC_PACKET_TYPE_SEQ_HEADER
                    {
                        let config = AudioSpecificConfig::parse(&msg.data[2..]).map_err(|e| {
                            FramerError::InvalidSequenceHeader {
                                reason: e.to_string(),
                            }
                        })?;
                        audio = Some(Track::Aac {
                            clock_rate: config.sample_rate,
                            config: Bytes::copy_from_slice(&msg.data[2..]),
                        });
                    }
                }
                MSG_SET_CHUNK_SIZE => self.handle_set_chunk_size(&msg.data),
                _ => {}
            }

            if got_metadata
                && (!expect_video || video.is_some())
                && (!expect_audio || audio.is_some())
            {
                return Ok((video, audio));
            }
        }
    }

    /// Send metadata and sequence headers to a playing client.
    pub async fn write_tracks(
        &mut self,
        video: Option<&Track>,
        audio: Option<&Track>,
    ) -> Result<(), FramerError> {
        match self.write_deadline {
            Some(d) => timeout_at(d, self.write_tracks_inner(video, audio))
                .await
                .map_err(|_| FramerError::WriteTimeout)?,
            None => self.write_tracks_inner(video, audio).await,
        }
    }

    async fn write_tracks_inner(
        &mut self,
        video: Option<&Track>,
        audio: Option<&Track>,
    ) -> Result<(), FramerError> {
        let mut props = HashMap::new();
        props.insert("duration".to_string(), Amf0Value::Number(0.0));
        if video.is_some() {
            props.insert(
                "videocodecid".to_string(),
                Amf0Value::Number(f64::from(FLV_CODEC_ID_H264)),
            );
        }
        if let Some(Track::Aac { clock_rate, config }) = audio {
            props.insert(
                "audiocodecid".to_string(),
                Amf0Value::Number(f64::from(FLV_SOUND_FORMAT_AAC)),
            );
            props.insert(
                "audiosamplerate".to_string(),
                Amf0Value::Number(f64::from(*clock_rate)),
            );
            if let Ok(parsed) = AudioSpecificConfig::parse(config) {
                props.insert(
                    "stereo".to_string(),
                    Amf0Value::Boolean(parsed.channels == 2),
                );
            }
        }

        let body = encode_amf(&vec![
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::Object(props),
        ])?;
        self.write_message_raw(CSID_DATA, MSG_DATA_AMF0, MEDIA_STREAM_ID, 0, &body)
            .await?;

        if let Some(track) = video {
            let Track::H264 { sps, pps } = track else {
                return Err(FramerError::InvalidSequenceHeader {
                    reason: "video track is not H264".to_string(),
                });
            };
            let record = DecoderConfig {
                sps: sps.clone(),
                pps: pps.clone(),
            }
            .marshal()
            .map_err(|e| FramerError::InvalidSequenceHeader {
                reason: e.to_string(),
            })?;

            let mut tag = BytesMut::with_capacity(5 + record.len());
            tag.put_u8(0x10 | FLV_CODEC_ID_H264); // keyframe | H264
            tag.put_u8(AVC_PACKET_TYPE_SEQ_HEADER);
            tag.extend_from_slice(&[0, 0, 0]);
            tag.extend_from_slice(&record);
            self.write_message_raw(CSID_VIDEO, MSG_VIDEO, MEDIA_STREAM_ID, 0, &tag)
                .await?;
        }

        if let Some(track) = audio {
            let Track::Aac { config, .. } = track else {
                return Err(FramerError::InvalidSequenceHeader {
                    reason: "audio track is not AAC".to_string(),
                });
            };
            let mut tag = BytesMut::with_capacity(2 + config.len());
            tag.put_u8(0xAF); // AAC, 44kHz flags, 16-bit, stereo
            tag.put_u8(AAC_PACKET_TYPE_SEQ_HEADER);
            tag.extend_from_slice(config);
            self.write_message_raw(CSID_AUDIO, MSG_AUDIO, MEDIA_STREAM_ID, 0, &tag)
                .await?;
        }

        self.io.flush().await?;
        Ok(())
    }

    // -- media packets ------------------------------------------------------

    /// Read the next media packet from a publishing client.
    pub async fn read_packet(&mut self) -> Result<Packet, FramerError> {
        match self.read_deadline {
            Some(d) => timeout_at(d, self.read_packet_inner())
                .await
                .map_err(|_| FramerError::ReadTimeout)?,
            None => self.read_packet_inner().await,
        }
    }

    async fn read_packet_inner(&mut self) -> Result<Packet, FramerError> {
        loop {
            let msg = self.read_message_raw().await?;
            match msg.msg_type {
                MSG_VIDEO => {
                    if let Some(pkt) = parse_video_tag(&msg)? {
                        return Ok(pkt);
                    }
                }
                MSG_AUDIO => {
                    if let Some(pkt) = parse_audio_tag(&msg)? {
                        return Ok(pkt);
                    }
                }
                MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3 => {
                    let data = command_body(msg.msg_type, &msg.data);
                    if let Ok(values) = decode_amf(data) {
                        if let Ok((name, _)) = command_header(&values) {
                            if name == "deleteStream" || name == "closeStream" || name == "FCUnpublish" {
                                return Err(FramerError::StreamClosed);
                            }
                        }
                    }
                }
                MSG_SET_CHUNK_SIZE => self.handle_set_chunk_size(&msg.data),
                _ => {}
            }
        }
    }

    /// Write one media packet to a playing client.
    pub async fn write_packet(&mut self, pkt: &Packet) -> Result<(), FramerError> {
        match self.write_deadline {
            Some(d) => timeout_at(d, self.write_packet_inner(pkt))
                .await
                .map_err(|_| FramerError::WriteTimeout)?,
            None => self.write_packet_inner(pkt).await,
        }
    }

    async fn write_packet_inner(&mut self, pkt: &Packet) -> Result<(), FramerError> {
        let timestamp = pkt.time.as_millis() as u32;
        match pkt.kind {
            PacketKind::H264DecoderConfig => {
                let mut tag = BytesMut::with_capacity(5 + pkt.data.len());
                tag.put_u8(0x10 | FLV_CODEC_ID_H264);
                tag.put_u8(AVC_PACKET_TYPE_SEQ_HEADER);
                tag.extend_from_slice(&[0, 0, 0]);
                tag.extend_from_slice(&pkt.data);
                self.write_message_raw(CSID_VIDEO, MSG_VIDEO, MEDIA_STREAM_ID, timestamp, &tag)
                    .await?;
            }
            PacketKind::H264 => {
                let frame_type = if h264::avcc_idr_present(&pkt.data) {
                    0x10
                } else {
                    0x20
                };
                let cts = pkt.ctime.as_millis() as u32;
                let mut tag = BytesMut::with_capacity(5 + pkt.data.len());
                tag.put_u8(frame_type | FLV_CODEC_ID_H264);
                tag.put_u8(AVC_PACKET_TYPE_NALU);
                tag.put_u8((cts >> 16) as u8);
                tag.put_u8((cts >> 8) as u8);
                tag.put_u8(cts as u8);
                tag.extend_from_slice(&pkt.data);
                self.write_message_raw(CSID_VIDEO, MSG_VIDEO, MEDIA_STREAM_ID, timestamp, &tag)
                    .await?;
            }
            PacketKind::Aac => {
                let mut tag = BytesMut::with_capacity(2 + pkt.data.len());
                tag.put_u8(0xAF);
                tag.put_u8(AAC_PACKET_TYPE_RAW);
                tag.extend_from_slice(&pkt.data);
                self.write_message_raw(CSID_AUDIO, MSG_AUDIO, MEDIA_STREAM_ID, timestamp, &tag)
                    .await?;
            }
        }
        self.io.flush().await?;
        Ok(())
    }

    // -- chunk codec --------------------------------------------------------

    async fn read_message(&mut self) -> Result<Message, FramerError> {
        match self.read_deadline {
            Some(d) => timeout_at(d, self.read_message_raw())
                .await
                .map_err(|_| FramerError::ReadTimeout)?,
            None => self.read_message_raw().await,
        }
    }

    async fn read_message_raw(&mut self) -> Result<Message, FramerError> {
        loop {
            if let Some(msg) = self.read_chunk().await? {
                return Ok(msg);
            }
        }
    }

    /// Read a single chunk; returns the message it completes, if any.
    async fn read_chunk(&mut self) -> Result<Option<Message>, FramerError> {
        let b0 = self.io.read_u8().await?;
        let fmt = b0 >> 6;
        let mut csid = u32::from(b0 & 0x3F);
        match csid {
            0 => csid = 64 + u32::from(self.io.read_u8().await?),
            1 => {
                let b1 = u32::from(self.io.read_u8().await?);
                let b2 = u32::from(self.io.read_u8().await?);
                csid = 64 + b1 + b2 * 256;
            }
            _ => {}
        }

        let (prev_ext_ts, assembling) = match self.in_streams.get(&csid) {
            Some(s) => (s.ext_ts, !s.buf.is_empty()),
            None => (false, false),
        };

        // decode the message header into locals before touching the state
        let mut header = [0u8; 11];
        match fmt {
            0 => {
                self.io.read_exact(&mut header[..11]).await?;
                let mut ts = u32::from_be_bytes([0, header[0], header[1], header[2]]);
                let length = u32::from_be_bytes([0, header[3], header[4], header[5]]) as usize;
                let type_id = header[6];
                let stream_id =
                    u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
                let ext = ts == 0xFF_FFFF;
                if ext {
                    ts = self.io.read_u32().await?;
                }
                let state = self.in_streams.entry(csid).or_default();
                state.timestamp = ts;
                state.ts_delta = 0;
                state.length = length;
                state.type_id = type_id;
                state.stream_id = stream_id;
                state.ext_ts = ext;
            }
            1 => {
                self.io.read_exact(&mut header[..7]).await?;
                let mut delta = u32::from_be_bytes([0, header[0], header[1], header[2]]);
                let length = u32::from_be_bytes([0, header[3], header[4], header[5]]) as usize;
                let type_id = header[6];
                let ext = delta == 0xFF_FFFF;
                if ext {
                    delta = self.io.read_u32().await?;
                }
                let state = self.in_streams.entry(csid).or_default();
                state.timestamp = state.timestamp.wrapping_add(delta);
                state.ts_delta = delta;
                state.length = length;
                state.type_id = type_id;
                state.ext_ts = ext;
            }
            2 => {
                self.io.read_exact(&mut header[..3]).await?;
                let mut delta = u32::from_be_bytes([0, header[0], header[1], header[2]]);
                let ext = delta == 0xFF_FFFF;
                if ext {
                    delta = self.io.read_u32().await?;
                }
                let state = self.in_streams.entry(csid).or_default();
                state.timestamp = state.timestamp.wrapping_add(delta);
                state.ts_delta = delta;
                state.ext_ts = ext;
            }
            _ => {
                // type 3: continuation, or a new message reusing the
                // previous header; peers re-send the extended timestamp
                if prev_ext_ts {
                    let v = self.io.read_u32().await?;
                    if !assembling {
                        let state = self.in_streams.entry(csid).or_default();
                        state.timestamp = state.timestamp.wrapping_add(v);
                    }
                } else if !assembling {
                    let state = self.in_streams.entry(csid).or_default();
                    state.timestamp = state.timestamp.wrapping_add(state.ts_delta);
                }
            }
        }

        let (length, remaining) = {
            let state = self.in_streams.entry(csid).or_default();
            (state.length, state.length - state.buf.len())
        };
        let to_read = remaining.min(self.in_chunk_size);
        let mut chunk = vec![0u8; to_read];
        self.io.read_exact(&mut chunk).await?;

        let state = self.in_streams.entry(csid).or_default();
        state.buf.extend_from_slice(&chunk);

        if state.buf.len() == length {
            let data = state.buf.split().freeze();
            return Ok(Some(Message {
                msg_type: state.type_id,
                timestamp: state.timestamp,
                stream_id: state.stream_id,
                data,
            }));
        }
        Ok(None)
    }

    async fn write_message(
        &mut self,
        csid: u8,
        type_id: u8,
        stream_id: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> Result<(), FramerError> {
        match self.write_deadline {
            Some(d) => timeout_at(
                d,
                self.write_message_raw(csid, type_id, stream_id, timestamp, payload),
            )
            .await
            .map_err(|_| FramerError::WriteTimeout)?,
            None => {
                self.write_message_raw(csid, type_id, stream_id, timestamp, payload)
                    .await
            }
        }
    }

    /// Write one message as a type-0 chunk plus type-3 continuations.
    async fn write_message_raw(
        &mut self,
        csid: u8,
        type_id: u8,
        stream_id: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> Result<(), FramerError> {
        let ext = timestamp >= 0xFF_FFFF;
        let ts24 = if ext { 0xFF_FFFF } else { timestamp };

        let mut buf = BytesMut::with_capacity(payload.len() + 18);
        buf.put_u8(csid & 0x3F);
        buf.put_u8((ts24 >> 16) as u8);
        buf.put_u8((ts24 >> 8) as u8);
        buf.put_u8(ts24 as u8);
        let len = payload.len() as u32;
        buf.put_u8((len >> 16) as u8);
        buf.put_u8((len >> 8) as u8);
        buf.put_u8(len as u8);
        buf.put_u8(type_id);
        buf.put_u32_le(stream_id);
        if ext {
            buf.put_u32(timestamp);
        }

        let mut offset = 0;
        loop {
            let n = (payload.len() - offset).min(self.out_chunk_size);
            buf.extend_from_slice(&payload[offset..offset + n]);
            offset += n;
            if offset == payload.len() {
                break;
            }
            buf.put_u8(0xC0 | (csid & 0x3F));
            if ext {
                buf.put_u32(timestamp);
            }
        }

        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FLV tag bodies
// ---------------------------------------------------------------------------

fn parse_video_tag(msg: &Message) -> Result<Option<Packet>, FramerError> {
    if msg.data.len() < 5 {
        return Err(FramerError::ShortVideoTag);
    }
    let codec_id = msg.data[0] & 0x0F;
    if codec_id != FLV_CODEC_ID_H264 {
        return Err(FramerError::UnsupportedVideoCodec { codec_id });
    }

    let avc_packet_type = msg.data[1];
    let cts = i32::from_be_bytes([
        if msg.data[2] & 0x80 != 0 { 0xFF } else { 0x00 },
        msg.data[2],
        msg.data[3],
        msg.data[4],
    ]);

    let kind = match avc_packet_type {
        AVC_PACKET_TYPE_SEQ_HEADER => PacketKind::H264DecoderConfig,
        AVC_PACKET_TYPE_NALU => PacketKind::H264,
        _ => return Ok(None),
    };

    Ok(Some(Packet {
        kind,
        data: msg.data.slice(5..),
        time: Duration::from_millis(u64::from(msg.timestamp)),
        ctime: Duration::from_millis(cts.max(0) as u64),
    }))
}

fn parse_audio_tag(msg: &Message) -> Result<Option<Packet>, FramerError> {
    if msg.data.is_empty() {
        return Ok(None);
    }
    let sound_format = msg.data[0] >> 4;
    if sound_format != FLV_SOUND_FORMAT_AAC {
        return Err(FramerError::UnsupportedAudioCodec { sound_format });
    }
    if msg.data.len() < 2 || msg.data[1] != AAC_PACKET_TYPE_RAW {
        // duplicate AudioSpecificConfig, skip
        return Ok(None);
    }

    Ok(Some(Packet {
        kind: PacketKind::Aac,
        data: msg.data.slice(2..),
        time: Duration::from_millis(u64::from(msg.timestamp)),
        ctime: Duration::ZERO,
    }))
}

// ---------------------------------------------------------------------------
// AMF helpers
// ---------------------------------------------------------------------------

/// AMF3 command messages (type 17) carry a leading format byte.
fn command_body<'a>(msg_type: u8, data: &'a Bytes) -> &'a [u8] {
    if msg_type == MSG_COMMAND_AMF3 && data.first() == Some(&0) {
        &data[1..]
    } else {
        data
    }
}

fn decode_amf(data: &[u8]) -> Result<Vec<Amf0Value>, FramerError> {
    let mut cursor = Cursor::new(data);
    rml_amf0::deserialize(&mut cursor).map_err(|e| FramerError::MalformedAmf {
        reason: e.to_string(),
    })
}

fn encode_amf(values: &Vec<Amf0Value>) -> Result<Bytes, FramerError> {
    rml_amf0::serialize(values)
        .map(Bytes::from)
        .map_err(|e| FramerError::MalformedAmf {
            reason: e.to_string(),
        })
}

fn command_header(values: &[Amf0Value]) -> Result<(String, f64), FramerError> {
    let name = match values.first() {
        Some(Amf0Value::Utf8String(s)) => s.clone(),
        _ => {
            return Err(FramerError::MalformedAmf {
                reason: "command without a name".to_string(),
            });
        }
    };
    let transaction_id = match values.get(1) {
        Some(Amf0Value::Number(n)) => *n,
        _ => 0.0,
    };
    Ok((name, transaction_id))
}

/// First string argument after the transaction id, skipping nulls; this is
/// the stream key of publish and the stream name of play.
fn first_string_arg(values: &[Amf0Value]) -> Option<String> {
    values.iter().skip(2).find_map(|v| match v {
        Amf0Value::Utf8String(s) => Some(s.clone()),
        _ => None,
    })
}

fn is_metadata(values: &[Amf0Value]) -> bool {
    values.iter().any(|v| {
        matches!(v, Amf0Value::Utf8String(s) if s == "onMetaData" || s == "@setDataFrame")
    })
}

fn metadata_object(values: &[Amf0Value]) -> Option<&HashMap<String, Amf0Value>> {
    values.iter().find_map(|v| match v {
        Amf0Value::Object(props) => Some(props),
        _ => None,
    })
}

fn matches_codec(value: Option<&Amf0Value>, number: f64, fourcc: &str) -> bool {
    match value {
        Some(Amf0Value::Number(n)) => *n == number,
        Some(Amf0Value::Utf8String(s)) => s == fourcc,
        _ => false,
    }
}

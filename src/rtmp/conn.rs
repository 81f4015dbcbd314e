use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::aac_rtp::{AacRtpDecoder, AacRtpEncoder, SAMPLES_PER_AU};
use crate::codec::h264::{self, DecoderConfig, DtsEstimator};
use crate::codec::h264_rtp::H264RtpEncoder;
use crate::core::auth::{AuthAction, AuthRequest, Authenticator};
use crate::core::error::{AacDecodeError, PathError, SessionError};
use crate::core::ringbuf::RingBuffer;
use crate::core::types::{ApiDescribe, ConnId, Data, DataPayload, H264AccessUnit, Track};
use crate::externalcmd::ExternalCmd;
use crate::observability::metrics as obs;
use crate::path::{
    AuthenticateFn, Path, PathManager, PublisherAnnounceReq, ReaderSetupPlayReq, StreamReader,
    StreamSource,
};

use super::framer::{Framer, Packet, PacketKind};

/// Mandatory pause before closing a connection that failed authentication.
const PAUSE_AFTER_AUTH_ERROR: Duration = Duration::from_secs(2);

/// RTP payload types assigned to published tracks.
const VIDEO_PAYLOAD_TYPE: u8 = 96;
const AUDIO_PAYLOAD_TYPE: u8 = 97;

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Split an RTMP URL into path name, parsed query and raw query.
fn path_name_and_query(raw_url: &str) -> (String, Vec<(String, String)>, String) {
    // remove trailing slashes inserted by OBS and some other clients
    let trimmed = raw_url.trim_end_matches('/');
    let after_scheme = match trimmed.find("://") {
        Some(i) => &trimmed[i + 3..],
        None => trimmed,
    };
    let path_and_query = match after_scheme.find('/') {
        Some(i) => &after_scheme[i + 1..],
        None => "",
    };
    let (path, raw_query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, q),
        None => (path_and_query, ""),
    };
    let path_name = path.trim_start_matches('/').to_string();
    (path_name, parse_query(raw_query), raw_query.to_string())
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn query_value(query: &[(String, String)], key: &str) -> String {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

/// Port component of a host:port address string.
fn address_port(addr: &str) -> String {
    addr.rsplit(':').next().unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Read,
    Publish,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Idle => "idle",
            ConnState::Read => "read",
            ConnState::Publish => "publish",
        }
    }
}

/// Per-connection configuration snapshot.
#[derive(Debug, Clone)]
pub struct ConnSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_buffer_count: usize,
    pub rtsp_address: String,
    pub run_on_connect: String,
    pub run_on_connect_restart: bool,
}

/// Owner of the connection, notified exactly once when it closes.
pub trait ConnParent: Send + Sync {
    fn on_conn_close(&self, conn: &RtmpConn);
}

/// One RTMP connection: handshake, direction dispatch, media pump.
pub struct RtmpConn {
    id: ConnId,
    remote_addr: SocketAddr,
    created: DateTime<Utc>,
    settings: ConnSettings,
    authenticator: Authenticator,
    path_manager: Arc<PathManager>,
    parent: Arc<dyn ConnParent>,
    token: CancellationToken,
    state: Mutex<ConnState>,
    path: Mutex<Option<Arc<Path>>>,
    /// Allocated once, when the connection enters the read state.
    ring: OnceLock<Arc<RingBuffer<Arc<Data>>>>,
}

impl RtmpConn {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        parent_token: &CancellationToken,
        socket: TcpStream,
        remote_addr: SocketAddr,
        settings: ConnSettings,
        authenticator: Authenticator,
        path_manager: Arc<PathManager>,
        parent: Arc<dyn ConnParent>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            id: ConnId::new(),
            remote_addr,
            created: Utc::now(),
            settings,
            authenticator,
            path_manager,
            parent,
            token: parent_token.child_token(),
            state: Mutex::new(ConnState::Idle),
            path: Mutex::new(None),
            ring: OnceLock::new(),
        });

        info!(conn = %conn.id, addr = %remote_addr, "connection opened");
        obs::inc_conns_opened();

        tokio::spawn(conn.clone().run(socket));
        conn
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Current state; callable from any task.
    pub fn safe_state(&self) -> ConnState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn describe(&self) -> ApiDescribe {
        ApiDescribe {
            kind: "rtmpConn",
            id: self.id.to_string(),
        }
    }

    /// Request connection shutdown.
    pub fn close(&self) {
        self.token.cancel();
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn path_name(&self) -> String {
        self.path
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.name().to_string())
            .unwrap_or_default()
    }

    fn set_path(&self, path: &Arc<Path>) {
        *self.path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.clone());
    }

    // -- lifecycle ----------------------------------------------------------

    async fn run(self: Arc<Self>, socket: TcpStream) {
        let err = self.run_conn(socket).await;

        self.token.cancel();
        self.parent.on_conn_close(&self);
        obs::dec_conns_open();
        info!(conn = %self.id, addr = %self.remote_addr, "connection closed ({err})");
    }

    async fn run_conn(self: &Arc<Self>, socket: TcpStream) -> SessionError {
        let mut on_connect_cmd = None;
        if !self.settings.run_on_connect.is_empty() {
            info!(conn = %self.id, "runOnConnect command started");
            let env = vec![
                ("RTSP_PATH".to_string(), String::new()),
                (
                    "RTSP_PORT".to_string(),
                    address_port(&self.settings.rtsp_address),
                ),
            ];
            on_connect_cmd = Some(ExternalCmd::spawn(
                &self.settings.run_on_connect,
                self.settings.run_on_connect_restart,
                env,
            ));
        }

        let inner_token = self.token.child_token();
        let mut inner = tokio::spawn({
            let conn = self.clone();
            let token = inner_token.clone();
            async move { conn.run_inner(token, socket).await }
        });

        let err = tokio::select! {
            res = &mut inner => {
                inner_token.cancel();
                res.unwrap_or(SessionError::Terminated)
            }
            _ = self.token.cancelled() => {
                // dropping the inner scope closes the socket and unblocks
                // any read or write in progress
                inner_token.cancel();
                let _ = (&mut inner).await;
                SessionError::Terminated
            }
        };

        if let Some(cmd) = on_connect_cmd {
            cmd.close().await;
            info!(conn = %self.id, "runOnConnect command stopped");
        }

        err
    }

    async fn run_inner(
        self: Arc<Self>,
        token: CancellationToken,
        socket: TcpStream,
    ) -> SessionError {
        let mut framer = Framer::new(socket);
        framer.set_read_deadline(Some(Instant::now() + self.settings.read_timeout));
        framer.set_write_deadline(Some(Instant::now() + self.settings.write_timeout));

        let handshake = tokio::select! {
            _ = token.cancelled() => return SessionError::Terminated,
            res = framer.server_handshake() => res,
        };
        if let Err(e) = handshake {
            return e.into();
        }

        if framer.is_publishing() {
            self.run_publish(&token, &mut framer).await
        } else {
            self.run_read(&token, &mut framer).await
        }
    }

    fn auth_callback(
        self: &Arc<Self>,
        path_name: String,
        action: AuthAction,
        query: &[(String, String)],
        raw_query: String,
    ) -> AuthenticateFn {
        let authenticator = self.authenticator.clone();
        let req = AuthRequest {
            path_name,
            action,
            ip: self.remote_addr.ip(),
            query_user: query_value(query, "user"),
            query_pass: query_value(query, "pass"),
            raw_query,
        };
        Box::new(move |spec| Box::pin(async move { authenticator.authenticate(&req, &spec).await }))
    }

    // -- read side ----------------------------------------------------------

    async fn run_read(
        self: &Arc<Self>,
        token: &CancellationToken,
        framer: &mut Framer<TcpStream>,
    ) -> SessionError {
        let (path_name, query, raw_query) = path_name_and_query(framer.url());
        let authenticate =
            self.auth_callback(path_name.clone(), AuthAction::Read, &query, raw_query);

        let setup = tokio::select! {
            _ = token.cancelled() => return SessionError::Terminated,
            res = self.path_manager.reader_setup_play(ReaderSetupPlayReq {
                author: self.clone() as Arc<dyn StreamReader>,
                path_name,
                authenticate,
            }) => res,
        };
        let (path, stream) = match setup {
            Ok(v) => v,
            Err(e) => return setup_failure(e).await,
        };

        // track selection happens before anything is registered: a failure
        // here leaves no cleanup to run and no state transition behind
        let (video, audio) = match select_read_tracks(stream.tracks()) {
            Ok(v) => v,
            Err(e) => return e,
        };

        self.set_path(&path);
        self.set_state(ConnState::Read);
        obs::inc_readers();

        let err = self
            .run_read_session(token, framer, &path, video, audio)
            .await;

        let author: Arc<dyn StreamReader> = self.clone();
        self.path_manager.reader_remove(&path, &author);
        obs::dec_readers();
        err
    }

    async fn run_read_session(
        self: &Arc<Self>,
        token: &CancellationToken,
        framer: &mut Framer<TcpStream>,
        path: &Arc<Path>,
        video: Option<(usize, Track)>,
        audio: Option<(usize, Track)>,
    ) -> SessionError {
        framer.set_write_deadline(Some(Instant::now() + self.settings.write_timeout));
        let written = tokio::select! {
            _ = token.cancelled() => return SessionError::Terminated,
            res = framer.write_tracks(
                video.as_ref().map(|(_, t)| t),
                audio.as_ref().map(|(_, t)| t),
            ) => res,
        };
        if let Err(e) = written {
            return e.into();
        }

        let ring = Arc::new(RingBuffer::new(self.settings.read_buffer_count));
        let _ = self.ring.set(ring.clone());
        {
            let ring = ring.clone();
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                ring.close();
            });
        }

        self.path_manager.reader_play(path, self.clone() as Arc<dyn StreamReader>);

        let mut on_read_cmd = None;
        if !path.conf().run_on_read.is_empty() {
            info!(conn = %self.id, "runOnRead command started");
            let env = vec![
                ("RTSP_PATH".to_string(), path.name().to_string()),
                (
                    "RTSP_PORT".to_string(),
                    address_port(&self.settings.rtsp_address),
                ),
            ];
            on_read_cmd = Some(ExternalCmd::spawn(
                &path.conf().run_on_read,
                path.conf().run_on_read_restart,
                env,
            ));
        }

        // the reader never reads from the socket again
        framer.set_read_deadline(None);

        let mut pump = ReaderPump::new(video, audio);
        let err = loop {
            let item = tokio::select! {
                _ = token.cancelled() => break SessionError::Terminated,
                item = ring.pull() => item,
            };
            let Some(item) = item else {
                break SessionError::Terminated;
            };

            let packets = match pump.handle(&item) {
                Ok(packets) => packets,
                Err(e) => break e,
            };

            let write_timeout = self.settings.write_timeout;
            let written = tokio::select! {
                _ = token.cancelled() => break SessionError::Terminated,
                res = async {
                    for pkt in &packets {
                        framer.set_write_deadline(Some(Instant::now() + write_timeout));
                        framer.write_packet(pkt).await?;
                    }
                    Ok::<(), crate::core::error::FramerError>(())
                } => res,
            };
            if let Err(e) = written {
                break e.into();
            }
        };

        if let Some(cmd) = on_read_cmd {
            cmd.close().await;
            info!(conn = %self.id, "runOnRead command stopped");
        }
        err
    }

    // -- publish side -------------------------------------------------------

    async fn run_publish(
        self: &Arc<Self>,
        token: &CancellationToken,
        framer: &mut Framer<TcpStream>,
    ) -> SessionError {
        framer.set_read_deadline(Some(Instant::now() + self.settings.read_timeout));
        let read = tokio::select! {
            _ = token.cancelled() => return SessionError::Terminated,
            res = framer.read_tracks() => res,
        };
        let (video, audio) = match read {
            Ok(v) => v,
            Err(e) => return e.into(),
        };

        let mut tracks = Vec::new();
        let mut video_track_id = None;
        let mut h264_encoder = None;
        if let Some(track) = video {
            h264_encoder = Some(H264RtpEncoder::new(VIDEO_PAYLOAD_TYPE));
            video_track_id = Some(tracks.len());
            tracks.push(track);
        }

        let mut audio_track_id = None;
        let mut aac_encoder = None;
        if let Some(track) = audio {
            aac_encoder = Some(AacRtpEncoder::new(AUDIO_PAYLOAD_TYPE, track.clock_rate()));
            audio_track_id = Some(tracks.len());
            tracks.push(track);
        }

        let (path_name, query, raw_query) = path_name_and_query(framer.url());
        let authenticate =
            self.auth_callback(path_name.clone(), AuthAction::Publish, &query, raw_query);

        let announce = tokio::select! {
            _ = token.cancelled() => return SessionError::Terminated,
            res = self.path_manager.publisher_announce(PublisherAnnounceReq {
                author: self.clone() as Arc<dyn StreamSource>,
                path_name,
                authenticate,
            }) => res,
        };
        let path = match announce {
            Ok(p) => p,
            Err(e) => return setup_failure(e).await,
        };

        self.set_path(&path);
        self.set_state(ConnState::Publish);
        obs::inc_publishers();

        let pump = PublishPump {
            video_track_id,
            audio_track_id,
            h264_encoder,
            aac_encoder,
        };
        let err = self
            .run_publish_session(token, framer, &path, tracks, pump)
            .await;

        let author: Arc<dyn StreamSource> = self.clone();
        self.path_manager.publisher_remove(&path, &author);
        obs::dec_publishers();
        err
    }

    async fn run_publish_session(
        self: &Arc<Self>,
        token: &CancellationToken,
        framer: &mut Framer<TcpStream>,
        path: &Arc<Path>,
        tracks: Vec<Track>,
        mut pump: PublishPump,
    ) -> SessionError {
        // the publisher never writes media
        framer.set_write_deadline(None);

        let author: Arc<dyn StreamSource> = self.clone();
        let stream = match self.path_manager.publisher_record(path, &author, tracks) {
            Ok(s) => s,
            Err(e) => return e.into(),
        };

        loop {
            framer.set_read_deadline(Some(Instant::now() + self.settings.read_timeout));
            let pkt = tokio::select! {
                _ = token.cancelled() => return SessionError::Terminated,
                res = framer.read_packet() => match res {
                    Ok(pkt) => pkt,
                    Err(e) => return e.into(),
                },
            };

            let items = match pump.handle(pkt) {
                Ok(items) => items,
                Err(e) => return e,
            };
            for item in items {
                stream.write_data(Arc::new(item));
            }
        }
    }
}

/// Map a setup refusal to the session error, applying the anti-brute-force
/// pause when the failure was an authentication one.
async fn setup_failure(err: PathError) -> SessionError {
    match err {
        PathError::AuthCritical { message } => {
            // wait some seconds to stop brute force attacks
            tokio::time::sleep(PAUSE_AFTER_AUTH_ERROR).await;
            SessionError::Auth { message }
        }
        other => SessionError::Path(other),
    }
}

/// Pick the first H.264 and first AAC track; a second of either kind, or
/// none at all, refuses the session.
fn select_read_tracks(
    tracks: &[Track],
) -> Result<(Option<(usize, Track)>, Option<(usize, Track)>), SessionError> {
    let mut video = None;
    let mut audio = None;

    for (i, track) in tracks.iter().enumerate() {
        match track {
            Track::H264 { .. } => {
                if video.is_some() {
                    return Err(SessionError::TooManyTracks { n: i + 1 });
                }
                video = Some((i, track.clone()));
            }
            Track::Aac { .. } => {
                if audio.is_some() {
                    return Err(SessionError::TooManyTracks { n: i + 1 });
                }
                audio = Some((i, track.clone()));
            }
        }
    }

    if video.is_none() && audio.is_none() {
        return Err(SessionError::NoSuitableTracks);
    }
    Ok((video, audio))
}

// ---------------------------------------------------------------------------
// Reader pump
// ---------------------------------------------------------------------------

struct ReaderVideoTrack {
    id: usize,
    sps: Bytes,
    pps: Bytes,
}

struct ReaderAudioTrack {
    id: usize,
    clock_rate: u32,
    decoder: AacRtpDecoder,
}

/// Translates bus items into RTMP packets for one reader session.
///
/// Video PTS are re-anchored twice: first to the initial video item (video
/// and audio are produced on different tasks and need a common origin),
/// then to the first IDR so the outgoing timeline starts at zero on a
/// random-access point.
struct ReaderPump {
    video: Option<ReaderVideoTrack>,
    audio: Option<ReaderAudioTrack>,
    video_initial_pts: Option<Duration>,
    video_first_idr_pts: Option<Duration>,
    video_dts_estimator: Option<DtsEstimator>,
}

impl ReaderPump {
    fn new(video: Option<(usize, Track)>, audio: Option<(usize, Track)>) -> Self {
        let video = video.and_then(|(id, track)| match track {
            Track::H264 { sps, pps } => Some(ReaderVideoTrack { id, sps, pps }),
            _ => None,
        });
        let audio = audio.and_then(|(id, track)| match track {
            Track::Aac { clock_rate, .. } => Some(ReaderAudioTrack {
                id,
                clock_rate,
                decoder: AacRtpDecoder::new(clock_rate),
            }),
            _ => None,
        });

        Self {
            video,
            audio,
            video_initial_pts: None,
            video_first_idr_pts: None,
            video_dts_estimator: None,
        }
    }

    fn handle(&mut self, data: &Data) -> Result<Vec<Packet>, SessionError> {
        match &data.payload {
            DataPayload::Video {
                access_unit: Some(au),
                ..
            } if self.video.as_ref().is_some_and(|v| v.id == data.track_id) => {
                self.handle_video(au)
            }
            DataPayload::Audio { rtp }
                if self.audio.as_ref().is_some_and(|a| a.id == data.track_id) =>
            {
                self.handle_audio(rtp)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn handle_video(&mut self, au: &H264AccessUnit) -> Result<Vec<Packet>, SessionError> {
        let initial = *self.video_initial_pts.get_or_insert(au.pts);
        let mut pts = au.pts.saturating_sub(initial);

        let idr = h264::idr_present(&au.nalus);
        let first_idr_pts = match self.video_first_idr_pts {
            Some(v) => v,
            None => {
                // hold everything back until a random-access point
                if !idr {
                    return Ok(Vec::new());
                }
                self.video_first_idr_pts = Some(pts);
                pts
            }
        };

        let mut out = Vec::with_capacity(2);
        if idr {
            if let Some(video) = &self.video {
                let config = DecoderConfig {
                    sps: video.sps.clone(),
                    pps: video.pps.clone(),
                };
                out.push(Packet {
                    kind: PacketKind::H264DecoderConfig,
                    data: config.marshal()?,
                    time: Duration::ZERO,
                    ctime: Duration::ZERO,
                });
            }
        }

        let avcc = h264::encode_avcc(&au.nalus)?;
        pts = pts.saturating_sub(first_idr_pts);
        let dts = self
            .video_dts_estimator
            .get_or_insert_with(DtsEstimator::new)
            .feed(pts);
        out.push(Packet {
            kind: PacketKind::H264,
            data: avcc,
            time: dts,
            ctime: pts.saturating_sub(dts),
        });
        Ok(out)
    }

    fn handle_audio(&mut self, rtp: &Bytes) -> Result<Vec<Packet>, SessionError> {
        let Some(audio) = &mut self.audio else {
            return Ok(Vec::new());
        };

        let (aus, mut pts) = match audio.decoder.decode(rtp) {
            Ok(v) => v,
            Err(AacDecodeError::MorePacketsNeeded) => return Ok(Vec::new()),
            Err(e) => {
                warn!(error = %e, "unable to decode audio track");
                return Ok(Vec::new());
            }
        };

        if self.video.is_some() {
            // audio waits for the video random-access point
            let Some(first_idr_pts) = self.video_first_idr_pts else {
                return Ok(Vec::new());
            };
            pts = match pts.checked_sub(first_idr_pts) {
                Some(p) => p,
                None => return Ok(Vec::new()),
            };
        }

        let step = Duration::from_nanos(
            u64::from(SAMPLES_PER_AU) * 1_000_000_000 / u64::from(audio.clock_rate),
        );
        let mut out = Vec::with_capacity(aus.len());
        for au in aus {
            out.push(Packet {
                kind: PacketKind::Aac,
                data: au,
                time: pts,
                ctime: Duration::ZERO,
            });
            pts += step;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Publish pump
// ---------------------------------------------------------------------------

/// Translates RTMP packets into bus items for one publisher session.
struct PublishPump {
    video_track_id: Option<usize>,
    audio_track_id: Option<usize>,
    h264_encoder: Option<H264RtpEncoder>,
    aac_encoder: Option<AacRtpEncoder>,
}

impl PublishPump {
    fn handle(&mut self, pkt: Packet) -> Result<Vec<Data>, SessionError> {
        match pkt.kind {
            PacketKind::H264DecoderConfig => {
                let config = DecoderConfig::unmarshal(&pkt.data)?;
                let nalus = vec![config.sps, config.pps];
                self.encode_video(nalus, pkt.time + pkt.ctime)
            }
            PacketKind::H264 => {
                let nalus = h264::decode_avcc(&pkt.data)?;
                self.encode_video(nalus, pkt.time + pkt.ctime)
            }
            PacketKind::Aac => {
                let (Some(track_id), Some(encoder)) =
                    (self.audio_track_id, self.aac_encoder.as_mut())
                else {
                    return Err(SessionError::UnexpectedAudioPacket);
                };
                let packets = encoder.encode(&[pkt.data], pkt.time + pkt.ctime)?;
                Ok(packets
                    .into_iter()
                    .map(|rtp| Data {
                        track_id,
                        payload: DataPayload::Audio { rtp },
                    })
                    .collect())
            }
        }
    }

    /// Packetize one access unit; only the final fragment carries the
    /// decoded NALUs and PTS, and its `pts_equals_dts` reflects whether the
    /// unit holds an IDR.
    fn encode_video(&mut self, nalus: Vec<Bytes>, pts: Duration) -> Result<Vec<Data>, SessionError> {
        let (Some(track_id), Some(encoder)) = (self.video_track_id, self.h264_encoder.as_mut())
        else {
            return Err(SessionError::UnexpectedVideoPacket);
        };

        let idr = h264::idr_present(&nalus);
        let packets = encoder.encode(&nalus, pts)?;
        let last = packets.len() - 1;

        Ok(packets
            .into_iter()
            .enumerate()
            .map(|(i, rtp)| Data {
                track_id,
                payload: DataPayload::Video {
                    rtp,
                    pts_equals_dts: if i == last { idr } else { false },
                    access_unit: (i == last).then(|| H264AccessUnit {
                        nalus: nalus.clone(),
                        pts,
                    }),
                },
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Path callback implementations
// ---------------------------------------------------------------------------

impl StreamReader for RtmpConn {
    fn on_reader_accepted(&self) {
        info!(conn = %self.id, path = %self.path_name(), "is reading from path");
    }

    fn on_reader_data(&self, data: &Arc<Data>) {
        if let Some(ring) = self.ring.get() {
            ring.push(data.clone());
        }
    }

    fn api_describe(&self) -> ApiDescribe {
        self.describe()
    }
}

impl StreamSource for RtmpConn {
    fn on_publisher_accepted(&self, tracks_len: usize) {
        info!(
            conn = %self.id,
            path = %self.path_name(),
            tracks = tracks_len,
            "is publishing to path"
        );
    }

    fn api_describe(&self) -> ApiDescribe {
        self.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn h264_track() -> Track {
        Track::H264 {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEE]),
        }
    }

    fn aac_track(clock_rate: u32) -> Track {
        Track::Aac {
            clock_rate,
            config: Bytes::from_static(&[0x12, 0x10]),
        }
    }

    fn idr_au(pts: Duration) -> H264AccessUnit {
        H264AccessUnit {
            nalus: vec![Bytes::from_static(&[0x65, 0x88, 0x84])],
            pts,
        }
    }

    fn p_frame_au(pts: Duration) -> H264AccessUnit {
        H264AccessUnit {
            nalus: vec![Bytes::from_static(&[0x41, 0x9A, 0x00])],
            pts,
        }
    }

    fn video_item(track_id: usize, au: H264AccessUnit) -> Data {
        Data {
            track_id,
            payload: DataPayload::Video {
                rtp: Bytes::from_static(&[0x80]),
                pts_equals_dts: true,
                access_unit: Some(au),
            },
        }
    }

    fn audio_item(track_id: usize, rtp: Bytes) -> Data {
        Data {
            track_id,
            payload: DataPayload::Audio { rtp },
        }
    }

    // -- URL parsing --------------------------------------------------------

    #[test]
    fn url_parsing_strips_slashes_and_splits_query() {
        let (name, query, raw) =
            path_name_and_query("rtmp://127.0.0.1:1935/live/cam1?user=u&pass=p");
        assert_eq!(name, "live/cam1");
        assert_eq!(query_value(&query, "user"), "u");
        assert_eq!(query_value(&query, "pass"), "p");
        assert_eq!(raw, "user=u&pass=p");

        let (name, query, raw) = path_name_and_query("rtmp://host/live/");
        assert_eq!(name, "live");
        assert!(query.is_empty());
        assert!(raw.is_empty());

        let (name, _, _) = path_name_and_query("rtmp://host");
        assert!(name.is_empty());
    }

    #[test]
    fn address_port_takes_last_component() {
        assert_eq!(address_port("0.0.0.0:8554"), "8554");
        assert_eq!(address_port("[::]:8554"), "8554");
    }

    // -- track selection ----------------------------------------------------

    #[test]
    fn track_selection_picks_first_of_each_kind() {
        let tracks = vec![h264_track(), aac_track(48_000)];
        let (video, audio) = select_read_tracks(&tracks).unwrap();
        assert_eq!(video.unwrap().0, 0);
        assert_eq!(audio.unwrap().0, 1);
    }

    #[test]
    fn second_video_track_is_refused() {
        let tracks = vec![h264_track(), h264_track()];
        let err = select_read_tracks(&tracks).unwrap_err();
        assert!(matches!(err, SessionError::TooManyTracks { n: 2 }));
    }

    #[test]
    fn empty_track_list_is_refused() {
        assert!(matches!(
            select_read_tracks(&[]),
            Err(SessionError::NoSuitableTracks)
        ));
    }

    // -- reader pump --------------------------------------------------------

    #[test]
    fn reader_emits_config_then_frames_with_zero_based_timeline() {
        let mut pump = ReaderPump::new(Some((0, h264_track())), None);

        // IDR at 1000 ms, P-frames at 1040 and 1080 ms
        let packets = pump.handle(&video_item(0, idr_au(ms(1000)))).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].kind, PacketKind::H264DecoderConfig);
        let config = DecoderConfig::unmarshal(&packets[0].data).unwrap();
        assert_eq!(&config.sps[..], &[0x67, 0x64, 0x00, 0x1F]);
        assert_eq!(packets[1].kind, PacketKind::H264);
        assert_eq!(packets[1].time, ms(0));
        assert_eq!(packets[1].ctime, ms(0));

        let packets = pump.handle(&video_item(0, p_frame_au(ms(1040)))).unwrap();
        assert_eq!(packets.len(), 1, "non-IDR frames carry no decoder config");
        assert_eq!(packets[0].time, ms(40));

        let packets = pump.handle(&video_item(0, p_frame_au(ms(1080)))).unwrap();
        assert_eq!(packets[0].time, ms(80));
    }

    #[test]
    fn reader_drops_video_until_first_idr() {
        let mut pump = ReaderPump::new(Some((0, h264_track())), None);

        // only P-frames at first: nothing may reach the peer
        assert!(pump.handle(&video_item(0, p_frame_au(ms(500)))).unwrap().is_empty());
        assert!(pump.handle(&video_item(0, p_frame_au(ms(540)))).unwrap().is_empty());

        // the IDR re-anchors the timeline at zero
        let packets = pump.handle(&video_item(0, idr_au(ms(1000)))).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].kind, PacketKind::H264DecoderConfig);
        assert_eq!(packets[1].time, ms(0));
    }

    #[test]
    fn reader_emits_config_before_every_idr() {
        let mut pump = ReaderPump::new(Some((0, h264_track())), None);

        pump.handle(&video_item(0, idr_au(ms(0)))).unwrap();
        pump.handle(&video_item(0, p_frame_au(ms(40)))).unwrap();
        let packets = pump.handle(&video_item(0, idr_au(ms(80)))).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].kind, PacketKind::H264DecoderConfig);
        assert_eq!(packets[1].time, ms(80));
    }

    #[test]
    fn reader_gates_audio_on_first_idr() {
        let clock_rate = 48_000;
        let mut pump = ReaderPump::new(
            Some((0, h264_track())),
            Some((1, aac_track(clock_rate))),
        );

        let mut enc = AacRtpEncoder::new(AUDIO_PAYLOAD_TYPE, clock_rate);
        let aus = vec![
            Bytes::from_static(&[0xA1; 8]),
            Bytes::from_static(&[0xA2; 8]),
        ];
        let rtp = enc.encode(&aus, ms(0)).unwrap();

        // audio before any IDR is dropped entirely
        assert!(pump.handle(&audio_item(1, rtp[0].clone())).unwrap().is_empty());

        // after the IDR, audio flows with a zero-based timeline
        pump.handle(&video_item(0, idr_au(ms(1000)))).unwrap();
        let packets = pump.handle(&audio_item(1, rtp[1].clone())).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, PacketKind::Aac);
        assert_eq!(&packets[0].data[..], &[0xA2; 8]);
        // 1024 samples at 48 kHz after the (dropped) first packet
        assert_eq!(
            packets[0].time,
            Duration::from_nanos(1024 * 1_000_000_000 / u64::from(clock_rate))
        );
    }

    #[test]
    fn reader_spaces_multiple_aus_by_au_duration() {
        let clock_rate = 48_000;
        let mut pump = ReaderPump::new(None, Some((0, aac_track(clock_rate))));

        // two AUs aggregated into one call, emitted as two packets
        let mut enc = AacRtpEncoder::new(AUDIO_PAYLOAD_TYPE, clock_rate);
        let aus = vec![
            Bytes::from_static(&[0xB1; 6]),
            Bytes::from_static(&[0xB2; 6]),
        ];
        let rtp = enc.encode(&aus, ms(0)).unwrap();

        let first = pump.handle(&audio_item(0, rtp[0].clone())).unwrap();
        let second = pump.handle(&audio_item(0, rtp[1].clone())).unwrap();
        assert_eq!(first[0].time, ms(0));
        let au_duration = Duration::from_nanos(1024 * 1_000_000_000 / u64::from(clock_rate));
        assert_eq!(second[0].time, au_duration);
    }

    #[test]
    fn reader_ignores_foreign_and_partial_items() {
        let mut pump = ReaderPump::new(Some((0, h264_track())), None);

        // wrong track id
        assert!(pump.handle(&video_item(3, idr_au(ms(0)))).unwrap().is_empty());

        // non-final fragment without an access unit
        let partial = Data {
            track_id: 0,
            payload: DataPayload::Video {
                rtp: Bytes::from_static(&[0x80]),
                pts_equals_dts: false,
                access_unit: None,
            },
        };
        assert!(pump.handle(&partial).unwrap().is_empty());
    }

    // -- publish pump -------------------------------------------------------

    fn publish_pump() -> PublishPump {
        PublishPump {
            video_track_id: Some(0),
            audio_track_id: Some(1),
            h264_encoder: Some(H264RtpEncoder::new(VIDEO_PAYLOAD_TYPE)),
            aac_encoder: Some(AacRtpEncoder::new(AUDIO_PAYLOAD_TYPE, 48_000)),
        }
    }

    #[test]
    fn publish_marks_only_the_last_fragment() {
        let mut pump = publish_pump();

        // a large IDR NALU forces FU-A fragmentation
        let mut nalu = vec![0x65u8];
        nalu.extend(std::iter::repeat(0x11).take(4000));
        let avcc = h264::encode_avcc(&[Bytes::from(nalu)]).unwrap();

        let items = pump
            .handle(Packet {
                kind: PacketKind::H264,
                data: avcc,
                time: ms(40),
                ctime: ms(10),
            })
            .unwrap();
        assert!(items.len() > 1);

        for item in &items[..items.len() - 1] {
            match &item.payload {
                DataPayload::Video {
                    pts_equals_dts,
                    access_unit,
                    ..
                } => {
                    assert!(!pts_equals_dts);
                    assert!(access_unit.is_none());
                }
                other => panic!("unexpected payload: {other:?}"),
            }
        }

        match &items.last().unwrap().payload {
            DataPayload::Video {
                pts_equals_dts,
                access_unit,
                ..
            } => {
                assert!(*pts_equals_dts, "IDR unit: final fragment has PTS == DTS");
                let au = access_unit.as_ref().unwrap();
                assert_eq!(au.pts, ms(50)); // time + ctime
                assert_eq!(au.nalus.len(), 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn publish_decoder_config_reemits_sps_pps() {
        let mut pump = publish_pump();
        let record = DecoderConfig {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEE]),
        }
        .marshal()
        .unwrap();

        let items = pump
            .handle(Packet {
                kind: PacketKind::H264DecoderConfig,
                data: record,
                time: ms(0),
                ctime: ms(0),
            })
            .unwrap();
        assert_eq!(items.len(), 1);
        match &items[0].payload {
            DataPayload::Video {
                pts_equals_dts,
                access_unit,
                ..
            } => {
                // SPS/PPS carry no IDR
                assert!(!pts_equals_dts);
                assert_eq!(access_unit.as_ref().unwrap().nalus.len(), 2);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn publish_audio_items_map_one_to_one() {
        let mut pump = publish_pump();
        let items = pump
            .handle(Packet {
                kind: PacketKind::Aac,
                data: Bytes::from_static(&[0xC0; 32]),
                time: ms(20),
                ctime: ms(0),
            })
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].track_id, 1);
        assert!(items[0].pts_equals_dts());
    }

    #[test]
    fn publish_refuses_packets_for_missing_tracks() {
        let mut pump = PublishPump {
            video_track_id: None,
            audio_track_id: None,
            h264_encoder: None,
            aac_encoder: None,
        };

        let video = pump.handle(Packet {
            kind: PacketKind::H264,
            data: h264::encode_avcc(&[Bytes::from_static(&[0x65, 0x01])]).unwrap(),
            time: ms(0),
            ctime: ms(0),
        });
        assert!(matches!(video, Err(SessionError::UnexpectedVideoPacket)));

        let audio = pump.handle(Packet {
            kind: PacketKind::Aac,
            data: Bytes::from_static(&[0x01]),
            time: ms(0),
            ctime: ms(0),
        });
        assert!(matches!(audio, Err(SessionError::UnexpectedAudioPacket)));
    }

    // -- auth pause ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn critical_auth_failure_pauses_before_closing() {
        let before = Instant::now();
        let err = setup_failure(PathError::AuthCritical {
            message: "external authentication failed: 401".to_string(),
        })
        .await;

        assert!(Instant::now() - before >= PAUSE_AFTER_AUTH_ERROR);
        match err {
            SessionError::Auth { message } => {
                assert!(message.contains("external authentication failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_auth_setup_failure_returns_immediately() {
        let before = Instant::now();
        let err = setup_failure(PathError::NoPublisher {
            name: "cam".to_string(),
        })
        .await;

        assert!(Instant::now() - before < Duration::from_millis(100));
        assert!(matches!(err, SessionError::Path(PathError::NoPublisher { .. })));
    }
}

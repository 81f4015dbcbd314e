use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::core::auth::PathAuthSpec;
use crate::core::config::PathConf;
use crate::core::error::{AuthError, PathError};
use crate::core::types::{ApiDescribe, Data, Track};

pub mod stream;

pub use stream::Stream;

// ---------------------------------------------------------------------------
// Callback traits
// ---------------------------------------------------------------------------

/// A consumer of a path's stream. Registered callbacks are never invoked
/// after `reader_remove` for the same author returns.
pub trait StreamReader: Send + Sync {
    fn on_reader_accepted(&self);
    fn on_reader_data(&self, data: &Arc<Data>);
    fn api_describe(&self) -> ApiDescribe;
}

/// The producer feeding a path's stream.
pub trait StreamSource: Send + Sync {
    fn on_publisher_accepted(&self, tracks_len: usize);
    fn api_describe(&self) -> ApiDescribe;
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub type AuthFuture = Pin<Box<dyn Future<Output = Result<(), AuthError>> + Send>>;

/// Capture point for the connection-side authentication state: the path
/// invokes it once with its configured allow-list and credentials.
pub type AuthenticateFn = Box<dyn FnOnce(PathAuthSpec) -> AuthFuture + Send>;

pub struct ReaderSetupPlayReq {
    pub author: Arc<dyn StreamReader>,
    pub path_name: String,
    pub authenticate: AuthenticateFn,
}

pub struct PublisherAnnounceReq {
    pub author: Arc<dyn StreamSource>,
    pub path_name: String,
    pub authenticate: AuthenticateFn,
}

// ---------------------------------------------------------------------------
// Path
// ---------------------------------------------------------------------------

/// A named media endpoint: at most one publisher, N readers.
pub struct Path {
    name: String,
    conf: PathConf,
    inner: Mutex<PathInner>,
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path").field("name", &self.name).finish_non_exhaustive()
    }
}

struct PathInner {
    source: Option<Arc<dyn StreamSource>>,
    stream: Option<Arc<Stream>>,
}

impl Path {
    fn new(name: String, conf: PathConf) -> Arc<Self> {
        Arc::new(Self {
            name,
            conf,
            inner: Mutex::new(PathInner {
                source: None,
                stream: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conf(&self) -> &PathConf {
        &self.conf
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PathInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stream(&self) -> Option<Arc<Stream>> {
        self.lock().stream.clone()
    }

    fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.source.is_none() && inner.stream.is_none()
    }
}

// ---------------------------------------------------------------------------
// Path manager
// ---------------------------------------------------------------------------

/// Owns every active path and mediates reader/publisher attachment.
pub struct PathManager {
    confs: HashMap<String, PathConf>,
    paths: Mutex<HashMap<String, Arc<Path>>>,
}

/// Introspection view of one path.
#[derive(Debug, serde::Serialize)]
pub struct PathSnapshot {
    pub name: String,
    pub source: Option<ApiDescribe>,
    pub readers: usize,
}

impl PathManager {
    pub fn new(confs: HashMap<String, PathConf>) -> Self {
        Self {
            confs,
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the path for a name, attaching its configuration.
    fn path(&self, name: &str) -> Arc<Path> {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths
            .entry(name.to_string())
            .or_insert_with(|| {
                let conf = self.confs.get(name).cloned().unwrap_or_default();
                debug!(path = name, "path created");
                Path::new(name.to_string(), conf)
            })
            .clone()
    }

    fn collect_if_idle(&self, path: &Arc<Path>) {
        if path.is_idle() {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = paths.get(path.name()) {
                if Arc::ptr_eq(current, path) {
                    paths.remove(path.name());
                    debug!(path = path.name(), "path collected");
                }
            }
        }
    }

    /// Authenticate a reader and hand it the path's active stream.
    pub async fn reader_setup_play(
        &self,
        req: ReaderSetupPlayReq,
    ) -> Result<(Arc<Path>, Arc<Stream>), PathError> {
        let path = self.path(&req.path_name);

        (req.authenticate)(path.conf().read_auth_spec())
            .await
            .map_err(|AuthError::Critical { message }| PathError::AuthCritical { message })?;

        let stream = path.stream().ok_or_else(|| PathError::NoPublisher {
            name: req.path_name.clone(),
        })?;

        Ok((path, stream))
    }

    /// Authenticate a publisher and reserve the path for it.
    pub async fn publisher_announce(
        &self,
        req: PublisherAnnounceReq,
    ) -> Result<Arc<Path>, PathError> {
        let path = self.path(&req.path_name);

        (req.authenticate)(path.conf().publish_auth_spec())
            .await
            .map_err(|AuthError::Critical { message }| PathError::AuthCritical { message })?;

        let mut inner = path.lock();
        if inner.source.is_some() {
            return Err(PathError::AlreadyPublishing {
                name: req.path_name.clone(),
            });
        }
        inner.source = Some(req.author.clone());
        drop(inner);

        Ok(path)
    }

    /// Declare the publisher's tracks and create the stream.
    pub fn publisher_record(
        &self,
        path: &Arc<Path>,
        author: &Arc<dyn StreamSource>,
        tracks: Vec<Track>,
    ) -> Result<Arc<Stream>, PathError> {
        let mut inner = path.lock();
        match &inner.source {
            Some(source) if Arc::ptr_eq(source, author) => {}
            _ => {
                return Err(PathError::AlreadyPublishing {
                    name: path.name().to_string(),
                });
            }
        }

        let tracks_len = tracks.len();
        let stream = Arc::new(Stream::new(tracks));
        inner.stream = Some(stream.clone());
        drop(inner);

        author.on_publisher_accepted(tracks_len);
        Ok(stream)
    }

    /// Register a reader on the path's stream and confirm it.
    pub fn reader_play(&self, path: &Arc<Path>, author: Arc<dyn StreamReader>) {
        if let Some(stream) = path.stream() {
            stream.add_reader(author.clone());
        }
        author.on_reader_accepted();
    }

    /// Detach a reader. No callback fires for it once this returns.
    pub fn reader_remove(&self, path: &Arc<Path>, author: &Arc<dyn StreamReader>) {
        if let Some(stream) = path.stream() {
            stream.remove_reader(author);
        }
        self.collect_if_idle(path);
    }

    /// Detach the publisher and tear its stream down.
    pub fn publisher_remove(&self, path: &Arc<Path>, author: &Arc<dyn StreamSource>) {
        {
            let mut inner = path.lock();
            match &inner.source {
                Some(source) if Arc::ptr_eq(source, author) => {
                    inner.source = None;
                    inner.stream = None;
                }
                _ => return,
            }
        }
        self.collect_if_idle(path);
    }

    /// Introspection view of every active path.
    pub fn path_snapshots(&self) -> Vec<PathSnapshot> {
        let paths: Vec<Arc<Path>> = {
            let map = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };

        let mut out: Vec<PathSnapshot> = paths
            .iter()
            .map(|p| {
                let inner = p.lock();
                PathSnapshot {
                    name: p.name().to_string(),
                    source: inner.source.as_ref().map(|s| s.api_describe()),
                    readers: inner.stream.as_ref().map_or(0, |s| s.reader_count()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::core::types::{DataPayload, H264AccessUnit};

    struct FakeReader {
        accepted: AtomicUsize,
        received: AtomicUsize,
    }

    impl FakeReader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                accepted: AtomicUsize::new(0),
                received: AtomicUsize::new(0),
            })
        }
    }

    impl StreamReader for FakeReader {
        fn on_reader_accepted(&self) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_reader_data(&self, _data: &Arc<Data>) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }

        fn api_describe(&self) -> ApiDescribe {
            ApiDescribe {
                kind: "fakeReader",
                id: "r".to_string(),
            }
        }
    }

    struct FakeSource {
        accepted_tracks: AtomicUsize,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                accepted_tracks: AtomicUsize::new(0),
            })
        }
    }

    impl StreamSource for FakeSource {
        fn on_publisher_accepted(&self, tracks_len: usize) {
            self.accepted_tracks.store(tracks_len, Ordering::SeqCst);
        }

        fn api_describe(&self) -> ApiDescribe {
            ApiDescribe {
                kind: "fakeSource",
                id: "s".to_string(),
            }
        }
    }

    fn allow() -> AuthenticateFn {
        Box::new(|_spec| Box::pin(async { Ok(()) }))
    }

    fn deny(message: &str) -> AuthenticateFn {
        let message = message.to_string();
        Box::new(move |_spec| {
            Box::pin(async move { Err(AuthError::Critical { message }) })
        })
    }

    fn test_tracks() -> Vec<Track> {
        vec![Track::H264 {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEE]),
        }]
    }

    fn video_item() -> Arc<Data> {
        Arc::new(Data {
            track_id: 0,
            payload: DataPayload::Video {
                rtp: Bytes::from_static(&[0x80, 0x60]),
                pts_equals_dts: true,
                access_unit: Some(H264AccessUnit {
                    nalus: vec![Bytes::from_static(&[0x65, 0x88])],
                    pts: Duration::ZERO,
                }),
            },
        })
    }

    #[tokio::test]
    async fn reader_without_publisher_fails() {
        let pm = PathManager::new(HashMap::new());
        let err = pm
            .reader_setup_play(ReaderSetupPlayReq {
                author: FakeReader::new(),
                path_name: "empty".to_string(),
                authenticate: allow(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PathError::NoPublisher { .. }));
    }

    #[tokio::test]
    async fn publish_then_read_delivers_items() {
        let pm = PathManager::new(HashMap::new());
        let source = FakeSource::new();
        let source_dyn: Arc<dyn StreamSource> = source.clone();

        let path = pm
            .publisher_announce(PublisherAnnounceReq {
                author: source_dyn.clone(),
                path_name: "cam".to_string(),
                authenticate: allow(),
            })
            .await
            .unwrap();
        let stream = pm
            .publisher_record(&path, &source_dyn, test_tracks())
            .unwrap();
        assert_eq!(source.accepted_tracks.load(Ordering::SeqCst), 1);

        let reader = FakeReader::new();
        let reader_dyn: Arc<dyn StreamReader> = reader.clone();
        let (rpath, rstream) = pm
            .reader_setup_play(ReaderSetupPlayReq {
                author: reader_dyn.clone(),
                path_name: "cam".to_string(),
                authenticate: allow(),
            })
            .await
            .unwrap();
        assert_eq!(rstream.tracks().len(), 1);

        pm.reader_play(&rpath, reader_dyn.clone());
        assert_eq!(reader.accepted.load(Ordering::SeqCst), 1);

        stream.write_data(video_item());
        assert_eq!(reader.received.load(Ordering::SeqCst), 1);

        pm.reader_remove(&rpath, &reader_dyn);
        stream.write_data(video_item());
        assert_eq!(reader.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_publisher_is_rejected() {
        let pm = PathManager::new(HashMap::new());
        let first: Arc<dyn StreamSource> = FakeSource::new();
        let second: Arc<dyn StreamSource> = FakeSource::new();

        pm.publisher_announce(PublisherAnnounceReq {
            author: first,
            path_name: "cam".to_string(),
            authenticate: allow(),
        })
        .await
        .unwrap();

        let err = pm
            .publisher_announce(PublisherAnnounceReq {
                author: second,
                path_name: "cam".to_string(),
                authenticate: allow(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PathError::AlreadyPublishing { .. }));
    }

    #[tokio::test]
    async fn auth_failure_surfaces_as_critical() {
        let pm = PathManager::new(HashMap::new());
        let err = pm
            .reader_setup_play(ReaderSetupPlayReq {
                author: FakeReader::new(),
                path_name: "cam".to_string(),
                authenticate: deny("invalid credentials"),
            })
            .await
            .unwrap_err();
        match err {
            PathError::AuthCritical { message } => assert_eq!(message, "invalid credentials"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn publisher_remove_tears_stream_down() {
        let pm = PathManager::new(HashMap::new());
        let source: Arc<dyn StreamSource> = FakeSource::new();

        let path = pm
            .publisher_announce(PublisherAnnounceReq {
                author: source.clone(),
                path_name: "cam".to_string(),
                authenticate: allow(),
            })
            .await
            .unwrap();
        pm.publisher_record(&path, &source, test_tracks()).unwrap();
        pm.publisher_remove(&path, &source);

        let err = pm
            .reader_setup_play(ReaderSetupPlayReq {
                author: FakeReader::new(),
                path_name: "cam".to_string(),
                authenticate: allow(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PathError::NoPublisher { .. }));
        assert!(pm.path_snapshots().is_empty(), "idle path must be collected");
    }
}

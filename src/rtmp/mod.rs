use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::auth::Authenticator;
use crate::core::config::AppConfig;
use crate::core::types::ConnId;
use crate::path::PathManager;

pub mod conn;
pub mod framer;

pub use conn::{ConnParent, ConnSettings, ConnState, RtmpConn};

/// RTMP server: accepts connections and tracks them until they close.
pub struct RtmpServer {
    bind_addr: String,
    settings: ConnSettings,
    authenticator: Authenticator,
    path_manager: Arc<PathManager>,
    cancel: CancellationToken,
    conns: Mutex<HashMap<ConnId, Arc<RtmpConn>>>,
}

/// Introspection view of one connection.
#[derive(Debug, Serialize)]
pub struct ConnSnapshot {
    pub id: String,
    pub remote_addr: String,
    pub state: &'static str,
    pub created: DateTime<Utc>,
}

impl RtmpServer {
    pub fn new(
        config: &AppConfig,
        path_manager: Arc<PathManager>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let settings = ConnSettings {
            read_timeout: config.rtmp.read_timeout(),
            write_timeout: config.rtmp.write_timeout(),
            read_buffer_count: config.rtmp.read_buffer_count,
            rtsp_address: config.server.rtsp_address.clone(),
            run_on_connect: config.rtmp.run_on_connect.clone(),
            run_on_connect_restart: config.rtmp.run_on_connect_restart,
        };

        Arc::new(Self {
            bind_addr: format!("{}:{}", config.server.host, config.server.rtmp_port),
            settings,
            authenticator: Authenticator::new(config.auth.external_auth_url()),
            path_manager,
            cancel,
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the configured address and serve until cancellation.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let bind_addr: SocketAddr = self.bind_addr.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid RTMP bind address: {}", e),
            )
        })?;

        let listener = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "RTMP server listening");
        self.serve(listener).await;
        Ok(())
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("RTMP server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            error!(error = %e, "failed to accept RTMP connection");
                            continue;
                        }
                    };

                    let conn = RtmpConn::spawn(
                        &self.cancel,
                        socket,
                        peer_addr,
                        self.settings.clone(),
                        self.authenticator.clone(),
                        self.path_manager.clone(),
                        self.clone() as Arc<dyn ConnParent>,
                    );
                    self.conns
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(conn.id(), conn);
                }
            }
        }
    }

    pub fn conn_snapshots(&self) -> Vec<ConnSnapshot> {
        let conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ConnSnapshot> = conns
            .values()
            .map(|c| ConnSnapshot {
                id: c.id().to_string(),
                remote_addr: c.remote_addr().to_string(),
                state: c.safe_state().as_str(),
                created: c.created(),
            })
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created));
        out
    }
}

impl ConnParent for RtmpServer {
    fn on_conn_close(&self, conn: &RtmpConn) {
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn.id());
    }
}

use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Delay before restarting a command that exited on its own.
const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// A supervised external command, run through `sh -c`.
///
/// The supervisor task owns the child process: it logs exit codes,
/// optionally restarts the command after an unexpected exit, and kills it
/// when `close` is called.
pub struct ExternalCmd {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ExternalCmd {
    pub fn spawn(cmdline: &str, restart: bool, env: Vec<(String, String)>) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            cmdline.to_string(),
            restart,
            env,
            token.clone(),
        ));
        Self { token, handle }
    }

    /// Stop the command and wait for the supervisor to wind down.
    pub async fn close(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

async fn supervise(
    cmdline: String,
    restart: bool,
    env: Vec<(String, String)>,
    token: CancellationToken,
) {
    loop {
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&cmdline)
            .envs(env.iter().cloned())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %cmdline, error = %e, "external command failed to start");
                return;
            }
        };

        tokio::select! {
            _ = token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return;
            }
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        info!(command = %cmdline, code = status.code(), "external command exited");
                    }
                    Err(e) => {
                        warn!(command = %cmdline, error = %e, "external command wait failed");
                    }
                }
                if !restart {
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(RESTART_PAUSE) => {}
                }
            }
        }
    }
}

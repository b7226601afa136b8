//! Lifecycle of the NGINX master process.
//!
//! The child runs in its own process group so signals aimed at the
//! controller do not propagate; its exit is delivered through a
//! single-element channel watched by the controller's event loop.

use std::{
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{net::TcpStream, process::Command, sync::mpsc};

use crate::errors::NginxError;

/// What the waiter observed when the child went away.
#[derive(Debug)]
pub struct ExitNotice {
    pub status: Option<ExitStatus>,
    pub error: Option<String>,
}

/// An abnormal exit (non-zero code, or termination by signal) warrants a
/// fresh master process; a clean exit does not.
pub fn is_respawn_if_required(notice: &ExitNotice) -> bool {
    match notice.status {
        Some(status) => !status.success(),
        None => false,
    }
}

/// Blocks until nothing is listening on the port anymore.
pub async fn wait_until_port_is_available(port: u16) {
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(_) => tokio::time::sleep(Duration::from_millis(500)).await,
            Err(_) => return,
        }
    }
}

pub struct NginxProcess {
    binary: String,
    running: Arc<AtomicBool>,
}

impl NginxProcess {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns a new master process; a dedicated waiter delivers its exit
    /// into `err_tx`.
    pub fn start(&self, err_tx: mpsc::Sender<ExitNotice>) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("NGINX error starting {}", self.binary))?;
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        tokio::spawn(async move {
            let notice = match child.wait().await {
                Ok(status) => ExitNotice {
                    status: Some(status),
                    error: None,
                },
                Err(e) => ExitNotice {
                    status: None,
                    error: Some(e.to_string()),
                },
            };
            running.store(false, Ordering::SeqCst);
            let _ = err_tx.send(notice).await;
        });

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks the master process to quit gracefully and polls once per
    /// second until it is gone, bounded by `timeout`.
    pub async fn quit_and_wait(&self, timeout: Duration) -> Result<(), NginxError> {
        let output = Command::new(&self.binary)
            .args(["-s", "quit"])
            .output()
            .await
            .map_err(|e| NginxError::QuitFailed {
                output: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(NginxError::QuitFailed {
                output: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        loop {
            timer.tick().await;
            if !self.is_running() {
                tracing::info!("NGINX process has stopped");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NginxError::QuitFailed {
                    output: "timed out waiting for the NGINX process to stop".to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[tokio::test]
    async fn waiter_reports_clean_exit() {
        let process = NginxProcess::new("true");
        let (tx, mut rx) = mpsc::channel(1);
        process.start(tx).unwrap();

        let notice = rx.recv().await.unwrap();
        assert!(notice.status.unwrap().success());
        assert!(!is_respawn_if_required(&notice));
        assert!(!process.is_running());
    }

    #[test]
    fn signal_death_requires_respawn() {
        // raw wait status 9 encodes "killed by SIGKILL"
        let notice = ExitNotice {
            status: Some(ExitStatus::from_raw(9)),
            error: None,
        };
        assert!(is_respawn_if_required(&notice));
    }

    #[tokio::test]
    async fn nonzero_exit_requires_respawn() {
        let process = NginxProcess::new("false");
        let (tx, mut rx) = mpsc::channel(1);
        process.start(tx).unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.status.as_ref().unwrap().code(), Some(1));
        assert!(is_respawn_if_required(&notice));
    }

    #[test]
    fn abnormal_master_exit_requires_respawn() {
        // a dying master reports status 255; raw wait status encodes the
        // exit code in the high byte
        let notice = ExitNotice {
            status: Some(ExitStatus::from_raw(255 << 8)),
            error: None,
        };
        assert_eq!(notice.status.as_ref().unwrap().code(), Some(255));
        assert!(is_respawn_if_required(&notice));
    }

    #[tokio::test]
    async fn unused_port_is_available_immediately() {
        // nothing listens on this port in the test environment
        wait_until_port_is_available(59999).await;
    }

    #[tokio::test]
    async fn crash_is_detected_and_respawn_succeeds() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-nginx.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nif [ -f \"$0.crashed\" ]; then exec sleep 30; fi\ntouch \"$0.crashed\"\nkill -9 $$\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let process = NginxProcess::new(script.to_str().unwrap());
        let (tx, mut rx) = mpsc::channel(1);

        // first spawn kills itself, which warrants a respawn
        process.start(tx.clone()).unwrap();
        let notice = rx.recv().await.unwrap();
        assert!(is_respawn_if_required(&notice));
        assert!(!process.is_running());

        wait_until_port_is_available(59998).await;

        // the replacement stays up
        process.start(tx).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process.is_running());
    }
}

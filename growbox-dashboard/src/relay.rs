// Growbox Dashboard - Video relay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! RTSP to HLS video relay.
//!
//! Runs `ffmpeg` as a child process that repackages the camera stream into
//! a rolling HLS playlist under the output directory, which the dashboard
//! serves at `/hls/`. The child is restarted with exponential backoff when
//! it exits and killed on shutdown. Acquisition never depends on it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::metrics::{record_relay_restart, set_relay_running};

/// Playlist written into the output directory
pub const PLAYLIST: &str = "stream.m3u8";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// RTSP source URL.
    pub source: String,
    /// Directory receiving the playlist and segments.
    pub output_dir: PathBuf,
    /// ffmpeg executable.
    pub program: PathBuf,
    /// Delay before the first restart.
    pub initial_backoff: Duration,
    /// Upper bound for the restart delay.
    pub max_backoff: Duration,
    /// A run lasting at least this long resets the backoff.
    pub stable_after: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            output_dir: PathBuf::from("hls"),
            program: PathBuf::from("ffmpeg"),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    pub fn new(source: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), growbox::ConfigError> {
        if self.source.trim().is_empty() {
            return Err(growbox::ConfigError::Missing("rtsp url"));
        }
        if self.initial_backoff.is_zero() || self.max_backoff < self.initial_backoff {
            return Err(growbox::ConfigError::invalid(
                "relay_backoff",
                "initial backoff must be positive and not above the maximum",
            ));
        }
        Ok(())
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(PLAYLIST)
    }

    /// ffmpeg arguments: copy video, drop audio, keep a five-segment window.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-nostdin",
            "-rtsp_transport",
            "tcp",
            "-i",
            self.source.as_str(),
            "-c:v",
            "copy",
            "-an",
            "-f",
            "hls",
            "-hls_time",
            "1",
            "-hls_list_size",
            "5",
            "-hls_flags",
            "delete_segments+append_list+omit_endlist",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(self.playlist_path().to_string_lossy().into_owned());
        args
    }
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Cannot create HLS directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Relay exited with {0}")]
    Exited(ExitStatus),

    #[error("Waiting for relay failed: {0}")]
    Wait(#[from] std::io::Error),
}

/// Restart delay that doubles on every quick failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    stable_after: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            stable_after: config.stable_after,
            current: config.initial_backoff,
        }
    }

    /// Delay before the next start, given how long the last run lasted.
    pub fn after_run(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.stable_after {
            self.current = self.initial;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Relay status shared with the HTTP layer.
#[derive(Debug, Default)]
pub struct RelayState {
    pub running: AtomicBool,
    pub restarts: AtomicU64,
}

enum RunEnd {
    Exited(Result<(), RelayError>),
    Shutdown,
}

/// Supervises the ffmpeg child.
pub struct Relay {
    config: RelayConfig,
    state: Arc<RelayState>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: Arc::new(RelayState::default()),
        }
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    fn spawn(&self) -> Result<Child, RelayError> {
        std::fs::create_dir_all(&self.config.output_dir).map_err(|source| {
            RelayError::OutputDir {
                path: self.config.output_dir.display().to_string(),
                source,
            }
        })?;

        Command::new(&self.config.program)
            .args(self.config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RelayError::Spawn {
                program: self.config.program.display().to_string(),
                source,
            })
    }

    async fn run_once(&self, shutdown: &mut watch::Receiver<bool>) -> RunEnd {
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => return RunEnd::Exited(Err(e)),
        };

        self.state.running.store(true, Ordering::SeqCst);
        set_relay_running(true);
        info!("Video relay started: {}", self.config.playlist_path().display());

        let end = tokio::select! {
            status = child.wait() => RunEnd::Exited(match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(RelayError::Exited(status)),
                Err(e) => Err(RelayError::Wait(e)),
            }),
            _ = shutdown.changed() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill video relay: {}", e);
                }
                RunEnd::Shutdown
            }
        };

        self.state.running.store(false, Ordering::SeqCst);
        set_relay_running(false);
        end
    }

    /// Keep the relay alive until `shutdown` turns true or its sender is
    /// dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(&self.config);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            match self.run_once(&mut shutdown).await {
                RunEnd::Shutdown => break,
                RunEnd::Exited(Ok(())) => info!("Video relay ended"),
                RunEnd::Exited(Err(e)) => warn!("Video relay failed: {}", e),
            }

            let delay = backoff.after_run(started.elapsed());
            debug!("Restarting video relay in {:?}", delay);
            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            self.state.restarts.fetch_add(1, Ordering::SeqCst);
            record_relay_restart();
        }

        info!("Video relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config(dir: &std::path::Path) -> RelayConfig {
        RelayConfig {
            program: PathBuf::from("/nonexistent/ffmpeg"),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            stable_after: Duration::from_secs(60),
            ..RelayConfig::new("rtsp://camera.local/stream1", dir)
        }
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(&RelayConfig::default());
        let quick = Duration::from_millis(200);
        let delays: Vec<u64> = (0..8).map(|_| backoff.after_run(quick).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_backoff_resets_after_stable_run() {
        let mut backoff = Backoff::new(&RelayConfig::default());
        for _ in 0..4 {
            backoff.after_run(Duration::ZERO);
        }
        assert_eq!(
            backoff.after_run(Duration::from_secs(61)),
            Duration::from_secs(1)
        );
        assert_eq!(backoff.after_run(Duration::ZERO), Duration::from_secs(2));
    }

    #[test]
    fn test_ffmpeg_arguments() {
        let config = RelayConfig::new("rtsp://10.0.0.9/live", "/srv/hls");
        let args = config.args();
        assert_eq!(args[0], "-nostdin");
        assert!(args.windows(2).any(|w| w == ["-i", "rtsp://10.0.0.9/live"]));
        assert!(args.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-hls_flags", "delete_segments+append_list+omit_endlist"]));
        assert_eq!(args.last().unwrap(), "/srv/hls/stream.m3u8");
    }

    #[test]
    fn test_config_validation() {
        assert!(RelayConfig::default().validate().is_err());
        assert!(RelayConfig::new("rtsp://cam/1", "hls").validate().is_ok());

        let inverted = RelayConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..RelayConfig::new("rtsp://cam/1", "hls")
        };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_retried_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::new(quick_config(dir.path()));
        let state = relay.state();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(rx));

        sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay did not stop")
            .unwrap();

        assert!(state.restarts.load(Ordering::SeqCst) >= 2);
        assert!(!state.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_output_directory_created() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("hls");
        let relay = Relay::new(quick_config(&out));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(rx));
        sleep(Duration::from_millis(50)).await;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay did not stop")
            .unwrap();

        assert!(out.is_dir());
    }
}

//! Tunnel Supervisor: manages the push-webhook tunnel child process
//! (`cloudflared` by convention) and exposes its connection state.
//!
//! Connection state is derived by scanning the child's stdout/stderr lines
//! against two configurable regex lists rather than parsing any particular
//! tunnel daemon's structured output -- the phrases are empirically derived
//! and vary across binaries and versions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const DEFAULT_CONNECTED_PATTERNS: &[&str] = &["Registered tunnel connection"];
const DEFAULT_DISCONNECTED_PATTERNS: &[&str] = &["Connection terminated"];
const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to compile tunnel log pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to spawn tunnel binary {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
}

/// Regex lists used to derive connection state from log lines (§9 Open
/// Questions: treated as configuration, not a hardcoded parser).
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub bin: String,
    pub hostname: String,
    pub token: Option<String>,
    pub connected_patterns: Vec<String>,
    pub disconnected_patterns: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bin: "cloudflared".to_string(),
            hostname: String::new(),
            token: None,
            connected_patterns: DEFAULT_CONNECTED_PATTERNS.iter().map(|s| s.to_string()).collect(),
            disconnected_patterns: DEFAULT_DISCONNECTED_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

struct CompiledPatterns {
    connected: Vec<Regex>,
    disconnected: Vec<Regex>,
}

impl CompiledPatterns {
    fn compile(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let compile_all = |patterns: &[String]| -> Result<Vec<Regex>, TunnelError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|source| TunnelError::Pattern {
                        pattern: p.clone(),
                        source,
                    })
                })
                .collect()
        };

        Ok(Self {
            connected: compile_all(&config.connected_patterns)?,
            disconnected: compile_all(&config.disconnected_patterns)?,
        })
    }

    fn classify(&self, line: &str) -> Option<bool> {
        if self.connected.iter().any(|re| re.is_match(line)) {
            Some(true)
        } else if self.disconnected.iter().any(|re| re.is_match(line)) {
            Some(false)
        } else {
            None
        }
    }
}

/// Supervises the tunnel child process and tracks its last-known
/// connection state from its log output.
pub struct TunnelSupervisor {
    connected: Arc<AtomicBool>,
    child: tokio::sync::Mutex<Option<Child>>,
    patterns: CompiledPatterns,
    config: TunnelConfig,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        let patterns = CompiledPatterns::compile(&config)?;
        Ok(Self {
            connected: Arc::new(AtomicBool::new(false)),
            child: tokio::sync::Mutex::new(None),
            patterns,
            config,
        })
    }

    pub fn is_tunnel_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Spawn the tunnel binary and start draining its combined output into
    /// connection-state updates. Replaces any previously running child.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let mut cmd = Command::new(&self.config.bin);
        cmd.arg("tunnel").arg("run").arg("--hostname").arg(&self.config.hostname);
        if let Some(token) = &self.config.token {
            cmd.arg("--token").arg(token);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut proc = cmd.spawn().map_err(|source| TunnelError::Spawn {
            bin: self.config.bin.clone(),
            source,
        })?;

        let stdout = proc.stdout.take();
        let stderr = proc.stderr.take();

        {
            let mut guard = self.child.lock().await;
            *guard = Some(proc);
        }

        self.connected.store(false, Ordering::SeqCst);

        if let Some(stdout) = stdout {
            self.spawn_line_reader(stdout);
        }
        if let Some(stderr) = stderr {
            self.spawn_line_reader(stderr);
        }

        Ok(())
    }

    fn spawn_line_reader<R>(&self, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let connected = Arc::clone(&self.connected);
        let patterns = CompiledPatterns {
            connected: self.patterns.connected.clone(),
            disconnected: self.patterns.disconnected.clone(),
        };

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(is_connected) = patterns.classify(&line) {
                            connected.store(is_connected, Ordering::SeqCst);
                            if is_connected {
                                tracing::info!("tunnel connected");
                            } else {
                                tracing::warn!("tunnel disconnected");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading tunnel output");
                        break;
                    }
                }
            }
        });
    }

    /// `SIGTERM`, 5s grace, then `SIGKILL`. Idempotent: a no-op if no child
    /// is running.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        let pid = child.id();
        #[cfg(unix)]
        if let Some(pid) = pid {
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                tracing::warn!(pid, "SIGTERM failed for tunnel process, proceeding to SIGKILL");
            }
        }

        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(_status)) => tracing::debug!("tunnel process exited after SIGTERM"),
            _ => {
                tracing::debug!("tunnel process did not exit after SIGTERM, sending SIGKILL");
                let _ = child.kill().await;
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_patterns_classify_cloudflared_lines() {
        let patterns = CompiledPatterns::compile(&TunnelConfig::default()).unwrap();
        assert_eq!(patterns.classify("INF Registered tunnel connection connIndex=0"), Some(true));
        assert_eq!(patterns.classify("INF Connection terminated"), Some(false));
        assert_eq!(patterns.classify("INF some unrelated line"), None);
    }

    #[test]
    fn custom_patterns_override_defaults() {
        let config = TunnelConfig {
            connected_patterns: vec!["UP".to_string()],
            disconnected_patterns: vec!["DOWN".to_string()],
            ..TunnelConfig::default()
        };
        let patterns = CompiledPatterns::compile(&config).unwrap();
        assert_eq!(patterns.classify("tunnel is UP now"), Some(true));
        assert_eq!(patterns.classify("tunnel is DOWN now"), Some(false));
    }

    #[test]
    fn invalid_pattern_is_rejected_at_construction() {
        let config = TunnelConfig {
            connected_patterns: vec!["(unclosed".to_string()],
            ..TunnelConfig::default()
        };
        assert!(matches!(TunnelSupervisor::new(config), Err(TunnelError::Pattern { .. })));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let supervisor = TunnelSupervisor::new(TunnelConfig::default()).unwrap();
        assert!(!supervisor.is_tunnel_connected());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_real_process_updates_connection_state() {
        let tmp = tempfile::tempdir().unwrap();
        let script_path = tmp.path().join("fake_tunnel.sh");
        std::fs::write(
            &script_path,
            "#!/bin/sh\necho 'INF Registered tunnel connection'\nsleep 3600\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = TunnelConfig {
            bin: script_path.to_str().unwrap().to_string(),
            hostname: "example.com".to_string(),
            ..TunnelConfig::default()
        };
        let supervisor = TunnelSupervisor::new(config).unwrap();
        supervisor.start().await.unwrap();

        for _ in 0..20 {
            if supervisor.is_tunnel_connected() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(supervisor.is_tunnel_connected());

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_tunnel_connected());
    }
}

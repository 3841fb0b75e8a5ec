//! `AgentRunner` implementation wrapping the `claude` CLI.
//!
//! Spawns `claude -p --output-format stream-json` and streams its stdout as
//! newline-delimited JSON frames.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{AgentEvent, AgentFrame, AgentHandle, AgentRunner, AgentRunnerError, SpawnSpec, parse_agent_frame};

struct ProcessState {
    child: Child,
    stdout: Option<ChildStdout>,
}

/// Drives `claude` as a subprocess, one per invocation.
pub struct ClaudeAgentRunner {
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl ClaudeAgentRunner {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ClaudeAgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRunner for ClaudeAgentRunner {
    fn name(&self) -> &str {
        "claude"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<AgentHandle, AgentRunnerError> {
        let mut cmd = Command::new(&spec.agent_bin);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--max-turns")
            .arg(spec.max_turns.to_string());

        if let Some(system_prompt) = &spec.system_prompt {
            cmd.arg("--append-system-prompt").arg(system_prompt);
        }
        if !spec.disallowed_tools.is_empty() {
            cmd.arg("--disallowedTools").arg(spec.disallowed_tools.join(","));
        }
        cmd.arg(&spec.agent_prompt);

        cmd.current_dir(&spec.worktree_path);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().map_err(|source| AgentRunnerError::Spawn {
            bin: spec.agent_bin.clone(),
            source,
        })?;

        let pid = child.id().ok_or(AgentRunnerError::NoPid)?;
        let stdout = child.stdout.take();

        self.processes.lock().await.insert(pid, ProcessState { child, stdout });

        Ok(AgentHandle {
            pid,
            invocation_id: spec.invocation_id,
        })
    }

    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);

        let stream = async_stream::stream! {
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "no stdout available for pid -- events already consumed or process missing");
                yield AgentEvent::Completed;
                return;
            };

            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_agent_frame(trimmed) {
                            Ok(Some(frame)) => yield AgentEvent::Frame(frame),
                            Ok(None) => {}
                            Err(e) => warn!(line = trimmed, error = %e, "skipping malformed agent frame"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        break;
                    }
                }
            }

            yield AgentEvent::Completed;
        };

        Box::pin(stream)
    }

    async fn kill(&self, handle: &AgentHandle) -> Result<(), AgentRunnerError> {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            #[cfg(unix)]
            {
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }

            let exited = tokio::time::timeout(std::time::Duration::from_secs(5), state.child.wait()).await;
            match exited {
                Ok(Ok(_status)) => debug!(pid, "process exited after SIGTERM"),
                _ => {
                    debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
                    let _ = state.child.kill().await;
                }
            }
            processes.remove(&pid);
        } else {
            debug!(pid, "kill called but process not in map (already exited?)");
        }

        Ok(())
    }

    async fn is_running(&self, handle: &AgentHandle) -> bool {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        match processes.get_mut(&pid) {
            Some(state) => match state.child.try_wait() {
                Ok(Some(_status)) => {
                    processes.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "error checking process status");
                    false
                }
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::path::PathBuf;

    fn spec(worktree: &std::path::Path) -> SpawnSpec {
        SpawnSpec {
            agent_prompt: "fix the bug".to_string(),
            worktree_path: worktree.to_path_buf(),
            max_turns: 10,
            invocation_id: 1,
            agent_bin: "unused".to_string(),
            system_prompt: None,
            disallowed_tools: vec![],
        }
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn spawn_and_stream_full_invocation() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_claude.sh",
            "#!/bin/sh\n\
             echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s1\"}'\n\
             echo '{\"type\":\"assistant\",\"message\":{}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"total_cost_usd\":0.05,\"num_turns\":3,\"result\":\"done\"}'\n",
        );

        let runner = ClaudeAgentRunner::new();
        let mut spawn_spec = spec(tmp.path());
        spawn_spec.agent_bin = script.to_str().unwrap().to_string();

        let handle = runner.spawn(&spawn_spec).await.unwrap();
        let events: Vec<AgentEvent> = runner.events(&handle).collect().await;

        assert_eq!(
            events[0],
            AgentEvent::Frame(AgentFrame::Init {
                session_id: "s1".to_string()
            })
        );
        assert!(matches!(events[1], AgentEvent::Frame(AgentFrame::Intermediate(_))));
        assert_eq!(
            events[2],
            AgentEvent::Frame(AgentFrame::Result {
                subtype: "success".to_string(),
                total_cost_usd: Some(0.05),
                num_turns: Some(3),
                result: Some("done".to_string()),
            })
        );
        assert_eq!(events[3], AgentEvent::Completed);
    }

    #[tokio::test]
    async fn spawn_binary_not_found_returns_error() {
        let runner = ClaudeAgentRunner::new();
        let mut spawn_spec = spec(std::path::Path::new("/tmp"));
        spawn_spec.agent_bin = "/nonexistent/path/to/claude".to_string();

        let result = runner.spawn(&spawn_spec).await;
        assert!(matches!(result, Err(AgentRunnerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn kill_terminates_subprocess() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy.sh", "#!/bin/sh\nsleep 3600\n");

        let runner = ClaudeAgentRunner::new();
        let mut spawn_spec = spec(tmp.path());
        spawn_spec.agent_bin = script.to_str().unwrap().to_string();

        let handle = runner.spawn(&spawn_spec).await.unwrap();
        assert!(runner.is_running(&handle).await);

        runner.kill(&handle).await.unwrap();
        assert!(!runner.is_running(&handle).await);
    }

    #[tokio::test]
    async fn is_running_false_after_natural_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "quick.sh", "#!/bin/sh\necho done\n");

        let runner = ClaudeAgentRunner::new();
        let mut spawn_spec = spec(tmp.path());
        spawn_spec.agent_bin = script.to_str().unwrap().to_string();

        let handle = runner.spawn(&spawn_spec).await.unwrap();
        for _ in 0..20 {
            if !runner.is_running(&handle).await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        panic!("process did not exit within 2 seconds");
    }
}

//! The `AgentRunner` trait -- the adapter interface for the coding-agent
//! subprocess.
//!
//! Orca spawns exactly one configured agent binary (`agent_bin`, default
//! `claude`); unlike a multi-harness registry this trait has a single
//! production implementation ([`claude::ClaudeAgentRunner`]), stored as
//! `Arc<dyn AgentRunner>` wherever the run pool needs it.

pub mod claude;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

/// Everything the run pool needs to launch one invocation.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub agent_prompt: String,
    pub worktree_path: PathBuf,
    pub max_turns: i64,
    pub invocation_id: i64,
    pub agent_bin: String,
    pub system_prompt: Option<String>,
    pub disallowed_tools: Vec<String>,
}

/// A handle to a spawned agent process.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub pid: u32,
    pub invocation_id: i64,
}

/// A parsed frame from the agent's newline-delimited JSON protocol (§6).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    /// `{type:"system", subtype:"init", session_id}` -- emitted once.
    Init { session_id: String },
    /// Any other frame, passed through verbatim for logging.
    Intermediate(serde_json::Value),
    /// `{type:"result", ...}` -- the terminating frame.
    Result {
        subtype: String,
        total_cost_usd: Option<f64>,
        num_turns: Option<i64>,
        result: Option<String>,
    },
}

/// Event stream item yielded by [`AgentRunner::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Frame(AgentFrame),
    /// The stdout stream has closed; no more frames will arrive.
    Completed,
}

#[derive(Debug, Error)]
pub enum AgentRunnerError {
    #[error("failed to spawn agent binary '{bin}': {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned agent process has no pid")]
    NoPid,
}

/// Parse a single newline-delimited JSON line from the agent's stdout.
///
/// Returns `Ok(None)` for a frame type this protocol does not need to act
/// on (it is still appended to the ndjson log by the caller). Returns
/// `Err` if the line is not valid JSON; callers should log and continue.
pub fn parse_agent_frame(line: &str) -> Result<Option<AgentFrame>, serde_json::Error> {
    let v: serde_json::Value = serde_json::from_str(line)?;
    let frame_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let frame = match frame_type {
        "system" if v.get("subtype").and_then(|s| s.as_str()) == Some("init") => {
            let session_id = v
                .get("session_id")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            Some(AgentFrame::Init { session_id })
        }
        "result" => Some(AgentFrame::Result {
            subtype: v.get("subtype").and_then(|s| s.as_str()).unwrap_or("unknown").to_string(),
            total_cost_usd: v.get("total_cost_usd").and_then(|c| c.as_f64()),
            num_turns: v.get("num_turns").and_then(|n| n.as_i64()),
            result: v.get("result").and_then(|r| r.as_str()).map(str::to_string),
        }),
        _ => Some(AgentFrame::Intermediate(v)),
    };

    Ok(frame)
}

/// Adapter interface for spawning and supervising the coding agent.
///
/// Object-safe: every method returns a concrete or boxed type, so the
/// single production implementation can be stored as `Arc<dyn AgentRunner>`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Spawn the agent subprocess for one invocation.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<AgentHandle, AgentRunnerError>;

    /// Stream parsed frames from the process's stdout until it closes.
    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

    /// `SIGTERM`, then `SIGKILL` after a 5s grace period if still alive.
    async fn kill(&self, handle: &AgentHandle) -> Result<(), AgentRunnerError>;

    async fn is_running(&self, handle: &AgentHandle) -> bool;
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentRunner) {}
};

//! Agent execution
//!
//! An [`AgentRunner`] runs one turn of an agent CLI and reports its
//! transcript. [`RuntimeConfig`] is a profile's resolved agent settings;
//! [`run_interruptible`] wraps a runner so an interrupt signal stored
//! against the turn ends it early without cancelling the surrounding run.

mod adapter;
mod process;

pub use adapter::{AdapterArgs, AgentAdapter};
pub use process::ProcessRunner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CrewError, Result};
use crate::store::Store;

/// Environment variable through which CLI commands find their turn.
pub const TURN_ID_ENV: &str = "CREWLOOP_TURN_ID";

/// Everything needed to start one agent session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: PathBuf,
    pub prompt: String,
    pub max_turns: Option<u32>,
    pub resume_session: Option<String>,
    /// Write the prompt to the child's stdin
    pub stdin_prompt: bool,
}

/// One structured event from an agent's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub kind: String,
    pub text: Option<String>,
    pub raw: serde_json::Value,
}

impl TranscriptEvent {
    pub fn text(kind: &str, text: &str) -> Self {
        Self {
            kind: kind.to_string(),
            text: Some(text.to_string()),
            raw: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnResult {
    pub exit_code: i32,
    pub session_id: Option<String>,
    pub transcript: Vec<TranscriptEvent>,
}

impl TurnResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The agent's final words: the last `result` event, else the last text.
    pub fn summary(&self) -> Option<String> {
        self.transcript
            .iter()
            .rev()
            .find(|e| e.kind == "result" && e.text.is_some())
            .or_else(|| self.transcript.iter().rev().find(|e| e.text.is_some()))
            .and_then(|e| e.text.clone())
    }
}

/// Lifecycle callbacks for one agent session.
pub trait SessionObserver: Send + Sync {
    fn session_started(&self, _session_id: &str) {}
    fn transcript(&self, _event: &TranscriptEvent) {}
    fn session_ended(&self, _result: &TurnResult) {}
}

pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one session. When `cancel` fires the session is terminated and
    /// the runner returns [`CrewError::Cancelled`].
    async fn run(&self, request: TurnRequest, observer: &dyn SessionObserver, cancel: CancellationToken)
    -> Result<TurnResult>;
}

/// A profile's resolved agent settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub agent: String,
    pub adapter: AgentAdapter,
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: PathBuf,
    pub max_turns: Option<u32>,
}

impl RuntimeConfig {
    /// Build the request for one session of this profile.
    pub fn request(&self, turn_id: &str, prompt: &str, resume_session: Option<&str>) -> TurnRequest {
        let model = self.model.as_deref().filter(|_| self.adapter.supports_model_override());
        let reasoning = self.reasoning.as_deref().filter(|_| self.adapter.supports_reasoning_level());
        let args = self.adapter.build_args(&AdapterArgs {
            prompt,
            model,
            reasoning,
            max_turns: self.max_turns,
            resume_session,
            extra: &self.args,
        });
        let mut env = self.env.clone();
        env.insert(TURN_ID_ENV.to_string(), turn_id.to_string());
        TurnRequest {
            command: self.command.clone(),
            args,
            env,
            workdir: self.workdir.clone(),
            prompt: prompt.to_string(),
            max_turns: self.max_turns,
            resume_session: resume_session.map(String::from),
            stdin_prompt: self.adapter.prompt_on_stdin(),
        }
    }
}

/// Result of a turn that may have been interrupted.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub result: TurnResult,
    /// Set when an interrupt signal ended the turn
    pub interrupt: Option<String>,
}

/// Run a turn while watching the store for an interrupt addressed to it.
///
/// The turn runs under a child of `cancel`: an interrupt cancels only that
/// child, while cancelling `cancel` itself yields [`CrewError::Cancelled`].
/// An elapsed `timeout` yields [`CrewError::Timeout`].
#[allow(clippy::too_many_arguments)]
pub async fn run_interruptible(
    runner: &dyn AgentRunner,
    store: Arc<dyn Store>,
    turn_id: &str,
    request: TurnRequest,
    observer: &dyn SessionObserver,
    cancel: &CancellationToken,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> Result<TurnOutcome> {
    let turn_token = cancel.child_token();
    let watcher = {
        let token = turn_token.clone();
        let turn_id = turn_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = ticker.tick() => match store.take_interrupt(&turn_id) {
                        Ok(Some(reason)) => {
                            tracing::info!(turn_id = %turn_id, reason = %reason, "Turn interrupted");
                            token.cancel();
                            return Some(reason);
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(turn_id = %turn_id, error = %e, "Interrupt check failed"),
                    },
                }
            }
        })
    };

    let session = runner.run(request, observer, turn_token.clone());
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, session).await {
            Ok(result) => result,
            Err(_) => {
                turn_token.cancel();
                watcher.abort();
                return Err(CrewError::Timeout(limit.as_secs()));
            }
        },
        None => session.await,
    };

    turn_token.cancel();
    let interrupt = watcher.await.unwrap_or(None);

    if cancel.is_cancelled() {
        return Err(CrewError::Cancelled);
    }
    match result {
        Ok(result) => Ok(TurnOutcome { result, interrupt }),
        Err(e) if e.is_cancelled() && interrupt.is_some() => Ok(TurnOutcome {
            result: TurnResult {
                exit_code: -1,
                ..Default::default()
            },
            interrupt,
        }),
        Err(e) => Err(e),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;
    use crate::domain::Turn;
    use crate::policy::Position;
    use crate::store::MemoryStore;

    fn runtime(adapter: AgentAdapter) -> RuntimeConfig {
        RuntimeConfig {
            agent: "a".to_string(),
            adapter,
            command: "agent".to_string(),
            args: vec![],
            model: Some("big".to_string()),
            reasoning: Some("high".to_string()),
            env: BTreeMap::from([("K".to_string(), "V".to_string())]),
            workdir: PathBuf::from("/work"),
            max_turns: Some(3),
        }
    }

    fn store_with_turn() -> (Arc<dyn Store>, Turn) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let turn = Turn::standalone("p", "a", Position::Lead);
        store.create_turn(&turn).unwrap();
        (store, turn)
    }

    #[test]
    fn test_request_sets_turn_env_and_filters_capabilities() {
        let request = runtime(AgentAdapter::Claude).request("turn-1", "hello", Some("s-1"));
        assert_eq!(request.env.get(TURN_ID_ENV).map(String::as_str), Some("turn-1"));
        assert_eq!(request.env.get("K").map(String::as_str), Some("V"));
        assert!(request.args.contains(&"--model".to_string()));
        assert!(!request.args.iter().any(|a| a.contains("reasoning")));
        assert_eq!(request.resume_session.as_deref(), Some("s-1"));
        assert!(!request.stdin_prompt);

        let generic = runtime(AgentAdapter::Generic).request("turn-1", "hello", None);
        assert!(generic.args.is_empty());
        assert!(generic.stdin_prompt);
    }

    #[test]
    fn test_summary_prefers_result_event() {
        let result = TurnResult {
            exit_code: 0,
            session_id: None,
            transcript: vec![
                TranscriptEvent::text("result", "final"),
                TranscriptEvent::text("assistant", "chatter"),
            ],
        };
        assert_eq!(result.summary().as_deref(), Some("final"));
    }

    #[tokio::test]
    async fn test_run_interruptible_completes() {
        let (store, turn) = store_with_turn();
        let runner = ScriptedRunner::new(Duration::from_millis(5), 0);
        let outcome = run_interruptible(
            &runner,
            store,
            &turn.id,
            TurnRequest::default(),
            &NoopObserver,
            &CancellationToken::new(),
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap();
        assert!(outcome.result.success());
        assert_eq!(outcome.interrupt, None);
    }

    #[tokio::test]
    async fn test_run_interruptible_honours_interrupt() {
        let (store, turn) = store_with_turn();
        store.signal_interrupt(&turn.id, "supervisor called").unwrap();
        let runner = ScriptedRunner::new(Duration::from_secs(30), 0);
        let cancel = CancellationToken::new();
        let outcome = run_interruptible(
            &runner,
            store.clone(),
            &turn.id,
            TurnRequest::default(),
            &NoopObserver,
            &cancel,
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.interrupt.as_deref(), Some("supervisor called"));
        assert!(!cancel.is_cancelled());
        assert_eq!(store.take_interrupt(&turn.id).unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_interruptible_cancellation() {
        let (store, turn) = store_with_turn();
        let runner = ScriptedRunner::new(Duration::from_secs(30), 0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = run_interruptible(
            &runner,
            store,
            &turn.id,
            TurnRequest::default(),
            &NoopObserver,
            &cancel,
            Duration::from_millis(10),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_interruptible_timeout() {
        let (store, turn) = store_with_turn();
        let runner = ScriptedRunner::new(Duration::from_secs(30), 0);
        let err = run_interruptible(
            &runner,
            store,
            &turn.id,
            TurnRequest::default(),
            &NoopObserver,
            &CancellationToken::new(),
            Duration::from_millis(10),
            Some(Duration::from_millis(30)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CrewError::Timeout(_)));
    }
}

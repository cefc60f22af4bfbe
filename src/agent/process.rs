//! Subprocess agent runner.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{AgentRunner, SessionObserver, TranscriptEvent, TurnRequest, TurnResult};
use crate::error::{CrewError, Result};

/// Runs agent CLIs with `tokio::process`, one JSON event per stdout line.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

/// Parse one stdout line. Non-JSON lines become plain text events.
pub(crate) fn parse_line(line: &str) -> TranscriptEvent {
    match serde_json::from_str::<Value>(line) {
        Ok(raw @ Value::Object(_)) => {
            let kind = raw
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("message")
                .to_string();
            let text = ["result", "text", "message", "content"]
                .iter()
                .find_map(|key| raw.get(*key).and_then(Value::as_str))
                .map(String::from);
            TranscriptEvent { kind, text, raw }
        }
        _ => TranscriptEvent::text("text", line),
    }
}

/// Session id reported by the agent, under whichever key its CLI uses.
pub(crate) fn session_id_of(event: &TranscriptEvent) -> Option<String> {
    ["session_id", "thread_id", "sessionId"]
        .iter()
        .find_map(|key| event.raw.get(*key).and_then(Value::as_str))
        .map(String::from)
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn run(
        &self,
        request: TurnRequest,
        observer: &dyn SessionObserver,
        cancel: CancellationToken,
    ) -> Result<TurnResult> {
        tracing::debug!(command = %request.command, args = ?request.args, workdir = %request.workdir.display(), "Starting agent");

        let mut child = Command::new(&request.command)
            .args(&request.args)
            .envs(&request.env)
            .current_dir(&request.workdir)
            .stdin(if request.stdin_prompt { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CrewError::Agent(format!("failed to start {}: {}", request.command, e)))?;

        if request.stdin_prompt
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(request.prompt.as_bytes()).await?;
            // Dropping stdin closes it so the agent sees EOF
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CrewError::Agent("agent stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let command = request.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(command = %command, "stderr: {}", line);
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let mut result = TurnResult::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(CrewError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        let event = parse_line(&line);
                        if result.session_id.is_none()
                            && let Some(id) = session_id_of(&event)
                        {
                            observer.session_started(&id);
                            result.session_id = Some(id);
                        }
                        observer.transcript(&event);
                        result.transcript.push(event);
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(CrewError::Cancelled);
            }
            status = child.wait() => status?,
        };
        result.exit_code = status.code().unwrap_or(-1);
        if result.session_id.is_none() {
            result.session_id = request.resume_session.clone();
        }
        observer.session_ended(&result);

        tracing::debug!(command = %request.command, exit_code = result.exit_code, "Agent exited");
        Ok(result)
    }
}

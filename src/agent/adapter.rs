//! Capability-tagged adapters for agent CLIs.
//!
//! The adapter is picked once, when a profile's runtime configuration is
//! built, and then only answers three questions: how to lay out the command
//! line, and whether the CLI accepts a model override or a reasoning level.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Inputs an adapter turns into command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct AdapterArgs<'a> {
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub reasoning: Option<&'a str>,
    pub max_turns: Option<u32>,
    pub resume_session: Option<&'a str>,
    /// Extra arguments from the agent's configuration
    pub extra: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentAdapter {
    /// `claude -p` with stream-json output
    Claude,
    /// `codex exec --json`
    Codex,
    /// Any command that reads the prompt on stdin
    Generic,
}

impl AgentAdapter {
    /// Pick an adapter from an explicit kind, falling back to the agent name.
    pub fn select(kind: Option<&str>, agent_name: &str) -> Self {
        let key = kind.unwrap_or(agent_name).trim().to_ascii_lowercase();
        match key.as_str() {
            "claude" => AgentAdapter::Claude,
            "codex" => AgentAdapter::Codex,
            _ => AgentAdapter::Generic,
        }
    }

    pub fn default_command(&self, agent_name: &str) -> String {
        match self {
            AgentAdapter::Claude => "claude".to_string(),
            AgentAdapter::Codex => "codex".to_string(),
            AgentAdapter::Generic => agent_name.to_string(),
        }
    }

    pub fn supports_model_override(&self) -> bool {
        matches!(self, AgentAdapter::Claude | AgentAdapter::Codex)
    }

    pub fn supports_reasoning_level(&self) -> bool {
        matches!(self, AgentAdapter::Codex)
    }

    /// Whether the prompt goes to stdin rather than the argument list.
    pub fn prompt_on_stdin(&self) -> bool {
        matches!(self, AgentAdapter::Generic)
    }

    pub fn build_args(&self, input: &AdapterArgs<'_>) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self {
            AgentAdapter::Claude => {
                args.extend(["-p", input.prompt, "--output-format", "stream-json", "--verbose"].map(String::from));
                if let Some(max_turns) = input.max_turns {
                    args.push("--max-turns".to_string());
                    args.push(max_turns.to_string());
                }
                if let Some(model) = input.model {
                    args.push("--model".to_string());
                    args.push(model.to_string());
                }
                if let Some(session) = input.resume_session {
                    args.push("--resume".to_string());
                    args.push(session.to_string());
                }
                args.extend(input.extra.iter().cloned());
            }
            AgentAdapter::Codex => {
                args.extend(["exec", "--json"].map(String::from));
                if let Some(model) = input.model {
                    args.push("-m".to_string());
                    args.push(model.to_string());
                }
                if let Some(reasoning) = input.reasoning {
                    args.push("-c".to_string());
                    args.push(format!("model_reasoning_effort={reasoning}"));
                }
                args.extend(input.extra.iter().cloned());
                if let Some(session) = input.resume_session {
                    args.push("resume".to_string());
                    args.push(session.to_string());
                }
                args.push(input.prompt.to_string());
            }
            AgentAdapter::Generic => {
                args.extend(input.extra.iter().cloned());
            }
        }
        args
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentAdapter::Claude => "claude",
            AgentAdapter::Codex => "codex",
            AgentAdapter::Generic => "generic",
        }
    }
}

impl fmt::Display for AgentAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_kind_then_name() {
        assert_eq!(AgentAdapter::select(None, "claude"), AgentAdapter::Claude);
        assert_eq!(AgentAdapter::select(Some("Codex"), "fast"), AgentAdapter::Codex);
        assert_eq!(AgentAdapter::select(None, "aider"), AgentAdapter::Generic);
    }

    #[test]
    fn test_capabilities() {
        assert!(AgentAdapter::Claude.supports_model_override());
        assert!(!AgentAdapter::Claude.supports_reasoning_level());
        assert!(AgentAdapter::Codex.supports_reasoning_level());
        assert!(!AgentAdapter::Generic.supports_model_override());
        assert!(AgentAdapter::Generic.prompt_on_stdin());
    }

    #[test]
    fn test_claude_args() {
        let args = AgentAdapter::Claude.build_args(&AdapterArgs {
            prompt: "do it",
            model: Some("opus"),
            max_turns: Some(5),
            resume_session: Some("abc"),
            ..Default::default()
        });
        assert_eq!(&args[..2], &["-p", "do it"]);
        let joined = args.join(" ");
        assert!(joined.contains("--max-turns 5"));
        assert!(joined.contains("--model opus"));
        assert!(joined.contains("--resume abc"));
    }

    #[test]
    fn test_codex_puts_prompt_last() {
        let extra = vec!["--full-auto".to_string()];
        let args = AgentAdapter::Codex.build_args(&AdapterArgs {
            prompt: "task",
            reasoning: Some("high"),
            extra: &extra,
            ..Default::default()
        });
        assert_eq!(args.first().map(String::as_str), Some("exec"));
        assert_eq!(args.last().map(String::as_str), Some("task"));
        assert!(args.contains(&"model_reasoning_effort=high".to_string()));
        assert!(args.contains(&"--full-auto".to_string()));
    }

    #[test]
    fn test_generic_only_extra_args() {
        let extra = vec!["--yes".to_string()];
        let args = AgentAdapter::Generic.build_args(&AdapterArgs {
            prompt: "ignored",
            model: Some("m"),
            extra: &extra,
            ..Default::default()
        });
        assert_eq!(args, vec!["--yes"]);
    }
}

//! Prompt construction
//!
//! The controller and spawn drivers never format prompt text themselves; they
//! fill a [`PromptContext`] and hand it to a [`PromptBuilder`].

use std::fmt::Write;

use crate::delegation::DelegationConfig;
use crate::domain::{InboxEntry, InboxKind, LoopMessage, SpawnRecord};
use crate::policy::Position;

/// Where a step turn sits in its loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopContext {
    pub loop_name: String,
    pub cycle: u32,
    pub max_cycles: u32,
    pub step_index: usize,
    pub step_count: usize,
    /// 0-based iteration within the step visit
    pub iteration: u32,
    pub turns: u32,
    pub instructions: String,
    pub can_stop: bool,
    pub can_message: bool,
    pub can_pushover: bool,
    pub can_call_supervisor: bool,
    pub standalone: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub profile: String,
    pub position: Position,
    pub role: Option<String>,
    pub can_write: bool,
    /// Profile-level standing instructions
    pub profile_instructions: Option<String>,
    /// Spawn task, for child turns
    pub task: Option<String>,
    pub loop_ctx: Option<LoopContext>,
    pub delegation: Option<DelegationConfig>,
    pub skills: Vec<String>,
    /// Loop messages this step has not seen yet
    pub messages: Vec<LoopMessage>,
    /// Still-running spawns this turn inherited
    pub handoffs: Vec<SpawnRecord>,
    /// Finished spawns not yet reported to this turn's owner
    pub wait_results: Vec<SpawnRecord>,
    /// Parent notes delivered into a resumed child session
    pub inbox: Vec<InboxEntry>,
}

impl PromptContext {
    pub fn new(profile: &str, position: Position) -> Self {
        Self {
            profile: profile.to_string(),
            position,
            role: None,
            can_write: position.can_write(None),
            profile_instructions: None,
            task: None,
            loop_ctx: None,
            delegation: None,
            skills: Vec::new(),
            messages: Vec::new(),
            handoffs: Vec::new(),
            wait_results: Vec::new(),
            inbox: Vec::new(),
        }
    }
}

pub trait PromptBuilder: Send + Sync {
    fn build(&self, ctx: &PromptContext) -> String;
}

/// Markdown-ish plain text prompt.
#[derive(Debug, Clone, Default)]
pub struct PlainPromptBuilder;

fn spawn_line(spawn: &SpawnRecord) -> String {
    let role = spawn.role.as_deref().map(|r| format!("/{r}")).unwrap_or_default();
    let mut line = format!("- {} ({}{}) [{}]: {}", spawn.id, spawn.profile, role, spawn.status, spawn.task);
    if let Some(summary) = &spawn.summary {
        let _ = write!(line, "\n  result: {summary}");
    }
    if let Some(question) = &spawn.question {
        let _ = write!(line, "\n  question: {question}");
    }
    line
}

impl PromptBuilder for PlainPromptBuilder {
    fn build(&self, ctx: &PromptContext) -> String {
        let mut out = String::new();
        let role = ctx.role.as_deref().map(|r| format!(", role {r}")).unwrap_or_default();
        let _ = writeln!(out, "You are {} working as {}{}.", ctx.profile, ctx.position, role);
        if !ctx.can_write {
            let _ = writeln!(out, "You must not modify code in this turn.");
        }
        if let Some(instructions) = &ctx.profile_instructions {
            let _ = writeln!(out, "\n{instructions}");
        }

        if let Some(lp) = &ctx.loop_ctx {
            let max = if lp.max_cycles == 0 { "unbounded".to_string() } else { lp.max_cycles.to_string() };
            let _ = writeln!(
                out,
                "\n## Loop\nLoop {}: cycle {} of {}, step {} of {}, turn {} of {}.",
                lp.loop_name,
                lp.cycle,
                max,
                lp.step_index + 1,
                lp.step_count,
                lp.iteration + 1,
                lp.turns
            );
            if !lp.instructions.is_empty() {
                let _ = writeln!(out, "\n{}", lp.instructions);
            }
            let mut rights = Vec::new();
            if lp.can_stop {
                rights.push("stop the loop (`crewloop loop stop`)");
            }
            if lp.can_message {
                rights.push("post loop messages (`crewloop loop message`)");
            }
            if lp.can_call_supervisor {
                rights.push("call the supervisor (`crewloop loop call-supervisor`)");
            }
            if lp.can_pushover {
                rights.push("send push notifications");
            }
            if !rights.is_empty() {
                let _ = writeln!(out, "\nYou may: {}.", rights.join("; "));
            }
        }

        if let Some(task) = &ctx.task {
            let _ = writeln!(out, "\n## Task\n{task}");
        }

        if !ctx.messages.is_empty() {
            let _ = writeln!(out, "\n## Messages from other steps");
            for m in &ctx.messages {
                let _ = writeln!(out, "- [{}] {} (step {}): {}", m.id, m.author, m.step_index + 1, m.body);
            }
        }

        if let Some(delegation) = ctx.delegation.as_ref().filter(|d| !d.is_empty()) {
            let _ = writeln!(
                out,
                "\n## Delegation\nYou may spawn up to {} concurrent helpers with `crewloop spawn`:",
                delegation.effective_max_parallel()
            );
            for option in &delegation.profiles {
                let position = option.effective_position();
                let roles = if position == Position::Worker && !option.roles.is_empty() {
                    format!(" roles: {}", option.roles.join(", "))
                } else {
                    option.role.as_deref().map(|r| format!(" role: {r}")).unwrap_or_default()
                };
                let _ = writeln!(out, "- {} as {}{}", option.profile, position, roles);
            }
            if let Some(style) = &delegation.style {
                let _ = writeln!(out, "\n{style}");
            }
            let _ = writeln!(out, "Use `crewloop wait-for-spawns` to wait for results.");
        }

        if !ctx.handoffs.is_empty() {
            let _ = writeln!(out, "\n## Spawns handed to you");
            for spawn in &ctx.handoffs {
                let _ = writeln!(out, "{}", spawn_line(spawn));
            }
        }

        if !ctx.wait_results.is_empty() {
            let _ = writeln!(out, "\n## Finished spawns");
            for spawn in &ctx.wait_results {
                let _ = writeln!(out, "{}", spawn_line(spawn));
            }
        }

        if !ctx.inbox.is_empty() {
            let _ = writeln!(out, "\n## From your parent");
            for entry in &ctx.inbox {
                let label = match entry.kind {
                    InboxKind::Message => "message",
                    InboxKind::Reply => "reply",
                };
                let _ = writeln!(out, "- {label}: {}", entry.body);
            }
        }

        if !ctx.skills.is_empty() {
            let _ = writeln!(out, "\n## Skills\n{}", ctx.skills.join(", "));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::DelegationProfile;

    #[test]
    fn test_worker_prompt_with_task() {
        let mut ctx = PromptContext::new("coder", Position::Worker);
        ctx.role = Some("qa".to_string());
        ctx.can_write = false;
        ctx.task = Some("review the parser".to_string());
        let prompt = PlainPromptBuilder.build(&ctx);
        assert!(prompt.contains("coder working as worker, role qa"));
        assert!(prompt.contains("must not modify code"));
        assert!(prompt.contains("review the parser"));
        assert!(!prompt.contains("## Loop"));
    }

    #[test]
    fn test_loop_prompt_lists_messages_and_delegation() {
        let mut ctx = PromptContext::new("planner", Position::Lead);
        ctx.loop_ctx = Some(LoopContext {
            loop_name: "build".to_string(),
            cycle: 2,
            step_index: 0,
            step_count: 3,
            turns: 1,
            can_message: true,
            ..Default::default()
        });
        ctx.messages.push(LoopMessage {
            id: 7,
            run_id: "run-1".to_string(),
            step_index: 2,
            author: "boss".to_string(),
            body: "focus on tests".to_string(),
            created_at: 0,
        });
        ctx.delegation = Some(DelegationConfig {
            profiles: vec![DelegationProfile::new("coder").with_roles(["developer", "qa"])],
            max_parallel: 2,
            style: None,
        });
        let prompt = PlainPromptBuilder.build(&ctx);
        assert!(prompt.contains("cycle 2 of unbounded, step 1 of 3"));
        assert!(prompt.contains("[7] boss (step 3): focus on tests"));
        assert!(prompt.contains("up to 2 concurrent helpers"));
        assert!(prompt.contains("coder as worker roles: developer, qa"));
        assert!(prompt.contains("post loop messages"));
    }

    #[test]
    fn test_finished_spawns_show_results() {
        let mut spawn = SpawnRecord::new("t", "r", "coder", Position::Worker, "add tests");
        spawn.summary = Some("added 4 tests".to_string());
        let mut ctx = PromptContext::new("planner", Position::Lead);
        ctx.wait_results.push(spawn);
        let prompt = PlainPromptBuilder.build(&ctx);
        assert!(prompt.contains("## Finished spawns"));
        assert!(prompt.contains("result: added 4 tests"));
    }
}

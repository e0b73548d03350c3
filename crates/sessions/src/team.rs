//! Team-tool reduction and tool_use / tool_result correlation.
//!
//! Team state is derived from a closed set of tool names appearing in
//! message content. Each `tool_use` is applied optimistically and buffered;
//! when the matching `tool_result` arrives it is correlated (replacing
//! synthetic task ids with real ones). Buffer entries expire after 30 s.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use bc_domain::message::ContentBlock;
use bc_domain::state::{MemberStatus, TeamMember, TeamState, TeamTask};

/// Tool names the team reducer recognizes.
pub const TEAM_TOOLS: &[&str] = &["TeamCreate", "TaskCreate", "TaskUpdate", "SendMessage", "Task"];

const CORRELATION_TTL_SECS: i64 = 30;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Correlation buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    pub inserted_at: DateTime<Utc>,
}

/// Per-session buffer pairing `tool_use` blocks with later `tool_result`s.
#[derive(Debug, Default)]
pub struct CorrelationBuffer {
    entries: Vec<CorrelationEntry>,
}

impl CorrelationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: CorrelationEntry) {
        self.entries.push(entry);
    }

    pub fn take(&mut self, tool_use_id: &str) -> Option<CorrelationEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.tool_use_id == tool_use_id)?;
        Some(self.entries.remove(idx))
    }

    pub fn flush_expired(&mut self, now: DateTime<Utc>) {
        let ttl = Duration::seconds(CORRELATION_TTL_SECS);
        self.entries.retain(|e| now - e.inserted_at < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reduction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scan message content for team tools and fold them into `team`.
/// Returns `None` when nothing changed.
pub fn reduce_team(
    team: &TeamState,
    content: &[ContentBlock],
    buffer: &mut CorrelationBuffer,
    now: DateTime<Utc>,
) -> Option<TeamState> {
    buffer.flush_expired(now);

    let mut next = team.clone();
    for block in content {
        match block {
            ContentBlock::ToolUse { id, name, input } if TEAM_TOOLS.contains(&name.as_str()) => {
                buffer.insert(CorrelationEntry {
                    tool_use_id: id.clone(),
                    tool_name: name.clone(),
                    input: input.clone(),
                    inserted_at: now,
                });
                apply_tool_use(&mut next, name, input, id, now);
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                if let Some(entry) = buffer.take(tool_use_id) {
                    correlate(&mut next, &entry, content);
                }
            }
            _ => {}
        }
    }

    (next != *team).then_some(next)
}

fn apply_tool_use(
    team: &mut TeamState,
    name: &str,
    input: &Value,
    tool_use_id: &str,
    now: DateTime<Utc>,
) {
    match name {
        // `Task` spawns a teammate; both parameters are required.
        "Task" => {
            let (Some(team_name), Some(member_name)) = (
                input.get("team_name").and_then(Value::as_str),
                input.get("name").and_then(Value::as_str),
            ) else {
                return;
            };
            match team
                .members
                .iter_mut()
                .find(|m| m.name == member_name && m.team_name == team_name)
            {
                Some(member) => {
                    member.status = MemberStatus::Active;
                    member.last_active_at = now;
                }
                None => team.members.push(TeamMember {
                    name: member_name.to_string(),
                    team_name: team_name.to_string(),
                    status: MemberStatus::Active,
                    last_active_at: now,
                }),
            }
        }
        "TaskCreate" => {
            team.tasks.push(TeamTask {
                // Synthetic id until the tool_result reveals the real one.
                id: format!("tu-{tool_use_id}"),
                subject: input
                    .get("subject")
                    .or_else(|| input.get("description"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status: "pending".into(),
                owner: input.get("owner").and_then(Value::as_str).map(str::to_string),
            });
        }
        "TaskUpdate" => {
            let Some(task_id) = input
                .get("taskId")
                .or_else(|| input.get("task_id"))
                .and_then(Value::as_str)
            else {
                return;
            };
            if let Some(task) = team.tasks.iter_mut().find(|t| t.id == task_id) {
                if let Some(status) = input.get("status").and_then(Value::as_str) {
                    task.status = status.to_string();
                }
                if let Some(owner) = input.get("owner").and_then(Value::as_str) {
                    task.owner = Some(owner.to_string());
                }
                if let Some(subject) = input.get("subject").and_then(Value::as_str) {
                    task.subject = subject.to_string();
                }
            }
        }
        "SendMessage" => {
            if is_approved_shutdown(input) {
                // The reply approves the teammate's shutdown request, so the
                // most-recently-active member is the one going away.
                if let Some(member) = team
                    .members
                    .iter_mut()
                    .filter(|m| m.status == MemberStatus::Active)
                    .max_by_key(|m| m.last_active_at)
                {
                    member.status = MemberStatus::Shutdown;
                }
            }
        }
        // TeamCreate names the team but carries no member state.
        _ => {}
    }
}

fn is_approved_shutdown(input: &Value) -> bool {
    let message = input.get("message").unwrap_or(input);
    message.get("type").and_then(Value::as_str) == Some("shutdown_response")
        && message.get("approve").and_then(Value::as_bool) == Some(true)
}

fn correlate(team: &mut TeamState, entry: &CorrelationEntry, result_content: &Value) {
    if entry.tool_name != "TaskCreate" {
        // Correlation is idempotent for everything else.
        return;
    }
    let Some(real_id) = extract_task_id(result_content) else {
        return;
    };
    let synthetic = format!("tu-{}", entry.tool_use_id);
    if let Some(task) = team.tasks.iter_mut().find(|t| t.id == synthetic) {
        task.id = real_id;
    }
}

/// Pull the created task id out of a TaskCreate result: either a structured
/// `{"id": …}` object or prose like `Task #4 created`.
fn extract_task_id(content: &Value) -> Option<String> {
    if let Some(id) = content.get("id") {
        return match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
    }
    let text = content.as_str()?;
    let hash = text.find('#')?;
    let digits: String = text[hash + 1..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    (!digits.is_empty()).then_some(digits)
}

//! The pure session state reducer.
//!
//! `(state, message) → state`, no I/O, no locks. Returns `None` when the
//! message left the state untouched so callers can skip persistence and
//! `session_update` broadcasts with a cheap identity check.
//!
//! Cost, turn, duration, and line counters in `result` payloads are per-turn
//! increments and accumulate into the session totals.

use chrono::{DateTime, Utc};

use bc_domain::message::{ResultPayload, UnifiedMessage, UnifiedPayload};
use bc_domain::state::{SessionState, SessionStatus};

use crate::team::{reduce_team, CorrelationBuffer};

pub fn reduce(
    state: &SessionState,
    msg: &UnifiedMessage,
    buffer: &mut CorrelationBuffer,
    now: DateTime<Utc>,
) -> Option<SessionState> {
    let mut next = state.clone();

    match &msg.payload {
        UnifiedPayload::SessionInit(init) => {
            next.model = init.model.clone();
            next.cwd = init.cwd.clone();
            next.permission_mode = init.permission_mode.clone();
            next.tools = init.tools.clone();
            next.mcp_servers = init.mcp_servers.clone();
            next.slash_commands = init.slash_commands.clone();
            next.skills = init.skills.clone();
        }
        UnifiedPayload::StatusChange {
            status,
            permission_mode,
        } => {
            if let Some(status) = status {
                next.is_compacting = *status == SessionStatus::Compacting;
            }
            if let Some(mode) = permission_mode {
                next.permission_mode = Some(mode.clone());
            }
        }
        UnifiedPayload::Result(result) => apply_result(&mut next, result),
        UnifiedPayload::ConfigurationChange {
            model,
            permission_mode,
        } => {
            if let Some(model) = model {
                next.model = Some(model.clone());
            }
            if let Some(mode) = permission_mode {
                next.permission_mode = Some(mode.clone());
            }
        }
        _ => {}
    }

    // Team tools can appear in any message's content.
    if let Some(team) = reduce_team(&next.team, &msg.content, buffer, now) {
        next.team = team;
    }

    (next != *state).then_some(next)
}

fn apply_result(state: &mut SessionState, result: &ResultPayload) {
    state.total_cost_usd += result.total_cost_usd;
    state.num_turns += result.num_turns;
    state.total_duration_ms += result.duration_ms;
    state.total_lines_added += result.lines_added;
    state.total_lines_removed += result.lines_removed;

    // Last writer wins across usage entries.
    for usage in &result.usage {
        if usage.context_window == 0 {
            continue;
        }
        let used = usage.input_tokens + usage.output_tokens;
        let percent =
            ((used as f64 / usage.context_window as f64) * 100.0).round().min(100.0) as u8;
        state.context_used_percent = Some(percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::message::{
        ContentBlock, ModelUsage, ResultStatus, Role, SessionInitPayload,
    };

    fn setup() -> (SessionState, CorrelationBuffer) {
        (SessionState::new("s1"), CorrelationBuffer::new())
    }

    fn result_msg(result: ResultPayload) -> UnifiedMessage {
        UnifiedMessage::new(UnifiedPayload::Result(result), Role::System)
    }

    #[test]
    fn session_init_overwrites_identity_fields() {
        let (state, mut buffer) = setup();
        let msg = UnifiedMessage::new(
            UnifiedPayload::SessionInit(SessionInitPayload {
                session_id: "s1".into(),
                model: Some("sonnet".into()),
                cwd: Some("/work".into()),
                tools: vec!["Bash".into()],
                slash_commands: vec!["/compact".into()],
                ..Default::default()
            }),
            Role::System,
        );
        let next = reduce(&state, &msg, &mut buffer, Utc::now()).unwrap();
        assert_eq!(next.model.as_deref(), Some("sonnet"));
        assert_eq!(next.cwd.as_deref(), Some("/work"));
        assert_eq!(next.slash_commands, vec!["/compact"]);
        // Counters untouched.
        assert_eq!(next.num_turns, 0);
    }

    #[test]
    fn results_accumulate() {
        let (state, mut buffer) = setup();
        let now = Utc::now();

        let first = ResultPayload {
            status: ResultStatus::Success,
            is_error: false,
            error: None,
            total_cost_usd: 0.10,
            num_turns: 1,
            duration_ms: 1200,
            lines_added: 5,
            lines_removed: 1,
            usage: vec![],
        };
        let state = reduce(&state, &result_msg(first.clone()), &mut buffer, now).unwrap();
        let state = reduce(&state, &result_msg(first), &mut buffer, now).unwrap();
        assert!((state.total_cost_usd - 0.20).abs() < 1e-9);
        assert_eq!(state.num_turns, 2);
        assert_eq!(state.total_duration_ms, 2400);
        assert_eq!(state.total_lines_added, 10);
    }

    #[test]
    fn context_percent_last_writer_wins() {
        let (state, mut buffer) = setup();
        let result = ResultPayload {
            status: ResultStatus::Success,
            is_error: false,
            error: None,
            total_cost_usd: 0.0,
            num_turns: 1,
            duration_ms: 0,
            lines_added: 0,
            lines_removed: 0,
            usage: vec![
                ModelUsage {
                    model: "small".into(),
                    input_tokens: 10,
                    output_tokens: 10,
                    context_window: 100,
                },
                ModelUsage {
                    model: "big".into(),
                    input_tokens: 50_000,
                    output_tokens: 10_000,
                    context_window: 200_000,
                },
            ],
        };
        let next = reduce(&state, &result_msg(result), &mut buffer, Utc::now()).unwrap();
        // 60k / 200k = 30%, not the 20% of the first entry.
        assert_eq!(next.context_used_percent, Some(30));
    }

    #[test]
    fn status_change_sets_compacting() {
        let (state, mut buffer) = setup();
        let msg = UnifiedMessage::new(
            UnifiedPayload::StatusChange {
                status: Some(SessionStatus::Compacting),
                permission_mode: None,
            },
            Role::System,
        );
        let next = reduce(&state, &msg, &mut buffer, Utc::now()).unwrap();
        assert!(next.is_compacting);

        let msg = UnifiedMessage::new(
            UnifiedPayload::StatusChange {
                status: Some(SessionStatus::Idle),
                permission_mode: Some("acceptEdits".into()),
            },
            Role::System,
        );
        let next = reduce(&next, &msg, &mut buffer, Utc::now()).unwrap();
        assert!(!next.is_compacting);
        assert_eq!(next.permission_mode.as_deref(), Some("acceptEdits"));
    }

    #[test]
    fn unchanged_messages_return_none() {
        let (state, mut buffer) = setup();
        let now = Utc::now();

        // A user message with no team tools changes nothing.
        assert!(reduce(&state, &UnifiedMessage::user("hi"), &mut buffer, now).is_none());

        // A configuration change with no fields set changes nothing.
        let noop = UnifiedMessage::configuration_change(None, None);
        assert!(reduce(&state, &noop, &mut buffer, now).is_none());
    }

    #[test]
    fn team_tools_in_assistant_content_are_reduced() {
        let (state, mut buffer) = setup();
        let mut msg = UnifiedMessage::new(
            UnifiedPayload::StreamEvent {
                event: serde_json::Value::Null,
            },
            Role::Assistant,
        );
        msg.content = vec![ContentBlock::ToolUse {
            id: "tu1".into(),
            name: "Task".into(),
            input: serde_json::json!({"team_name": "alpha", "name": "agent1"}),
        }];
        let next = reduce(&state, &msg, &mut buffer, Utc::now()).unwrap();
        assert_eq!(next.team.members.len(), 1);
    }
}

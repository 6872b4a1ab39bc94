//! Auto-resubmit decision engine.
//!
//! After the UI mutates the conversation history (typically by answering a
//! tool approval), the caller re-evaluates [`should_resubmit`] to decide
//! whether the client must autonomously resend state to the backend. The
//! function is pure and total: anything unexpected maps to `false`, because
//! an accidental `true` risks an infinite resubmission loop.

use crate::protocol::{MessagePart, Role, ToolPart, ToolState, UiMessage};

/// Decide whether the client must resend the conversation to the backend.
///
/// Rules, in priority order — the first matching rule decides:
/// 1. No last message, or its role is not assistant → `false`.
/// 2. The last message already has rendered text → `false` (the backend has
///    responded; resending would loop).
/// 3. A frontend-executed tool has its output ready → `true` (it must be
///    flushed to the backend).
/// 4. No confirmation-style tool has been responded to → `false`.
/// 5. Some confirmation-style tool is still awaiting the user → `false`.
/// 6. Any tool in the message has already resolved or carries an error →
///    `false` (the backend already handled this turn).
/// 7. Otherwise `true`: this approval response is ready for its first flush.
pub fn should_resubmit(messages: &[UiMessage]) -> bool {
    let Some(last) = messages.last() else {
        return false;
    };
    if last.role != Role::Assistant {
        return false;
    }

    if last
        .parts
        .iter()
        .any(|part| matches!(part, MessagePart::Text { text } if !text.is_empty()))
    {
        return false;
    }

    let tools: Vec<&ToolPart> = last
        .parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Tool(tool) => Some(tool),
            _ => None,
        })
        .collect();

    if tools
        .iter()
        .any(|t| !t.provider_executed && t.state == ToolState::OutputAvailable)
    {
        return true;
    }

    let confirmations: Vec<&&ToolPart> =
        tools.iter().filter(|t| t.requires_confirmation).collect();
    if !confirmations
        .iter()
        .any(|t| matches!(t.state, ToolState::ApprovalResponded { .. }))
    {
        return false;
    }
    if confirmations
        .iter()
        .any(|t| t.state == ToolState::ApprovalRequested)
    {
        return false;
    }

    if tools
        .iter()
        .any(|t| t.state.is_resolved() || t.error.is_some())
    {
        return false;
    }

    true
}

/// Record the user's answer to an approval request in the history.
///
/// Flips the matching tool part of the last message from
/// `ApprovalRequested` to `ApprovalResponded`. Returns whether anything
/// changed; callers re-run [`should_resubmit`] afterwards.
pub fn respond_to_approval(messages: &mut [UiMessage], tool_call_id: &str, approved: bool) -> bool {
    let Some(last) = messages.last_mut() else {
        return false;
    };
    for part in &mut last.parts {
        if let MessagePart::Tool(tool) = part {
            if tool.tool_call_id == tool_call_id && tool.state == ToolState::ApprovalRequested {
                tool.state = ToolState::ApprovalResponded { approved };
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(id: &str, confirmation: bool, state: ToolState) -> MessagePart {
        MessagePart::Tool(ToolPart {
            tool_call_id: id.to_string(),
            tool_name: "lookup".to_string(),
            requires_confirmation: confirmation,
            provider_executed: true,
            state,
            input: None,
            output: None,
            error: None,
        })
    }

    fn assistant(parts: Vec<MessagePart>) -> UiMessage {
        UiMessage {
            id: "a1".to_string(),
            role: Role::Assistant,
            parts,
        }
    }

    #[test]
    fn empty_history_never_resubmits() {
        assert!(!should_resubmit(&[]));
    }

    #[test]
    fn user_tail_never_resubmits() {
        let messages = vec![UiMessage {
            id: "u1".into(),
            role: Role::User,
            parts: vec![MessagePart::Text { text: "hi".into() }],
        }];
        assert!(!should_resubmit(&messages));
    }

    #[test]
    fn rendered_text_blocks_resubmission() {
        let messages = vec![assistant(vec![
            MessagePart::Text { text: "done".into() },
            tool("c1", true, ToolState::ApprovalResponded { approved: true }),
        ])];
        assert!(!should_resubmit(&messages));
    }

    #[test]
    fn frontend_tool_output_forces_flush() {
        let mut part = tool("c1", false, ToolState::OutputAvailable);
        if let MessagePart::Tool(t) = &mut part {
            t.provider_executed = false;
        }
        let messages = vec![assistant(vec![part])];
        assert!(should_resubmit(&messages));
    }

    #[test]
    fn responded_approval_fires_exactly_once() {
        // requested → false
        let mut messages = vec![assistant(vec![tool(
            "c1",
            true,
            ToolState::ApprovalRequested,
        )])];
        assert!(!should_resubmit(&messages));

        // responded → true
        assert!(respond_to_approval(&mut messages, "c1", true));
        assert!(should_resubmit(&messages));

        // resolved → false again
        if let MessagePart::Tool(t) = &mut messages[0].parts[0] {
            t.state = ToolState::OutputAvailable;
        }
        assert!(!should_resubmit(&messages));
    }

    #[test]
    fn second_pending_approval_holds_the_flush() {
        let mut messages = vec![assistant(vec![
            tool("call-1", true, ToolState::ApprovalRequested),
            tool("call-2", true, ToolState::ApprovalRequested),
        ])];
        assert!(respond_to_approval(&mut messages, "call-1", true));
        // call-2 still pending → wait for the user
        assert!(!should_resubmit(&messages));

        assert!(respond_to_approval(&mut messages, "call-2", false));
        assert!(should_resubmit(&messages));
    }

    #[test]
    fn sibling_resolution_blocks_resubmission() {
        let messages = vec![assistant(vec![
            tool("c1", true, ToolState::ApprovalResponded { approved: true }),
            tool("c2", false, ToolState::OutputError),
        ])];
        assert!(!should_resubmit(&messages));
    }

    #[test]
    fn tool_error_blocks_resubmission() {
        let mut erroring = tool("c2", false, ToolState::InputAvailable);
        if let MessagePart::Tool(t) = &mut erroring {
            t.error = Some("boom".into());
        }
        let messages = vec![assistant(vec![
            tool("c1", true, ToolState::ApprovalResponded { approved: true }),
            erroring,
        ])];
        assert!(!should_resubmit(&messages));
    }

    #[test]
    fn respond_ignores_unknown_call_id() {
        let mut messages = vec![assistant(vec![tool(
            "c1",
            true,
            ToolState::ApprovalRequested,
        )])];
        assert!(!respond_to_approval(&mut messages, "nope", true));
        assert!(!should_resubmit(&messages));
    }
}

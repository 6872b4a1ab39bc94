//! Decision-engine transition tables for the approval workflow.

use agentlink::protocol::{MessagePart, Role, ToolPart, ToolState, UiMessage};
use agentlink::{respond_to_approval, should_resubmit};

fn confirmation_tool(id: &str, state: ToolState) -> MessagePart {
    MessagePart::Tool(ToolPart {
        tool_call_id: id.to_string(),
        tool_name: "askForConfirmation".to_string(),
        requires_confirmation: true,
        provider_executed: true,
        state,
        input: None,
        output: None,
        error: None,
    })
}

fn plain_tool(id: &str, state: ToolState) -> MessagePart {
    MessagePart::Tool(ToolPart {
        tool_call_id: id.to_string(),
        tool_name: "getWeather".to_string(),
        requires_confirmation: false,
        provider_executed: true,
        state,
        input: None,
        output: None,
        error: None,
    })
}

fn history(parts: Vec<MessagePart>) -> Vec<UiMessage> {
    vec![
        UiMessage {
            id: "u1".into(),
            role: Role::User,
            parts: vec![MessagePart::Text {
                text: "please".into(),
            }],
        },
        UiMessage {
            id: "a1".into(),
            role: Role::Assistant,
            parts,
        },
    ]
}

#[test]
fn user_tail_is_always_false() {
    let messages = vec![UiMessage {
        id: "u1".into(),
        role: Role::User,
        parts: vec![MessagePart::Text { text: "hi".into() }],
    }];
    assert!(!should_resubmit(&messages));
}

#[test]
fn fires_exactly_once_across_the_approval_lifecycle() {
    // requested
    let mut messages = history(vec![confirmation_tool("c1", ToolState::ApprovalRequested)]);
    assert!(!should_resubmit(&messages));

    // responded, no sibling resolved
    assert!(respond_to_approval(&mut messages, "c1", true));
    assert!(should_resubmit(&messages));

    // the same tool resolves
    if let Some(last) = messages.last_mut() {
        if let MessagePart::Tool(tool) = &mut last.parts[0] {
            tool.state = ToolState::OutputAvailable;
        }
    }
    assert!(!should_resubmit(&messages));
}

#[test]
fn text_part_appearing_stops_resubmission() {
    let mut messages = history(vec![confirmation_tool(
        "c1",
        ToolState::ApprovalResponded { approved: true },
    )]);
    assert!(should_resubmit(&messages));

    if let Some(last) = messages.last_mut() {
        last.parts.push(MessagePart::Text {
            text: "Understood, running the tool.".into(),
        });
    }
    assert!(!should_resubmit(&messages));
}

#[test]
fn two_sequential_approvals_in_one_message() {
    let mut messages = history(vec![
        confirmation_tool("call-1", ToolState::ApprovalRequested),
        confirmation_tool("call-2", ToolState::ApprovalRequested),
    ]);

    // approving call-1 while call-2 is still requested holds the flush
    assert!(respond_to_approval(&mut messages, "call-1", true));
    assert!(!should_resubmit(&messages));

    // once call-2 is also responded (even denied) the flush fires
    assert!(respond_to_approval(&mut messages, "call-2", false));
    assert!(should_resubmit(&messages));
}

#[test]
fn resolved_sibling_means_backend_already_handled_the_turn() {
    let messages = history(vec![
        confirmation_tool("c1", ToolState::ApprovalResponded { approved: true }),
        plain_tool("c2", ToolState::OutputAvailable),
    ]);
    assert!(!should_resubmit(&messages));
}

#[test]
fn frontend_executed_output_takes_priority() {
    let mut part = plain_tool("c1", ToolState::OutputAvailable);
    if let MessagePart::Tool(tool) = &mut part {
        tool.provider_executed = false;
    }
    // even with a still-requested confirmation sibling, the local output
    // must be flushed
    let messages = history(vec![
        part,
        confirmation_tool("c2", ToolState::ApprovalRequested),
    ]);
    assert!(should_resubmit(&messages));
}

#[test]
fn streaming_tool_input_alone_never_resubmits() {
    let messages = history(vec![plain_tool("c1", ToolState::InputStreaming)]);
    assert!(!should_resubmit(&messages));
}

#[test]
fn repeated_evaluation_is_stable() {
    let messages = history(vec![confirmation_tool(
        "c1",
        ToolState::ApprovalResponded { approved: false },
    )]);
    // the function is pure; evaluating twice must not change the answer
    assert!(should_resubmit(&messages));
    assert!(should_resubmit(&messages));
}

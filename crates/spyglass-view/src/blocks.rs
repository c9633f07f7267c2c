//! Render block assembly.
//!
//! A pure projection of interpreter state into one ordered block list.
//! The assembler holds no state of its own: it replays the interpreter's
//! timeline, and tool blocks read the call's current registry entry, so a
//! result that arrived after the start enriches the block in place.

use serde_json::Value;

use spyglass_stream::ErrorSource;

use crate::interpreter::{RunInterpreter, TimelineEntry, ToolCallStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum RenderBlock {
    PhaseHeader {
        node_id: String,
        title: String,
    },
    Tool {
        name: String,
        arguments: Option<Value>,
        status: ToolCallStatus,
        result: Option<Value>,
    },
    Content {
        text: String,
    },
    Log {
        message: String,
    },
    Result {
        result: Option<Value>,
    },
    Error {
        message: String,
        source: ErrorSource,
    },
}

#[must_use]
pub fn assemble_blocks(state: &RunInterpreter) -> Vec<RenderBlock> {
    state
        .timeline()
        .iter()
        .map(|entry| match entry {
            TimelineEntry::PhaseStart { node_index } => {
                let node = &state.nodes()[*node_index];
                RenderBlock::PhaseHeader {
                    node_id: node.id.clone(),
                    title: node.name.clone().unwrap_or_else(|| node.id.clone()),
                }
            }
            TimelineEntry::Tool { call_index } => {
                let call = &state.tool_calls()[*call_index];
                RenderBlock::Tool {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    status: call.status,
                    result: call.result.clone(),
                }
            }
            TimelineEntry::Content { text } => RenderBlock::Content { text: text.clone() },
            TimelineEntry::Log { message } => RenderBlock::Log {
                message: message.clone(),
            },
            TimelineEntry::Result => RenderBlock::Result {
                result: state.final_result().cloned(),
            },
            TimelineEntry::Error { message, source } => RenderBlock::Error {
                message: message.clone(),
                source: *source,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spyglass_stream::parse_run_event;

    fn state_from(payloads: &[Value]) -> RunInterpreter {
        let mut interpreter = RunInterpreter::new();
        for payload in payloads {
            interpreter.apply(&parse_run_event(payload).expect("event"));
        }
        interpreter
    }

    #[test]
    fn blocks_follow_arrival_order() {
        let state = state_from(&[
            json!({"type":"node_start","node_id":"n1","name":"Gather"}),
            json!({"type":"tool_start","name":"search","arguments":{"q":"x"}}),
            json!({"type":"content","text":"found it"}),
            json!({"type":"done","result":{"ok":true}}),
        ]);

        let blocks = assemble_blocks(&state);
        assert_eq!(blocks.len(), 4);
        assert_eq!(
            blocks[0],
            RenderBlock::PhaseHeader {
                node_id: "n1".to_string(),
                title: "Gather".to_string(),
            }
        );
        assert!(matches!(&blocks[1], RenderBlock::Tool { name, .. } if name == "search"));
        assert_eq!(
            blocks[2],
            RenderBlock::Content {
                text: "found it".to_string()
            }
        );
        assert_eq!(
            blocks[3],
            RenderBlock::Result {
                result: Some(json!({"ok":true}))
            }
        );
    }

    #[test]
    fn tool_block_reflects_the_result_that_arrived_later() {
        let state = state_from(&[
            json!({"type":"tool_start","name":"search"}),
            json!({"type":"content","text":"waiting"}),
            json!({"type":"tool_result","name":"search","output":{"hits":5}}),
        ]);

        let blocks = assemble_blocks(&state);
        assert_eq!(
            blocks[0],
            RenderBlock::Tool {
                name: "search".to_string(),
                arguments: None,
                status: ToolCallStatus::Done,
                result: Some(json!({"hits":5})),
            }
        );
    }

    #[test]
    fn discussion_events_produce_no_blocks() {
        let state = state_from(&[
            json!({"type":"question","speaker":"mod","text":"views?"}),
            json!({"type":"answer","speaker":"risk","text":"wary"}),
            json!({"type":"content","text":"main"}),
        ]);

        let blocks = assemble_blocks(&state);
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0],
            RenderBlock::Content {
                text: "main".to_string()
            }
        );
    }

    #[test]
    fn assembly_is_stable_across_repeated_calls() {
        let state = state_from(&[
            json!({"type":"node_start","node_id":"n1"}),
            json!({"type":"node_error","node_id":"n1","message":"boom"}),
            json!({"type":"error","message":"run failed"}),
        ]);

        let first = assemble_blocks(&state);
        let second = assemble_blocks(&state);
        assert_eq!(first, second);
        assert!(matches!(
            first.last(),
            Some(RenderBlock::Error {
                source: ErrorSource::Job,
                ..
            })
        ));
    }
}

//! Run event model.
//!
//! The executor emits a log of `{"type": "...", ...}` JSON objects. The
//! known tags form a closed union; anything with an unrecognized tag is
//! carried as [`RunEvent::Unknown`] so new backend event types never break
//! an older observer. Only payloads that are not an event at all (non-object,
//! missing type) fail to parse, and the transports drop those with a warning.

use serde_json::{Map, Value};

/// Where an `error` event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Reported by the job itself through the event log.
    Job,
    /// Synthesized locally when a transport failed mid-run.
    Transport,
}

/// Sub-type of a panel discussion event. Discussion events form their own
/// ordered side thread and never interleave with the main run sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscussionKind {
    RoundStart,
    Question,
    Answer,
    Recruitment,
    RecruitmentResult,
    DebateDraft,
    DebateCritique,
    DebateFinal,
}

impl DiscussionKind {
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "round_start" => Some(Self::RoundStart),
            "question" => Some(Self::Question),
            "answer" => Some(Self::Answer),
            "recruitment" => Some(Self::Recruitment),
            "recruitment_result" => Some(Self::RecruitmentResult),
            "debate_draft" => Some(Self::DebateDraft),
            "debate_critique" => Some(Self::DebateCritique),
            "debate_final" => Some(Self::DebateFinal),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundStart => "round_start",
            Self::Question => "question",
            Self::Answer => "answer",
            Self::Recruitment => "recruitment",
            Self::RecruitmentResult => "recruitment_result",
            Self::DebateDraft => "debate_draft",
            Self::DebateCritique => "debate_critique",
            Self::DebateFinal => "debate_final",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStart {
        run_id: Option<String>,
    },
    NodeStart {
        node_id: String,
        name: Option<String>,
    },
    NodeDone {
        node_id: String,
        content: Option<String>,
    },
    NodeError {
        node_id: String,
        message: Option<String>,
    },
    NodeSkipped {
        node_id: String,
        reason: Option<String>,
    },
    ToolStart {
        call_id: Option<String>,
        name: String,
        arguments: Option<Value>,
    },
    ToolResult {
        call_id: Option<String>,
        name: String,
        output: Option<Value>,
    },
    Content {
        text: String,
    },
    SpecialistStart {
        key: String,
        display_name: Option<String>,
    },
    SpecialistComplete {
        key: String,
        report: Option<Value>,
        duration_ms: Option<u64>,
    },
    SpecialistError {
        key: String,
        message: Option<String>,
    },
    Discussion {
        kind: DiscussionKind,
        speaker: Option<String>,
        text: Option<String>,
        payload: Value,
    },
    Paused {
        node_id: String,
        prompt: Option<String>,
    },
    Done {
        result: Option<Value>,
    },
    Error {
        message: String,
        source: ErrorSource,
    },
    Unknown {
        event_type: String,
        payload: Value,
    },
}

impl RunEvent {
    /// Synthetic local error for a transport that died mid-run. Distinct
    /// from a job-reported error so display can label it honestly.
    #[must_use]
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            source: ErrorSource::Transport,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// One entry of the durable log, as the poll transport sees it. Push
/// delivery carries bare [`RunEvent`]s; arrival order is the order.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedRunEvent {
    pub seq: i64,
    pub event: RunEvent,
}

/// Parse one wire object into an event. `None` means the payload is not
/// an event at all; an unrecognized tag still parses, as `Unknown`.
#[must_use]
pub fn parse_run_event(value: &Value) -> Option<RunEvent> {
    let object = value.as_object()?;
    let event_type = normalized_string(object.get("type"))?;

    if let Some(kind) = DiscussionKind::from_tag(event_type.as_str()) {
        return Some(RunEvent::Discussion {
            kind,
            speaker: field_string(object, &["speaker", "specialist", "speaker_key"]),
            text: field_string(object, &["text", "content", "message"]),
            payload: value.clone(),
        });
    }

    let event = match event_type.as_str() {
        "run_start" => RunEvent::RunStart {
            run_id: field_string(object, &["run_id", "runId"]),
        },
        "node_start" => RunEvent::NodeStart {
            node_id: field_string(object, &["node_id", "nodeId"])?,
            name: field_string(object, &["name", "node_name", "nodeName"]),
        },
        "node_done" => RunEvent::NodeDone {
            node_id: field_string(object, &["node_id", "nodeId"])?,
            content: field_string(object, &["content", "text"]),
        },
        "node_error" => RunEvent::NodeError {
            node_id: field_string(object, &["node_id", "nodeId"])?,
            message: field_string(object, &["message", "error"]),
        },
        "node_skipped" => RunEvent::NodeSkipped {
            node_id: field_string(object, &["node_id", "nodeId"])?,
            reason: field_string(object, &["reason", "message"]),
        },
        "tool_start" => RunEvent::ToolStart {
            call_id: field_string(object, &["call_id", "callId", "id"]),
            name: field_string(object, &["name", "tool", "tool_name", "toolName"])?,
            arguments: field_value(object, &["arguments", "args", "input"]),
        },
        "tool_result" => RunEvent::ToolResult {
            call_id: field_string(object, &["call_id", "callId", "id"]),
            name: field_string(object, &["name", "tool", "tool_name", "toolName"])?,
            output: field_value(object, &["output", "result", "content"]),
        },
        "content" => RunEvent::Content {
            text: field_string(object, &["text", "content"])?,
        },
        "specialist_start" => RunEvent::SpecialistStart {
            key: field_string(object, &["key", "specialist", "specialist_key", "specialistKey"])?,
            display_name: field_string(object, &["display_name", "displayName", "name"]),
        },
        "specialist_complete" => RunEvent::SpecialistComplete {
            key: field_string(object, &["key", "specialist", "specialist_key", "specialistKey"])?,
            report: field_value(object, &["report", "result"]),
            duration_ms: field_u64(object, &["duration_ms", "durationMs"]),
        },
        "specialist_error" => RunEvent::SpecialistError {
            key: field_string(object, &["key", "specialist", "specialist_key", "specialistKey"])?,
            message: field_string(object, &["message", "error"]),
        },
        "paused" => RunEvent::Paused {
            node_id: field_string(object, &["node_id", "nodeId"])?,
            prompt: field_string(object, &["prompt", "message", "question"]),
        },
        "done" => RunEvent::Done {
            result: field_value(object, &["result", "output"]),
        },
        "error" => RunEvent::Error {
            message: field_string(object, &["message", "error"])
                .unwrap_or_else(|| "job_error".to_string()),
            source: ErrorSource::Job,
        },
        _ => RunEvent::Unknown {
            event_type,
            payload: value.clone(),
        },
    };
    Some(event)
}

/// Parse one log entry from the poll page. The sequence number is
/// authoritative even when the payload is not an event.
#[must_use]
pub fn parse_sequenced(raw: &spyglass_api::RawRunEvent) -> Option<SequencedRunEvent> {
    parse_run_event(&raw.payload).map(|event| SequencedRunEvent {
        seq: raw.seq,
        event,
    })
}

fn normalized_string(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn field_string(object: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| normalized_string(object.get(*name)))
}

fn field_value(object: &Map<String, Value>, names: &[&str]) -> Option<Value> {
    names
        .iter()
        .find_map(|name| object.get(*name))
        .filter(|value| !value.is_null())
        .cloned()
}

fn field_u64(object: &Map<String, Value>, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|name| object.get(*name)?.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_node_lifecycle_tags_with_both_field_styles() {
        let snake = parse_run_event(&json!({"type":"node_start","node_id":"n1","name":"Gather"}));
        assert_eq!(
            snake,
            Some(RunEvent::NodeStart {
                node_id: "n1".to_string(),
                name: Some("Gather".to_string()),
            })
        );

        let camel = parse_run_event(&json!({"type":"node_done","nodeId":"n1","content":"ok"}));
        assert_eq!(
            camel,
            Some(RunEvent::NodeDone {
                node_id: "n1".to_string(),
                content: Some("ok".to_string()),
            })
        );
    }

    #[test]
    fn parses_tool_pair_and_keeps_raw_arguments() {
        let start = parse_run_event(&json!({
            "type": "tool_start",
            "name": "web_search",
            "arguments": {"query": "q3 revenue"},
        }));
        assert_eq!(
            start,
            Some(RunEvent::ToolStart {
                call_id: None,
                name: "web_search".to_string(),
                arguments: Some(json!({"query": "q3 revenue"})),
            })
        );

        let result = parse_run_event(&json!({
            "type": "tool_result",
            "toolName": "web_search",
            "output": {"hits": 3},
        }));
        assert_eq!(
            result,
            Some(RunEvent::ToolResult {
                call_id: None,
                name: "web_search".to_string(),
                output: Some(json!({"hits": 3})),
            })
        );
    }

    #[test]
    fn discussion_tags_are_diverted_into_the_side_thread_shape() {
        for tag in [
            "round_start",
            "question",
            "answer",
            "recruitment",
            "recruitment_result",
            "debate_draft",
            "debate_critique",
            "debate_final",
        ] {
            let parsed = parse_run_event(&json!({"type": tag, "speaker": "risk", "text": "hm"}));
            match parsed {
                Some(RunEvent::Discussion { kind, speaker, .. }) => {
                    assert_eq!(kind.as_str(), tag);
                    assert_eq!(speaker.as_deref(), Some("risk"));
                }
                other => unreachable!("{tag} should parse as discussion, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_tag_is_carried_not_dropped() {
        let payload = json!({"type": "telemetry_v2", "cpu": 0.4});
        let parsed = parse_run_event(&payload);
        assert_eq!(
            parsed,
            Some(RunEvent::Unknown {
                event_type: "telemetry_v2".to_string(),
                payload,
            })
        );
    }

    #[test]
    fn non_events_do_not_parse() {
        assert_eq!(parse_run_event(&json!("just text")), None);
        assert_eq!(parse_run_event(&json!([1, 2, 3])), None);
        assert_eq!(parse_run_event(&json!({"no_type": true})), None);
        assert_eq!(parse_run_event(&json!({"type": "   "})), None);
        // A known tag missing its required field is not an event either.
        assert_eq!(parse_run_event(&json!({"type": "node_start"})), None);
    }

    #[test]
    fn wire_error_is_job_sourced_and_synthetic_is_transport_sourced() {
        let wire = parse_run_event(&json!({"type": "error", "message": "budget exceeded"}));
        assert_eq!(
            wire,
            Some(RunEvent::Error {
                message: "budget exceeded".to_string(),
                source: ErrorSource::Job,
            })
        );

        let local = RunEvent::transport_error("channel closed");
        assert_eq!(
            local,
            RunEvent::Error {
                message: "channel closed".to_string(),
                source: ErrorSource::Transport,
            }
        );
    }

    #[test]
    fn terminal_classification() {
        assert!(RunEvent::Done { result: None }.is_terminal());
        assert!(RunEvent::transport_error("x").is_terminal());
        assert!(
            !RunEvent::Content {
                text: "hello".to_string()
            }
            .is_terminal()
        );
    }
}

//! Deterministic fold of a run's event sequence into renderable state.
//!
//! The interpreter is a pure reducer: same ordered events in, same derived
//! state out, whether fed in one pass or across any resumption boundary.
//! Statuses only move forward; a straggler event can never regress a node,
//! tool call, or specialist that already reached a terminal state.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use spyglass_stream::{DiscussionKind, ErrorSource, EventSink, RunEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Running,
    Done,
    Error,
    Skipped,
}

impl NodeStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Done | Self::Error | Self::Skipped => 2,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub id: String,
    pub name: Option<String>,
    pub status: NodeStatus,
    pub content: Option<String>,
    /// Indices into the run's tool-call registry, in start order.
    pub tool_calls: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallState {
    pub call_id: Option<String>,
    pub name: String,
    pub arguments: Option<Value>,
    pub result: Option<Value>,
    pub status: ToolCallStatus,
    /// Node the call was attributed to when it started, if one was active.
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialistStatus {
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecialistState {
    pub key: String,
    pub display_name: Option<String>,
    pub status: SpecialistStatus,
    pub report: Option<Value>,
    pub duration_ms: Option<u64>,
}

/// One entry of the discussion side thread, kept apart from the main
/// sequence in its own arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscussionEntry {
    pub kind: DiscussionKind,
    pub speaker: Option<String>,
    pub text: Option<String>,
    pub payload: Value,
}

/// Ordered record of what happened, replayed by the block assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    PhaseStart { node_index: usize },
    Tool { call_index: usize },
    Content { text: String },
    Log { message: String },
    Result,
    Error { message: String, source: ErrorSource },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunInterpreter {
    run_id: Option<String>,
    nodes: Vec<NodeState>,
    node_index: BTreeMap<String, usize>,
    tool_calls: Vec<ToolCallState>,
    specialists: Vec<SpecialistState>,
    specialist_index: BTreeMap<String, usize>,
    discussion: Vec<DiscussionEntry>,
    timeline: Vec<TimelineEntry>,
    awaiting_input: Option<(String, Option<String>)>,
    final_result: Option<Value>,
    terminal_error: Option<(String, ErrorSource)>,
    unknown_events: usize,
}

impl RunInterpreter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeState] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.node_index.get(node_id).map(|index| &self.nodes[*index])
    }

    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCallState] {
        &self.tool_calls
    }

    #[must_use]
    pub fn specialists(&self) -> &[SpecialistState] {
        &self.specialists
    }

    #[must_use]
    pub fn specialist(&self, key: &str) -> Option<&SpecialistState> {
        self.specialist_index
            .get(key)
            .map(|index| &self.specialists[*index])
    }

    #[must_use]
    pub fn discussion(&self) -> &[DiscussionEntry] {
        &self.discussion
    }

    #[must_use]
    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    /// `(node_id, prompt)` of a pause the run is currently waiting on.
    #[must_use]
    pub fn awaiting_input(&self) -> Option<(&str, Option<&str>)> {
        self.awaiting_input
            .as_ref()
            .map(|(node_id, prompt)| (node_id.as_str(), prompt.as_deref()))
    }

    #[must_use]
    pub fn final_result(&self) -> Option<&Value> {
        self.final_result.as_ref()
    }

    #[must_use]
    pub fn terminal_error(&self) -> Option<(&str, ErrorSource)> {
        self.terminal_error
            .as_ref()
            .map(|(message, source)| (message.as_str(), *source))
    }

    #[must_use]
    pub fn unknown_events(&self) -> usize {
        self.unknown_events
    }

    /// Fold one event. Infallible: unknown events are counted, stale
    /// status transitions are ignored.
    pub fn apply(&mut self, event: &RunEvent) {
        if !matches!(event, RunEvent::Paused { .. }) {
            // Any consumed event after a pause means the run moved on.
            self.awaiting_input = None;
        }

        match event {
            RunEvent::RunStart { run_id } => {
                if self.run_id.is_none() {
                    self.run_id = run_id.clone();
                }
            }
            RunEvent::NodeStart { node_id, name } => {
                let index = self.upsert_node(node_id);
                if let Some(name) = name {
                    self.nodes[index].name = Some(name.clone());
                }
                self.promote_node(index, NodeStatus::Running);
                self.timeline.push(TimelineEntry::PhaseStart { node_index: index });
            }
            RunEvent::NodeDone { node_id, content } => {
                let index = self.upsert_node(node_id);
                if content.is_some() {
                    self.nodes[index].content = content.clone();
                }
                self.promote_node(index, NodeStatus::Done);
            }
            RunEvent::NodeError { node_id, message } => {
                let index = self.upsert_node(node_id);
                self.promote_node(index, NodeStatus::Error);
                let label = self.node_title(index);
                let message = message.clone().unwrap_or_else(|| "node failed".to_string());
                self.timeline.push(TimelineEntry::Log {
                    message: format!("{label} failed: {message}"),
                });
            }
            RunEvent::NodeSkipped { node_id, reason } => {
                let index = self.upsert_node(node_id);
                self.promote_node(index, NodeStatus::Skipped);
                let label = self.node_title(index);
                let message = match reason {
                    Some(reason) => format!("{label} skipped: {reason}"),
                    None => format!("{label} skipped"),
                };
                self.timeline.push(TimelineEntry::Log { message });
            }
            RunEvent::ToolStart {
                call_id,
                name,
                arguments,
            } => {
                let node_index = self.active_node_index();
                let call_index = self.tool_calls.len();
                self.tool_calls.push(ToolCallState {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                    result: None,
                    status: ToolCallStatus::Running,
                    node_id: node_index.map(|index| self.nodes[index].id.clone()),
                });
                if let Some(node_index) = node_index {
                    self.nodes[node_index].tool_calls.push(call_index);
                }
                self.timeline.push(TimelineEntry::Tool { call_index });
            }
            RunEvent::ToolResult { name, output, .. } => {
                self.settle_tool_call(name, output.as_ref());
            }
            RunEvent::Content { text } => {
                self.timeline.push(TimelineEntry::Content { text: text.clone() });
            }
            RunEvent::SpecialistStart { key, display_name } => {
                let index = self.upsert_specialist(key);
                if let Some(display_name) = display_name {
                    self.specialists[index].display_name = Some(display_name.clone());
                }
            }
            RunEvent::SpecialistComplete {
                key,
                report,
                duration_ms,
            } => {
                let index = self.upsert_specialist(key);
                let specialist = &mut self.specialists[index];
                if specialist.status == SpecialistStatus::Running {
                    specialist.status = SpecialistStatus::Done;
                    specialist.report = report.clone();
                    specialist.duration_ms = *duration_ms;
                }
            }
            RunEvent::SpecialistError { key, message } => {
                let index = self.upsert_specialist(key);
                let specialist = &mut self.specialists[index];
                if specialist.status == SpecialistStatus::Running {
                    specialist.status = SpecialistStatus::Error;
                }
                let label = specialist
                    .display_name
                    .clone()
                    .unwrap_or_else(|| key.clone());
                let message = message.clone().unwrap_or_else(|| "failed".to_string());
                self.timeline.push(TimelineEntry::Log {
                    message: format!("{label}: {message}"),
                });
            }
            RunEvent::Discussion {
                kind,
                speaker,
                text,
                payload,
            } => {
                self.discussion.push(DiscussionEntry {
                    kind: *kind,
                    speaker: speaker.clone(),
                    text: text.clone(),
                    payload: payload.clone(),
                });
            }
            RunEvent::Paused { node_id, prompt } => {
                self.awaiting_input = Some((node_id.clone(), prompt.clone()));
            }
            RunEvent::Done { result } => {
                if self.final_result.is_none() {
                    self.final_result = result.clone();
                }
                self.timeline.push(TimelineEntry::Result);
            }
            RunEvent::Error { message, source } => {
                if self.terminal_error.is_none() {
                    self.terminal_error = Some((message.clone(), *source));
                }
                self.timeline.push(TimelineEntry::Error {
                    message: message.clone(),
                    source: *source,
                });
            }
            RunEvent::Unknown { event_type, .. } => {
                debug!(event_type, "ignoring unknown event");
                self.unknown_events += 1;
            }
        }
    }

    fn upsert_node(&mut self, node_id: &str) -> usize {
        if let Some(index) = self.node_index.get(node_id) {
            return *index;
        }
        let index = self.nodes.len();
        self.nodes.push(NodeState {
            id: node_id.to_string(),
            name: None,
            status: NodeStatus::Pending,
            content: None,
            tool_calls: Vec::new(),
        });
        self.node_index.insert(node_id.to_string(), index);
        index
    }

    fn promote_node(&mut self, index: usize, status: NodeStatus) {
        let node = &mut self.nodes[index];
        if status.rank() > node.status.rank() {
            node.status = status;
        }
    }

    fn node_title(&self, index: usize) -> String {
        let node = &self.nodes[index];
        node.name.clone().unwrap_or_else(|| node.id.clone())
    }

    /// Most recently started node that is still running. Tool starts with
    /// no node attribution of their own attach here.
    fn active_node_index(&self) -> Option<usize> {
        self.timeline.iter().rev().find_map(|entry| match entry {
            TimelineEntry::PhaseStart { node_index }
                if self.nodes[*node_index].status == NodeStatus::Running =>
            {
                Some(*node_index)
            }
            _ => None,
        })
    }

    /// A result settles the most recent still-running call with the same
    /// tool name, across the whole run. String outputs that parse as JSON
    /// are stored parsed.
    fn settle_tool_call(&mut self, name: &str, output: Option<&Value>) {
        let Some(call) = self
            .tool_calls
            .iter_mut()
            .rev()
            .find(|call| call.status == ToolCallStatus::Running && call.name == name)
        else {
            debug!(tool = name, "tool result without a running call");
            return;
        };

        let parsed = output.map(|value| match value {
            Value::String(text) => {
                serde_json::from_str::<Value>(text).unwrap_or_else(|_| value.clone())
            }
            _ => value.clone(),
        });
        let failed = parsed
            .as_ref()
            .and_then(|value| value.get("error"))
            .is_some_and(|error| !error.is_null());

        call.result = parsed;
        call.status = if failed {
            ToolCallStatus::Error
        } else {
            ToolCallStatus::Done
        };
    }

    fn upsert_specialist(&mut self, key: &str) -> usize {
        if let Some(index) = self.specialist_index.get(key) {
            return *index;
        }
        let index = self.specialists.len();
        self.specialists.push(SpecialistState {
            key: key.to_string(),
            display_name: None,
            status: SpecialistStatus::Running,
            report: None,
            duration_ms: None,
        });
        self.specialist_index.insert(key.to_string(), index);
        index
    }
}

impl EventSink for RunInterpreter {
    fn on_event(&mut self, event: &RunEvent) {
        self.apply(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spyglass_stream::parse_run_event;

    fn events(payloads: &[Value]) -> Vec<RunEvent> {
        payloads
            .iter()
            .map(|payload| parse_run_event(payload).expect("event"))
            .collect()
    }

    fn fold(events: &[RunEvent]) -> RunInterpreter {
        let mut interpreter = RunInterpreter::new();
        for event in events {
            interpreter.apply(event);
        }
        interpreter
    }

    #[test]
    fn node_status_never_regresses() {
        let sequence = events(&[
            json!({"type":"node_start","node_id":"n1","name":"Gather"}),
            json!({"type":"node_done","node_id":"n1","content":"collected"}),
            // Stale start arriving after the terminal state.
            json!({"type":"node_start","node_id":"n1"}),
        ]);
        let state = fold(&sequence);

        let node = state.node("n1").expect("node");
        assert_eq!(node.status, NodeStatus::Done);
        assert_eq!(node.content.as_deref(), Some("collected"));
    }

    #[test]
    fn tool_and_specialist_statuses_are_monotonic() {
        let sequence = events(&[
            json!({"type":"tool_start","name":"search"}),
            json!({"type":"tool_result","name":"search","output":{"hits":1}}),
            // A duplicate result finds no running call and changes nothing.
            json!({"type":"tool_result","name":"search","output":{"hits":9}}),
            json!({"type":"specialist_start","key":"risk","display_name":"Risk"}),
            json!({"type":"specialist_complete","key":"risk","report":{"ok":true},"duration_ms":1200}),
            json!({"type":"specialist_error","key":"risk","message":"late"}),
        ]);
        let state = fold(&sequence);

        assert_eq!(state.tool_calls().len(), 1);
        assert_eq!(state.tool_calls()[0].status, ToolCallStatus::Done);
        assert_eq!(state.tool_calls()[0].result, Some(json!({"hits":1})));

        let specialist = state.specialist("risk").expect("specialist");
        assert_eq!(specialist.status, SpecialistStatus::Done);
        assert_eq!(specialist.report, Some(json!({"ok":true})));
        assert_eq!(specialist.duration_ms, Some(1200));
    }

    #[test]
    fn replay_in_chunks_matches_single_pass() {
        let sequence = events(&[
            json!({"type":"run_start","run_id":"run1"}),
            json!({"type":"node_start","node_id":"n1","name":"Plan"}),
            json!({"type":"tool_start","name":"search","arguments":{"q":"x"}}),
            json!({"type":"tool_result","name":"search","output":"{\"hits\":2}"}),
            json!({"type":"content","text":"interim"}),
            json!({"type":"node_done","node_id":"n1"}),
            json!({"type":"question","speaker":"mod","text":"why?"}),
            json!({"type":"done","result":{"ok":true}}),
        ]);

        let single = fold(&sequence);
        for split in 1..sequence.len() {
            let mut chunked = RunInterpreter::new();
            for event in &sequence[..split] {
                chunked.apply(event);
            }
            for event in &sequence[split..] {
                chunked.apply(event);
            }
            assert_eq!(chunked, single, "split at {split}");
        }
    }

    #[test]
    fn distinct_tool_pairs_all_settle_done() {
        let mut payloads = Vec::new();
        for index in 0..4 {
            payloads.push(json!({"type":"tool_start","name":format!("tool_{index}")}));
        }
        for index in 0..4 {
            payloads.push(json!({
                "type":"tool_result",
                "name":format!("tool_{index}"),
                "output":{"index":index},
            }));
        }
        let state = fold(&events(&payloads));

        assert_eq!(state.tool_calls().len(), 4);
        assert!(
            state
                .tool_calls()
                .iter()
                .all(|call| call.status == ToolCallStatus::Done)
        );
    }

    #[test]
    fn same_name_result_settles_most_recent_running_call() {
        let sequence = events(&[
            json!({"type":"tool_start","name":"search","arguments":{"q":"first"}}),
            json!({"type":"tool_start","name":"search","arguments":{"q":"second"}}),
            json!({"type":"tool_result","name":"search","output":{"for":"second"}}),
        ]);
        let state = fold(&sequence);

        assert_eq!(state.tool_calls()[0].status, ToolCallStatus::Running);
        assert_eq!(state.tool_calls()[1].status, ToolCallStatus::Done);
        assert_eq!(state.tool_calls()[1].result, Some(json!({"for":"second"})));
    }

    #[test]
    fn tool_start_attaches_to_most_recent_running_node() {
        let sequence = events(&[
            json!({"type":"node_start","node_id":"n1"}),
            json!({"type":"node_start","node_id":"n2"}),
            json!({"type":"node_done","node_id":"n2"}),
            json!({"type":"tool_start","name":"fetch"}),
        ]);
        let state = fold(&sequence);

        // n2 finished, so the call belongs to n1.
        assert_eq!(state.tool_calls()[0].node_id.as_deref(), Some("n1"));
        assert_eq!(state.node("n1").expect("n1").tool_calls, vec![0]);
        assert!(state.node("n2").expect("n2").tool_calls.is_empty());
    }

    #[test]
    fn scenario_short_run_builds_expected_state() {
        let sequence = events(&[
            json!({"type":"run_start","run_id":"run1"}),
            json!({"type":"tool_start","name":"a"}),
            json!({"type":"tool_result","name":"a","output":{"x":1}}),
            json!({"type":"content","text":"hello"}),
            json!({"type":"done"}),
        ]);
        let state = fold(&sequence);

        assert_eq!(state.run_id(), Some("run1"));
        assert_eq!(state.tool_calls().len(), 1);
        assert_eq!(state.tool_calls()[0].status, ToolCallStatus::Done);
        assert_eq!(state.tool_calls()[0].result, Some(json!({"x":1})));
        assert!(
            state
                .timeline()
                .iter()
                .any(|entry| matches!(entry, TimelineEntry::Content { text } if text == "hello"))
        );
        assert!(state.terminal_error().is_none());
    }

    #[test]
    fn discussion_events_stay_out_of_the_main_timeline() {
        let sequence = events(&[
            json!({"type":"round_start","round":1}),
            json!({"type":"question","speaker":"mod","text":"views?"}),
            json!({"type":"answer","speaker":"risk","text":"wary"}),
            json!({"type":"content","text":"main thread"}),
        ]);
        let state = fold(&sequence);

        assert_eq!(state.discussion().len(), 3);
        assert_eq!(state.discussion()[1].speaker.as_deref(), Some("mod"));
        assert_eq!(state.timeline().len(), 1);
    }

    #[test]
    fn string_tool_output_that_parses_is_stored_parsed() {
        let sequence = events(&[
            json!({"type":"tool_start","name":"calc"}),
            json!({"type":"tool_result","name":"calc","output":"{\"sum\":7}"}),
            json!({"type":"tool_start","name":"log"}),
            json!({"type":"tool_result","name":"log","output":"plain text"}),
        ]);
        let state = fold(&sequence);

        assert_eq!(state.tool_calls()[0].result, Some(json!({"sum":7})));
        assert_eq!(state.tool_calls()[1].result, Some(json!("plain text")));
    }

    #[test]
    fn error_shaped_tool_output_marks_the_call_failed() {
        let sequence = events(&[
            json!({"type":"tool_start","name":"fetch"}),
            json!({"type":"tool_result","name":"fetch","output":{"error":"timeout"}}),
        ]);
        let state = fold(&sequence);
        assert_eq!(state.tool_calls()[0].status, ToolCallStatus::Error);
    }

    #[test]
    fn unknown_events_are_counted_and_ignored() {
        let mut state = RunInterpreter::new();
        state.apply(&RunEvent::Unknown {
            event_type: "telemetry_v2".to_string(),
            payload: json!({"type":"telemetry_v2"}),
        });
        state.apply(&parse_run_event(&json!({"type":"content","text":"still fine"})).expect("event"));

        assert_eq!(state.unknown_events(), 1);
        assert_eq!(state.timeline().len(), 1);
    }

    #[test]
    fn pause_surfaces_and_clears_on_next_event() {
        let sequence = events(&[
            json!({"type":"node_start","node_id":"n1"}),
            json!({"type":"paused","node_id":"n1","prompt":"approve?"}),
        ]);
        let mut state = fold(&sequence);
        assert_eq!(state.awaiting_input(), Some(("n1", Some("approve?"))));

        state.apply(&parse_run_event(&json!({"type":"node_done","node_id":"n1"})).expect("event"));
        assert_eq!(state.awaiting_input(), None);
    }
}

//! End-to-end: poll observer driving the interpreter across a pause.
//!
//! A run that pauses mid-way, receives a response, and resumes must leave
//! the interpreter in exactly the state a one-pass replay of the final log
//! produces.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use spyglass_api::{RawRunEvent, RunEventPage, RunStatus};
use spyglass_stream::{
    ObserverStatus, RunBackend, RunObserver, StreamError, parse_run_event,
};
use spyglass_view::{NodeStatus, RunInterpreter, assemble_blocks};

struct ScriptedBackend {
    pages: Mutex<VecDeque<RunEventPage>>,
}

impl ScriptedBackend {
    fn new(pages: Vec<RunEventPage>) -> Self {
        Self {
            pages: Mutex::new(pages.into_iter().collect()),
        }
    }
}

#[async_trait::async_trait]
impl RunBackend for ScriptedBackend {
    async fn list_run_events(
        &self,
        _run_id: &str,
        _after: i64,
    ) -> Result<RunEventPage, StreamError> {
        self.pages
            .lock()
            .map_err(|_| StreamError::Connect("lock".to_string()))?
            .pop_front()
            .ok_or_else(|| StreamError::Connect("script exhausted".to_string()))
    }

    async fn respond_to_pause(
        &self,
        _run_id: &str,
        _node_id: &str,
        _response: &Value,
    ) -> Result<(), StreamError> {
        Ok(())
    }

    async fn stop_run(&self, _run_id: &str) -> Result<(), StreamError> {
        Ok(())
    }
}

fn full_log() -> Vec<Value> {
    vec![
        json!({"type":"run_start","run_id":"run1"}),
        json!({"type":"node_start","node_id":"n1","name":"Draft"}),
        json!({"type":"tool_start","name":"search","arguments":{"q":"filings"}}),
        json!({"type":"tool_result","name":"search","output":{"hits":2}}),
        json!({"type":"paused","node_id":"n1","prompt":"approve the draft?"}),
        json!({"type":"node_done","node_id":"n1","content":"draft approved"}),
        json!({"type":"content","text":"wrapping up"}),
        json!({"type":"done","result":{"verdict":"ship"}}),
    ]
}

fn entries(range: std::ops::Range<usize>) -> Vec<RawRunEvent> {
    full_log()[range.clone()]
        .iter()
        .cloned()
        .zip(range)
        .map(|(payload, seq)| RawRunEvent {
            seq: seq as i64,
            payload,
        })
        .collect()
}

#[tokio::test]
async fn paused_run_resumes_into_one_pass_equivalent_state() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        RunEventPage {
            status: RunStatus::Running,
            events: entries(0..5),
        },
        RunEventPage {
            status: RunStatus::Completed,
            events: entries(5..8),
        },
    ]));

    let mut observer = RunObserver::new(backend, "run1", RunInterpreter::new())
        .with_interval(Duration::ZERO);

    let status = observer.run_until_blocked().await.expect("first leg");
    let ObserverStatus::AwaitingInput(pending) = status else {
        unreachable!("expected a pause, got {status:?}");
    };
    assert_eq!(pending.node_id, "n1");
    assert_eq!(pending.prompt.as_deref(), Some("approve the draft?"));
    assert_eq!(
        observer.sink().awaiting_input(),
        Some(("n1", Some("approve the draft?")))
    );

    observer
        .submit_response(&json!({"approved": true}))
        .await
        .expect("respond");
    let status = observer.run_until_blocked().await.expect("second leg");
    assert_eq!(status, ObserverStatus::Completed);

    let observed = observer.into_sink();
    let mut replayed = RunInterpreter::new();
    for payload in full_log() {
        replayed.apply(&parse_run_event(&payload).expect("event"));
    }

    assert_eq!(observed, replayed);
    assert_eq!(observed.node("n1").expect("n1").status, NodeStatus::Done);
    assert_eq!(observed.final_result(), Some(&json!({"verdict":"ship"})));
    assert_eq!(assemble_blocks(&observed), assemble_blocks(&replayed));
}

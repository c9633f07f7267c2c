//! Pause/resume coordination.
//!
//! [`PauseCoordinator`] is the pure per-run state machine
//! (`running → paused → running → {completed|failed}`); [`RunObserver`]
//! wraps it around the poll transport and [`PushRunObserver`] around the
//! push channel. Resumption re-enters whichever transport was active:
//! poll continues from the held cursor, push re-subscribes. The machine
//! is directly testable without any transport in the loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;

use spyglass_api::RunStatus;

use crate::error::StreamError;
use crate::event::{RunEvent, SequencedRunEvent};
use crate::poll::{INITIAL_CURSOR, POLL_INTERVAL, RunBackend, decode_page};

/// Consumer of the ordered event sequence. The view-layer interpreter is
/// the real implementation; tests record.
pub trait EventSink: Send {
    fn on_event(&mut self, event: &RunEvent);
}

impl EventSink for Vec<RunEvent> {
    fn on_event(&mut self, event: &RunEvent) {
        self.push(event.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A paused node waiting on a human response, keyed by `(run_id, node_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInput {
    pub run_id: String,
    pub node_id: String,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub run_id: String,
    pub phase: RunPhase,
    pub pending_input: Option<PendingInput>,
}

/// Per-run lifecycle machine. Events are rejected while paused and after
/// a terminal phase; the driver stops feeding at a pause, so a rejection
/// here means the driver (or a caller) broke the protocol.
#[derive(Debug)]
pub struct PauseCoordinator {
    run_id: String,
    phase: RunPhase,
    pending_input: Option<PendingInput>,
}

impl PauseCoordinator {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            phase: RunPhase::Running,
            pending_input: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    #[must_use]
    pub fn pending_input(&self) -> Option<&PendingInput> {
        self.pending_input.as_ref()
    }

    #[must_use]
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            run_id: self.run_id.clone(),
            phase: self.phase,
            pending_input: self.pending_input.clone(),
        }
    }

    /// Feed one consumed event through the lifecycle.
    pub fn observe(&mut self, event: &RunEvent) -> Result<(), StreamError> {
        if self.phase.is_terminal() {
            return Err(StreamError::RunFinished);
        }
        if self.phase == RunPhase::Paused {
            return Err(StreamError::RunSuspended);
        }

        match event {
            RunEvent::Paused { node_id, prompt } => {
                self.phase = RunPhase::Paused;
                self.pending_input = Some(PendingInput {
                    run_id: self.run_id.clone(),
                    node_id: node_id.clone(),
                    prompt: prompt.clone(),
                });
            }
            RunEvent::Done { .. } => self.phase = RunPhase::Completed,
            RunEvent::Error { .. } => self.phase = RunPhase::Failed,
            _ => {}
        }
        Ok(())
    }

    /// Fold in the run status reported alongside a poll page. The log can
    /// reach a terminal status without a terminal event when the executor
    /// crashed between writes.
    pub fn observe_status(&mut self, status: RunStatus) -> Result<(), StreamError> {
        match status {
            RunStatus::Running => Ok(()),
            RunStatus::Completed => self.finish(RunPhase::Completed),
            RunStatus::Failed => self.finish(RunPhase::Failed),
        }
    }

    /// Leave the paused phase after a response was accepted upstream.
    pub fn resume(&mut self) -> Result<PendingInput, StreamError> {
        if self.phase.is_terminal() {
            return Err(StreamError::RunFinished);
        }
        let pending = self.pending_input.take().ok_or(StreamError::NoPendingInput)?;
        self.phase = RunPhase::Running;
        Ok(pending)
    }

    fn finish(&mut self, phase: RunPhase) -> Result<(), StreamError> {
        if self.phase.is_terminal() && self.phase != phase {
            return Err(StreamError::RunFinished);
        }
        self.phase = phase;
        self.pending_input = None;
        Ok(())
    }
}

/// What the observer loop stopped on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverStatus {
    Completed,
    Failed,
    AwaitingInput(PendingInput),
}

/// Drives one run over the poll transport: fetch after the cursor, feed
/// the sink in order, halt at a pause, stop at a terminal status. A fresh
/// observer started from the run id alone replays the whole log.
pub struct RunObserver<S: EventSink> {
    backend: Arc<dyn RunBackend>,
    run_id: String,
    sink: S,
    machine: PauseCoordinator,
    cursor: i64,
    interval: Duration,
}

impl<S: EventSink> RunObserver<S> {
    #[must_use]
    pub fn new(backend: Arc<dyn RunBackend>, run_id: impl Into<String>, sink: S) -> Self {
        let run_id = run_id.into();
        Self {
            backend,
            machine: PauseCoordinator::new(run_id.clone()),
            run_id,
            sink,
            cursor: INITIAL_CURSOR,
            interval: POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.machine.phase()
    }

    #[must_use]
    pub fn pending_input(&self) -> Option<&PendingInput> {
        self.machine.pending_input()
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Run the poll loop until the run pauses or finishes. A transport
    /// failure is terminal: it surfaces to the sink as a synthetic local
    /// error event and the run is marked failed.
    pub async fn run_until_blocked(&mut self) -> Result<ObserverStatus, StreamError> {
        loop {
            let page = match self.backend.list_run_events(&self.run_id, self.cursor).await {
                Ok(page) => page,
                Err(error) => {
                    let event = RunEvent::transport_error(error.to_string());
                    self.machine.observe(&event)?;
                    self.sink.on_event(&event);
                    return Ok(ObserverStatus::Failed);
                }
            };

            let batch = decode_page(&self.run_id, page, &mut self.cursor);
            for SequencedRunEvent { event, .. } in &batch.events {
                self.machine.observe(event)?;
                self.sink.on_event(event);
                match self.machine.phase() {
                    RunPhase::Paused => {
                        // Anything after the pause stays in the log; the
                        // cursor re-fetches it once the run resumes.
                        let pending = self
                            .machine
                            .pending_input()
                            .cloned()
                            .ok_or(StreamError::NoPendingInput)?;
                        return Ok(ObserverStatus::AwaitingInput(pending));
                    }
                    RunPhase::Completed => return Ok(ObserverStatus::Completed),
                    RunPhase::Failed => return Ok(ObserverStatus::Failed),
                    RunPhase::Running => {}
                }
            }

            if batch.status.is_terminal() {
                self.machine.observe_status(batch.status)?;
                return Ok(match self.machine.phase() {
                    RunPhase::Failed => ObserverStatus::Failed,
                    _ => ObserverStatus::Completed,
                });
            }

            sleep(self.interval).await;
        }
    }

    /// Submit the human response for the pending pause and re-enter the
    /// running phase. The caller then calls [`Self::run_until_blocked`]
    /// again; polling continues from the held cursor, so nothing already
    /// consumed is re-processed.
    pub async fn submit_response(&mut self, response: &Value) -> Result<(), StreamError> {
        let pending = self
            .machine
            .pending_input()
            .cloned()
            .ok_or(StreamError::NoPendingInput)?;
        self.backend
            .respond_to_pause(&pending.run_id, &pending.node_id, response)
            .await?;
        self.machine.resume()?;
        Ok(())
    }

    /// Best-effort cancellation: notify the backend, mark the run failed
    /// locally with a synthetic event.
    pub async fn cancel(&mut self) -> Result<(), StreamError> {
        if let Err(error) = self.backend.stop_run(&self.run_id).await {
            tracing::warn!(run_id = %self.run_id, %error, "stop notification failed");
        }
        if !self.machine.phase().is_terminal() {
            let event = RunEvent::transport_error("cancelled");
            if self.machine.phase() == RunPhase::Paused {
                self.machine.resume()?;
            }
            self.machine.observe(&event)?;
            self.sink.on_event(&event);
        }
        Ok(())
    }
}

/// One open delivery channel for a run: events in arrival order, `None`
/// once the channel has ended. The push subscription implements this;
/// tests script one.
#[async_trait]
pub trait RunChannel: Send {
    async fn next_event(&mut self) -> Option<RunEvent>;

    /// Close the channel locally without resolving anything.
    async fn close(&mut self);
}

/// Opens the delivery channel for a run id. Re-entry after a pause goes
/// through here too: push does not replay, it re-subscribes.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_channel(&self, run_id: &str) -> Result<Box<dyn RunChannel>, StreamError>;
}

/// Drives one run over push delivery: consume channel events in arrival
/// order, halt at a pause, and after the response is accepted open a
/// fresh channel for the same run. A channel that ends before the job
/// reports a terminal event fails the run with a synthetic local error.
pub struct PushRunObserver<S: EventSink> {
    backend: Arc<dyn RunBackend>,
    opener: Arc<dyn ChannelOpener>,
    run_id: String,
    sink: S,
    machine: PauseCoordinator,
    channel: Option<Box<dyn RunChannel>>,
}

impl<S: EventSink> PushRunObserver<S> {
    #[must_use]
    pub fn new(
        backend: Arc<dyn RunBackend>,
        opener: Arc<dyn ChannelOpener>,
        run_id: impl Into<String>,
        sink: S,
    ) -> Self {
        let run_id = run_id.into();
        Self {
            backend,
            opener,
            machine: PauseCoordinator::new(run_id.clone()),
            run_id,
            sink,
            channel: None,
        }
    }

    /// Adopt a channel that is already open. Subscribe-then-trigger hands
    /// its pre-trigger subscription in this way.
    #[must_use]
    pub fn with_channel(
        backend: Arc<dyn RunBackend>,
        opener: Arc<dyn ChannelOpener>,
        run_id: impl Into<String>,
        sink: S,
        channel: Box<dyn RunChannel>,
    ) -> Self {
        let mut observer = Self::new(backend, opener, run_id, sink);
        observer.channel = Some(channel);
        observer
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.machine.phase()
    }

    #[must_use]
    pub fn pending_input(&self) -> Option<&PendingInput> {
        self.machine.pending_input()
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Consume the channel until the run pauses or finishes. A failure to
    /// open, or a channel that ends without a terminal event, surfaces to
    /// the sink as a synthetic local error and fails the run.
    pub async fn run_until_blocked(&mut self) -> Result<ObserverStatus, StreamError> {
        loop {
            let next = match self.channel.as_mut() {
                Some(channel) => channel.next_event().await,
                None => {
                    match self.opener.open_channel(&self.run_id).await {
                        Ok(channel) => self.channel = Some(channel),
                        Err(error) => {
                            return self.fail_locally(error.to_string());
                        }
                    }
                    continue;
                }
            };

            let Some(event) = next else {
                self.channel = None;
                return self.fail_locally("channel closed before done");
            };

            self.machine.observe(&event)?;
            self.sink.on_event(&event);
            match self.machine.phase() {
                RunPhase::Paused => {
                    // The executor sends nothing while paused; drop the
                    // socket and re-subscribe on resume.
                    self.close_channel().await;
                    let pending = self
                        .machine
                        .pending_input()
                        .cloned()
                        .ok_or(StreamError::NoPendingInput)?;
                    return Ok(ObserverStatus::AwaitingInput(pending));
                }
                RunPhase::Completed => {
                    self.close_channel().await;
                    return Ok(ObserverStatus::Completed);
                }
                RunPhase::Failed => {
                    self.close_channel().await;
                    return Ok(ObserverStatus::Failed);
                }
                RunPhase::Running => {}
            }
        }
    }

    /// Submit the human response for the pending pause. The next
    /// [`Self::run_until_blocked`] opens a fresh channel for the run.
    pub async fn submit_response(&mut self, response: &Value) -> Result<(), StreamError> {
        let pending = self
            .machine
            .pending_input()
            .cloned()
            .ok_or(StreamError::NoPendingInput)?;
        self.backend
            .respond_to_pause(&pending.run_id, &pending.node_id, response)
            .await?;
        self.machine.resume()?;
        Ok(())
    }

    /// Best-effort cancellation, mirroring the poll observer.
    pub async fn cancel(&mut self) -> Result<(), StreamError> {
        self.close_channel().await;
        if let Err(error) = self.backend.stop_run(&self.run_id).await {
            tracing::warn!(run_id = %self.run_id, %error, "stop notification failed");
        }
        if !self.machine.phase().is_terminal() {
            let event = RunEvent::transport_error("cancelled");
            if self.machine.phase() == RunPhase::Paused {
                self.machine.resume()?;
            }
            self.machine.observe(&event)?;
            self.sink.on_event(&event);
        }
        Ok(())
    }

    async fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }

    fn fail_locally(&mut self, message: impl Into<String>) -> Result<ObserverStatus, StreamError> {
        let event = RunEvent::transport_error(message.into());
        self.machine.observe(&event)?;
        self.sink.on_event(&event);
        Ok(ObserverStatus::Failed)
    }
}

//! Event delivery for remote run observation.
//!
//! One run, one durable ordered event log, two ways to receive it: a push
//! channel opened before the trigger, or a resumable cursor poll that can
//! rebuild everything from the run id alone. The pause/resume coordinator
//! sits above either transport.

pub mod coordinator;
pub mod error;
pub mod event;
pub mod poll;
pub mod push;

pub use coordinator::{
    ChannelOpener, CoordinatorSnapshot, EventSink, ObserverStatus, PauseCoordinator, PendingInput,
    PushRunObserver, RunChannel, RunObserver, RunPhase,
};
pub use error::StreamError;
pub use event::{
    DiscussionKind, ErrorSource, RunEvent, SequencedRunEvent, parse_run_event, parse_sequenced,
};
pub use poll::{INITIAL_CURSOR, POLL_INTERVAL, PolledBatch, RunBackend, decode_page};
pub use push::{
    ApiChannelOpener, PushSubscription, RunOutcome, channel_url, observe_then_trigger,
    parse_push_frame, subscribe_then_trigger,
};

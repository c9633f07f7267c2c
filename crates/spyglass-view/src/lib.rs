//! Derived view state for observed runs.
//!
//! `interpreter` folds the ordered event sequence into node, tool-call,
//! specialist, and discussion registries; `blocks` projects that state
//! into an ordered render block list; `report` turns structured content
//! payloads into display text and never fails doing it.

pub mod blocks;
pub mod interpreter;
pub mod report;

pub use blocks::{RenderBlock, assemble_blocks};
pub use interpreter::{
    DiscussionEntry, NodeState, NodeStatus, RunInterpreter, SpecialistState, SpecialistStatus,
    TimelineEntry, ToolCallState, ToolCallStatus,
};
pub use report::{format_content, format_value};

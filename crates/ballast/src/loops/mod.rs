//! Behavior loop detection.
//!
//! Two independent detectors that notice when the agent has stopped making
//! progress:
//!
//! - [`ToolCycleDetector`] ([`tool_cycles`]): the host records each batch of
//!   tool calls and asks which of them repeat recent work. Synchronous, no
//!   timers.
//! - [`TextLoopDetector`] ([`text`]): the host streams model text in; a timer
//!   periodically runs the [`patterns`] over it and fires a callback once.
//!
//! Both only advise. The host decides whether to inject a reminder (see
//! [`steering_message`]), abort the turn, or ignore the signal.

pub mod history;
pub mod patterns;
pub mod signature;
pub mod text;
pub mod tool_cycles;

pub use history::RingBuffer;
pub use patterns::{
    LoopDetection, LoopPattern, PatternMatch, ReconstructionCycle, RepeatedActions,
    RepeatedQuestions, builtin_patterns, evaluate_patterns,
};
pub use signature::{canonical_json, parameter_overlap, parse_arguments, signature};
pub use text::{DetectorState, LoopCallback, StreamKind, TextLoopDetector};
pub use tool_cycles::{
    CycleInfo, CycleKind, CycleStats, SEARCH_TOOLS, ToolCycleDetector, ToolOutcome,
    is_search_tool, steering_message,
};

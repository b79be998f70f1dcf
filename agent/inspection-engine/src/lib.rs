//! Inspection & dispatch: per-signal sample rings, condition evaluation
//! over sliding windows, trigger-edge detection and payload assembly.
//!
//!   [signal buffer] → SampleStore → evaluate conditions ─┬→ payload queue → uplink
//!                                                        └→ fetch requests → fetchers

pub mod engine;
pub mod eval;
pub mod fetch;
pub mod store;

pub use engine::TriggerEngine;
pub use eval::{evaluate, evaluate_as_trigger, CustomFunctionRegistry, EvalError, Value};
pub use fetch::{FetchRequest, FetchScheduler};
pub use store::{SampleStore, WindowAggregate};

//! Loop coordination module
//!
//! Permission-checked stop, wind-down, call-supervisor and message signals
//! between the turns of a loop run and the operator.

pub mod signals;

pub use signals::{Caller, SignalManager};

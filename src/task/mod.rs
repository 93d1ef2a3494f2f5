//! Task descriptors and the trigger-gated task runtime.

pub mod process;
pub mod runtime;
pub mod spec;
pub mod unit;

pub use process::STDIN_CLOSE;
pub use runtime::TaskRuntime;
pub use spec::{ExecSpec, TaskSpec, TaskStat, TaskValue};
pub use unit::TaskUnit;

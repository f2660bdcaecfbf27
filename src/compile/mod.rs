//! Background builds.
//!
//! - **job**: [`job::CompileJob`] state machine, progress throttling, listeners
//! - **pool**: fixed worker pool returning [`pool::JobHandle`]s
//! - **target**: compile targets and the file-to-file [`target::FileCompile`]
//! - **unit**: jobs that drive a session's exit code

pub mod job;
pub mod pool;
pub mod target;
pub mod unit;

mod codec;
mod conn;
mod error;
mod packet;
mod stub;
mod target;

pub use error::StubError;
pub use stub::GdbStub;
pub use target::{
    Action, Arch, BreakpointKind, Capabilities, InterruptHandle, TARGET_RV32, TARGET_RV64,
    TARGET_X86_64, Target, TargetError, TargetResult,
};

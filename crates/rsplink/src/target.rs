use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

/// Target description served for 32-bit RISC-V targets.
pub const TARGET_RV32: &str =
    "<target version=\"1.0\"><architecture>riscv:rv32</architecture></target>";
/// Target description served for 64-bit RISC-V targets.
pub const TARGET_RV64: &str =
    "<target version=\"1.0\"><architecture>riscv:rv64</architecture></target>";
/// Target description served for x86-64 targets.
pub const TARGET_X86_64: &str =
    "<target version=\"1.0\"><architecture>i386:x86-64</architecture></target>";

/// Immutable description of the debugged machine.
#[derive(Debug, Clone)]
pub struct Arch {
    /// Target description XML served on `qXfer:features:read`, if any.
    pub target_desc: Option<String>,
    /// Number of CPUs the target models; 0 and 1 both mean single-core.
    pub smp: usize,
    /// Number of registers in the `g`/`G` register file.
    pub reg_num: usize,
}

/// What the target wants the stub to do after an execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Nothing happened; keep serving packets.
    #[default]
    None,
    /// The target halted (step done, breakpoint, interrupt); report a stop.
    Resume,
    /// Tear the session down.
    Shutdown,
}

/// Breakpoint and watchpoint flavors of the `Z`/`z` packets.
///
/// For breakpoints `len` is the instruction size; for watchpoints it is
/// the size of the watched region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakpointKind {
    Software = 0,
    Hardware = 1,
    WatchWrite = 2,
    WatchRead = 3,
    WatchAccess = 4,
}

impl BreakpointKind {
    /// Parses the numeric type field of a `Z`/`z` packet; values above 4
    /// are rejected.
    pub fn from_code(code: usize) -> Option<Self> {
        match code {
            0 => Some(Self::Software),
            1 => Some(Self::Hardware),
            2 => Some(Self::WatchWrite),
            3 => Some(Self::WatchRead),
            4 => Some(Self::WatchAccess),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Which optional [`Target`] operations a target actually implements.
    ///
    /// The stub consults this set before dispatching: a request whose
    /// backing operation is missing is answered with the `E01` permission
    /// error, and `qSupported`/`vCont?` advertisements are trimmed to
    /// match.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const CONT      = 1 << 0;
        const STEPI     = 1 << 1;
        const READ_REG  = 1 << 2;
        const WRITE_REG = 1 << 3;
        const READ_MEM  = 1 << 4;
        const WRITE_MEM = 1 << 5;
        const SET_BP    = 1 << 6;
        const DEL_BP    = 1 << 7;
        const SET_CPU   = 1 << 8;
        const GET_CPU   = 1 << 9;
    }
}

/// Failure of a single target operation, rendered as an `E<hh>` reply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TargetError {
    /// The operation is not supported by this target.
    #[error("operation not supported by this target")]
    Unsupported,
    /// The requested address range is outside target memory.
    #[error("memory access fault")]
    Fault,
    /// Any other target-specific error number, passed through verbatim.
    #[error("target error {0:#04x}")]
    Errno(u8),
}

impl TargetError {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Unsupported => 0x01,
            Self::Fault => 0x0e,
            Self::Errno(code) => code,
        }
    }
}

pub type TargetResult<T> = Result<T, TargetError>;

/// Interrupt delivery endpoint, invoked from the stub's watcher thread
/// while the target is inside [`Target::cont`]. Implementations must be
/// lock-free; the canonical one is an `Arc<AtomicBool>` halt flag the
/// execution loop polls.
pub trait InterruptHandle: Send + Sync {
    fn interrupt(&self);
}

impl InterruptHandle for AtomicBool {
    fn interrupt(&self) {
        self.store(true, Ordering::Relaxed);
    }
}

/// The capability surface a debugged program exposes to the stub.
///
/// Every operation except [`capabilities`](Self::capabilities) and
/// [`reg_bytes`](Self::reg_bytes) has a default-reject body, so a target
/// implements exactly the subset it declares. The stub never calls an
/// operation whose capability bit is unset.
pub trait Target {
    /// The operations this target implements.
    fn capabilities(&self) -> Capabilities;

    /// Byte width of register `regno`; must be constant across the run.
    fn reg_bytes(&self, regno: usize) -> usize;

    /// Runs the target until it completes, hits a breakpoint, observes the
    /// halt flag set by the interrupt handle, or fails.
    fn cont(&mut self) -> Action {
        Action::None
    }

    /// Executes exactly one instruction.
    fn stepi(&mut self) -> Action {
        Action::None
    }

    /// Reads register `regno` into `value` (`reg_bytes(regno)` long).
    fn read_reg(&mut self, regno: usize, value: &mut [u8]) -> TargetResult<()> {
        let _ = (regno, value);
        Err(TargetError::Unsupported)
    }

    /// Writes register `regno` from `value` (`reg_bytes(regno)` long).
    fn write_reg(&mut self, regno: usize, value: &[u8]) -> TargetResult<()> {
        let _ = (regno, value);
        Err(TargetError::Unsupported)
    }

    /// Reads `value.len()` bytes of target memory at `addr`.
    fn read_mem(&mut self, addr: usize, value: &mut [u8]) -> TargetResult<()> {
        let _ = (addr, value);
        Err(TargetError::Unsupported)
    }

    /// Writes `value` into target memory at `addr`.
    fn write_mem(&mut self, addr: usize, value: &[u8]) -> TargetResult<()> {
        let _ = (addr, value);
        Err(TargetError::Unsupported)
    }

    /// Arms a breakpoint or watchpoint. Returns false when the target is
    /// out of slots or does not support `kind`.
    fn set_bp(&mut self, addr: usize, len: usize, kind: BreakpointKind) -> bool {
        let _ = (addr, len, kind);
        false
    }

    /// Disarms a breakpoint or watchpoint previously set with the same
    /// coordinates.
    fn del_bp(&mut self, addr: usize, len: usize, kind: BreakpointKind) -> bool {
        let _ = (addr, len, kind);
        false
    }

    /// Selects the CPU subsequent register/memory operations act on.
    fn set_cpu(&mut self, cpu: usize) {
        let _ = cpu;
    }

    /// CPU currently selected.
    fn cur_cpu(&mut self) -> usize {
        0
    }

    /// Handle the watcher thread uses to deliver `0x03` interrupt
    /// requests. `None` disables asynchronous interruption entirely (no
    /// watcher thread is spawned).
    fn interrupt_handle(&self) -> Option<Arc<dyn InterruptHandle>> {
        None
    }
}

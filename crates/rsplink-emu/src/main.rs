use std::{
    fs,
    path::PathBuf,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use rsplink::{
    Action, Arch, BreakpointKind, Capabilities, GdbStub, InterruptHandle, TARGET_RV32, Target,
    TargetError, TargetResult,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MEM_SIZE: usize = 1024;
/// x0-x31 plus pc.
const REG_NUM: usize = 33;
const REG_PC: usize = 32;
const INST_SIZE: u32 = 4;

/// Toy RV32 emulator debuggable over the GDB remote serial protocol.
#[derive(Parser)]
struct Args {
    /// Raw memory image loaded at address zero.
    image: PathBuf,
    /// Listen address: `<ip>:<port>` or a local socket path.
    #[arg(long, default_value = "127.0.0.1:1234")]
    listen: String,
}

/// A deliberately small RV32 core: enough of the integer ISA (`addi`,
/// `add`) to single-step through the bundled test images.
struct Emu {
    mem: Vec<u8>,
    code_size: usize,
    x: [u32; 32],
    pc: u32,
    /// Single software breakpoint slot.
    breakpoint: Option<u32>,
    /// Set by the stub's watcher thread to stop a free-running `cont`.
    halt: Arc<AtomicBool>,
}

impl Emu {
    fn new(image: &[u8]) -> Self {
        let mut mem = vec![0u8; MEM_SIZE];
        let code_size = image.len().min(MEM_SIZE);
        mem[..code_size].copy_from_slice(&image[..code_size]);
        let mut emu = Self {
            mem,
            code_size,
            x: [0; 32],
            pc: 0,
            breakpoint: None,
            halt: Arc::new(AtomicBool::new(false)),
        };
        // sp starts at the top of memory.
        emu.x[2] = MEM_SIZE as u32;
        emu
    }

    fn fetch(&self, addr: u32) -> u32 {
        let addr = addr as usize;
        // The debugger can point pc anywhere; out-of-range fetches decode
        // as an invalid instruction instead of faulting the emulator.
        if addr + 4 > MEM_SIZE {
            return 0;
        }
        u32::from_le_bytes([
            self.mem[addr],
            self.mem[addr + 1],
            self.mem[addr + 2],
            self.mem[addr + 3],
        ])
    }

    fn exec(&mut self, inst: u32) {
        let opcode = inst & 0x7f;
        let rd = ((inst >> 7) & 0x1f) as usize;
        let rs1 = ((inst >> 15) & 0x1f) as usize;
        let rs2 = ((inst >> 20) & 0x1f) as usize;
        let imm = ((inst & 0xfff0_0000) as i32 >> 20) as u32;

        match opcode {
            // addi
            0x13 => self.x[rd] = self.x[rs1].wrapping_add(imm),
            // add
            0x33 => self.x[rd] = self.x[rs1].wrapping_add(self.x[rs2]),
            _ => info!(opcode, "unimplemented or invalid opcode"),
        }
        self.x[0] = 0;
    }

    fn step(&mut self) {
        let inst = self.fetch(self.pc);
        self.pc += INST_SIZE;
        self.exec(inst);
    }

    fn done(&self) -> bool {
        self.pc as usize >= self.code_size
    }
}

impl Target for Emu {
    fn capabilities(&self) -> Capabilities {
        Capabilities::CONT
            | Capabilities::STEPI
            | Capabilities::READ_REG
            | Capabilities::WRITE_REG
            | Capabilities::READ_MEM
            | Capabilities::WRITE_MEM
            | Capabilities::SET_BP
            | Capabilities::DEL_BP
    }

    fn reg_bytes(&self, _regno: usize) -> usize {
        4
    }

    fn cont(&mut self) -> Action {
        while !self.done() && !self.halt.load(Ordering::Relaxed) {
            if self.breakpoint == Some(self.pc) {
                break;
            }
            self.step();
        }
        self.halt.store(false, Ordering::Relaxed);
        Action::Resume
    }

    fn stepi(&mut self) -> Action {
        if !self.done() {
            self.step();
        }
        Action::Resume
    }

    fn read_reg(&mut self, regno: usize, value: &mut [u8]) -> TargetResult<()> {
        let reg = match regno {
            0..32 => self.x[regno],
            REG_PC => self.pc,
            _ => return Err(TargetError::Errno(0x16)),
        };
        value.copy_from_slice(&reg.to_le_bytes());
        Ok(())
    }

    fn write_reg(&mut self, regno: usize, value: &[u8]) -> TargetResult<()> {
        let reg = u32::from_le_bytes(value.try_into().map_err(|_| TargetError::Errno(0x16))?);
        match regno {
            0 => {}
            1..32 => self.x[regno] = reg,
            REG_PC => self.pc = reg,
            _ => return Err(TargetError::Errno(0x16)),
        }
        Ok(())
    }

    fn read_mem(&mut self, addr: usize, value: &mut [u8]) -> TargetResult<()> {
        let end = addr.checked_add(value.len()).ok_or(TargetError::Fault)?;
        if end > MEM_SIZE {
            return Err(TargetError::Fault);
        }
        value.copy_from_slice(&self.mem[addr..end]);
        Ok(())
    }

    fn write_mem(&mut self, addr: usize, value: &[u8]) -> TargetResult<()> {
        let end = addr.checked_add(value.len()).ok_or(TargetError::Fault)?;
        if end > MEM_SIZE {
            return Err(TargetError::Fault);
        }
        self.mem[addr..end].copy_from_slice(value);
        Ok(())
    }

    fn set_bp(&mut self, addr: usize, _len: usize, kind: BreakpointKind) -> bool {
        if kind != BreakpointKind::Software || self.breakpoint.is_some() {
            return false;
        }
        self.breakpoint = Some(addr as u32);
        true
    }

    fn del_bp(&mut self, addr: usize, _len: usize, kind: BreakpointKind) -> bool {
        if kind != BreakpointKind::Software || self.breakpoint != Some(addr as u32) {
            return false;
        }
        self.breakpoint = None;
        true
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn InterruptHandle>> {
        Some(self.halt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// addi x1, x0, 5 ; addi x2, x0, 7 ; add x3, x1, x2
    const PROGRAM: [u32; 3] = [0x0050_0093, 0x0070_0113, 0x0020_81b3];

    fn emu_with_program() -> Emu {
        let image: Vec<u8> = PROGRAM.iter().flat_map(|inst| inst.to_le_bytes()).collect();
        Emu::new(&image)
    }

    #[test]
    fn executes_addi_and_add() {
        let mut emu = emu_with_program();
        emu.cont();
        assert_eq!(emu.x[1], 5);
        assert_eq!(emu.x[2], 7);
        assert_eq!(emu.x[3], 12);
        assert_eq!(emu.pc, 12);
    }

    #[test]
    fn stepi_advances_one_instruction() {
        let mut emu = emu_with_program();
        assert_eq!(emu.stepi(), Action::Resume);
        assert_eq!(emu.pc, 4);
        assert_eq!(emu.x[1], 5);
        // sp keeps its reset value until the second instruction runs.
        assert_eq!(emu.x[2], MEM_SIZE as u32);
    }

    #[test]
    fn cont_stops_at_breakpoint() {
        let mut emu = emu_with_program();
        assert!(emu.set_bp(8, 4, BreakpointKind::Software));
        emu.cont();
        assert_eq!(emu.pc, 8);
        assert_eq!(emu.x[3], 0);
        assert!(emu.del_bp(8, 4, BreakpointKind::Software));
        emu.cont();
        assert_eq!(emu.x[3], 12);
    }

    #[test]
    fn x0_stays_hardwired_to_zero() {
        let mut emu = Emu::new(&0x0050_0013u32.to_le_bytes()); // addi x0, x0, 5
        emu.stepi();
        assert_eq!(emu.x[0], 0);
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let image = match fs::read(&args.image) {
        Ok(image) => image,
        Err(err) => {
            error!(path = %args.image.display(), %err, "failed to read memory image");
            return ExitCode::FAILURE;
        }
    };
    if image.len() > MEM_SIZE {
        error!(len = image.len(), max = MEM_SIZE, "memory image too large");
        return ExitCode::FAILURE;
    }

    let mut emu = Emu::new(&image);
    let arch = Arch { target_desc: Some(TARGET_RV32.to_string()), smp: 1, reg_num: REG_NUM };

    let mut stub = match GdbStub::listen(&emu, arch, &args.listen) {
        Ok(stub) => stub,
        Err(err) => {
            error!(%err, "failed to bring the debug connection up");
            return ExitCode::FAILURE;
        }
    };
    match stub.run(&mut emu) {
        Ok(()) => info!("debug session finished"),
        Err(err) => {
            error!(%err, "debug session failed");
            return ExitCode::FAILURE;
        }
    }
    stub.close();
    ExitCode::SUCCESS
}

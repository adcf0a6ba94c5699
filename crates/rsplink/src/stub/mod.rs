mod commands;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::{debug, info};

use crate::{
    conn::{self, Conn, IntrPoller},
    error::StubError,
    target::{Action, Arch, InterruptHandle, Target},
};

/// Signal number reported in the stop reply: trap, the halted-at-a-
/// breakpoint-equivalent event.
const SIGTRAP: u8 = 5;

/// Readiness slice of one watcher probe for the interrupt byte.
const INTR_POLL_MS: i32 = 100;
/// Watcher nap while no continue request is in flight.
const INTR_IDLE_NAP: Duration = Duration::from_millis(10);

/// What a decoded packet asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    None,
    Cont,
    Step,
    Detach,
}

/// The protocol engine: one accepted debugger session speaking the GDB
/// remote serial protocol on behalf of a [`Target`].
///
/// ```no_run
/// # use rsplink::{Arch, Capabilities, GdbStub, Target};
/// # struct Emu;
/// # impl Target for Emu {
/// #     fn capabilities(&self) -> Capabilities { Capabilities::empty() }
/// #     fn reg_bytes(&self, _: usize) -> usize { 4 }
/// # }
/// let mut emu = Emu;
/// let arch = Arch { target_desc: None, smp: 1, reg_num: 33 };
/// let mut stub = GdbStub::listen(&emu, arch, "127.0.0.1:1234")?;
/// stub.run(&mut emu)?;
/// # Ok::<(), rsplink::StubError>(())
/// ```
pub struct GdbStub {
    arch: Arch,
    conn: Conn,
    /// Sum of `reg_bytes(i)` over the whole register file, fixed at
    /// listen time.
    total_reg_bytes: usize,
    /// Grow-on-demand scratch for register transfers.
    reg_scratch: Vec<u8>,
    /// True only while a continue request is in flight; gates the
    /// watcher's reads of the shared socket.
    async_io: Arc<AtomicBool>,
    /// Tells the watcher to wind down.
    stop: Arc<AtomicBool>,
    watcher: Option<thread::JoinHandle<()>>,
}

impl GdbStub {
    /// Binds `addr` (`<dotted-quad>[:<port>]` for TCP, a path for a local
    /// socket) and blocks until a debugger connects.
    ///
    /// `target` is only inspected for its register geometry here; the
    /// same target is expected back in [`run`](Self::run).
    pub fn listen<T: Target>(target: &T, arch: Arch, addr: &str) -> Result<Self, StubError> {
        let total_reg_bytes = (0..arch.reg_num).map(|regno| target.reg_bytes(regno)).sum();
        let bind = conn::parse_bind_addr(addr);
        info!(?bind, "waiting for debugger");
        let conn = Conn::listen(&bind)?;
        Ok(Self {
            arch,
            conn,
            total_reg_bytes,
            reg_scratch: Vec::new(),
            async_io: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            watcher: None,
        })
    }

    /// Serves the debugger until it detaches (`Ok`), the target asks for
    /// shutdown (`Ok`), or the connection dies (`Err`). Blocks for the
    /// whole session.
    pub fn run<T: Target>(&mut self, target: &mut T) -> Result<(), StubError> {
        if self.watcher.is_none()
            && let Some(handle) = target.interrupt_handle()
        {
            self.spawn_watcher(handle)?;
        }

        loop {
            self.conn.recv_packet()?;
            let Some(pkt) = self.conn.pop_packet() else {
                return Err(StubError::Disconnected);
            };
            let event = self.process_packet(target, &pkt)?;
            match self.handle_event(target, event) {
                Action::Resume => self.send_stop_reply()?,
                Action::Shutdown => {
                    info!("target requested shutdown");
                    return Ok(());
                }
                Action::None => {}
            }
        }
    }

    /// Tears the session down: watcher joined, sockets closed.
    pub fn close(mut self) {
        self.stop_watcher();
    }

    fn spawn_watcher(&mut self, handle: Arc<dyn InterruptHandle>) -> Result<(), StubError> {
        self.async_io.store(false, Ordering::Relaxed);
        let poller = self.conn.intr_poller()?;
        let async_io = Arc::clone(&self.async_io);
        let stop = Arc::clone(&self.stop);
        let thread = thread::Builder::new()
            .name("rsplink-intr".into())
            .spawn(move || watcher_loop(poller, &*handle, &async_io, &stop))?;
        self.watcher = Some(thread);
        Ok(())
    }

    fn stop_watcher(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.watcher.take() {
            let _ = thread.join();
        }
    }

    /// Maps a decoded event onto the target and propagates its verdict.
    /// The async-I/O window is open exactly for the duration of a
    /// continue, so interrupts can only land while the target runs.
    fn handle_event<T: Target>(&self, target: &mut T, event: Event) -> Action {
        match event {
            Event::Cont => {
                self.async_io.store(true, Ordering::Relaxed);
                let action = target.cont();
                self.async_io.store(false, Ordering::Relaxed);
                action
            }
            Event::Step => target.stepi(),
            Event::Detach => Action::Shutdown,
            Event::None => Action::None,
        }
    }

    fn send_stop_reply(&self) -> Result<(), StubError> {
        let reply = format!("S{SIGTRAP:02x}");
        self.conn.send_payload(reply.as_bytes())?;
        Ok(())
    }
}

impl Drop for GdbStub {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

/// Body of the interrupt watcher thread.
///
/// Sleeps while the async-I/O window is closed; while it is open, probes
/// the shared socket for the `0x03` interrupt byte and forwards it to the
/// target's interrupt handle. The ack goes out before the handle fires so
/// it always precedes the eventual stop reply on the wire.
fn watcher_loop(
    mut poller: IntrPoller,
    handle: &dyn InterruptHandle,
    async_io: &AtomicBool,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        if !async_io.load(Ordering::Relaxed) {
            thread::sleep(INTR_IDLE_NAP);
            continue;
        }
        if !poller.poll_readable(INTR_POLL_MS) {
            continue;
        }
        // The window can close while the poll is parked: whatever just
        // arrived then belongs to the command loop, not to us.
        if !async_io.load(Ordering::Relaxed) {
            continue;
        }
        if poller.try_recv_intr() {
            debug!("interrupt request from debugger");
            poller.try_send_ack();
            handle.interrupt();
        }
    }
}

//! Scripted-peer sessions against a live stub: raw bytes in, raw bytes
//! out, checksums computed the way the debugger computes them.

use std::{
    io::{Read, Write},
    net::TcpStream,
    os::unix::net::UnixStream,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use rsplink::{
    Action, Arch, BreakpointKind, Capabilities, GdbStub, InterruptHandle, StubError, TARGET_RV32,
    Target, TargetError, TargetResult,
};

const MEM_SIZE: usize = 0x2000;
const REG_NUM: usize = 4;

/// In-process target fixture: four 32-bit registers, a flat memory, one
/// breakpoint slot and an interruptible `cont`.
struct TestTarget {
    regs: [u32; REG_NUM],
    mem: Vec<u8>,
    breakpoint: Option<(usize, usize, BreakpointKind)>,
    cpu: usize,
    halt: Arc<AtomicBool>,
}

impl TestTarget {
    fn new() -> Self {
        Self {
            regs: [0x0000_0001, 2, 3, 4],
            mem: vec![0; MEM_SIZE],
            breakpoint: None,
            cpu: 0,
            halt: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Target for TestTarget {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn reg_bytes(&self, _regno: usize) -> usize {
        4
    }

    fn cont(&mut self) -> Action {
        while !self.halt.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(1));
        }
        self.halt.store(false, Ordering::Relaxed);
        Action::Resume
    }

    fn stepi(&mut self) -> Action {
        Action::Resume
    }

    fn read_reg(&mut self, regno: usize, value: &mut [u8]) -> TargetResult<()> {
        value.copy_from_slice(&self.regs[regno].to_le_bytes());
        Ok(())
    }

    fn write_reg(&mut self, regno: usize, value: &[u8]) -> TargetResult<()> {
        self.regs[regno] = u32::from_le_bytes(value.try_into().expect("register width"));
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

    fn set_bp(&mut self, addr: usize, len: usize, kind: BreakpointKind) -> bool {
        if self.breakpoint.is_some() {
            return false;
        }
        self.breakpoint = Some((addr, len, kind));
        true
    }

    fn del_bp(&mut self, addr: usize, len: usize, kind: BreakpointKind) -> bool {
        if self.breakpoint != Some((addr, len, kind)) {
            return false;
        }
        self.breakpoint = None;
        true
    }

    fn set_cpu(&mut self, cpu: usize) {
        self.cpu = cpu;
    }

    fn cur_cpu(&mut self) -> usize {
        self.cpu
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn InterruptHandle>> {
        Some(self.halt.clone())
    }
}

/// Target implementing nothing but register reads, for capability-gating
/// checks.
struct MinimalTarget;

impl Target for MinimalTarget {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_REG
    }

    fn reg_bytes(&self, _regno: usize) -> usize {
        4
    }

    fn read_reg(&mut self, _regno: usize, value: &mut [u8]) -> TargetResult<()> {
        value.fill(0);
        Ok(())
    }
}

fn arch_with_desc() -> Arch {
    Arch { target_desc: Some(TARGET_RV32.to_string()), smp: 0, reg_num: REG_NUM }
}

fn spawn_stub<T: Target + Send + 'static>(
    addr: &str,
    arch: Arch,
    mut target: T,
) -> thread::JoinHandle<Result<(), StubError>> {
    let addr = addr.to_string();
    thread::spawn(move || {
        let mut stub = GdbStub::listen(&target, arch, &addr)?;
        stub.run(&mut target)
    })
}

fn connect_tcp(addr: &str) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("stub never started listening on {addr}");
}

fn connect_unix(path: &Path) -> UnixStream {
    for _ in 0..200 {
        if let Ok(stream) = UnixStream::connect(path) {
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("stub never started listening on {}", path.display());
}

fn csum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = vec![b'$'];
    framed.extend_from_slice(payload);
    framed.push(b'#');
    framed.extend_from_slice(format!("{:02x}", csum(payload)).as_bytes());
    framed
}

fn send_packet<W: Write>(stream: &mut W, payload: &[u8]) {
    stream.write_all(&frame(payload)).unwrap();
}

fn expect_bytes<R: Read>(stream: &mut R, expected: &[u8]) {
    let mut got = vec![0u8; expected.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(
        got,
        expected,
        "wire mismatch: got {:?}, want {:?}",
        String::from_utf8_lossy(&got),
        String::from_utf8_lossy(expected)
    );
}

/// Ack for the request, then the framed reply.
fn expect_reply<R: Read>(stream: &mut R, payload: &[u8]) {
    let mut expected = b"+".to_vec();
    expected.extend_from_slice(&frame(payload));
    expect_bytes(stream, &expected);
}

fn detach<S: Read + Write>(stream: &mut S) {
    send_packet(stream, b"D");
}

#[test]
fn handshake_with_target_description() {
    let stub = spawn_stub("127.0.0.1:47801", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47801");

    send_packet(&mut peer, b"qSupported:multiprocess+;swbreak+;hwbreak+");
    expect_reply(&mut peer, b"PacketSize=1024;qXfer:features:read+;hwbreak+;swbreak+");

    send_packet(&mut peer, b"?");
    expect_reply(&mut peer, b"S05");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn handshake_without_target_description() {
    let arch = Arch { target_desc: None, smp: 0, reg_num: REG_NUM };
    let stub = spawn_stub("127.0.0.1:47802", arch, TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47802");

    send_packet(&mut peer, b"qSupported:multiprocess+");
    expect_reply(&mut peer, b"PacketSize=1024;hwbreak+;swbreak+");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn register_reads() {
    let stub = spawn_stub("127.0.0.1:47803", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47803");

    // Little-endian, two hex chars per byte.
    send_packet(&mut peer, b"p0");
    expect_reply(&mut peer, b"01000000");

    send_packet(&mut peer, b"g");
    expect_reply(&mut peer, b"01000000020000000300000004000000");

    // Out-of-range index.
    send_packet(&mut peer, b"p4");
    expect_reply(&mut peer, b"E16");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn register_file_write_then_read_back() {
    let stub = spawn_stub("127.0.0.1:47804", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47804");

    let blob = b"aabbccdd000000001111111122222222";
    let mut packet = b"G".to_vec();
    packet.extend_from_slice(blob);
    send_packet(&mut peer, &packet);
    expect_reply(&mut peer, b"OK");

    send_packet(&mut peer, b"g");
    expect_reply(&mut peer, blob);

    // Blob shorter than the register file.
    send_packet(&mut peer, b"Gaabb");
    expect_reply(&mut peer, b"E16");

    // Single-register write, then read it back.
    send_packet(&mut peer, b"P1=deadbeef");
    expect_reply(&mut peer, b"OK");
    send_packet(&mut peer, b"p1");
    expect_reply(&mut peer, b"deadbeef");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn memory_roundtrip() {
    let stub = spawn_stub("127.0.0.1:47805", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47805");

    send_packet(&mut peer, b"M1000,2:dead");
    expect_reply(&mut peer, b"OK");
    send_packet(&mut peer, b"m1000,2");
    expect_reply(&mut peer, b"dead");

    // Binary write with every escape-worthy byte, read back as hex.
    let mut packet = b"X1080,4:".to_vec();
    for &raw in &[0x7d, 0x24, 0x23, 0x2a] {
        packet.push(b'}');
        packet.push(raw ^ 0x20);
    }
    send_packet(&mut peer, &packet);
    expect_reply(&mut peer, b"OK");
    send_packet(&mut peer, b"m1080,4");
    expect_reply(&mut peer, b"7d24232a");

    // Zero-length X is the debugger probing for support.
    send_packet(&mut peer, b"X1080,0:");
    expect_reply(&mut peer, b"OK");

    // Reads past the end of target memory are the target's error.
    send_packet(&mut peer, b"m1fff,2");
    expect_reply(&mut peer, b"E0e");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn memory_transfer_size_limits() {
    let stub = spawn_stub("127.0.0.1:47806", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47806");

    // MAX_MEM_XFER_SIZE = (0x1000 - 6) / 2 = 2045 = 0x7fd.
    send_packet(&mut peer, b"m0,7fd");
    let mut expected = b"+".to_vec();
    expected.extend_from_slice(&frame(&vec![b'0'; 0x7fd * 2]));
    expect_bytes(&mut peer, &expected);

    send_packet(&mut peer, b"m0,7fe");
    expect_reply(&mut peer, b"E16");

    send_packet(&mut peer, b"m0,0");
    expect_reply(&mut peer, b"E16");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn continue_then_interrupt() {
    let stub = spawn_stub("127.0.0.1:47807", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47807");

    send_packet(&mut peer, b"c");
    expect_bytes(&mut peer, b"+");

    // The target is now spinning inside `cont`; 0x03 asks it to halt.
    peer.write_all(&[0x03]).unwrap();
    let mut expected = b"+".to_vec();
    expected.extend_from_slice(&frame(b"S05"));
    expect_bytes(&mut peer, &expected);

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn vcont_variants() {
    let stub = spawn_stub("127.0.0.1:47808", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47808");

    send_packet(&mut peer, b"vCont?");
    expect_reply(&mut peer, b"vCont;s;c;");

    send_packet(&mut peer, b"vCont;s");
    expect_reply(&mut peer, b"S05");

    // Signal-carrying actions are not supported.
    send_packet(&mut peer, b"vCont;C05");
    expect_reply(&mut peer, b"E01");

    send_packet(&mut peer, b"vCont;");
    expect_reply(&mut peer, b"E16");

    send_packet(&mut peer, b"vMustReplyEmpty");
    expect_reply(&mut peer, b"");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn bad_checksum_then_good() {
    let stub = spawn_stub("127.0.0.1:47809", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47809");

    // Receipt ack, then the rejection once verification fails.
    peer.write_all(b"$?#00").unwrap();
    expect_bytes(&mut peer, b"+-");

    send_packet(&mut peer, b"?");
    expect_reply(&mut peer, b"S05");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn no_ack_mode_latches() {
    let stub = spawn_stub("127.0.0.1:47810", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47810");

    // The latch takes effect after this exchange, which is still acked.
    send_packet(&mut peer, b"QStartNoAckMode");
    expect_reply(&mut peer, b"OK");

    // From here on: replies only, no `+` ever again.
    send_packet(&mut peer, b"?");
    expect_bytes(&mut peer, &frame(b"S05"));

    send_packet(&mut peer, b"m1000,2");
    expect_bytes(&mut peer, &frame(b"0000"));

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn breakpoint_slot_rearms() {
    let stub = spawn_stub("127.0.0.1:47811", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47811");

    send_packet(&mut peer, b"Z0,100,4");
    expect_reply(&mut peer, b"OK");

    // Single slot in this target.
    send_packet(&mut peer, b"Z0,200,4");
    expect_reply(&mut peer, b"E16");

    send_packet(&mut peer, b"z0,100,4");
    expect_reply(&mut peer, b"OK");

    send_packet(&mut peer, b"Z0,100,4");
    expect_reply(&mut peer, b"OK");

    // Type 5 does not exist.
    send_packet(&mut peer, b"z5,100,4");
    expect_reply(&mut peer, b"E16");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn target_description_slices() {
    let stub = spawn_stub("127.0.0.1:47812", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47812");

    let desc = TARGET_RV32.as_bytes();

    send_packet(&mut peer, b"qXfer:features:read:target.xml:0,10");
    let mut expected = b"m".to_vec();
    expected.extend_from_slice(&desc[..0x10]);
    expect_reply(&mut peer, &expected);

    send_packet(&mut peer, b"qXfer:features:read:target.xml:10,ffff");
    let mut expected = b"l".to_vec();
    expected.extend_from_slice(&desc[0x10..]);
    expect_reply(&mut peer, &expected);

    // Offset past the end of the document.
    send_packet(&mut peer, b"qXfer:features:read:target.xml:ffff,10");
    expect_reply(&mut peer, b"l");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn thread_and_query_surface() {
    let stub = spawn_stub("127.0.0.1:47813", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47813");

    // smp = 0 still reports one CPU.
    send_packet(&mut peer, b"qfThreadInfo");
    expect_reply(&mut peer, b"m0000,");
    send_packet(&mut peer, b"qsThreadInfo");
    expect_reply(&mut peer, b"l");

    send_packet(&mut peer, b"qAttached");
    expect_reply(&mut peer, b"1");
    send_packet(&mut peer, b"qSymbol::");
    expect_reply(&mut peer, b"OK");

    send_packet(&mut peer, b"qC");
    expect_reply(&mut peer, b"QC0000");
    send_packet(&mut peer, b"Hg1");
    expect_reply(&mut peer, b"OK");
    send_packet(&mut peer, b"qC");
    expect_reply(&mut peer, b"QC0001");

    // Legacy continue-thread selector and the "all threads" id.
    send_packet(&mut peer, b"Hc-1");
    expect_reply(&mut peer, b"OK");
    send_packet(&mut peer, b"Hg-1");
    expect_reply(&mut peer, b"OK");

    send_packet(&mut peer, b"T0");
    expect_reply(&mut peer, b"OK");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn unknown_and_empty_packets() {
    let stub = spawn_stub("127.0.0.1:47814", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47814");

    send_packet(&mut peer, b"R");
    expect_reply(&mut peer, b"");

    send_packet(&mut peer, b"");
    expect_reply(&mut peer, b"");

    send_packet(&mut peer, b"qUnknownThing:1");
    expect_reply(&mut peer, b"");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn missing_capabilities_reject_with_eperm() {
    let arch = Arch { target_desc: None, smp: 0, reg_num: REG_NUM };
    let stub = spawn_stub("127.0.0.1:47815", arch, MinimalTarget);
    let mut peer = connect_tcp("127.0.0.1:47815");

    send_packet(&mut peer, b"g");
    expect_reply(&mut peer, b"00000000000000000000000000000000");

    send_packet(&mut peer, b"c");
    expect_reply(&mut peer, b"E01");
    send_packet(&mut peer, b"s");
    expect_reply(&mut peer, b"E01");
    send_packet(&mut peer, b"M1000,1:aa");
    expect_reply(&mut peer, b"E01");
    send_packet(&mut peer, b"Z0,100,4");
    expect_reply(&mut peer, b"E01");
    send_packet(&mut peer, b"Hg0");
    expect_reply(&mut peer, b"E01");

    // Nothing to advertise.
    send_packet(&mut peer, b"vCont?");
    expect_reply(&mut peer, b"vCont;");
    send_packet(&mut peer, b"qC");
    expect_reply(&mut peer, b"");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

#[test]
fn repeated_violations_poison_the_connection() {
    let stub = spawn_stub("127.0.0.1:47816", arch_with_desc(), TestTarget::new());
    let mut peer = connect_tcp("127.0.0.1:47816");

    // CONN_MAX_FAILURES is 50; one more bad frame drops the client.
    for _ in 0..51 {
        peer.write_all(b"$?#ff").unwrap();
        expect_bytes(&mut peer, b"+-");
    }

    match stub.join().unwrap() {
        Err(StubError::Poisoned) => {}
        other => panic!("expected poisoned connection, got {other:?}"),
    }
}

#[test]
fn session_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rsplink.sock");
    let stub = spawn_stub(path.to_str().unwrap(), arch_with_desc(), TestTarget::new());
    let mut peer = connect_unix(&path);

    send_packet(&mut peer, b"?");
    expect_reply(&mut peer, b"S05");
    send_packet(&mut peer, b"m1000,4");
    expect_reply(&mut peer, b"00000000");

    detach(&mut peer);
    stub.join().unwrap().expect("clean detach");
}

use std::{
    fs,
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, info, warn};

use crate::{
    codec::{self, CSUM_LEN},
    error::StubError,
    packet::{PACKET_END, PACKET_START, Packet, PacketBuf},
};

/// Hard ceiling on one outbound frame, framing bytes included.
pub(crate) const MAX_SEND_PACKET_SIZE: usize = 0x1000;
/// Payload budget inside that frame: start/end markers, the checksum
/// digits, and two bytes of headroom for reply prefixes.
pub(crate) const MAX_DATA_PAYLOAD: usize = MAX_SEND_PACKET_SIZE - (2 + CSUM_LEN + 2);
/// Largest memory transfer a single `m`/`M`/`X` request may name: every
/// byte costs two hex chars in the reply.
pub(crate) const MAX_MEM_XFER_SIZE: usize = MAX_DATA_PAYLOAD / 2;

/// Inbound buffer cap. A stream that grows past this without framing a
/// single packet is noise, not a debugger.
const MAX_RECV_BUF: usize = 0x4000;

/// Consecutive framing/checksum violations tolerated before the peer is
/// declared poisoned.
pub(crate) const CONN_MAX_FAILURES: u32 = 50;

/// Out-of-band interrupt request byte.
pub(crate) const INTR_BYTE: u8 = 0x03;

const ACK: &[u8] = b"+";
const NACK: &[u8] = b"-";

/// Readiness slice for one outbound write attempt.
const SEND_POLL_SLICE_MS: i32 = 100;
/// Total patience with a peer that stops draining its socket.
const SEND_TIMEOUT_MS: i32 = 5_000;

/// Readiness poll on the raw fd; a negative timeout blocks indefinitely.
/// `EINTR` and timeouts both land on `false`, so callers loop.
fn poll_fd(fd: RawFd, events: libc::c_short, timeout_ms: libc::c_int) -> bool {
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    rc > 0 && (pfd.revents & events) != 0
}

fn readable(fd: RawFd, timeout_ms: i32) -> bool {
    poll_fd(fd, libc::POLLIN, timeout_ms)
}

fn writable(fd: RawFd, timeout_ms: i32) -> bool {
    poll_fd(fd, libc::POLLOUT, timeout_ms)
}

/// Where the stub listens: `<dotted-quad>[:<port>]` selects TCP, anything
/// else names a local socket path. Checked in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BindAddr {
    Tcp(SocketAddrV4),
    Local(PathBuf),
}

pub(crate) fn parse_bind_addr(s: &str) -> BindAddr {
    if let Some((host, port)) = s.split_once(':') {
        if let (Ok(ip), Ok(port)) = (host.parse::<Ipv4Addr>(), port.parse::<u16>()) {
            return BindAddr::Tcp(SocketAddrV4::new(ip, port));
        }
    } else if let Ok(ip) = s.parse::<Ipv4Addr>() {
        return BindAddr::Tcp(SocketAddrV4::new(ip, 0));
    }
    BindAddr::Local(PathBuf::from(s))
}

enum Listener {
    Tcp(TcpListener),
    Local(UnixListener),
}

/// Accepted peer stream, TCP or local-socket flavored. Always in
/// non-blocking mode; all waiting happens in readiness polls.
enum Stream {
    Tcp(TcpStream),
    Local(UnixStream),
}

impl Stream {
    fn fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Local(s) => s.as_raw_fd(),
        }
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Tcp(s) => Self::Tcp(s.try_clone()?),
            Self::Local(s) => Self::Local(s.try_clone()?),
        })
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => (&*s).write(buf),
            Self::Local(s) => (&*s).write(buf),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            Self::Local(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Local(s) => s.read(buf),
        }
    }
}

/// Writes all of `bytes`, slicing the readiness wait so a congested peer
/// cannot block the caller for more than `SEND_TIMEOUT_MS` overall.
fn send_all(stream: &Stream, bytes: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    let mut waited_ms = 0;
    while sent < bytes.len() {
        if !writable(stream.fd(), SEND_POLL_SLICE_MS) {
            waited_ms += SEND_POLL_SLICE_MS;
            if waited_ms >= SEND_TIMEOUT_MS {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "peer not accepting writes"));
            }
            continue;
        }
        match stream.write(&bytes[sent..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                sent += n;
                waited_ms = 0;
            }
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// The single accepted debugger connection.
///
/// Owns the inbound packet buffer and the outbound send path. The send
/// path is serialized through a mutex shared with the [`IntrPoller`] so a
/// reply and the watcher's interrupt ack can never interleave bytes.
pub(crate) struct Conn {
    _listener: Listener,
    stream: Stream,
    buf: PacketBuf,
    no_ack: Arc<AtomicBool>,
    failures: u32,
    send_lock: Arc<Mutex<()>>,
}

impl Conn {
    /// Binds `addr` and blocks until the debugger connects. Exactly one
    /// peer is accepted for the lifetime of the connection.
    pub fn listen(addr: &BindAddr) -> io::Result<Self> {
        let (listener, stream) = match addr {
            BindAddr::Tcp(sock) => {
                let listener = TcpListener::bind(sock)?;
                let (stream, peer) = listener.accept()?;
                info!(%peer, "client connected");
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                (Listener::Tcp(listener), Stream::Tcp(stream))
            }
            BindAddr::Local(path) => {
                // Stale socket file from a previous run.
                if path.exists() {
                    let _ = fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                let (stream, _) = listener.accept()?;
                info!(path = %path.display(), "client connected");
                stream.set_nonblocking(true)?;
                (Listener::Local(listener), Stream::Local(stream))
            }
        };
        Ok(Self {
            _listener: listener,
            stream,
            buf: PacketBuf::new(),
            no_ack: Arc::new(AtomicBool::new(false)),
            failures: 0,
            send_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Blocks until the buffer frames a complete packet or the peer goes
    /// away. Receipt is acked with `+` unless no-ack mode is latched.
    pub fn recv_packet(&mut self) -> Result<(), StubError> {
        while !self.buf.is_complete() {
            if self.buf.len() > MAX_RECV_BUF {
                warn!(len = self.buf.len(), "recv buffer overrun without a framed packet");
                self.buf.reset();
                if self.note_violation() {
                    return Err(StubError::Poisoned);
                }
            }
            if !readable(self.stream.fd(), -1) {
                continue;
            }
            match self.buf.fill_from(&mut self.stream) {
                Ok(0) => return Err(StubError::Disconnected),
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if !self.no_ack() {
            self.send_raw(ACK)?;
        }
        Ok(())
    }

    /// Splits off the received frame. Only meaningful after a successful
    /// [`recv_packet`](Self::recv_packet).
    pub fn pop_packet(&mut self) -> Option<Packet> {
        self.buf.pop()
    }

    /// Frames `payload` as `$<payload>#<cc>` and sends it.
    pub fn send_payload(&self, payload: &[u8]) -> io::Result<()> {
        assert!(payload.len() + 2 + CSUM_LEN <= MAX_SEND_PACKET_SIZE, "oversized reply payload");
        let mut frame = Vec::with_capacity(payload.len() + 2 + CSUM_LEN);
        frame.push(PACKET_START);
        frame.extend_from_slice(payload);
        frame.push(PACKET_END);
        codec::hex_encode(&[codec::checksum(payload)], &mut frame);
        debug!(frame = %String::from_utf8_lossy(&frame), "send");
        self.send_raw(&frame)
    }

    /// Rejects a corrupt frame so the debugger retransmits. Suppressed in
    /// no-ack mode.
    pub fn send_nack(&self) -> io::Result<()> {
        if self.no_ack() {
            return Ok(());
        }
        self.send_raw(NACK)
    }

    fn send_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = send_all(&self.stream, bytes);
        drop(guard);
        result
    }

    pub fn no_ack(&self) -> bool {
        self.no_ack.load(Ordering::Relaxed)
    }

    /// Latches no-ack mode; never unlatched for the connection lifetime.
    pub fn set_no_ack(&self) {
        self.no_ack.store(true, Ordering::Relaxed);
    }

    /// Counts one framing/checksum violation; true once the connection
    /// has burned through its allowance.
    pub fn note_violation(&mut self) -> bool {
        self.failures += 1;
        self.failures > CONN_MAX_FAILURES
    }

    /// A verified packet clears the violation streak.
    pub fn note_verified(&mut self) {
        self.failures = 0;
    }

    /// Builds the watcher-thread half of this connection.
    pub fn intr_poller(&self) -> io::Result<IntrPoller> {
        Ok(IntrPoller {
            stream: self.stream.try_clone()?,
            no_ack: Arc::clone(&self.no_ack),
            send_lock: Arc::clone(&self.send_lock),
        })
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.stream.shutdown();
    }
}

/// Watcher-thread half of the connection: a cloned stream handle good for
/// single-byte interrupt probes and a best-effort ack.
pub(crate) struct IntrPoller {
    stream: Stream,
    no_ack: Arc<AtomicBool>,
    send_lock: Arc<Mutex<()>>,
}

impl IntrPoller {
    /// Waits up to `timeout_ms` for inbound bytes without consuming any.
    pub fn poll_readable(&self, timeout_ms: i32) -> bool {
        readable(self.stream.fd(), timeout_ms)
    }

    /// True iff a byte is immediately readable and it is the interrupt
    /// request. Stray `+`/`-` acks are discarded (the peer may still be
    /// draining its side of a no-ack handshake); anything else is a
    /// protocol violation from a confused client and is dropped.
    pub fn try_recv_intr(&mut self) -> bool {
        if !readable(self.stream.fd(), 0) {
            return false;
        }
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(1) => match byte[0] {
                INTR_BYTE => true,
                b'+' | b'-' => false,
                other => {
                    warn!(byte = other, "unexpected byte while target is running");
                    false
                }
            },
            _ => false,
        }
    }

    /// Acks a consumed interrupt byte without ever contending with an
    /// in-flight reply: skipped when the send lock is busy or acks are
    /// off.
    pub fn try_send_ack(&self) {
        if self.no_ack.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(guard) = self.send_lock.try_lock() {
            if let Err(err) = send_all(&self.stream, ACK) {
                debug!(?err, "interrupt ack dropped");
            }
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_detection_order() {
        assert_eq!(
            parse_bind_addr("127.0.0.1:1234"),
            BindAddr::Tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1234))
        );
        assert_eq!(
            parse_bind_addr("10.0.0.2"),
            BindAddr::Tcp(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 0))
        );
        assert_eq!(
            parse_bind_addr("/tmp/stub.sock"),
            BindAddr::Local(PathBuf::from("/tmp/stub.sock"))
        );
        // Not a dotted quad: falls through to the local-socket form.
        assert_eq!(
            parse_bind_addr("localhost:1234"),
            BindAddr::Local(PathBuf::from("localhost:1234"))
        );
    }

    #[test]
    fn size_budgets_are_consistent() {
        assert_eq!(MAX_DATA_PAYLOAD, MAX_SEND_PACKET_SIZE - 6);
        assert_eq!(MAX_MEM_XFER_SIZE, MAX_DATA_PAYLOAD / 2);
        assert!(MAX_MEM_XFER_SIZE * 2 <= MAX_DATA_PAYLOAD);
    }
}

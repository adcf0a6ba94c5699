use std::fmt::Write as _;

use tracing::{debug, warn};

use crate::{
    codec,
    conn::{MAX_DATA_PAYLOAD, MAX_MEM_XFER_SIZE},
    error::StubError,
    packet::{PACKET_START, Packet},
    stub::{Event, GdbStub},
    target::{BreakpointKind, Capabilities, Target},
};

/// RSP error numbers used in `E<hh>` replies.
const EPERM: u8 = 0x01;
const ENOMEM: u8 = 0x0c;
const EINVAL: u8 = 0x16;

/// Ceiling on the advertised CPU count; thread ids are formatted as four
/// decimal digits.
const MAX_SMP_COUNT: usize = 10_000;

impl GdbStub {
    /// Validates one framed packet and dispatches its command. Replies are
    /// sent from here; the returned event drives the outer run loop.
    pub(crate) fn process_packet<T: Target>(
        &mut self,
        target: &mut T,
        pkt: &Packet,
    ) -> Result<Event, StubError> {
        if pkt.as_bytes().first() != Some(&PACKET_START) {
            return self.violation();
        }

        let mut expected = [0u8; 1];
        codec::hex_decode(pkt.csum_digits(), &mut expected);
        if codec::checksum(pkt.body()) != expected[0] {
            debug!("checksum mismatch, dropping packet");
            self.conn.send_nack()?;
            return self.violation();
        }
        self.conn.note_verified();

        let body = pkt.body();
        debug!(packet = %String::from_utf8_lossy(body), "recv");
        let Some((&request, payload)) = body.split_first() else {
            // Bare `$#00`: nothing to dispatch.
            self.conn.send_payload(b"")?;
            return Ok(Event::None);
        };

        let event = match request {
            b'?' => {
                self.conn.send_payload(b"S05")?;
                Event::None
            }
            b'c' => self.process_cont(target)?,
            b's' => self.process_stepi(target)?,
            b'D' => Event::Detach,
            b'v' => self.process_vpacket(target, payload)?,
            b'g' => {
                self.reg_read_all(target)?;
                Event::None
            }
            b'G' => {
                self.reg_write_all(target, payload)?;
                Event::None
            }
            b'p' => {
                self.reg_read_one(target, payload)?;
                Event::None
            }
            b'P' => {
                self.reg_write_one(target, payload)?;
                Event::None
            }
            b'm' => {
                self.mem_read(target, payload)?;
                Event::None
            }
            b'M' => {
                self.mem_write(target, payload)?;
                Event::None
            }
            b'X' => {
                self.mem_write_binary(target, payload)?;
                Event::None
            }
            b'z' => {
                self.breakpoint_remove(target, payload)?;
                Event::None
            }
            b'Z' => {
                self.breakpoint_insert(target, payload)?;
                Event::None
            }
            b'H' => {
                self.cpu_select(target, payload)?;
                Event::None
            }
            b'T' => {
                // Thread-alive probe; every modeled CPU stays alive.
                self.conn.send_payload(b"OK")?;
                Event::None
            }
            b'q' | b'Q' => {
                self.process_query(target, request, payload)?;
                Event::None
            }
            _ => {
                // Unknown request: the empty reply is the protocol's
                // "unsupported" answer.
                self.conn.send_payload(b"")?;
                Event::None
            }
        };
        Ok(event)
    }

    /// Books one framing/checksum violation against the connection.
    fn violation(&mut self) -> Result<Event, StubError> {
        if self.conn.note_violation() {
            warn!("too many protocol violations, dropping the client");
            return Err(StubError::Poisoned);
        }
        Ok(Event::None)
    }

    fn send_err(&self, code: u8) -> Result<(), StubError> {
        let reply = format!("E{code:02x}");
        self.conn.send_payload(reply.as_bytes())?;
        Ok(())
    }

    fn send_ok(&self) -> Result<(), StubError> {
        self.conn.send_payload(b"OK")?;
        Ok(())
    }

    /// Scratch slice for register transfers; grows by doubling and is
    /// reused across commands.
    fn scratch(&mut self, len: usize) -> &mut [u8] {
        if self.reg_scratch.len() < len {
            let mut grown = self.reg_scratch.len().max(8);
            while grown < len {
                grown *= 2;
            }
            self.reg_scratch.resize(grown, 0);
        }
        &mut self.reg_scratch[..len]
    }

    fn process_cont<T: Target>(&self, target: &T) -> Result<Event, StubError> {
        if !target.capabilities().contains(Capabilities::CONT) {
            self.send_err(EPERM)?;
            return Ok(Event::None);
        }
        Ok(Event::Cont)
    }

    fn process_stepi<T: Target>(&self, target: &T) -> Result<Event, StubError> {
        if !target.capabilities().contains(Capabilities::STEPI) {
            self.send_err(EPERM)?;
            return Ok(Event::None);
        }
        Ok(Event::Step)
    }

    /// `g`: concatenated hex of the whole register file in index order.
    fn reg_read_all<T: Target>(&mut self, target: &mut T) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::READ_REG) {
            return self.send_err(EPERM);
        }
        let mut reply = Vec::with_capacity(self.total_reg_bytes * 2);
        for regno in 0..self.arch.reg_num {
            let reg_sz = target.reg_bytes(regno);
            if reply.len() + reg_sz * 2 > MAX_DATA_PAYLOAD {
                return self.send_err(ENOMEM);
            }
            let value = self.scratch(reg_sz);
            match target.read_reg(regno, value) {
                Ok(()) => codec::hex_encode(value, &mut reply),
                Err(err) => return self.send_err(err.code()),
            }
        }
        self.conn.send_payload(&reply)?;
        Ok(())
    }

    /// `G`: writes the whole register file. Atomic over the file: a
    /// failed write rolls the already-written registers back to their
    /// previous values before the error reply goes out.
    fn reg_write_all<T: Target>(&mut self, target: &mut T, payload: &[u8]) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::WRITE_REG) {
            return self.send_err(EPERM);
        }
        if self.total_reg_bytes == 0 {
            return self.send_ok();
        }
        if payload.len() != self.total_reg_bytes * 2 {
            return self.send_err(EINVAL);
        }

        let mut new_values = vec![0u8; self.total_reg_bytes];
        codec::hex_decode(payload, &mut new_values);

        // Snapshot the current file; rollback needs it, and a register we
        // cannot read is a register we must not overwrite.
        let mut backup = vec![0u8; self.total_reg_bytes];
        let mut offset = 0;
        for regno in 0..self.arch.reg_num {
            let reg_sz = target.reg_bytes(regno);
            if let Err(err) = target.read_reg(regno, &mut backup[offset..offset + reg_sz]) {
                return self.send_err(err.code());
            }
            offset += reg_sz;
        }

        let mut offset = 0;
        for regno in 0..self.arch.reg_num {
            let reg_sz = target.reg_bytes(regno);
            if let Err(err) = target.write_reg(regno, &new_values[offset..offset + reg_sz]) {
                let mut undo = 0;
                for prev in 0..regno {
                    let prev_sz = target.reg_bytes(prev);
                    let _ = target.write_reg(prev, &backup[undo..undo + prev_sz]);
                    undo += prev_sz;
                }
                return self.send_err(err.code());
            }
            offset += reg_sz;
        }
        self.send_ok()
    }

    /// `p<regno>`: one register as hex.
    fn reg_read_one<T: Target>(&mut self, target: &mut T, payload: &[u8]) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::READ_REG) {
            return self.send_err(EPERM);
        }
        let Some(regno) = codec::parse_hex(payload) else {
            return self.send_err(EINVAL);
        };
        if regno >= self.arch.reg_num {
            return self.send_err(EINVAL);
        }
        let reg_sz = target.reg_bytes(regno);
        let mut reply = Vec::with_capacity(reg_sz * 2);
        let value = self.scratch(reg_sz);
        match target.read_reg(regno, value) {
            Ok(()) => codec::hex_encode(value, &mut reply),
            Err(err) => return self.send_err(err.code()),
        }
        self.conn.send_payload(&reply)?;
        Ok(())
    }

    /// `P<regno>=<hex>`: writes one register.
    fn reg_write_one<T: Target>(&mut self, target: &mut T, payload: &[u8]) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::WRITE_REG) {
            return self.send_err(EPERM);
        }
        let Some(eq) = payload.iter().position(|&b| b == b'=') else {
            return self.send_err(EINVAL);
        };
        let Some(regno) = codec::parse_hex(&payload[..eq]) else {
            return self.send_err(EINVAL);
        };
        if regno >= self.arch.reg_num {
            return self.send_err(EINVAL);
        }
        let value_hex = &payload[eq + 1..];
        let reg_sz = target.reg_bytes(regno);
        if value_hex.len() != reg_sz * 2 {
            return self.send_err(EINVAL);
        }
        let value = self.scratch(reg_sz);
        codec::hex_decode(value_hex, value);
        debug!(regno, value = %String::from_utf8_lossy(value_hex), "reg write");
        match target.write_reg(regno, value) {
            Ok(()) => self.send_ok(),
            Err(err) => self.send_err(err.code()),
        }
    }

    /// `m<addr>,<len>`: target memory as hex.
    fn mem_read<T: Target>(&mut self, target: &mut T, payload: &[u8]) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::READ_MEM) {
            return self.send_err(EPERM);
        }
        let Some((addr, len)) = parse_addr_len(payload) else {
            return self.send_err(EINVAL);
        };
        if len == 0 || len > MAX_MEM_XFER_SIZE {
            return self.send_err(EINVAL);
        }
        debug!(addr, len, "mem read");
        let mut data = vec![0u8; len];
        match target.read_mem(addr, &mut data) {
            Ok(()) => {
                let mut reply = Vec::with_capacity(len * 2);
                codec::hex_encode(&data, &mut reply);
                self.conn.send_payload(&reply)?;
                Ok(())
            }
            Err(err) => self.send_err(err.code()),
        }
    }

    /// `M<addr>,<len>:<hex>`: writes target memory from a hex blob.
    fn mem_write<T: Target>(&mut self, target: &mut T, payload: &[u8]) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::WRITE_MEM) {
            return self.send_err(EPERM);
        }
        let Some(colon) = payload.iter().position(|&b| b == b':') else {
            return self.send_err(EINVAL);
        };
        let Some((addr, len)) = parse_addr_len(&payload[..colon]) else {
            return self.send_err(EINVAL);
        };
        let content = &payload[colon + 1..];
        if len == 0 || len > MAX_MEM_XFER_SIZE || content.len() != len * 2 {
            return self.send_err(EINVAL);
        }
        debug!(addr, len, "mem write");
        let mut data = vec![0u8; len];
        codec::hex_decode(content, &mut data);
        match target.write_mem(addr, &data) {
            Ok(()) => self.send_ok(),
            Err(err) => self.send_err(err.code()),
        }
    }

    /// `X<addr>,<len>:<binary>`: writes target memory from the escaped
    /// binary form. A zero-length write is the debugger probing for `X`
    /// support and succeeds without touching the target's memory map.
    fn mem_write_binary<T: Target>(
        &mut self,
        target: &mut T,
        payload: &[u8],
    ) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::WRITE_MEM) {
            return self.send_err(EPERM);
        }
        let Some(colon) = payload.iter().position(|&b| b == b':') else {
            return self.send_err(EINVAL);
        };
        let Some((addr, len)) = parse_addr_len(&payload[..colon]) else {
            return self.send_err(EINVAL);
        };
        if len > MAX_MEM_XFER_SIZE {
            return self.send_err(EINVAL);
        }
        let data = codec::unescape(&payload[colon + 1..]);
        if data.len() != len {
            return self.send_err(EINVAL);
        }
        debug!(addr, len, "mem write (binary)");
        match target.write_mem(addr, &data) {
            Ok(()) => self.send_ok(),
            Err(err) => self.send_err(err.code()),
        }
    }

    /// `z<type>,<addr>,<len>`: disarms a breakpoint or watchpoint.
    fn breakpoint_remove<T: Target>(
        &mut self,
        target: &mut T,
        payload: &[u8],
    ) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::DEL_BP) {
            return self.send_err(EPERM);
        }
        let Some((kind, addr, len)) = parse_bp_args(payload) else {
            return self.send_err(EINVAL);
        };
        debug!(?kind, addr, len, "del breakpoint");
        if target.del_bp(addr, len, kind) { self.send_ok() } else { self.send_err(EINVAL) }
    }

    /// `Z<type>,<addr>,<len>`: arms a breakpoint or watchpoint.
    fn breakpoint_insert<T: Target>(
        &mut self,
        target: &mut T,
        payload: &[u8],
    ) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::SET_BP) {
            return self.send_err(EPERM);
        }
        let Some((kind, addr, len)) = parse_bp_args(payload) else {
            return self.send_err(EINVAL);
        };
        debug!(?kind, addr, len, "set breakpoint");
        if target.set_bp(addr, len, kind) { self.send_ok() } else { self.send_err(EINVAL) }
    }

    /// `H<op><id>`: `Hg` selects the CPU for subsequent operations, `Hc`
    /// is the legacy continue-thread selector and is accepted as a no-op.
    fn cpu_select<T: Target>(&mut self, target: &mut T, payload: &[u8]) -> Result<(), StubError> {
        if !target.capabilities().contains(Capabilities::SET_CPU) {
            return self.send_err(EPERM);
        }
        if let Some((&b'g', id)) = payload.split_first() {
            let Some(id) = std::str::from_utf8(id).ok().and_then(|s| s.parse::<i64>().ok())
            else {
                return self.send_err(EINVAL);
            };
            // Negative ids are the debugger's "all threads" form; there is
            // no CPU to switch to.
            if id >= 0 {
                target.set_cpu(id as usize);
            }
        }
        self.send_ok()
    }

    /// `q`/`Q` general queries.
    fn process_query<T: Target>(
        &mut self,
        target: &mut T,
        request: u8,
        payload: &[u8],
    ) -> Result<(), StubError> {
        let (name, qargs) = match payload.iter().position(|&b| b == b':') {
            Some(i) => (&payload[..i], &payload[i + 1..]),
            None => (payload, &payload[..0]),
        };
        match (request, name) {
            (b'q', b"C") => {
                if target.capabilities().contains(Capabilities::GET_CPU) {
                    let reply = format!("QC{:04}", target.cur_cpu());
                    self.conn.send_payload(reply.as_bytes())?;
                } else {
                    self.conn.send_payload(b"")?;
                }
            }
            (b'q', b"Supported") => {
                let mut reply = String::from("PacketSize=1024");
                if self.arch.target_desc.is_some() {
                    reply.push_str(";qXfer:features:read+");
                }
                reply.push_str(";hwbreak+;swbreak+");
                self.conn.send_payload(reply.as_bytes())?;
            }
            // Assume the stub is attached to an already-running program.
            (b'q', b"Attached") => self.conn.send_payload(b"1")?,
            (b'q', b"Xfer") => self.xfer(qargs)?,
            (b'q', b"Symbol") => self.send_ok()?,
            (b'q', b"fThreadInfo") => self.thread_info()?,
            (b'q', b"sThreadInfo") => self.conn.send_payload(b"l")?,
            (b'Q', b"StartNoAckMode") => {
                self.conn.set_no_ack();
                self.send_ok()?;
            }
            _ => self.conn.send_payload(b"")?,
        }
        Ok(())
    }

    /// `qXfer:features:read:target.xml:<offset>,<length>`: serves one
    /// slice of the target description, prefixed `l` when it completes
    /// the document and `m` when more follows.
    fn xfer(&self, qargs: &[u8]) -> Result<(), StubError> {
        let mut fields = qargs.split(|&b| b == b':');
        let (Some(b"features"), Some(b"read"), Some(b"target.xml"), Some(range)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            self.conn.send_payload(b"")?;
            return Ok(());
        };
        let Some(desc) = self.arch.target_desc.as_deref() else {
            self.conn.send_payload(b"")?;
            return Ok(());
        };
        let Some((offset, length)) = parse_addr_len(range) else {
            self.conn.send_payload(b"")?;
            return Ok(());
        };
        debug!(offset, length, "xfer target description");

        let total = desc.len();
        if offset >= total {
            self.conn.send_payload(b"l")?;
            return Ok(());
        }
        let slice_len = length.min(total - offset).min(MAX_DATA_PAYLOAD - 1);
        let mut reply = Vec::with_capacity(slice_len + 1);
        reply.push(if offset + slice_len >= total { b'l' } else { b'm' });
        reply.extend_from_slice(&desc.as_bytes()[offset..offset + slice_len]);
        self.conn.send_payload(&reply)?;
        Ok(())
    }

    /// `qfThreadInfo`: every modeled CPU as a four-digit decimal id, in
    /// one chunk. `qsThreadInfo` then closes the list with `l`.
    fn thread_info(&self) -> Result<(), StubError> {
        let smp = self.arch.smp.max(1).min(MAX_SMP_COUNT);
        let mut reply = String::with_capacity(1 + smp * 5);
        reply.push('m');
        for cpu in 0..smp {
            if reply.len() + 5 > MAX_DATA_PAYLOAD {
                warn!(smp, "thread list truncated to fit the reply budget");
                break;
            }
            let _ = write!(reply, "{cpu:04},");
        }
        self.conn.send_payload(reply.as_bytes())?;
        Ok(())
    }

    /// `v` multi-letter requests; only the `vCont` family is meaningful
    /// here.
    fn process_vpacket<T: Target>(
        &mut self,
        target: &mut T,
        payload: &[u8],
    ) -> Result<Event, StubError> {
        let (name, vargs) = match payload.iter().position(|&b| b == b';') {
            Some(i) => (&payload[..i], &payload[i + 1..]),
            None => (payload, &payload[..0]),
        };
        match name {
            b"Cont?" => {
                // Advertise exactly what the target can do; no signal
                // actions, no thread selectors.
                let mut reply = String::from("vCont;");
                if target.capabilities().contains(Capabilities::STEPI) {
                    reply.push_str("s;");
                }
                if target.capabilities().contains(Capabilities::CONT) {
                    reply.push_str("c;");
                }
                self.conn.send_payload(reply.as_bytes())?;
                Ok(Event::None)
            }
            b"Cont" => self.vcont(target, vargs),
            _ => {
                self.conn.send_payload(b"")?;
                Ok(Event::None)
            }
        }
    }

    /// Only the first `vCont` action is honored; CPU selection goes
    /// through `H` instead of per-action thread ids.
    fn vcont<T: Target>(&self, target: &T, vargs: &[u8]) -> Result<Event, StubError> {
        let Some(&action) = vargs.first() else {
            self.send_err(EINVAL)?;
            return Ok(Event::None);
        };
        match action {
            b'c' => self.process_cont(target),
            b's' => self.process_stepi(target),
            _ => {
                // Includes `C`/`S` with a signal, which make no sense for
                // a hardware target.
                self.send_err(EPERM)?;
                Ok(Event::None)
            }
        }
    }
}

/// Parses the `<hex>,<hex>` argument pair of the memory and xfer packets.
fn parse_addr_len(payload: &[u8]) -> Option<(usize, usize)> {
    let comma = payload.iter().position(|&b| b == b',')?;
    let addr = codec::parse_hex(&payload[..comma])?;
    let len = codec::parse_hex(&payload[comma + 1..])?;
    Some((addr, len))
}

/// Parses `<type>,<addr>,<len>` of the `Z`/`z` packets, rejecting unknown
/// breakpoint types.
fn parse_bp_args(payload: &[u8]) -> Option<(BreakpointKind, usize, usize)> {
    let mut fields = payload.splitn(3, |&b| b == b',');
    let kind = BreakpointKind::from_code(codec::parse_hex(fields.next()?)?)?;
    let addr = codec::parse_hex(fields.next()?)?;
    let len = codec::parse_hex(fields.next()?)?;
    Some((kind, addr, len))
}

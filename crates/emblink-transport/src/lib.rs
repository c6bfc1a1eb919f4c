/*! Port multiplexing and message segmentation on top of [`emblink_link`].

A [`Transport`] owns one [`DataLink`] and fans its byte-oriented send/recv
contract out to up to [`N_PORTS`] logical ports, each with its own pair of
callbacks and per-port reassembly scratch. Port 0 is reserved: it answers a
small built-in management protocol (STATUS/ECHO/TIMESYNC/META) instead of
being available for application registration.

Handlers are plain function pointers plus an opaque `usize` user-data
token, not trait objects or closures -- the same "dynamic dispatch without
an allocator" shape the teacher's key matrix and report builders use for
their own callback hooks, just generalized to the transport's shape.
*/
#![no_std]

use emblink_common::bus::ByteSink;
use emblink_common::time::Clock;
use emblink_framer::{Segment, MAX_PAYLOAD_LEN};
use emblink_link::{
    pack_metadata, unpack_metadata, DataLink, LinkEvent, LinkEventSink, LinkTimings,
    SendError as LinkSendError,
};

pub const N_PORTS: usize = 32;
pub const MANAGEMENT_PORT: u8 = 0;

/// Upper bound on a fully reassembled message. Segmentation only exists to
/// carry a "short burst" (see the crate's non-goals); this is generous
/// enough for the concrete 700-byte scenario with headroom, not a general
/// streaming buffer.
pub const MAX_REASSEMBLED_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Full,
    TooBig,
    NotConnected,
    ParameterInvalid,
}

impl From<LinkSendError> for SendError {
    fn from(e: LinkSendError) -> Self {
        match e {
            LinkSendError::Full => SendError::Full,
            LinkSendError::TooBig => SendError::TooBig,
            LinkSendError::NotConnected => SendError::NotConnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// Port 0 is reserved for the management protocol.
    ReservedPort,
    InvalidPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Link(LinkEvent),
    /// An out-of-order or over-length segment broke this port's reassembly.
    ReassemblyError,
}

pub type EventFn = fn(user_data: usize, event: TransportEvent);
pub type RecvFn = fn(user_data: usize, port_id: u8, port_data: u16, msg: &[u8]);

#[derive(Clone, Copy, Default)]
pub struct PortHandlers {
    pub event_fn: Option<EventFn>,
    pub recv_fn: Option<RecvFn>,
    pub user_data: usize,
    pub meta_json: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScratchState {
    Idle,
    Collecting,
}

#[derive(Clone, Copy)]
struct ReassemblyScratch {
    state: ScratchState,
    port_data: u16,
    len: usize,
    buffer: [u8; MAX_REASSEMBLED_LEN],
}

impl ReassemblyScratch {
    const EMPTY: Self = ReassemblyScratch {
        state: ScratchState::Idle,
        port_data: 0,
        len: 0,
        buffer: [0u8; MAX_REASSEMBLED_LEN],
    };
}

enum ReassemblyOutcome {
    Pending,
    Delivered,
    Error,
}

fn feed_reassembly(scratch: &mut ReassemblyScratch, segment: Segment, port_data: u16, msg: &[u8]) -> ReassemblyOutcome {
    match segment {
        Segment::Single => {
            if msg.len() > MAX_REASSEMBLED_LEN {
                return ReassemblyOutcome::Error;
            }
            scratch.buffer[..msg.len()].copy_from_slice(msg);
            scratch.len = msg.len();
            scratch.port_data = port_data;
            scratch.state = ScratchState::Idle;
            ReassemblyOutcome::Delivered
        }
        Segment::Start => {
            scratch.state = ScratchState::Idle;
            if msg.len() > MAX_REASSEMBLED_LEN {
                return ReassemblyOutcome::Error;
            }
            scratch.buffer[..msg.len()].copy_from_slice(msg);
            scratch.len = msg.len();
            scratch.port_data = port_data;
            scratch.state = ScratchState::Collecting;
            ReassemblyOutcome::Pending
        }
        Segment::Middle | Segment::Stop => {
            if scratch.state != ScratchState::Collecting || scratch.port_data != port_data {
                scratch.state = ScratchState::Idle;
                return ReassemblyOutcome::Error;
            }
            if scratch.len + msg.len() > MAX_REASSEMBLED_LEN {
                scratch.state = ScratchState::Idle;
                return ReassemblyOutcome::Error;
            }
            scratch.buffer[scratch.len..scratch.len + msg.len()].copy_from_slice(msg);
            scratch.len += msg.len();
            if segment == Segment::Stop {
                scratch.state = ScratchState::Idle;
                ReassemblyOutcome::Delivered
            } else {
                ReassemblyOutcome::Pending
            }
        }
    }
}

#[derive(Clone, Copy)]
struct PortSlot {
    handlers: Option<PortHandlers>,
    scratch: ReassemblyScratch,
}

impl PortSlot {
    const EMPTY: Self = PortSlot { handlers: None, scratch: ReassemblyScratch::EMPTY };
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementOp {
    Status = 0,
    Echo = 1,
    TimeSync = 2,
    Meta = 3,
}

fn pack_mgmt(is_response: bool, opcode: u8) -> u16 {
    ((is_response as u16) << 15) | ((opcode as u16) << 7)
}

fn unpack_mgmt(port_data: u16) -> (bool, u8) {
    (((port_data >> 15) & 1) != 0, ((port_data >> 7) & 0xFF) as u8)
}

struct PendingMgmt {
    port_data: u16,
    buf: [u8; MAX_PAYLOAD_LEN],
    len: usize,
}

fn handle_management_request(ports: &[PortSlot; N_PORTS], clock_ms: u32, port_data: u16, msg: &[u8]) -> Option<PendingMgmt> {
    let (is_response, opcode) = unpack_mgmt(port_data);
    if is_response {
        // We never issue our own management requests; an unsolicited
        // response is simply ignored.
        return None;
    }

    let mut resp = PendingMgmt { port_data: 0, buf: [0u8; MAX_PAYLOAD_LEN], len: 0 };
    if opcode == ManagementOp::Status as u8 {
        resp.buf[0] = ports.iter().filter(|p| p.handlers.is_some()).count() as u8;
        resp.len = 1;
    } else if opcode == ManagementOp::Echo as u8 {
        let len = msg.len().min(MAX_PAYLOAD_LEN);
        resp.buf[..len].copy_from_slice(&msg[..len]);
        resp.len = len;
    } else if opcode == ManagementOp::TimeSync as u8 {
        resp.buf[..4].copy_from_slice(&clock_ms.to_le_bytes());
        resp.len = 4;
    } else if opcode == ManagementOp::Meta as u8 {
        if let Some(&queried) = msg.first() {
            if let Some(meta) = ports.get(queried as usize).and_then(|p| p.handlers.as_ref()).and_then(|h| h.meta_json) {
                let bytes = meta.as_bytes();
                let len = bytes.len().min(MAX_PAYLOAD_LEN);
                resp.buf[..len].copy_from_slice(&bytes[..len]);
                resp.len = len;
            }
        }
    } else {
        return None;
    }

    resp.port_data = pack_mgmt(true, opcode);
    Some(resp)
}

fn dispatch_port_event(ports: &[PortSlot; N_PORTS], event: TransportEvent) {
    for slot in ports.iter() {
        if let Some(h) = &slot.handlers {
            if let Some(f) = h.event_fn {
                f(h.user_data, event);
            }
        }
    }
}

struct RecvAdapter<'a> {
    ports: &'a mut [PortSlot; N_PORTS],
    pending: &'a mut Option<PendingMgmt>,
    clock_ms: u32,
}

impl<'a> LinkEventSink for RecvAdapter<'a> {
    fn on_event(&mut self, event: LinkEvent) -> bool {
        dispatch_port_event(self.ports, TransportEvent::Link(event));
        true
    }

    fn on_recv(&mut self, metadata: u32, msg: &[u8]) {
        let (port_data, segment, port_id, _reserved) = unpack_metadata(metadata);
        let idx = port_id as usize % N_PORTS;

        let outcome = feed_reassembly(&mut self.ports[idx].scratch, segment, port_data, msg);

        if idx == MANAGEMENT_PORT as usize {
            if let ReassemblyOutcome::Delivered = outcome {
                let req_port_data = self.ports[idx].scratch.port_data;
                let len = self.ports[idx].scratch.len;
                let msg_slice = &self.ports[idx].scratch.buffer[..len];
                *self.pending = handle_management_request(self.ports, self.clock_ms, req_port_data, msg_slice);
            }
            return;
        }

        match outcome {
            ReassemblyOutcome::Delivered => {
                if let Some(h) = &self.ports[idx].handlers {
                    if let Some(f) = h.recv_fn {
                        let scratch = &self.ports[idx].scratch;
                        f(h.user_data, port_id, scratch.port_data, &scratch.buffer[..scratch.len]);
                    }
                }
            }
            ReassemblyOutcome::Error => {
                if let Some(h) = &self.ports[idx].handlers {
                    if let Some(f) = h.event_fn {
                        f(h.user_data, TransportEvent::ReassemblyError);
                    }
                }
            }
            ReassemblyOutcome::Pending => {}
        }
    }
}

struct LinkTickAdapter<'a> {
    ports: &'a mut [PortSlot; N_PORTS],
}

impl<'a> LinkEventSink for LinkTickAdapter<'a> {
    fn on_event(&mut self, event: LinkEvent) -> bool {
        dispatch_port_event(self.ports, TransportEvent::Link(event));
        true
    }

    fn on_recv(&mut self, _metadata: u32, _msg: &[u8]) {
        unreachable!("DataLink::process/request_reset never deliver payloads")
    }
}

/// A port-multiplexed transport over a Go-back-N data link.
pub struct Transport<Ts: LinkTimings, CK: Clock + Clone, S: ByteSink, const TX_WIN: usize, const RX_WIN: usize> {
    link: DataLink<Ts, CK, S, TX_WIN, RX_WIN>,
    clock: CK,
    ports: [PortSlot; N_PORTS],
    pending_mgmt: Option<PendingMgmt>,
}

impl<Ts: LinkTimings, CK: Clock + Clone, S: ByteSink, const TX_WIN: usize, const RX_WIN: usize>
    Transport<Ts, CK, S, TX_WIN, RX_WIN>
{
    pub fn new(sink: S, clock: CK) -> Self {
        let link = DataLink::new(sink, clock.clone());
        Transport { link, clock, ports: [PortSlot::EMPTY; N_PORTS], pending_mgmt: None }
    }

    pub fn link(&self) -> &DataLink<Ts, CK, S, TX_WIN, RX_WIN> {
        &self.link
    }

    /// Installs handlers for `port_id`. Re-registration replaces the
    /// previous handlers. Port 0 is reserved for the management protocol.
    pub fn register(&mut self, port_id: u8, handlers: PortHandlers) -> Result<(), RegisterError> {
        if port_id == MANAGEMENT_PORT {
            return Err(RegisterError::ReservedPort);
        }
        let idx = port_id as usize;
        if idx >= N_PORTS {
            return Err(RegisterError::InvalidPort);
        }
        self.ports[idx].handlers = Some(handlers);
        Ok(())
    }

    /// Sends `msg` on `port_id` under `port_data`. Messages over
    /// [`MAX_PAYLOAD_LEN`] bytes are split into a START/MIDDLE.../STOP run
    /// of frames sharing the same `port_data`; shorter ones go as a single
    /// SINGLE frame. If a later chunk's underlying `DataLink::send` fails
    /// (e.g. the TX window fills), earlier chunks already queued are not
    /// rolled back -- callers sending messages close to the window's
    /// capacity should size their TX window accordingly.
    pub fn send(&mut self, port_id: u8, port_data: u16, msg: &[u8]) -> Result<(), SendError> {
        if port_id as usize >= N_PORTS || msg.is_empty() {
            return Err(SendError::ParameterInvalid);
        }

        if msg.len() <= MAX_PAYLOAD_LEN {
            let metadata = pack_metadata(port_data, Segment::Single, port_id, false);
            return self.link.send(metadata, msg).map_err(SendError::from);
        }

        let mut offset = 0;
        let mut first = true;
        while offset < msg.len() {
            let chunk_len = (msg.len() - offset).min(MAX_PAYLOAD_LEN);
            let is_last = offset + chunk_len >= msg.len();
            let segment = match (first, is_last) {
                (true, true) => Segment::Single,
                (true, false) => Segment::Start,
                (false, true) => Segment::Stop,
                (false, false) => Segment::Middle,
            };
            let metadata = pack_metadata(port_data, segment, port_id, false);
            self.link.send(metadata, &msg[offset..offset + chunk_len]).map_err(SendError::from)?;
            offset += chunk_len;
            first = false;
        }
        Ok(())
    }

    pub fn recv_byte(&mut self, byte: u8) {
        let clock_ms = self.clock.current_ms();
        let Transport { link, ports, pending_mgmt, .. } = self;
        let mut adapter = RecvAdapter { ports, pending: pending_mgmt, clock_ms };
        link.recv_byte(byte, &mut adapter);
    }

    /// Sends any pending management response, then drives the link's
    /// retransmit/reset timers.
    pub fn process(&mut self) {
        if let Some(pending) = self.pending_mgmt.take() {
            let metadata = pack_metadata(pending.port_data, Segment::Single, MANAGEMENT_PORT, false);
            let _ = self.link.send(metadata, &pending.buf[..pending.len]);
        }

        let Transport { link, ports, .. } = self;
        let mut adapter = LinkTickAdapter { ports };
        link.process(&mut adapter);
    }

    pub fn request_reset(&mut self) {
        let Transport { link, ports, .. } = self;
        let mut adapter = LinkTickAdapter { ports };
        link.request_reset(&mut adapter);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use emblink_common::bus::SendError as BusSendError;
    use emblink_link::{DefaultLinkTimings, LinkState};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Clone, Default)]
    struct TestClock {
        now_ns: Rc<Cell<u64>>,
    }
    impl Clock for TestClock {
        fn current_nanos(&self) -> u64 {
            self.now_ns.get()
        }
    }

    #[derive(Default)]
    struct LoopbackSink {
        out: Rc<RefCell<Vec<u8>>>,
    }
    impl ByteSink for LoopbackSink {
        fn send(&mut self, bytes: &[u8]) -> Result<(), BusSendError> {
            self.out.borrow_mut().extend_from_slice(bytes);
            Ok(())
        }
        fn send_available(&self) -> usize {
            8192
        }
    }

    type TestTransport = Transport<DefaultLinkTimings, TestClock, LoopbackSink, 8, 8>;
    type Pipe = Rc<RefCell<Vec<u8>>>;

    fn new_pair() -> (TestTransport, TestTransport, Pipe, Pipe) {
        let clock = TestClock::default();
        let a_to_b: Pipe = Rc::new(RefCell::new(Vec::new()));
        let b_to_a: Pipe = Rc::new(RefCell::new(Vec::new()));
        let a = Transport::new(LoopbackSink { out: a_to_b.clone() }, clock.clone());
        let b = Transport::new(LoopbackSink { out: b_to_a.clone() }, clock);
        (a, b, a_to_b, b_to_a)
    }

    fn pump(t: &mut TestTransport, bytes: &Pipe) {
        let drained: Vec<u8> = bytes.borrow_mut().drain(..).collect();
        for b in drained {
            t.recv_byte(b);
        }
    }

    fn connect(a: &mut TestTransport, b: &mut TestTransport, a_to_b: &Pipe, b_to_a: &Pipe) {
        a.request_reset();
        pump(b, a_to_b);
        pump(a, b_to_a);
        pump(b, a_to_b);
        assert_eq!(a.link().status(), LinkState::Connected);
        assert_eq!(b.link().status(), LinkState::Connected);
    }

    thread_local! {
        static RECEIVED: RefCell<Vec<(u8, u16, Vec<u8>)>> = RefCell::new(Vec::new());
        static EVENTS: RefCell<Vec<TransportEvent>> = RefCell::new(Vec::new());
    }

    fn recording_recv(_user_data: usize, port_id: u8, port_data: u16, msg: &[u8]) {
        RECEIVED.with(|r| r.borrow_mut().push((port_id, port_data, msg.to_vec())));
    }

    fn recording_event(_user_data: usize, event: TransportEvent) {
        EVENTS.with(|r| r.borrow_mut().push(event));
    }

    #[test]
    fn single_frame_message_round_trips() {
        RECEIVED.with(|r| r.borrow_mut().clear());
        let (mut a, mut b, a_to_b, b_to_a) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);
        b.register(5, PortHandlers { recv_fn: Some(recording_recv), ..Default::default() }).unwrap();

        a.send(5, 0xABCD, b"hello").unwrap();
        pump(&mut b, &a_to_b);

        RECEIVED.with(|r| {
            let r = r.borrow();
            assert_eq!(r.len(), 1);
            assert_eq!(r[0], (5, 0xABCD, b"hello".to_vec()));
        });
    }

    #[test]
    fn segmented_message_reassembles_byte_for_byte() {
        RECEIVED.with(|r| r.borrow_mut().clear());
        let (mut a, mut b, a_to_b, b_to_a) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);
        b.register(5, PortHandlers { recv_fn: Some(recording_recv), ..Default::default() }).unwrap();

        let payload: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        a.send(5, 0x1111, &payload).unwrap();
        pump(&mut b, &a_to_b);

        RECEIVED.with(|r| {
            let r = r.borrow();
            assert_eq!(r.len(), 1);
            assert_eq!(r[0].0, 5);
            assert_eq!(r[0].1, 0x1111);
            assert_eq!(r[0].2, payload);
        });
    }

    #[test]
    fn interleaved_ports_keep_independent_scratch() {
        RECEIVED.with(|r| r.borrow_mut().clear());
        let (mut a, mut b, a_to_b, b_to_a) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);
        b.register(1, PortHandlers { recv_fn: Some(recording_recv), ..Default::default() }).unwrap();
        b.register(2, PortHandlers { recv_fn: Some(recording_recv), ..Default::default() }).unwrap();

        let big_on_port1: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        a.send(1, 0, &big_on_port1).unwrap();
        a.send(2, 0, b"short").unwrap();
        pump(&mut b, &a_to_b);

        RECEIVED.with(|r| {
            let r = r.borrow();
            assert_eq!(r.len(), 2);
            let port1 = r.iter().find(|(p, ..)| *p == 1).unwrap();
            let port2 = r.iter().find(|(p, ..)| *p == 2).unwrap();
            assert_eq!(port1.2, big_on_port1);
            assert_eq!(port2.2, b"short");
        });
    }

    #[test]
    fn out_of_order_segment_raises_reassembly_error() {
        EVENTS.with(|r| r.borrow_mut().clear());
        let (mut a, mut b, _a_to_b, b_to_a) = new_pair();
        connect(&mut a, &mut b, &_a_to_b, &b_to_a);
        b.register(3, PortHandlers { event_fn: Some(recording_event), ..Default::default() }).unwrap();

        // Feed a lone MIDDLE frame straight to b's decoder, with no
        // preceding START.
        let metadata = pack_metadata(0, Segment::Middle, 3, false);
        let mut buf = [0u8; emblink_framer::MAX_DATA_FRAME_LEN];
        let (port_data, segment, port_id, _r) = emblink_link::unpack_metadata(metadata);
        let frame = emblink_framer::DataFrame {
            frame_id: 0,
            segment,
            port_id,
            message_id: 0,
            port_data,
            payload: b"oops",
        };
        let len = emblink_framer::encode_data(&mut buf, &frame).unwrap();
        for &byte in &buf[..len] {
            b.recv_byte(byte);
        }

        EVENTS.with(|r| {
            assert!(r.borrow().iter().any(|e| *e == TransportEvent::ReassemblyError));
        });
    }

    #[derive(Default)]
    struct CapturingSink {
        frames: Vec<(u8, u16, Vec<u8>)>,
    }
    impl emblink_framer::FrameSink for CapturingSink {
        fn on_frame(&mut self, frame: &emblink_framer::DataFrame) {
            self.frames.push((frame.port_id, frame.port_data, frame.payload.to_vec()));
        }
        fn on_ack(&mut self, _frame: emblink_framer::AckFrame) {}
        fn on_nack(&mut self, _frame: emblink_framer::NackFrame) {}
        fn on_frame_error(&mut self) {}
    }

    #[test]
    fn management_echo_responds_on_port_zero() {
        let (mut a, mut b, a_to_b, b_to_a) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);

        let request_port_data = pack_mgmt(false, ManagementOp::Echo as u8);
        a.send(MANAGEMENT_PORT, request_port_data, b"ping").unwrap();
        pump(&mut b, &a_to_b);
        b.process();

        let mut decoder = emblink_framer::Decoder::new();
        let mut sink = CapturingSink::default();
        for &byte in b_to_a.borrow().iter() {
            decoder.feed(byte, &mut sink);
        }

        let response = sink.frames.iter().find(|(port_id, ..)| *port_id == MANAGEMENT_PORT).expect("management response frame");
        assert_eq!(response.2, b"ping");
        assert_eq!(unpack_mgmt(response.1), (true, ManagementOp::Echo as u8));
    }
}

/*! Go-back-N data link: frame retransmission, ordering and the reset/connect
handshake on top of [`emblink_framer`]'s wire encoding.

A [`DataLink`] owns a TX window (frames sent but not yet cumulatively
acknowledged) and an RX window (frames received out of order and held for
reassembly into sequence). Both windows are fixed-size arrays bounded by the
`TX_WIN`/`RX_WIN` const generics, indexed by `frame_id modulo window size` --
no allocation, no unbounded queues.

The link never blocks: [`ByteSink::send`] is expected to be non-blocking, and
a full TX window or a busy sink simply yields [`SendError::Full`] or leaves a
slot to be retried on the next [`DataLink::process`] tick.
*/
#![no_std]

use emblink_common::bus::{ByteSink, SendError as BusSendError};
use emblink_common::time::{Clock, Instant};
use emblink_common::{dev_debug, dev_warn};
use emblink_framer::{
    encode_ack, encode_data, encode_nack, AckFrame, DataFrame, Decoder, EncodeError, FrameSink,
    NackCause, NackFrame, Segment, ACK_FRAME_LEN, FRAME_ID_MODULO, MAX_DATA_FRAME_LEN,
    MAX_PAYLOAD_LEN, NACK_FRAME_LEN, RESET_CAUSE_FRAME_ID,
};

/// Timing and retry parameters for a [`DataLink`] instance.
///
/// Window sizes are separate const generic parameters on [`DataLink`]
/// itself (they size fixed arrays); this trait only carries values that
/// don't need to be known at the type level.
pub trait LinkTimings {
    /// Milliseconds to wait for an ACK before retransmitting a sent frame.
    const TX_TIMEOUT_MS: u32;
    /// Retransmissions allowed for a single frame before the link is
    /// declared disconnected.
    const MAX_RETRIES: u32;
    /// Advisory byte budget used by callers deciding how much to send per
    /// tick; not enforced by the link itself.
    const TX_LINK_SIZE: usize;
    /// Whether this endpoint plays the "server" role in the reset/connect
    /// handshake. A client endpoint (the default) reciprocates an
    /// unsolicited [`LinkEvent::RxResetRequest`] immediately; a server
    /// endpoint only reciprocates right away if [`LinkEventSink::on_event`]
    /// returns `true`, and otherwise waits for the application to call
    /// [`DataLink::confirm_reset`] on its own schedule.
    const IS_SERVER: bool = false;
}

pub struct DefaultLinkTimings;

impl LinkTimings for DefaultLinkTimings {
    const TX_TIMEOUT_MS: u32 = 200;
    const MAX_RETRIES: u32 = 8;
    const TX_LINK_SIZE: usize = 64;
    const IS_SERVER: bool = false;
}

/// Packs the transport-level 24-bit metadata word from its wire sub-fields.
///
/// Layout (MSB to LSB): `port_data:16 | seq:2 | port_id:5 | reserved:1`.
/// The data-link layer only shuttles this value between [`DataLink::send`]
/// and the `recv` callback; the bit layout itself is transport vocabulary,
/// kept here because the link is the one that must split it to build wire
/// frames and reassemble it from received ones.
pub fn pack_metadata(port_data: u16, segment: Segment, port_id: u8, reserved: bool) -> u32 {
    ((port_data as u32) << 8)
        | ((segment.bits() as u32) << 6)
        | ((port_id as u32 & 0x1F) << 1)
        | (reserved as u32)
}

pub fn unpack_metadata(metadata: u32) -> (u16, Segment, u8, bool) {
    let port_data = (metadata >> 8) as u16;
    let segment = Segment::from_bits(((metadata >> 6) & 0x03) as u8);
    let port_id = ((metadata >> 1) & 0x1F) as u8;
    let reserved = (metadata & 0x01) != 0;
    (port_data, segment, port_id, reserved)
}

/// An 11-bit sequence number comparison, normalized onto `(-1024, 1024]` so
/// that "ahead" and "behind" are well defined across the wraparound point.
fn seq_diff(a: u16, b: u16) -> i32 {
    let raw = a as i32 - b as i32;
    if raw > 1024 {
        raw - 2048
    } else if raw <= -1024 {
        raw + 2048
    } else {
        raw
    }
}

fn seq_next(id: u16) -> u16 {
    (id + 1) % FRAME_ID_MODULO
}

fn seq_prev(id: u16) -> u16 {
    (id + FRAME_ID_MODULO - 1) % FRAME_ID_MODULO
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The TX window is full; try again once older frames are acknowledged.
    Full,
    /// The payload does not fit in a single DATA frame.
    TooBig,
    /// The link is not in the `Connected` state.
    NotConnected,
}

/// Events the link raises to its owner outside of delivered payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peer signaled a reset; the RX window has already been cleared.
    RxResetRequest,
    TxConnected,
    TxDisconnected,
}

/// Receives events and delivered payloads from a [`DataLink`].
///
/// Implemented by the transport layer in the full stack; test harnesses can
/// implement it directly to observe link behavior in isolation.
pub trait LinkEventSink {
    /// Handles a [`LinkEvent`]. The return value is only consulted for
    /// [`LinkEvent::RxResetRequest`] on a "server" endpoint
    /// (`LinkTimings::IS_SERVER`): returning `true` reciprocates the reset
    /// immediately, `false` defers it until the application later calls
    /// [`DataLink::confirm_reset`] itself. Client endpoints and the
    /// `TxConnected`/`TxDisconnected` events ignore the return value.
    fn on_event(&mut self, event: LinkEvent) -> bool;
    fn on_recv(&mut self, metadata: u32, msg: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    ResetWait,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxSlotState {
    Empty,
    Sent,
}

#[derive(Debug, Clone, Copy)]
struct TxSlot {
    state: TxSlotState,
    frame_id: u16,
    last_send_time: Instant,
    retry_count: u32,
    segment: Segment,
    port_id: u8,
    message_id: u8,
    port_data: u16,
    len: u8,
    payload: [u8; MAX_PAYLOAD_LEN],
}

impl TxSlot {
    const EMPTY: TxSlot = TxSlot {
        state: TxSlotState::Empty,
        frame_id: 0,
        last_send_time: Instant::new(0),
        retry_count: 0,
        segment: Segment::Single,
        port_id: 0,
        message_id: 0,
        port_data: 0,
        len: 0,
        payload: [0u8; MAX_PAYLOAD_LEN],
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxSlotState {
    Empty,
    Received,
}

#[derive(Debug, Clone, Copy)]
struct RxSlot {
    state: RxSlotState,
    frame_id: u16,
    segment: Segment,
    port_id: u8,
    message_id: u8,
    port_data: u16,
    len: u8,
    payload: [u8; MAX_PAYLOAD_LEN],
}

impl RxSlot {
    const EMPTY: RxSlot = RxSlot {
        state: RxSlotState::Empty,
        frame_id: 0,
        segment: Segment::Single,
        port_id: 0,
        message_id: 0,
        port_data: 0,
        len: 0,
        payload: [0u8; MAX_PAYLOAD_LEN],
    };
}

/// A Go-back-N data link running over a [`ByteSink`] and a [`Clock`].
///
/// `TX_WIN` and `RX_WIN` bound reordering depth in each direction and must
/// each stay well under half of [`FRAME_ID_MODULO`] for sequence-number
/// comparisons to stay unambiguous (the usual Go-back-N constraint).
pub struct DataLink<Ts: LinkTimings, CK: Clock, S: ByteSink, const TX_WIN: usize, const RX_WIN: usize> {
    sink: S,
    clock: CK,
    state: LinkState,
    next_tx_frame_id: u16,
    tx_base_frame_id: u16,
    tx_slots: [TxSlot; TX_WIN],
    next_message_id: u8,
    next_rx_frame_id: u16,
    rx_slots: [RxSlot; RX_WIN],
    decoder: Decoder,
    retransmit_count: u32,
    spurious_ack_count: u32,
    frame_error_count: u32,
    _timings: core::marker::PhantomData<Ts>,
}

struct RxAdapter<'a, Ts, CK, S, E, const TX_WIN: usize, const RX_WIN: usize>
where
    Ts: LinkTimings,
    CK: Clock,
    S: ByteSink,
    E: LinkEventSink,
{
    link: &'a mut DataLink<Ts, CK, S, TX_WIN, RX_WIN>,
    events: &'a mut E,
}

impl<'a, Ts, CK, S, E, const TX_WIN: usize, const RX_WIN: usize> FrameSink
    for RxAdapter<'a, Ts, CK, S, E, TX_WIN, RX_WIN>
where
    Ts: LinkTimings,
    CK: Clock,
    S: ByteSink,
    E: LinkEventSink,
{
    fn on_frame(&mut self, frame: &DataFrame) {
        self.link.handle_data_frame(frame, self.events);
    }

    fn on_ack(&mut self, frame: AckFrame) {
        self.link.handle_ack(frame, self.events);
    }

    fn on_nack(&mut self, frame: NackFrame) {
        self.link.handle_nack(frame, self.events);
    }

    fn on_frame_error(&mut self) {
        self.link.frame_error_count = self.link.frame_error_count.wrapping_add(1);
    }
}

impl<Ts: LinkTimings, CK: Clock, S: ByteSink, const TX_WIN: usize, const RX_WIN: usize>
    DataLink<Ts, CK, S, TX_WIN, RX_WIN>
{
    pub fn new(sink: S, clock: CK) -> Self {
        DataLink {
            sink,
            clock,
            state: LinkState::Disconnected,
            next_tx_frame_id: 0,
            tx_base_frame_id: 0,
            tx_slots: [TxSlot::EMPTY; TX_WIN],
            next_message_id: 0,
            next_rx_frame_id: 0,
            rx_slots: [RxSlot::EMPTY; RX_WIN],
            decoder: Decoder::new(),
            retransmit_count: 0,
            spurious_ack_count: 0,
            frame_error_count: 0,
            _timings: core::marker::PhantomData,
        }
    }

    pub fn status(&self) -> LinkState {
        self.state
    }

    pub fn retransmit_count(&self) -> u32 {
        self.retransmit_count
    }

    pub fn spurious_ack_count(&self) -> u32 {
        self.spurious_ack_count
    }

    pub fn frame_error_count(&self) -> u32 {
        self.frame_error_count
    }

    pub fn tx_outstanding(&self) -> u32 {
        seq_diff(self.next_tx_frame_id, self.tx_base_frame_id).max(0) as u32
    }

    /// Begins (or restarts) the reset/connect handshake: clears both
    /// windows, tells the peer about the reset, and moves to `ResetWait`.
    pub fn request_reset(&mut self, events: &mut impl LinkEventSink) {
        self.reset_tx_window();
        self.reset_rx_window();
        self.send_reset_nack();
        self.change_state(LinkState::ResetWait, events);
    }

    /// Feeds one received byte through the framer, dispatching any frame or
    /// error it recognizes back into `self` and `events`.
    pub fn recv_byte(&mut self, byte: u8, events: &mut impl LinkEventSink) {
        let mut decoder = core::mem::take(&mut self.decoder);
        {
            let mut adapter = RxAdapter { link: self, events };
            decoder.feed(byte, &mut adapter);
        }
        self.decoder = decoder;
    }

    /// Queues `msg` for transmission under `metadata`. Non-blocking: if the
    /// TX window is full the caller must retry after acknowledgments free a
    /// slot.
    pub fn send(&mut self, metadata: u32, msg: &[u8]) -> Result<(), SendError> {
        if self.state != LinkState::Connected {
            return Err(SendError::NotConnected);
        }
        if msg.is_empty() || msg.len() > MAX_PAYLOAD_LEN {
            return Err(SendError::TooBig);
        }
        if self.tx_outstanding() as usize >= TX_WIN {
            return Err(SendError::Full);
        }

        let (port_data, segment, port_id, _reserved) = unpack_metadata(metadata);
        let frame_id = self.next_tx_frame_id;
        let idx = (frame_id as usize) % TX_WIN;
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let slot = &mut self.tx_slots[idx];
        slot.frame_id = frame_id;
        slot.segment = segment;
        slot.port_id = port_id;
        slot.message_id = message_id;
        slot.port_data = port_data;
        slot.len = msg.len() as u8;
        slot.payload[..msg.len()].copy_from_slice(msg);
        slot.retry_count = 0;
        slot.state = TxSlotState::Sent;
        slot.last_send_time = self.clock.current_instant();

        self.next_tx_frame_id = seq_next(frame_id);
        self.transmit_slot(idx);
        Ok(())
    }

    /// Periodic tick: retransmits timed-out frames and, once a frame has
    /// been retried past `MAX_RETRIES`, declares the link disconnected.
    pub fn process(&mut self, events: &mut impl LinkEventSink) {
        if self.state != LinkState::Connected {
            return;
        }

        let outstanding = self.tx_outstanding();
        let mut id = self.tx_base_frame_id;
        for _ in 0..outstanding {
            let idx = (id as usize) % TX_WIN;
            if self.tx_slots[idx].state == TxSlotState::Sent {
                let elapsed = self.tx_slots[idx].last_send_time.elapsed_ms(&self.clock);
                if elapsed >= Ts::TX_TIMEOUT_MS {
                    self.tx_slots[idx].retry_count += 1;
                    if self.tx_slots[idx].retry_count > Ts::MAX_RETRIES {
                        dev_warn!("link: frame {} exceeded retry budget, disconnecting", id);
                        self.change_state(LinkState::Disconnected, events);
                        return;
                    }
                    self.retransmit_count = self.retransmit_count.wrapping_add(1);
                    self.transmit_slot(idx);
                }
            }
            id = seq_next(id);
        }
    }

    fn transmit_slot(&mut self, idx: usize) {
        if self.tx_slots[idx].state != TxSlotState::Sent {
            return;
        }
        let frame_len = 9 + self.tx_slots[idx].len as usize;
        if self.sink.send_available() < frame_len {
            return;
        }

        let mut buf = [0u8; MAX_DATA_FRAME_LEN];
        let len = {
            let slot = &self.tx_slots[idx];
            let frame = DataFrame {
                frame_id: slot.frame_id,
                segment: slot.segment,
                port_id: slot.port_id,
                message_id: slot.message_id,
                port_data: slot.port_data,
                payload: &slot.payload[..slot.len as usize],
            };
            match encode_data(&mut buf, &frame) {
                Ok(len) => len,
                Err(EncodeError::FrameTooBig) => unreachable!("tx slot payload always fits a frame"),
            }
        };

        match self.sink.send(&buf[..len]) {
            Ok(()) => {
                self.tx_slots[idx].last_send_time = self.clock.current_instant();
            }
            Err(BusSendError::WouldBlock) => {}
        }
    }

    fn handle_ack(&mut self, frame: AckFrame, events: &mut impl LinkEventSink) {
        if self.state == LinkState::ResetWait {
            // No DATA can be outstanding during the handshake (`send`
            // requires `Connected`), so any ACK received here is the
            // sentinel the peer sent from `confirm_reset` -- the "first
            // valid ACK after a reset" that completes the handshake.
            self.change_state(LinkState::Connected, events);
            return;
        }

        let diff = seq_diff(frame.frame_id, self.tx_base_frame_id);
        if diff < 0 || diff as u32 >= self.tx_outstanding() {
            self.spurious_ack_count = self.spurious_ack_count.wrapping_add(1);
            dev_debug!("link: ignoring ack for frame {} outside tx window", frame.frame_id);
            return;
        }

        let mut id = self.tx_base_frame_id;
        loop {
            let idx = (id as usize) % TX_WIN;
            self.tx_slots[idx] = TxSlot::EMPTY;
            if id == frame.frame_id {
                break;
            }
            id = seq_next(id);
        }
        self.tx_base_frame_id = seq_next(frame.frame_id);

        // Only reachable if we'd dropped to `Disconnected` on retry
        // exhaustion (which doesn't clear the TX window) and a late ACK
        // for one of those still-outstanding frames then arrives.
        if self.state != LinkState::Connected {
            self.change_state(LinkState::Connected, events);
        }
    }

    fn handle_nack(&mut self, frame: NackFrame, events: &mut impl LinkEventSink) {
        match frame.cause {
            NackCause::FrameError => {
                let diff = seq_diff(frame.cause_frame_id, self.tx_base_frame_id);
                if diff >= 0 && (diff as u32) < self.tx_outstanding() {
                    let idx = (frame.cause_frame_id as usize) % TX_WIN;
                    self.transmit_slot(idx);
                    self.retransmit_count = self.retransmit_count.wrapping_add(1);
                }
            }
            NackCause::OutOfWindow => {
                if frame.cause_frame_id == RESET_CAUSE_FRAME_ID {
                    self.handle_reset_indication(events);
                } else {
                    dev_warn!("link: peer reports us out of window, disconnecting");
                    self.change_state(LinkState::Disconnected, events);
                }
            }
        }
    }

    fn handle_reset_indication(&mut self, events: &mut impl LinkEventSink) {
        self.reset_rx_window();
        let we_initiated = self.state == LinkState::ResetWait;
        let proceed = events.on_event(LinkEvent::RxResetRequest);

        if we_initiated {
            // We requested this reset ourselves; the peer's reciprocal
            // indication means its RX window is aligned too. Send the
            // sentinel ACK that lets its own `confirm_reset` complete.
            self.send_ack();
            return;
        }

        if Ts::IS_SERVER && !proceed {
            dev_warn!("link: server endpoint deferred an unsolicited reset request");
            return;
        }

        self.confirm_reset(events);
    }

    /// Reciprocates a peer's reset request: resets the TX window, tells the
    /// peer this endpoint has reset too, and sends the sentinel ACK that
    /// will complete the peer's handshake once it arrives. A client
    /// endpoint calls this immediately from [`LinkEvent::RxResetRequest`];
    /// a server endpoint may instead return `false` from `on_event` and
    /// call this later, once the application has decided to accept the
    /// reset.
    pub fn confirm_reset(&mut self, events: &mut impl LinkEventSink) {
        self.reset_tx_window();
        self.send_reset_nack();
        self.change_state(LinkState::ResetWait, events);
        self.send_ack();
    }

    fn handle_data_frame(&mut self, frame: &DataFrame, events: &mut impl LinkEventSink) {
        if self.state != LinkState::Connected {
            dev_warn!("link: dropping data frame, link not connected");
            return;
        }

        let diff = seq_diff(frame.frame_id, self.next_rx_frame_id);
        if diff == 0 {
            let metadata = pack_metadata(frame.port_data, frame.segment, frame.port_id, false);
            events.on_recv(metadata, frame.payload);
            self.next_rx_frame_id = seq_next(self.next_rx_frame_id);
            self.drain_buffered(events);
            self.send_ack();
        } else if diff > 0 && (diff as usize) < RX_WIN {
            let idx = (frame.frame_id as usize) % RX_WIN;
            let slot = &mut self.rx_slots[idx];
            if slot.state == RxSlotState::Empty || slot.frame_id != frame.frame_id {
                slot.state = RxSlotState::Received;
                slot.frame_id = frame.frame_id;
                slot.segment = frame.segment;
                slot.port_id = frame.port_id;
                slot.message_id = frame.message_id;
                slot.port_data = frame.port_data;
                slot.len = frame.payload.len() as u8;
                slot.payload[..frame.payload.len()].copy_from_slice(frame.payload);
            }
            self.send_nack(NackCause::FrameError, self.next_rx_frame_id);
        } else if diff > 0 {
            self.send_nack(NackCause::OutOfWindow, self.next_rx_frame_id);
        } else {
            // Already delivered; the peer likely missed our last ACK.
            self.send_ack();
        }
    }

    fn drain_buffered(&mut self, events: &mut impl LinkEventSink) {
        loop {
            let idx = (self.next_rx_frame_id as usize) % RX_WIN;
            let slot = self.rx_slots[idx];
            if slot.state == RxSlotState::Received && slot.frame_id == self.next_rx_frame_id {
                let metadata = pack_metadata(slot.port_data, slot.segment, slot.port_id, false);
                events.on_recv(metadata, &slot.payload[..slot.len as usize]);
                self.rx_slots[idx] = RxSlot::EMPTY;
                self.next_rx_frame_id = seq_next(self.next_rx_frame_id);
            } else {
                break;
            }
        }
    }

    fn send_ack(&mut self) {
        let ack = AckFrame { frame_id: seq_prev(self.next_rx_frame_id) };
        let mut buf = [0u8; ACK_FRAME_LEN];
        if let Ok(len) = encode_ack(&mut buf, &ack) {
            let _ = self.sink.send(&buf[..len]);
        }
    }

    fn send_nack(&mut self, cause: NackCause, cause_frame_id: u16) {
        let nack = NackFrame { frame_id: self.next_rx_frame_id, cause, cause_frame_id };
        let mut buf = [0u8; NACK_FRAME_LEN];
        if let Ok(len) = encode_nack(&mut buf, &nack) {
            let _ = self.sink.send(&buf[..len]);
        }
    }

    fn send_reset_nack(&mut self) {
        self.send_nack(NackCause::OutOfWindow, RESET_CAUSE_FRAME_ID);
    }

    fn reset_tx_window(&mut self) {
        self.next_tx_frame_id = 0;
        self.tx_base_frame_id = 0;
        self.tx_slots = [TxSlot::EMPTY; TX_WIN];
    }

    fn reset_rx_window(&mut self) {
        self.next_rx_frame_id = 0;
        self.rx_slots = [RxSlot::EMPTY; RX_WIN];
    }

    fn change_state(&mut self, new_state: LinkState, events: &mut impl LinkEventSink) {
        if self.state == new_state {
            return;
        }
        self.state = new_state;
        match new_state {
            LinkState::Connected => events.on_event(LinkEvent::TxConnected),
            LinkState::Disconnected => events.on_event(LinkEvent::TxDisconnected),
            LinkState::ResetWait => {}
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::rc::Rc;
    use std::vec::Vec;

    struct TestTimings;
    impl LinkTimings for TestTimings {
        const TX_TIMEOUT_MS: u32 = 50;
        const MAX_RETRIES: u32 = 3;
        const TX_LINK_SIZE: usize = 32;
    }

    #[derive(Clone, Default)]
    struct TestClock {
        now_ns: Rc<core::cell::Cell<u64>>,
    }
    impl TestClock {
        fn advance_ms(&self, ms: u64) {
            self.now_ns.set(self.now_ns.get() + ms * 1_000_000);
        }
    }
    impl Clock for TestClock {
        fn current_nanos(&self) -> u64 {
            self.now_ns.get()
        }
    }

    struct RecordingEvents {
        events: Vec<LinkEvent>,
        recvd: Vec<(u32, Vec<u8>)>,
        /// Returned from `on_event` for `RxResetRequest`; only consulted by
        /// a server-mode `DataLink` (`LinkTimings::IS_SERVER`).
        accept_reset: bool,
    }
    impl Default for RecordingEvents {
        fn default() -> Self {
            RecordingEvents { events: Vec::new(), recvd: Vec::new(), accept_reset: true }
        }
    }
    impl LinkEventSink for RecordingEvents {
        fn on_event(&mut self, event: LinkEvent) -> bool {
            self.events.push(event);
            self.accept_reset
        }
        fn on_recv(&mut self, metadata: u32, msg: &[u8]) {
            self.recvd.push((metadata, msg.to_vec()));
        }
    }

    #[derive(Default)]
    struct LoopbackSink {
        out: Rc<core::cell::RefCell<Vec<u8>>>,
    }
    impl ByteSink for LoopbackSink {
        fn send(&mut self, bytes: &[u8]) -> Result<(), BusSendError> {
            self.out.borrow_mut().extend_from_slice(bytes);
            Ok(())
        }
        fn send_available(&self) -> usize {
            4096
        }
    }

    type TestLink = DataLink<TestTimings, TestClock, LoopbackSink, 4, 4>;
    type Pipe = Rc<core::cell::RefCell<Vec<u8>>>;

    fn new_pair() -> (TestLink, TestLink, Pipe, Pipe, TestClock) {
        let clock = TestClock::default();
        let a_to_b: Pipe = Rc::new(core::cell::RefCell::new(Vec::new()));
        let b_to_a: Pipe = Rc::new(core::cell::RefCell::new(Vec::new()));
        let a = DataLink::new(LoopbackSink { out: a_to_b.clone() }, clock.clone());
        let b = DataLink::new(LoopbackSink { out: b_to_a.clone() }, clock.clone());
        (a, b, a_to_b, b_to_a, clock)
    }

    fn pump(link: &mut TestLink, bytes: &Pipe, events: &mut RecordingEvents) {
        let drained: Vec<u8> = bytes.borrow_mut().drain(..).collect();
        for b in drained {
            link.recv_byte(b, events);
        }
    }

    /// Runs the reset/connect handshake to completion: a reset request from
    /// `a`, `b`'s reciprocal reset NACK plus its sentinel ACK, and `a`'s own
    /// sentinel ACK reaching `b` in turn -- the "both ACKs settle" shape the
    /// handshake requires before either side is `Connected`.
    fn connect(a: &mut TestLink, b: &mut TestLink, a_to_b: &Pipe, b_to_a: &Pipe) {
        let mut ea = RecordingEvents::default();
        let mut eb = RecordingEvents::default();
        a.request_reset(&mut ea);
        pump(b, a_to_b, &mut eb);
        pump(a, b_to_a, &mut ea);
        pump(b, a_to_b, &mut eb);
        assert_eq!(a.status(), LinkState::Connected);
        assert_eq!(b.status(), LinkState::Connected);
    }

    #[test]
    fn reset_handshake_reaches_connected() {
        let (mut a, mut b, a_to_b, b_to_a, _clock) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);
    }

    #[test]
    fn reset_handshake_completes_via_ack_frames_not_nacks() {
        let (mut a, mut b, a_to_b, b_to_a, _clock) = new_pair();
        let mut ea = RecordingEvents::default();
        let mut eb = RecordingEvents::default();

        a.request_reset(&mut ea);
        pump(b, &a_to_b, &mut eb);
        assert_eq!(b.status(), LinkState::ResetWait, "b reciprocates but waits for a's sentinel ACK");

        pump(a, &b_to_a, &mut ea);
        assert_eq!(a.status(), LinkState::Connected, "a completes on b's sentinel ACK");
        assert_eq!(b.status(), LinkState::ResetWait, "b hasn't seen a's sentinel ACK yet");

        pump(b, &a_to_b, &mut eb);
        assert_eq!(b.status(), LinkState::Connected, "b completes on a's sentinel ACK");
    }

    #[test]
    fn server_mode_defers_unsolicited_reset_until_confirmed() {
        struct ServerTimings;
        impl LinkTimings for ServerTimings {
            const TX_TIMEOUT_MS: u32 = 50;
            const MAX_RETRIES: u32 = 3;
            const TX_LINK_SIZE: usize = 32;
            const IS_SERVER: bool = true;
        }

        let clock = TestClock::default();
        let a_to_b: Pipe = Rc::new(core::cell::RefCell::new(Vec::new()));
        let b_to_a: Pipe = Rc::new(core::cell::RefCell::new(Vec::new()));
        let mut a: DataLink<TestTimings, TestClock, LoopbackSink, 4, 4> =
            DataLink::new(LoopbackSink { out: a_to_b.clone() }, clock.clone());
        let mut b: DataLink<ServerTimings, TestClock, LoopbackSink, 4, 4> =
            DataLink::new(LoopbackSink { out: b_to_a.clone() }, clock);

        let mut ea = RecordingEvents::default();
        let mut eb = RecordingEvents { accept_reset: false, ..RecordingEvents::default() };

        a.request_reset(&mut ea);
        let drained: Vec<u8> = a_to_b.borrow_mut().drain(..).collect();
        for byte in drained {
            b.recv_byte(byte, &mut eb);
        }
        assert!(eb.events.contains(&LinkEvent::RxResetRequest));
        assert_eq!(b.status(), LinkState::Disconnected, "server defers until the app confirms");
        assert!(b_to_a.borrow().is_empty(), "nothing reciprocated yet");

        b.confirm_reset(&mut eb);
        assert_eq!(b.status(), LinkState::ResetWait);

        let drained: Vec<u8> = b_to_a.borrow_mut().drain(..).collect();
        for byte in drained {
            a.recv_byte(byte, &mut ea);
        }
        assert_eq!(a.status(), LinkState::Connected);

        let drained: Vec<u8> = a_to_b.borrow_mut().drain(..).collect();
        for byte in drained {
            b.recv_byte(byte, &mut eb);
        }
        assert_eq!(b.status(), LinkState::Connected);
    }

    #[test]
    fn in_order_delivery_round_trip() {
        let (mut a, mut b, a_to_b, b_to_a, _clock) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);

        let mut ea = RecordingEvents::default();
        let mut eb = RecordingEvents::default();
        let metadata = pack_metadata(0, Segment::Single, 3, false);
        a.send(metadata, b"hello").unwrap();
        pump(&mut b, &a_to_b, &mut eb);
        pump(&mut a, &b_to_a, &mut ea);

        assert_eq!(eb.recvd.len(), 1);
        assert_eq!(eb.recvd[0].1, b"hello");
        assert_eq!(a.tx_outstanding(), 0);
    }

    #[test]
    fn out_of_order_frames_are_buffered_and_delivered_in_sequence() {
        let (mut a, mut b, a_to_b, b_to_a, _clock) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);

        let metadata = pack_metadata(0, Segment::Single, 1, false);
        a.send(metadata, b"one").unwrap();
        a.send(metadata, b"two").unwrap();
        a.send(metadata, b"three").unwrap();

        let frame_len = |payload_len: usize| 1 + 7 + payload_len + 4;
        let len1 = frame_len(3);
        let len2 = frame_len(3);
        let len3 = frame_len(5);
        let stream = a_to_b.borrow().clone();
        a_to_b.borrow_mut().clear();
        let f1 = stream[0..len1].to_vec();
        let f2 = stream[len1..len1 + len2].to_vec();
        let f3 = stream[len1 + len2..len1 + len2 + len3].to_vec();

        let mut reordered = Vec::new();
        reordered.extend_from_slice(&f2);
        reordered.extend_from_slice(&f3);
        reordered.extend_from_slice(&f1);

        let mut eb = RecordingEvents::default();
        let mut ea = RecordingEvents::default();
        for byte in reordered {
            b.recv_byte(byte, &mut eb);
        }
        pump(&mut a, &b_to_a, &mut ea);

        assert_eq!(eb.recvd.len(), 3);
        assert_eq!(eb.recvd[0].1, b"one");
        assert_eq!(eb.recvd[1].1, b"two");
        assert_eq!(eb.recvd[2].1, b"three");
    }

    #[test]
    fn dropped_frame_is_retransmitted_after_timeout() {
        let (mut a, mut b, a_to_b, b_to_a, clock) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);

        let metadata = pack_metadata(0, Segment::Single, 2, false);
        a.send(metadata, b"payload").unwrap();
        a_to_b.borrow_mut().clear(); // frame lost on the wire

        let mut ea = RecordingEvents::default();
        a.process(&mut ea);
        assert!(a_to_b.borrow().is_empty(), "no retransmit before the timeout elapses");

        clock.advance_ms(60);
        a.process(&mut ea);
        assert!(!a_to_b.borrow().is_empty(), "retransmit expected once TX_TIMEOUT_MS elapses");
        assert_eq!(a.retransmit_count(), 1);
    }

    #[test]
    fn link_disconnects_after_exhausting_retries() {
        let (mut a, mut b, a_to_b, b_to_a, clock) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);

        let metadata = pack_metadata(0, Segment::Single, 2, false);
        a.send(metadata, b"payload").unwrap();

        let mut ea = RecordingEvents::default();
        for _ in 0..(TestTimings::MAX_RETRIES + 1) {
            a_to_b.borrow_mut().clear();
            clock.advance_ms(60);
            a.process(&mut ea);
        }

        assert_eq!(a.status(), LinkState::Disconnected);
        assert!(ea.events.contains(&LinkEvent::TxDisconnected));
        assert_eq!(b.status(), LinkState::Connected);
    }

    #[test]
    fn duplicate_ack_after_window_advance_is_ignored_as_spurious() {
        let (mut a, mut b, a_to_b, b_to_a, _clock) = new_pair();
        connect(&mut a, &mut b, &a_to_b, &b_to_a);

        let metadata = pack_metadata(0, Segment::Single, 0, false);
        a.send(metadata, b"x").unwrap();
        let mut eb = RecordingEvents::default();
        let mut ea = RecordingEvents::default();
        pump(&mut b, &a_to_b, &mut eb);
        pump(&mut a, &b_to_a, &mut ea);
        assert_eq!(a.tx_outstanding(), 0);

        let mut ack = [0u8; ACK_FRAME_LEN];
        let len = encode_ack(&mut ack, &AckFrame { frame_id: 0 }).unwrap();
        for &byte in &ack[..len] {
            a.recv_byte(byte, &mut ea);
        }
        assert_eq!(a.spurious_ack_count(), 1);
    }
}

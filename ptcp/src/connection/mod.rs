use std::{
    collections::VecDeque,
    io::{self, Error, ErrorKind},
};

use bytepack::{FromBytestream, ToBytestream};
use types::packet::{
    ConnectOption, ControlMessage, Flags, Packet, HEADER_SIZE, MAX_PACKET, OPT_WND_SCALE,
};

use crate::{
    buffer::FifoBuffer,
    notify::{Notify, WriteResult},
};

mod cfg;
mod cong;
mod reorder;
mod rtt;

pub use cfg::{Clock, Config};
use cong::Congestion;
use reorder::{ReorderQueue, Span};
use rtt::RttEstimator;

// MTU ladder, stepped down through whenever the carrier rejects a datagram
// as too large. The lowest rung still clears PACKET_OVERHEAD.
const PACKET_MAXIMUMS: &[u32] = &[
    65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296,
];

const MIN_PACKET: u32 = 296;

const IP_HEADER_SIZE: u32 = 20;
const UDP_HEADER_SIZE: u32 = 8;
// Outer relay framing the host wraps around every datagram.
const OUTER_HEADER_SIZE: u32 = 64;
const PACKET_OVERHEAD: u32 =
    HEADER_SIZE as u32 + UDP_HEADER_SIZE + IP_HEADER_SIZE + OUTER_HEADER_SIZE;

pub(crate) const DEFAULT_RCV_BUF_SIZE: usize = 60 * 1024;
pub(crate) const DEFAULT_SND_BUF_SIZE: usize = 90 * 1024;

const MIN_RTO: u32 = 250;
const DEF_RTO: u32 = 3000;
const MAX_RTO: u32 = 60_000;
pub(crate) const DEF_ACK_DELAY: u32 = 100;

// A sender that stops advertising window space has 15 s to come back to
// life before the connection is torn down.
const ZERO_WINDOW_TIMEOUT: u32 = 15_000;

// Wake the host every 4 s even with no timer armed; once per minute after
// the connection has closed.
const DEFAULT_TIMEOUT: u32 = 4000;
const CLOSED_TIMEOUT: u32 = 60 * 1000;

/// Signed difference of two wrapping millisecond clock values.
fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    Closed,
}

impl State {
    fn transition_to(&mut self, new: Self) {
        tracing::trace!("{self:?} -> {new:?}");
        *self = new;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    None,
    Graceful,
    Forceful,
}

/// Runtime-tunable options, see [`Connection::set_option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    /// Disable Nagle's algorithm (nonzero disables).
    NoDelay,
    /// Delayed-ack flush interval in ms (zero disables delayed acks).
    AckDelay,
    /// Send buffer capacity; only settable while listening.
    SndBuf,
    /// Receive buffer capacity; only settable while listening.
    RcvBuf,
}

/// A descriptor over bytes sitting in the send buffer. The list of
/// descriptors partitions the buffered bytes exactly; control segments
/// carry their payload (opcode plus options) through the same buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SendSegment {
    seq: u32,
    len: u32,
    ctl: bool,
    /// Times this segment has been put on the wire. Only the first
    /// transmission advances `snd_nxt`.
    xmit: u32,
}

/// Whether the transmit loop owes the peer an acknowledgment when it has
/// no data left to carry one on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckSchedule {
    None,
    Delayed,
    Immediate,
}

/// A single reliable byte-stream connection over a datagram carrier.
///
/// The engine is single-threaded and performs no I/O: datagrams enter
/// through [`notify_packet`](Connection::notify_packet), time advances
/// through [`notify_clock`](Connection::notify_clock), and everything the
/// engine wants from the outside world goes through the [`Notify`]
/// implementation passed into each call.
pub struct Connection {
    pub(crate) state: State,
    shutdown: Shutdown,
    error: Option<ErrorKind>,
    conv: u32,

    // send side
    pub(crate) sbuf: FifoBuffer,
    pub(crate) slist: VecDeque<SendSegment>,
    pub(crate) snd_una: u32,
    pub(crate) snd_nxt: u32,
    pub(crate) snd_wnd: u32,
    pub(crate) lastsend: u32,

    // receive side
    pub(crate) rbuf: FifoBuffer,
    pub(crate) rlist: ReorderQueue,
    pub(crate) rcv_nxt: u32,
    pub(crate) rcv_wnd: u32,
    pub(crate) lastrecv: u32,

    // window scaling: ours advertised, the peer's learned
    pub(crate) rwnd_scale: u8,
    pub(crate) swnd_scale: u8,

    // segment sizing
    pub(crate) mss: u32,
    msslevel: usize,
    mtu_advise: u32,
    largest: u32,

    // timers and estimators
    pub(crate) rto_base: u32,
    pub(crate) t_ack: u32,
    pub(crate) rtt: RttEstimator,
    pub(crate) cong: Congestion,

    // echoed timestamp state
    ts_recent: u32,
    ts_lastack: u32,

    // notification arming
    read_enable: bool,
    write_enable: bool,

    pub(crate) cfg: Config,
}

impl Connection {
    /// Creates a connection in [`State::Listen`] for the given conversation
    /// id. Both endpoints must agree on the id out of band.
    pub fn new(conv: u32, cfg: Config) -> Connection {
        // Needed for the writeable notification logic.
        debug_assert!(cfg.rcv_buf_cap + (MIN_PACKET as usize) < cfg.snd_buf_cap);

        let now = (cfg.clock)();
        let mss = MIN_PACKET - PACKET_OVERHEAD;
        let rcv_buf_cap = cfg.rcv_buf_cap;

        Connection {
            state: State::Listen,
            shutdown: Shutdown::None,
            error: None,
            conv,

            sbuf: FifoBuffer::new(cfg.snd_buf_cap),
            slist: VecDeque::new(),
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 1,
            lastsend: now,

            rbuf: FifoBuffer::new(rcv_buf_cap),
            rlist: ReorderQueue::default(),
            rcv_nxt: 0,
            rcv_wnd: rcv_buf_cap as u32,
            lastrecv: now,

            rwnd_scale: 0,
            swnd_scale: 0,

            mss,
            msslevel: 0,
            mtu_advise: MAX_PACKET as u32,
            largest: 0,

            rto_base: 0,
            t_ack: 0,
            rtt: RttEstimator::new(),
            cong: Congestion::new(mss, rcv_buf_cap as u32),

            ts_recent: 0,
            ts_lastack: 0,

            read_enable: true,
            write_enable: false,

            cfg,
        }
    }

    /// Initiates the handshake by queueing a connect segment.
    ///
    /// # Errors
    ///
    /// `InvalidInput` unless the connection is still listening.
    pub fn connect(&mut self, notify: &mut dyn Notify) -> io::Result<()> {
        if self.state != State::Listen {
            self.error = Some(ErrorKind::InvalidInput);
            return Err(Error::new(ErrorKind::InvalidInput, "already connecting"));
        }

        self.state.transition_to(State::SynSent);
        self.queue_connect_message();
        self.attempt_send(notify, AckSchedule::None);
        Ok(())
    }

    /// Updates the advised path MTU.
    pub fn notify_mtu(&mut self, mtu: u16) {
        self.mtu_advise = u32::from(mtu);
        if self.state == State::Estab {
            self.adjust_mtu();
        }
    }

    /// Drives the retransmission, zero-window-probe and delayed-ack timers.
    /// The host must call this at (or after) the deadline reported by
    /// [`get_next_clock`](Connection::get_next_clock).
    pub fn notify_clock(&mut self, notify: &mut dyn Notify, now: u32) {
        if self.state == State::Closed {
            return;
        }

        // Retransmission timer
        if self.rto_base != 0 && time_diff(self.rto_base.wrapping_add(self.rtt.rto), now) <= 0 {
            if self.slist.is_empty() {
                debug_assert!(false, "retransmit timer armed without outstanding segments");
            } else {
                tracing::trace!(
                    rto = self.rtt.rto,
                    rto_base = self.rto_base,
                    dup_acks = self.cong.dup_acks,
                    "timeout retransmit"
                );
                if !self.transmit(notify, 0, now) {
                    self.closedown(notify, ErrorKind::ConnectionAborted);
                    return;
                }

                let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
                self.cong.on_timeout(in_flight, self.mss);

                // The backoff cap is lower while still connecting.
                let rto_limit = if self.state == State::Estab {
                    MAX_RTO
                } else {
                    DEF_RTO
                };
                self.rtt.backoff(rto_limit);
                self.rto_base = now;
            }
        }

        // Zero-window probing
        if self.snd_wnd == 0 && time_diff(self.lastsend.wrapping_add(self.rtt.rto), now) <= 0 {
            if time_diff(now, self.lastrecv) >= ZERO_WINDOW_TIMEOUT as i32 {
                self.closedown(notify, ErrorKind::ConnectionAborted);
                return;
            }

            self.packet(notify, self.snd_nxt.wrapping_sub(1), Flags::new(), 0, 0);
            self.lastsend = now;
            self.rtt.backoff(MAX_RTO);
        }

        // Delayed acknowledgments
        if self.t_ack != 0 && time_diff(self.t_ack.wrapping_add(self.cfg.ack_delay), now) <= 0 {
            self.packet(notify, self.snd_nxt, Flags::new(), 0, 0);
        }
    }

    /// Hands an inbound datagram to the engine. Returns `false` if the
    /// datagram was dropped without being processed.
    pub fn notify_packet(&mut self, notify: &mut dyn Notify, data: &[u8]) -> bool {
        if data.len() > MAX_PACKET {
            tracing::warn!(len = data.len(), "dropping oversized packet");
            return false;
        }
        let seg = match Packet::from_slice(data) {
            Ok(seg) => seg,
            Err(e) => {
                tracing::warn!(len = data.len(), "dropping unparseable packet: {e}");
                return false;
            }
        };
        self.process(notify, &seg)
    }

    /// Reports the next deadline (in ms from `now`) at which the host must
    /// call [`notify_clock`](Connection::notify_clock). `None` means the
    /// engine is done and needs no further ticks.
    pub fn get_next_clock(&self, now: u32) -> Option<u32> {
        if self.shutdown == Shutdown::Forceful {
            return None;
        }
        if self.shutdown == Shutdown::Graceful
            && (self.state != State::Estab || (self.sbuf.is_empty() && self.t_ack == 0))
        {
            return None;
        }

        if self.state == State::Closed {
            return Some(CLOSED_TIMEOUT);
        }

        let mut timeout = DEFAULT_TIMEOUT as i32;
        if self.t_ack != 0 {
            timeout = timeout.min(time_diff(self.t_ack.wrapping_add(self.cfg.ack_delay), now));
        }
        if self.rto_base != 0 {
            timeout = timeout.min(time_diff(self.rto_base.wrapping_add(self.rtt.rto), now));
        }
        if self.snd_wnd == 0 {
            timeout = timeout.min(time_diff(self.lastsend.wrapping_add(self.rtt.rto), now));
        }
        Some(timeout.max(0) as u32)
    }

    pub fn get_option(&self, opt: SockOpt) -> u32 {
        match opt {
            SockOpt::NoDelay => u32::from(!self.cfg.nagling),
            SockOpt::AckDelay => self.cfg.ack_delay,
            SockOpt::SndBuf => self.sbuf.capacity() as u32,
            SockOpt::RcvBuf => self.rbuf.capacity() as u32,
        }
    }

    /// # Errors
    ///
    /// `InvalidInput` when resizing a buffer after leaving [`State::Listen`].
    pub fn set_option(&mut self, opt: SockOpt, value: u32) -> io::Result<()> {
        match opt {
            SockOpt::NoDelay => self.cfg.nagling = value == 0,
            SockOpt::AckDelay => self.cfg.ack_delay = value,
            SockOpt::SndBuf => {
                if self.state != State::Listen {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "send buffer is only resizable while listening",
                    ));
                }
                self.sbuf.set_capacity(value as usize);
            }
            SockOpt::RcvBuf => {
                if self.state != State::Listen {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "receive buffer is only resizable while listening",
                    ));
                }
                self.resize_receive_buffer(value as usize);
            }
        }
        Ok(())
    }

    /// Suppresses the window-scale option on the outgoing connect message.
    pub fn disable_window_scale(&mut self) {
        self.cfg.wnd_scale = false;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn conversation(&self) -> u32 {
        self.conv
    }

    pub fn congestion_window(&self) -> u32 {
        self.cong.cwnd
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    pub fn bytes_buffered_not_sent(&self) -> u32 {
        self.snd_una
            .wrapping_add(self.sbuf.len() as u32)
            .wrapping_sub(self.snd_nxt)
    }

    /// Smoothed round-trip estimate in ms; zero before the first sample.
    pub fn round_trip_time_estimate(&self) -> u32 {
        self.rtt.srtt
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn is_receive_buffer_full(&self) -> bool {
        self.rbuf.remaining() == 0
    }

    /// Largest segment ever fully acknowledged by the peer.
    pub fn largest_acked_segment(&self) -> u32 {
        self.largest
    }

    /// Reads up to `buffer.len()` in-order bytes.
    ///
    /// # Errors
    ///
    /// `NotConnected` outside [`State::Estab`]; `WouldBlock` when no data
    /// is buffered (re-arming the readable notification).
    pub fn recv(&mut self, notify: &mut dyn Notify, buffer: &mut [u8]) -> io::Result<usize> {
        if self.state != State::Estab {
            self.error = Some(ErrorKind::NotConnected);
            return Err(Error::new(ErrorKind::NotConnected, "not established"));
        }

        if self.rbuf.is_empty() {
            self.read_enable = true;
            self.error = Some(ErrorKind::WouldBlock);
            return Err(Error::new(ErrorKind::WouldBlock, "no bytes buffered yet"));
        }

        let read = self.rbuf.read(buffer);

        // Reopen the advertised window once enough space has been freed to
        // be worth a window update of its own.
        let available_space = self.rbuf.remaining() as u32;
        if available_space.wrapping_sub(self.rcv_wnd)
            >= (self.rbuf.capacity() as u32 / 2).min(self.mss)
        {
            let was_closed = self.rcv_wnd == 0;
            self.rcv_wnd = available_space;

            if was_closed {
                self.attempt_send(notify, AckSchedule::Immediate);
            }
        }

        Ok(read)
    }

    /// Appends bytes to the send buffer and transmits what the windows
    /// allow. Returns the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// `NotConnected` outside [`State::Estab`]; `WouldBlock` when the send
    /// buffer is full (re-arming the writeable notification).
    pub fn send(&mut self, notify: &mut dyn Notify, buffer: &[u8]) -> io::Result<usize> {
        if self.state != State::Estab {
            self.error = Some(ErrorKind::NotConnected);
            return Err(Error::new(ErrorKind::NotConnected, "not established"));
        }

        if self.sbuf.remaining() == 0 {
            self.write_enable = true;
            self.error = Some(ErrorKind::WouldBlock);
            return Err(Error::new(ErrorKind::WouldBlock, "send buffer full"));
        }

        let written = self.queue(buffer, false);
        self.attempt_send(notify, AckSchedule::None);
        Ok(written)
    }

    /// Stops the connection. A forceful close ceases all activity
    /// immediately; a graceful one drains the send queue first. Idempotent,
    /// produces no further callbacks once forceful.
    pub fn close(&mut self, force: bool) {
        tracing::trace!(force, "close");
        self.shutdown = if force {
            Shutdown::Forceful
        } else {
            Shutdown::Graceful
        };
    }

    //
    // Internals
    //

    fn queue(&mut self, data: &[u8], ctl: bool) -> usize {
        let available = self.sbuf.remaining();
        let len = if data.len() > available {
            debug_assert!(!ctl);
            available
        } else {
            data.len()
        };

        // An unsent tail segment of the same kind is extended in place
        // rather than fragmenting the list.
        match self.slist.back_mut() {
            Some(last) if last.ctl == ctl && last.xmit == 0 => last.len += len as u32,
            _ => {
                let seq = self.snd_una.wrapping_add(self.sbuf.len() as u32);
                self.slist.push_back(SendSegment {
                    seq,
                    len: len as u32,
                    ctl,
                    xmit: 0,
                });
            }
        }

        self.sbuf.write(&data[..len])
    }

    /// Builds and emits one datagram: `len` bytes of send-buffer payload
    /// starting `offset` bytes past `snd_una`, under the given flags.
    fn packet(
        &mut self,
        notify: &mut dyn Notify,
        seq: u32,
        flags: Flags,
        offset: u32,
        len: u32,
    ) -> WriteResult {
        debug_assert!(HEADER_SIZE + len as usize <= MAX_PACKET);
        let now = (self.cfg.clock)();

        let mut content = vec![0; len as usize];
        let read = self.sbuf.read_offset(&mut content, offset as usize);
        debug_assert_eq!(read, len as usize);

        let pkt = Packet {
            conv: self.conv,
            seq_no: seq,
            ack_no: self.rcv_nxt,
            flags,
            window: (self.rcv_wnd >> self.rwnd_scale) as u16,
            tsval: now,
            tsecr: self.ts_recent,
            content,
        };
        self.ts_lastack = self.rcv_nxt;

        tracing::trace!(
            seq,
            end = seq.wrapping_add(len),
            ack = self.rcv_nxt,
            wnd = self.rcv_wnd,
            flags = %flags,
            "<-- send"
        );

        let encoded = pkt.to_vec().expect("packet encoding cannot fail");
        let wres = notify.write_packet(&encoded);

        // Empty acks are fire-and-forget; their failure must not disturb
        // the timers.
        if wres != WriteResult::Success && len != 0 {
            return wres;
        }

        self.t_ack = 0;
        if len > 0 {
            self.lastsend = now;
        }

        WriteResult::Success
    }

    fn process(&mut self, notify: &mut dyn Notify, seg: &Packet) -> bool {
        if seg.conv != self.conv {
            tracing::error!(seg.conv, self.conv, "wrong conversation");
            return false;
        }

        let now = (self.cfg.clock)();
        self.lastrecv = now;

        tracing::trace!(
            seq = seg.seq_no,
            end = seg.seq_no.wrapping_add(seg.seg_len()),
            ack = seg.ack_no,
            wnd = seg.window,
            flags = %seg.flags,
            "--> recv"
        );

        if self.state == State::Closed {
            tracing::error!("packet on closed connection");
            return false;
        }

        if seg.flags.rst {
            self.closedown(notify, ErrorKind::ConnectionReset);
            return false;
        }

        let mut connect = false;
        if seg.flags.ctl {
            if seg.content.is_empty() {
                tracing::error!("control segment without control code");
                return false;
            }
            match ControlMessage::from_slice(&seg.content) {
                Ok(ControlMessage::Connect(options)) => {
                    connect = true;
                    self.apply_connect_options(&options);

                    if self.state == State::Listen {
                        self.state.transition_to(State::SynRcvd);
                        self.queue_connect_message();
                    } else if self.state == State::SynSent {
                        self.state.transition_to(State::Estab);
                        self.adjust_mtu();
                        notify.on_open();
                    }
                }
                Err(e) => {
                    tracing::warn!("dropping control segment: {e}");
                    return false;
                }
            }
        }

        // Remember the peer's timestamp for echoing, as long as the segment
        // covers the sequence our last ack reported.
        if seg.seq_no <= self.ts_lastack
            && self.ts_lastack < seg.seq_no.wrapping_add(seg.seg_len())
        {
            self.ts_recent = seg.tsval;
        }

        let ack = seg.ack_no;
        if ack > self.snd_una && ack <= self.snd_nxt {
            // A forward ack; sample the round trip off the echoed timestamp.
            if seg.tsecr != 0 {
                let rtt = now.wrapping_sub(seg.tsecr);
                if rtt as i32 >= 0 {
                    self.rtt.sample(rtt);
                    tracing::trace!(rtt, srtt = self.rtt.srtt, rto = self.rtt.rto, "rtt sample");
                } else {
                    debug_assert!(false, "echoed timestamp from the future");
                }
            }

            self.snd_wnd = u32::from(seg.window) << self.swnd_scale;

            let acked = ack.wrapping_sub(self.snd_una);
            self.snd_una = ack;
            self.rto_base = if self.snd_una == self.snd_nxt { 0 } else { now };
            self.sbuf.consume(acked as usize);

            // Trim acknowledged segments off the head of the list.
            let mut free = acked;
            while free > 0 {
                debug_assert!(!self.slist.is_empty());
                let Some(front) = self.slist.front_mut() else {
                    break;
                };
                if free < front.len {
                    front.len -= free;
                    free = 0;
                } else {
                    if front.len > self.largest {
                        self.largest = front.len;
                    }
                    free -= front.len;
                    self.slist.pop_front();
                }
            }

            if self.cong.in_recovery() {
                if self.snd_una >= self.cong.recover {
                    let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
                    self.cong.exit_recovery(in_flight, self.mss);
                    tracing::trace!(cwnd = self.cong.cwnd, "exit recovery");
                } else {
                    // Partial ack: the head segment is lost as well.
                    tracing::trace!("recovery retransmit");
                    if !self.transmit(notify, 0, now) {
                        self.closedown(notify, ErrorKind::ConnectionAborted);
                        return false;
                    }
                    self.cong.partial_ack(acked, self.mss);
                }
            } else {
                self.cong.grow(self.mss);
            }
        } else if ack == self.snd_una {
            // The window is taken even from duplicates; a closed window
            // could never reopen otherwise.
            self.snd_wnd = u32::from(seg.window) << self.swnd_scale;

            if seg.seg_len() > 0 {
                // a duplicate carrying data does not count towards fast
                // retransmit
            } else if self.snd_una != self.snd_nxt {
                self.cong.dup_acks += 1;
                if self.cong.dup_acks == 3 {
                    tracing::trace!("enter recovery");
                    if !self.transmit(notify, 0, now) {
                        self.closedown(notify, ErrorKind::ConnectionAborted);
                        return false;
                    }
                    let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
                    self.cong.enter_recovery(self.snd_nxt, in_flight, self.mss);
                } else if self.cong.dup_acks > 3 {
                    self.cong.cwnd += self.mss;
                }
            } else {
                self.cong.dup_acks = 0;
            }
        }

        // A plain ack completes the passive side of the handshake.
        if self.state == State::SynRcvd && !connect {
            self.state.transition_to(State::Estab);
            self.adjust_mtu();
            notify.on_open();
        }

        // Tell the application once the send queue is halfway towards
        // holding a full window of fresh data again.
        let ideal_refill = (self.sbuf.capacity() + self.rbuf.capacity()) as u32 / 2;
        if self.write_enable && (self.sbuf.len() as u32) < ideal_refill {
            self.write_enable = false;
            notify.on_writeable();
        }

        // The only segment that owes the peer nothing is an empty one
        // sitting exactly at the receive frontier.
        let mut sflags = AckSchedule::None;
        if seg.seq_no != self.rcv_nxt {
            sflags = AckSchedule::Immediate;
        } else if seg.seg_len() != 0 {
            sflags = if self.cfg.ack_delay == 0 {
                AckSchedule::Immediate
            } else {
                AckSchedule::Delayed
            };
        }

        // Clip the segment to the receive window: drop bytes already
        // consumed and bytes beyond the buffer space.
        let mut seq = seg.seq_no;
        let mut data: &[u8] = &seg.content;

        if seq < self.rcv_nxt {
            let adjust = self.rcv_nxt.wrapping_sub(seq);
            if adjust < data.len() as u32 {
                seq = seq.wrapping_add(adjust);
                data = &data[adjust as usize..];
            } else {
                data = &[];
            }
        }

        let available_space = self.rbuf.remaining() as u32;
        if seq
            .wrapping_add(data.len() as u32)
            .wrapping_sub(self.rcv_nxt)
            > available_space
        {
            let adjust = seq
                .wrapping_add(data.len() as u32)
                .wrapping_sub(self.rcv_nxt)
                .wrapping_sub(available_space);
            if adjust < data.len() as u32 {
                data = &data[..data.len() - adjust as usize];
            } else {
                data = &[];
            }
        }

        let ignore_data = seg.flags.ctl || self.shutdown != Shutdown::None;
        let mut new_data = false;

        if !data.is_empty() {
            if ignore_data {
                if seq == self.rcv_nxt {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
                }
            } else {
                let offset = seq.wrapping_sub(self.rcv_nxt);
                let written = self.rbuf.write_offset(data, offset as usize);
                debug_assert_eq!(written, data.len());

                if seq == self.rcv_nxt {
                    self.rbuf.commit(data.len());
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
                    self.rcv_wnd = self.rcv_wnd.wrapping_sub(data.len() as u32);
                    new_data = true;

                    // Drain every queued span the frontier now reaches.
                    while let Some(span) = self.rlist.pop_ready(self.rcv_nxt) {
                        if span.end() > self.rcv_nxt {
                            sflags = AckSchedule::Immediate;
                            let adjust = span.end().wrapping_sub(self.rcv_nxt);
                            tracing::trace!(bytes = adjust, "recovered out-of-order span");
                            self.rbuf.commit(adjust as usize);
                            self.rcv_nxt = self.rcv_nxt.wrapping_add(adjust);
                            self.rcv_wnd = self.rcv_wnd.wrapping_sub(adjust);
                        }
                    }
                } else {
                    self.rlist.insert(Span {
                        seq,
                        len: data.len() as u32,
                    });
                }
            }
        }

        self.attempt_send(notify, sflags);

        if new_data && self.read_enable {
            self.read_enable = false;
            notify.on_readable();
        }

        true
    }

    /// Puts the segment at `index` on the wire, stepping the MTU ladder
    /// down when the carrier refuses the datagram. Returns `false` when the
    /// segment is undeliverable (retransmit cap, carrier failure, ladder
    /// exhausted).
    fn transmit(&mut self, notify: &mut dyn Notify, index: usize, now: u32) -> bool {
        let xmit_limit = if self.state == State::Estab { 15 } else { 30 };
        if self.slist[index].xmit >= xmit_limit {
            tracing::trace!("too many retransmits");
            return false;
        }

        let (seq, len, ctl, xmit) = {
            let seg = &self.slist[index];
            (seg.seq, seg.len, seg.ctl, seg.xmit)
        };
        let mut transmit_len = len.min(self.mss);

        loop {
            let offset = seq.wrapping_sub(self.snd_una);
            match self.packet(notify, seq, Flags::new().ctl(ctl), offset, transmit_len) {
                WriteResult::Success => break,
                WriteResult::Fail => {
                    tracing::trace!("packet failed");
                    return false;
                }
                WriteResult::TooLarge => loop {
                    if self.msslevel + 1 >= PACKET_MAXIMUMS.len() {
                        tracing::trace!("mtu too small");
                        return false;
                    }
                    self.msslevel += 1;
                    self.mss = PACKET_MAXIMUMS[self.msslevel] - PACKET_OVERHEAD;
                    self.cong.cwnd = 2 * self.mss;
                    if self.mss < transmit_len {
                        transmit_len = self.mss;
                        break;
                    }
                },
            }
            tracing::trace!(mss = self.mss, "adjusting mss");
        }

        if transmit_len < self.slist[index].len {
            // Leave the untransmitted tail as its own descriptor.
            let seg = &self.slist[index];
            let tail = SendSegment {
                seq: seg.seq.wrapping_add(transmit_len),
                len: seg.len - transmit_len,
                ctl: seg.ctl,
                xmit,
            };
            self.slist[index].len = transmit_len;
            self.slist.insert(index + 1, tail);
        }

        if self.slist[index].xmit == 0 {
            self.snd_nxt = self.snd_nxt.wrapping_add(self.slist[index].len);
        }
        self.slist[index].xmit += 1;

        if self.rto_base == 0 {
            self.rto_base = now;
        }

        true
    }

    fn attempt_send(&mut self, notify: &mut dyn Notify, mut sflags: AckSchedule) {
        let now = (self.cfg.clock)();

        // A pause longer than the retransmission timeout resets the
        // congestion window to a single segment.
        if time_diff(now, self.lastsend) > self.rtt.rto as i32 {
            self.cong.cwnd = self.mss;
        }

        loop {
            let cwnd = self.cong.effective_window(self.mss);
            let window = self.snd_wnd.min(cwnd);
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
            let useable = window.saturating_sub(in_flight);

            let mut available = (self.sbuf.len() as u32)
                .wrapping_sub(in_flight)
                .min(self.mss);

            if available > useable {
                if useable * 4 < window {
                    // sender-side silly-window avoidance (RFC 813)
                    available = 0;
                } else {
                    available = useable;
                }
            }

            if available == 0 {
                if sflags == AckSchedule::None {
                    return;
                }

                // An immediate ack, or the second of a delayed pair, goes
                // out now; the first delayed ack just starts the timer.
                if sflags == AckSchedule::Immediate || self.t_ack != 0 {
                    self.packet(notify, self.snd_nxt, Flags::new(), 0, 0);
                } else {
                    self.t_ack = now;
                }
                return;
            }

            // Nagle: while data is in flight, wait until a full segment of
            // fresh data has accumulated.
            if self.cfg.nagling && self.snd_nxt > self.snd_una && available < self.mss {
                return;
            }

            let Some(index) = self.slist.iter().position(|seg| seg.xmit == 0) else {
                debug_assert!(false, "transmittable bytes without an unsent segment");
                return;
            };

            // Oversized segments are split in place.
            if self.slist[index].len > available {
                let seg = &self.slist[index];
                let tail = SendSegment {
                    seq: seg.seq.wrapping_add(available),
                    len: seg.len - available,
                    ctl: seg.ctl,
                    xmit: 0,
                };
                self.slist[index].len = available;
                self.slist.insert(index + 1, tail);
            }

            if !self.transmit(notify, index, now) {
                tracing::trace!("transmit failed");
                return;
            }

            sflags = AckSchedule::None;
        }
    }

    fn closedown(&mut self, notify: &mut dyn Notify, err: ErrorKind) {
        self.error = Some(err);
        self.state.transition_to(State::Closed);
        notify.on_closed(err);
    }

    fn adjust_mtu(&mut self) {
        debug_assert!(self.mtu_advise > PACKET_OVERHEAD);

        self.msslevel = 0;
        while self.msslevel + 1 < PACKET_MAXIMUMS.len()
            && PACKET_MAXIMUMS[self.msslevel] > self.mtu_advise
        {
            self.msslevel += 1;
        }
        self.mss = self.mtu_advise - PACKET_OVERHEAD;
        tracing::trace!(mss = self.mss, "adjusting mss");

        // keep the congestion state plausible under the new segment size
        self.cong.ssthresh = self.cong.ssthresh.max(2 * self.mss);
        self.cong.cwnd = self.cong.cwnd.max(self.mss);
    }

    fn queue_connect_message(&mut self) {
        let mut options = Vec::new();
        if self.cfg.wnd_scale {
            options.push(ConnectOption::WindowScale(self.rwnd_scale));
        }
        let message = ControlMessage::Connect(options)
            .to_vec()
            .expect("connect encoding cannot fail");

        // Bootstrap window, just wide enough to let the connect segment
        // itself through; replaced by the peer's advertisement on the first
        // real ack.
        self.snd_wnd = message.len() as u32;
        self.queue(&message, true);
    }

    fn apply_connect_options(&mut self, options: &[ConnectOption]) {
        let mut wnd_scale_seen = false;
        for option in options {
            match option {
                ConnectOption::EndOfList => break,
                ConnectOption::NoOperation => {}
                ConnectOption::MaximumSegmentSize(mss) => {
                    tracing::warn!(mss = *mss, "peer sent the unsupported mss option");
                }
                ConnectOption::WindowScale(shift) => {
                    // Shifts beyond 14 cannot describe a real window.
                    if *shift > 14 {
                        tracing::warn!(shift = *shift, "window scale out of range");
                    } else {
                        self.swnd_scale = *shift;
                    }
                    wnd_scale_seen = true;
                }
                ConnectOption::Unknown { kind, data } if *kind == OPT_WND_SCALE => {
                    tracing::warn!(len = data.len(), "invalid window scale option");
                    wnd_scale_seen = true;
                }
                ConnectOption::Unknown { kind, .. } => {
                    tracing::debug!(kind = *kind, "ignoring unrecognized connect option");
                }
            }
        }

        if !wnd_scale_seen {
            tracing::warn!("peer does not support window scaling");
            if self.rwnd_scale > 0 {
                // fall back to an unscaled window of the default size
                self.resize_receive_buffer(DEFAULT_RCV_BUF_SIZE);
                self.swnd_scale = 0;
            }
        }
    }

    /// Picks the smallest scale factor under which the window fits the
    /// 16-bit wire field, and resizes the buffer to the rescaled capacity.
    fn resize_receive_buffer(&mut self, new_size: usize) {
        let mut scale_factor = 0u8;
        let mut scaled = new_size;
        while scaled > 0xFFFF {
            scale_factor += 1;
            scaled >>= 1;
        }
        let new_size = scaled << scale_factor;

        self.rbuf.set_capacity(new_size);
        self.rwnd_scale = scale_factor;
        self.cong.ssthresh = new_size as u32;
        self.rcv_wnd = self.rbuf.remaining() as u32;
    }
}

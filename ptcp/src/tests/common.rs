use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use bytepack::ToBytestream;
use types::packet::{ConnectOption, ControlMessage, Flags, Packet};

use crate::{Config, Connection, Notify, State, WriteResult};

pub(super) const CONV: u32 = 7;

/// Wire length of a connect message carrying one window-scale option; the
/// first data byte of either stream therefore sits at this sequence.
pub(super) const CONNECT_LEN: u32 = 4;

/// Test clocks start here so that armed ms-timestamps are never confused
/// with the zero sentinel of a disarmed timer.
pub(super) const T0: u32 = 1000;

pub(super) const WIN_64K: u16 = u16::MAX;

/// Captured lifecycle upcalls, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Event {
    Open,
    Readable,
    Writeable,
    Closed(ErrorKind),
}

/// Host double: records emitted datagrams and upcalls. The write verdict
/// can be swapped to simulate carriers that reject datagrams.
pub(super) struct Host {
    pub tx: VecDeque<Vec<u8>>,
    pub events: Vec<Event>,
    pub write_verdict: Box<dyn FnMut(&[u8]) -> WriteResult>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            tx: VecDeque::new(),
            events: Vec::new(),
            write_verdict: Box::new(|_| WriteResult::Success),
        }
    }
}

impl Notify for Host {
    fn on_open(&mut self) {
        self.events.push(Event::Open);
    }
    fn on_readable(&mut self) {
        self.events.push(Event::Readable);
    }
    fn on_writeable(&mut self) {
        self.events.push(Event::Writeable);
    }
    fn on_closed(&mut self, err: ErrorKind) {
        self.events.push(Event::Closed(err));
    }
    fn write_packet(&mut self, packet: &[u8]) -> WriteResult {
        let verdict = (self.write_verdict)(packet);
        if verdict == WriteResult::Success {
            self.tx.push_back(packet.to_vec());
        }
        verdict
    }
}

/// One endpoint under test: a connection, its host double and a shared
/// virtual clock.
pub(super) struct TestUnit {
    pub con: Connection,
    pub host: Host,
    pub clock: Arc<Mutex<u32>>,
}

impl TestUnit {
    pub fn new() -> Self {
        Self::with_cfg(CONV, |_| {})
    }

    pub fn with_cfg(conv: u32, tweak: impl FnOnce(&mut Config)) -> Self {
        let clock = Arc::new(Mutex::new(T0));
        let reader = clock.clone();
        let mut cfg = Config {
            clock: Arc::new(move || *reader.lock().unwrap()),
            ..Config::default()
        };
        tweak(&mut cfg);
        TestUnit {
            con: Connection::new(conv, cfg),
            host: Host::default(),
            clock,
        }
    }

    pub fn connect(&mut self) -> io::Result<()> {
        self.con.connect(&mut self.host)
    }

    pub fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.con.send(&mut self.host, data)
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.con.recv(&mut self.host, buf)
    }

    /// Reads everything currently buffered.
    pub fn recv_all(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(n) = self.recv(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    pub fn incoming(&mut self, pkt: &Packet) -> bool {
        let raw = pkt.to_vec().unwrap();
        self.incoming_raw(&raw)
    }

    pub fn incoming_raw(&mut self, data: &[u8]) -> bool {
        self.con.notify_packet(&mut self.host, data)
    }

    pub fn now(&self) -> u32 {
        *self.clock.lock().unwrap()
    }

    pub fn set_time(&self, now: u32) {
        *self.clock.lock().unwrap() = now;
    }

    /// Runs the clock handler at the current virtual time.
    pub fn tick(&mut self) {
        let now = self.now();
        self.con.notify_clock(&mut self.host, now);
    }

    /// Moves the virtual clock forward and ticks.
    pub fn advance(&mut self, delta: u32) {
        let now = self.now() + delta;
        self.set_time(now);
        self.tick();
    }

    /// Drains and decodes every emitted datagram.
    pub fn outgoing(&mut self) -> Vec<Packet> {
        use bytepack::FromBytestream;
        self.host
            .tx
            .drain(..)
            .map(|raw| Packet::from_slice(&raw).unwrap())
            .collect()
    }

    /// Forwards every emitted datagram to `peer`, returning the count.
    pub fn pipe_all(&mut self, peer: &mut TestUnit) -> usize {
        let pkts: Vec<_> = self.host.tx.drain(..).collect();
        for raw in &pkts {
            peer.incoming_raw(raw);
        }
        pkts.len()
    }

    pub fn events(&self) -> &[Event] {
        &self.host.events
    }

    pub fn clear(&mut self) {
        self.host.tx.clear();
        self.host.events.clear();
    }
}

impl Deref for TestUnit {
    type Target = Connection;
    fn deref(&self) -> &Self::Target {
        &self.con
    }
}

impl DerefMut for TestUnit {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.con
    }
}

/// Shuttles datagrams in both directions until the link falls silent.
pub(super) fn exchange(a: &mut TestUnit, b: &mut TestUnit) {
    loop {
        let moved = a.pipe_all(b) + b.pipe_all(a);
        if moved == 0 {
            return;
        }
    }
}

/// Drives both endpoints to `Estab` over a clean link and clears all
/// captured state. The shared clock of both units ends up in sync.
pub(super) fn handshake(a: &mut TestUnit, b: &mut TestUnit) {
    a.connect().unwrap();
    assert_eq!(a.pipe_all(b), 1);
    assert_eq!(b.pipe_all(a), 1);
    assert_eq!(a.state(), State::Estab);

    // flush the delayed ack that completes the passive side
    a.advance(crate::connection::DEF_ACK_DELAY);
    b.set_time(a.now());
    assert!(a.pipe_all(b) >= 1);
    assert_eq!(b.state(), State::Estab);

    a.clear();
    b.clear();
}

/// Handshake with a path MTU advised up front, yielding a small initial
/// congestion window and a predictable segment size.
pub(super) fn handshake_with_mtu(a: &mut TestUnit, b: &mut TestUnit, mtu: u16) {
    a.con.notify_mtu(mtu);
    b.con.notify_mtu(mtu);
    handshake(a, b);
}

/// Runs `rounds` of exchange-then-tick between both endpoints, keeping
/// their clocks in sync so delayed acks and retransmits keep traffic
/// flowing.
pub(super) fn pump(a: &mut TestUnit, b: &mut TestUnit, rounds: usize) {
    for _ in 0..rounds {
        exchange(a, b);
        let now = a.now() + 100;
        a.set_time(now);
        b.set_time(now);
        a.tick();
        b.tick();
    }
    exchange(a, b);
}

/// Establishes `a` as the passive side against a synthetic remote: a
/// connect message arrives, then a bare ack of `a`'s own connect reply.
/// Afterwards both streams start at sequence [`CONNECT_LEN`] and the
/// remote advertises `remote_window`.
pub(super) fn handshake_passive(a: &mut TestUnit, mtu: u16, remote_window: u16) {
    a.con.notify_mtu(mtu);

    let ctl = Packet {
        conv: CONV,
        seq_no: 0,
        ack_no: 0,
        flags: Flags::new().ctl(true),
        window: remote_window,
        tsval: 0,
        tsecr: 0,
        content: connect_message(Some(0)),
    };
    assert!(a.incoming(&ctl));
    assert_eq!(a.state(), State::SynRcvd);
    a.clear();

    assert!(a.incoming(&Packet::new(
        CONV,
        CONNECT_LEN,
        CONNECT_LEN,
        remote_window,
        vec![],
    )));
    assert_eq!(a.state(), State::Estab);
    a.clear();
}

/// Encoded connect message, optionally carrying a window-scale option.
pub(super) fn connect_message(scale: Option<u8>) -> Vec<u8> {
    let options = scale.map(ConnectOption::WindowScale).into_iter().collect();
    ControlMessage::Connect(options).to_vec().unwrap()
}

/// A plain data packet from the fake remote (no timestamps, so the
/// receiver's RTO stays at its 3 s default).
pub(super) fn data_packet(seq_no: u32, ack_no: u32, window: u16, content: Vec<u8>) -> Packet {
    Packet::new(CONV, seq_no, ack_no, window, content)
}

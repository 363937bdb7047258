use std::io::ErrorKind;

use super::common::{
    connect_message, data_packet, handshake, CONNECT_LEN, CONV, Event, TestUnit,
};
use crate::{SockOpt, State};
use types::packet::{Flags, Packet};

#[test]
fn both_sides_reach_estab() {
    let mut a = TestUnit::new();
    let mut b = TestUnit::new();

    a.connect().unwrap();
    assert_eq!(a.state(), State::SynSent);

    let pkts = a.outgoing();
    assert_eq!(pkts.len(), 1);
    assert!(pkts[0].flags.ctl);
    assert_eq!(pkts[0].seq_no, 0);
    assert_eq!(pkts[0].content, connect_message(Some(0)));

    assert!(b.incoming(&pkts[0]));
    assert_eq!(b.state(), State::SynRcvd);

    let reply = b.outgoing();
    assert_eq!(reply.len(), 1);
    assert!(reply[0].flags.ctl);
    assert_eq!(reply[0].ack_no, CONNECT_LEN);

    assert!(a.incoming(&reply[0]));
    assert_eq!(a.state(), State::Estab);
    assert_eq!(a.events(), [Event::Open]);

    // the ack completing the passive side rides the delayed-ack timer
    a.advance(100);
    b.set_time(a.now());
    assert_eq!(a.pipe_all(&mut b), 1);
    assert_eq!(b.state(), State::Estab);
    assert_eq!(b.events(), [Event::Open]);

    // no payload was exchanged
    let mut buf = [0u8; 16];
    assert_eq!(a.recv(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);
    assert_eq!(b.recv(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);
}

#[test]
fn connect_requires_listen() {
    let mut a = TestUnit::new();
    a.connect().unwrap();

    let err = a.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(a.last_error(), Some(ErrorKind::InvalidInput));
}

#[test]
fn window_scale_is_negotiated() {
    let mut a = TestUnit::new();
    let mut b = TestUnit::new();
    a.set_option(SockOpt::SndBuf, 4 * 1024 * 1024).unwrap();
    a.set_option(SockOpt::RcvBuf, 1 << 20).unwrap();

    a.connect().unwrap();
    let pkts = a.outgoing();
    // 1 MiB needs a shift of 5 to fit the 16-bit window field
    assert_eq!(pkts[0].content, connect_message(Some(5)));
    assert_eq!(pkts[0].window, (1u32 << 20 >> 5) as u16);

    assert!(b.incoming(&pkts[0]));
    assert_eq!(b.con.swnd_scale, 5);

    b.pipe_all(&mut a);
    assert_eq!(a.state(), State::Estab);
    assert_eq!(a.con.rwnd_scale, 5);
}

#[test]
fn peer_without_window_scale_reverts_to_default() {
    let mut a = TestUnit::new();
    let mut b = TestUnit::new();
    a.set_option(SockOpt::SndBuf, 4 * 1024 * 1024).unwrap();
    a.set_option(SockOpt::RcvBuf, 1 << 20).unwrap();
    b.disable_window_scale();

    a.connect().unwrap();
    a.pipe_all(&mut b);
    b.pipe_all(&mut a);

    assert_eq!(a.state(), State::Estab);
    assert_eq!(a.con.rwnd_scale, 0);
    assert_eq!(a.con.swnd_scale, 0);
    assert_eq!(a.get_option(SockOpt::RcvBuf), 60 * 1024);
}

#[test]
fn learned_scale_applies_to_the_advertised_window() {
    let mut a = TestUnit::new();

    let ctl = Packet {
        conv: CONV,
        seq_no: 0,
        ack_no: 0,
        flags: Flags::new().ctl(true),
        window: 100,
        tsval: 0,
        tsecr: 0,
        content: connect_message(Some(3)),
    };
    assert!(a.incoming(&ctl));
    assert_eq!(a.con.swnd_scale, 3);
    a.clear();

    assert!(a.incoming(&data_packet(CONNECT_LEN, CONNECT_LEN, 100, vec![])));
    assert_eq!(a.state(), State::Estab);
    assert_eq!(a.con.snd_wnd, 100 << 3);
}

#[test]
fn duplicate_connect_is_reacknowledged() {
    let mut a = TestUnit::new();
    let mut b = TestUnit::new();

    a.connect().unwrap();
    let pkts = a.outgoing();
    assert!(b.incoming(&pkts[0]));
    assert_eq!(b.state(), State::SynRcvd);
    b.clear();

    // the reply was lost; the initiator retransmits its connect message
    assert!(b.incoming(&pkts[0]));
    assert_eq!(b.state(), State::SynRcvd);

    let replies = b.outgoing();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].content.is_empty());
    assert_eq!(replies[0].ack_no, CONNECT_LEN);
}

#[test]
fn buffers_are_locked_once_connecting() {
    let mut a = TestUnit::new();
    let mut b = TestUnit::new();
    handshake(&mut a, &mut b);

    let err = a.set_option(SockOpt::RcvBuf, 128 * 1024).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = a.set_option(SockOpt::SndBuf, 128 * 1024).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    // delay tuning stays available
    a.set_option(SockOpt::AckDelay, 0).unwrap();
    assert_eq!(a.get_option(SockOpt::AckDelay), 0);
}

mod common;

mod handshake;

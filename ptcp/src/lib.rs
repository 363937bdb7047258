//! A reliable, in-order byte-stream transport layered on an unreliable,
//! message-oriented datagram carrier.
//!
//! The engine performs no I/O and keeps no threads or timers of its own:
//! the host feeds it inbound datagrams and clock ticks, and receives
//! outbound datagrams and lifecycle events through the [`Notify`] trait.

mod buffer;
mod connection;
mod notify;

pub use connection::{Clock, Config, Connection, SockOpt, State};
pub use notify::{Notify, WriteResult};

pub use types;

#[cfg(test)]
mod tests;

use std::io::ErrorKind;

/// Result of handing a datagram to the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The datagram was accepted.
    Success,
    /// The datagram exceeds the carrier's current MTU; the engine steps
    /// down its segment size and retries.
    TooLarge,
    /// The datagram was dropped; retransmission timers will recover.
    Fail,
}

/// Upcalls from the engine into the host.
///
/// All methods are invoked synchronously, on the calling thread, from
/// within the engine's own entry points. Implementations must not call
/// back into the engine.
pub trait Notify {
    /// The connection reached the established state.
    fn on_open(&mut self);

    /// New in-order data is ready; armed by a `recv` that returned
    /// [`ErrorKind::WouldBlock`].
    fn on_readable(&mut self);

    /// Send-buffer space was freed; armed by a `send` that returned
    /// [`ErrorKind::WouldBlock`].
    fn on_writeable(&mut self);

    /// The connection closed with the given error.
    fn on_closed(&mut self, err: ErrorKind);

    /// Transmit one datagram over the carrier. The slice is only valid for
    /// the duration of the call; the host must copy it to retain it.
    fn write_packet(&mut self, packet: &[u8]) -> WriteResult;
}

use std::{sync::Arc, time::Instant};

use super::{DEFAULT_RCV_BUF_SIZE, DEFAULT_SND_BUF_SIZE, DEF_ACK_DELAY};

/// Monotonic millisecond clock provided by the host. Wraps after ~49 days,
/// which all timer arithmetic tolerates.
pub type Clock = Arc<dyn Fn() -> u32>;

/// Initial tuning of a [`Connection`](super::Connection).
///
/// Everything here can also be adjusted through
/// [`set_option`](super::Connection::set_option); buffer capacities only
/// while still listening.
#[derive(Clone)]
pub struct Config {
    /// Send buffer capacity in bytes. Must exceed the receive buffer
    /// capacity by at least one minimum packet, so that freed send-buffer
    /// space can be detected and reported.
    pub snd_buf_cap: usize,
    /// Receive buffer capacity in bytes; doubles as the advertised window.
    pub rcv_buf_cap: usize,
    /// Delay before a pending acknowledgment is flushed, in ms. Zero turns
    /// delayed acks off.
    pub ack_delay: u32,
    /// Nagle's algorithm: hold sub-segment writes while data is in flight.
    pub nagling: bool,
    /// Offer the window-scale option when connecting.
    pub wnd_scale: bool,
    pub clock: Clock,
}

impl Default for Config {
    fn default() -> Self {
        let start = Instant::now();
        Self {
            snd_buf_cap: DEFAULT_SND_BUF_SIZE,
            rcv_buf_cap: DEFAULT_RCV_BUF_SIZE,
            ack_delay: DEF_ACK_DELAY,
            nagling: true,
            wnd_scale: true,
            clock: Arc::new(move || start.elapsed().as_millis() as u32),
        }
    }
}

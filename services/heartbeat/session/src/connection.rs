//! Connection capability used by the heartbeat session.

use std::io;

use crate::notifier::Subscription;

/// The operations a heartbeat session needs from the monitored handle.
///
/// Implementors never give up ownership of the underlying transport; the
/// session only signals on it and never closes it.
pub trait Connection: Send + Sync + 'static {
    /// Send `data` on the priority (out-of-band) channel without blocking
    fn send_urgent(&self, data: &[u8]) -> io::Result<usize>;

    /// Drain pending out-of-band data without blocking.
    ///
    /// `ErrorKind::WouldBlock` means the indicator arrived but nothing is
    /// readable yet.
    fn recv_urgent(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Route out-of-band notifications for this handle to the caller
    fn subscribe(&self) -> io::Result<Subscription>;

    /// Short description used in log lines
    fn label(&self) -> String {
        "connection".to_string()
    }
}

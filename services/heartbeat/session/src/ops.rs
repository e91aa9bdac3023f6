//! Caller-supplied heartbeat reactions.

use std::io;

use crate::connection::Connection;
use crate::error::HeartbeatError;

/// Payload of the default probe
pub const PROBE_BYTE: &[u8] = b"1";

/// Urgent reply to a received [`PROBE_BYTE`]
pub const ACK_BYTE: &[u8] = b"2";

/// Probe and broken-connection reactions for a heartbeat session.
///
/// Both methods run on the session's event task. They must return promptly
/// and must not call back into [`crate::Heartbeat`].
pub trait HeartbeatOperations: Send + Sync + 'static {
    /// Send one liveness-eliciting unit on the connection.
    ///
    /// Any `Err` is terminal for the session.
    fn probe(&self, conn: &dyn Connection) -> io::Result<usize> {
        default_probe(conn)
    }

    /// React to urgent data drained after a liveness notification.
    ///
    /// Runs after the countdown has been reset. Errors are logged and are
    /// not terminal; the next probe reports a dead transport.
    fn acknowledge(&self, _conn: &dyn Connection, _received: &[u8]) -> io::Result<()> {
        Ok(())
    }

    /// Called exactly once when the peer is presumed dead
    fn broken(&self, reason: &HeartbeatError);
}

/// Send a single out-of-band byte.
///
/// Ordinary sends can sit behind buffered data for an unbounded time; the
/// urgent channel gives a prompt answer about transport health.
pub fn default_probe(conn: &dyn Connection) -> io::Result<usize> {
    conn.send_urgent(PROBE_BYTE)
}

/// Reply to a peer's [`PROBE_BYTE`] with [`ACK_BYTE`].
///
/// Replies are never answered, so two answering peers cannot ping-pong.
pub fn answer_probe(conn: &dyn Connection, received: &[u8]) -> io::Result<()> {
    if received == PROBE_BYTE {
        conn.send_urgent(ACK_BYTE)?;
    }
    Ok(())
}

/// Wraps operations so that every probe from the peer is answered.
///
/// A peer whose own countdown keeps being reset by incoming probes never
/// probes back; answering gives the prober its liveness signal.
#[derive(Debug)]
pub struct AnswerProbes<O>(pub O);

impl<O: HeartbeatOperations> HeartbeatOperations for AnswerProbes<O> {
    fn probe(&self, conn: &dyn Connection) -> io::Result<usize> {
        self.0.probe(conn)
    }

    fn acknowledge(&self, conn: &dyn Connection, received: &[u8]) -> io::Result<()> {
        answer_probe(conn, received)?;
        self.0.acknowledge(conn, received)
    }

    fn broken(&self, reason: &HeartbeatError) {
        self.0.broken(reason)
    }
}

/// Operations built from a closure, using the default probe
pub struct OnBroken<F>(pub F);

impl<F> HeartbeatOperations for OnBroken<F>
where
    F: Fn(&HeartbeatError) + Send + Sync + 'static,
{
    fn broken(&self, reason: &HeartbeatError) {
        (self.0)(reason)
    }
}

impl<F> std::fmt::Debug for OnBroken<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OnBroken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{liveness_channel, Subscription};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingConnection {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Connection for RecordingConnection {
        fn send_urgent(&self, data: &[u8]) -> io::Result<usize> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn recv_urgent(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn subscribe(&self) -> io::Result<Subscription> {
            let (_tx, source) = liveness_channel();
            Ok(Subscription::new(source))
        }
    }

    #[test]
    fn test_default_probe_sends_one_byte() {
        let conn = RecordingConnection::default();
        assert_eq!(default_probe(&conn).unwrap(), 1);
        assert_eq!(conn.sent.lock().unwrap().as_slice(), &[b"1".to_vec()]);
    }

    #[test]
    fn test_on_broken_uses_default_probe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ops = OnBroken(move |_: &HeartbeatError| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let conn = RecordingConnection::default();
        assert_eq!(ops.probe(&conn).unwrap(), 1);

        ops.broken(&HeartbeatError::EscalationExhausted { max_probes: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_only_probes_are_answered() {
        let conn = RecordingConnection::default();

        answer_probe(&conn, PROBE_BYTE).unwrap();
        answer_probe(&conn, ACK_BYTE).unwrap();
        answer_probe(&conn, b"").unwrap();

        assert_eq!(conn.sent.lock().unwrap().as_slice(), &[ACK_BYTE.to_vec()]);
    }

    #[test]
    fn test_answer_probes_delegates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ops = AnswerProbes(OnBroken(move |_: &HeartbeatError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let conn = RecordingConnection::default();

        ops.acknowledge(&conn, PROBE_BYTE).unwrap();
        assert_eq!(ops.probe(&conn).unwrap(), 1);
        ops.broken(&HeartbeatError::EscalationExhausted { max_probes: 1 });

        assert_eq!(
            conn.sent.lock().unwrap().as_slice(),
            &[ACK_BYTE.to_vec(), PROBE_BYTE.to_vec()]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

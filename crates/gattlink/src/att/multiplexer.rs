//! ATT request multiplexer
//!
//! ATT allows one outstanding request per bearer. The multiplexer owns both
//! halves of the transport: callers queue for a turn, write their request and
//! block until the matching response arrives, while a background reader thread
//! routes every inbound PDU either to the waiting caller or, for notifications
//! and indications, to the [`SubscriptionRegistry`].
use super::constants::*;
use super::lock;
use super::subscriber::SubscriptionRegistry;
use super::types::{AttPacket, ErrorResponse, HandleValue, HandleValueConfirmation, Opcode};
use crate::error::{Error, Result};
use log::{debug, error, trace, warn};
use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Default bound on how long a caller waits for its response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do with a response whose opcode does not match the request in
/// flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Log the stray PDU and keep waiting for the right one
    #[default]
    LogAndContinue,
    /// Fail the waiting caller with [`Error::ProtocolMismatch`]
    FailFast,
}

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Per-request wait bound. `None` waits until a response or teardown.
    /// A request that times out closes the link.
    pub request_timeout: Option<Duration>,
    /// Handling of mismatched responses
    pub mismatch_policy: MismatchPolicy,
    /// Size of the buffer handed to each transport read
    pub read_buffer_size: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            mismatch_policy: MismatchPolicy::default(),
            read_buffer_size: L2CAP_DEFAULT_MTU,
        }
    }
}

/// The request currently awaiting its response
struct Pending {
    request: u8,
    expected: u8,
    reply: SyncSender<Result<Vec<u8>>>,
}

#[derive(Default)]
struct LinkState {
    pending: Option<Pending>,
    closed: bool,
}

/// FIFO ticket queue: callers are served in the order they arrived.
#[derive(Default)]
struct TicketQueue {
    next_ticket: u64,
    now_serving: u64,
}

struct Shared {
    writer: Mutex<Box<dyn Write + Send>>,
    link: Mutex<LinkState>,
    queue: Mutex<TicketQueue>,
    turn_changed: Condvar,
    registry: Arc<SubscriptionRegistry>,
    config: MultiplexerConfig,
}

/// Hands the bearer to the next ticket when dropped.
struct Turn<'a> {
    shared: &'a Shared,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        lock(&self.shared.queue).now_serving += 1;
        self.shared.turn_changed.notify_all();
    }
}

/// Serializes ATT requests over one transport and routes server-initiated
/// PDUs to subscribers.
pub struct RequestMultiplexer {
    shared: Arc<Shared>,
}

impl RequestMultiplexer {
    /// Start a multiplexer with the default configuration
    pub fn new<R, W>(reader: R, writer: W, registry: Arc<SubscriptionRegistry>) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::with_config(reader, writer, registry, MultiplexerConfig::default())
    }

    /// Start a multiplexer and its reader thread.
    ///
    /// Every `read` on `reader` must yield exactly one PDU; `Ok(0)` means the
    /// peer went away.
    pub fn with_config<R, W>(
        reader: R,
        writer: W,
        registry: Arc<SubscriptionRegistry>,
        config: MultiplexerConfig,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            link: Mutex::new(LinkState::default()),
            queue: Mutex::new(TicketQueue::default()),
            turn_changed: Condvar::new(),
            registry,
            config,
        });

        let reader_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("att-reader".into())
            .spawn(move || reader_shared.read_loop(reader))?;

        Ok(Self { shared })
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.shared.config
    }

    /// The registry notifications are routed to
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.shared.registry
    }

    /// Send a request PDU and wait for its response.
    ///
    /// Returns the full response PDU, opcode included. An ATT Error Response
    /// is returned as-is, so the caller decides whether it ends a discovery
    /// loop or is a genuine failure.
    pub fn send_request(&self, pdu: &[u8]) -> Result<Vec<u8>> {
        let request = *pdu.first().ok_or(Error::InvalidPdu("empty request"))?;
        let expected = Opcode::try_from(request)
            .ok()
            .and_then(Opcode::expected_response)
            .ok_or(Error::InvalidPdu("not a request opcode"))?;

        let _turn = self.shared.wait_turn();

        let (reply, response) = mpsc::sync_channel(1);
        {
            let mut link = lock(&self.shared.link);
            if link.closed {
                return Err(Error::TransportClosed);
            }
            link.pending = Some(Pending {
                request,
                expected: expected.into(),
                reply,
            });
        }

        trace!("ATT request > {}", hex::encode(pdu));
        if let Err(e) = self.shared.write_pdu(pdu) {
            lock(&self.shared.link).pending = None;
            return Err(e);
        }

        match self.shared.config.request_timeout {
            Some(timeout) => match response.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    // A late answer would be taken for the next request's
                    // response, so a timed out transaction ends the bearer.
                    warn!(
                        "ATT request 0x{:02X} timed out after {:?}, closing the link",
                        request, timeout
                    );
                    self.shared.shutdown();
                    Err(Error::RequestTimeout {
                        opcode: request,
                        timeout,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => Err(Error::TransportClosed),
            },
            None => response.recv().unwrap_or(Err(Error::TransportClosed)),
        }
    }

    /// Write a PDU that expects no response, such as a Write Command.
    pub fn send_command(&self, pdu: &[u8]) -> Result<()> {
        if pdu.is_empty() {
            return Err(Error::InvalidPdu("empty command"));
        }
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        trace!("ATT command > {}", hex::encode(pdu));
        self.shared.write_pdu(pdu)
    }

    /// Mark the link closed. The request in flight and every later one fail
    /// with [`Error::TransportClosed`].
    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.link).closed
    }
}

impl Drop for RequestMultiplexer {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl Shared {
    fn wait_turn(&self) -> Turn<'_> {
        let mut queue = lock(&self.queue);
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        while queue.now_serving != ticket {
            queue = self
                .turn_changed
                .wait(queue)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        Turn { shared: self }
    }

    fn write_pdu(&self, pdu: &[u8]) -> Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_all(pdu)?;
        writer.flush()?;
        Ok(())
    }

    fn shutdown(&self) {
        let pending = {
            let mut link = lock(&self.link);
            if link.closed {
                return;
            }
            link.closed = true;
            link.pending.take()
        };
        debug!("ATT link closed");
        if let Some(pending) = pending {
            let _ = pending.reply.send(Err(Error::TransportClosed));
        }
    }

    fn read_loop<R: Read>(&self, mut reader: R) {
        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("ATT transport reached end of stream");
                    break;
                }
                Ok(n) => self.route(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("ATT transport read failed: {}", e);
                    break;
                }
            }
        }
        self.shutdown();
    }

    fn route(&self, pdu: &[u8]) {
        trace!("ATT < {}", hex::encode(pdu));
        match pdu[0] {
            ATT_HANDLE_VALUE_NTF => self.deliver(pdu),
            ATT_HANDLE_VALUE_IND => {
                self.deliver(pdu);
                if let Err(e) = self.write_pdu(&HandleValueConfirmation.serialize()) {
                    warn!("Failed to confirm indication: {}", e);
                }
            }
            _ => self.complete(pdu),
        }
    }

    fn deliver(&self, pdu: &[u8]) {
        match HandleValue::parse(pdu) {
            Ok(HandleValue { handle, value }) => {
                if !self.registry.dispatch(handle, value) {
                    debug!("Dropping value for unsubscribed handle 0x{:04X}", handle);
                }
            }
            Err(e) => warn!("Dropping malformed handle value PDU: {}", e),
        }
    }

    fn complete(&self, pdu: &[u8]) {
        let opcode = pdu[0];
        let mut link = lock(&self.link);
        let pending = match link.pending.take() {
            Some(pending) => pending,
            None => {
                debug!("Dropping response 0x{:02X} with no request in flight", opcode);
                return;
            }
        };

        let answers_request = opcode == pending.expected
            || (opcode == ATT_ERROR_RSP
                && ErrorResponse::parse(pdu).map_or(false, |e| e.request_opcode == pending.request));
        if answers_request {
            let _ = pending.reply.send(Ok(pdu.to_vec()));
            return;
        }

        match self.config.mismatch_policy {
            MismatchPolicy::LogAndContinue => {
                warn!(
                    "Ignoring response 0x{:02X} while waiting for 0x{:02X}",
                    opcode, pending.expected
                );
                link.pending = Some(pending);
            }
            MismatchPolicy::FailFast => {
                let _ = pending.reply.send(Err(Error::ProtocolMismatch {
                    request: pending.request,
                    response: opcode,
                }));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::sync::mpsc::{Receiver, Sender};

    const WAIT: Duration = Duration::from_secs(2);

    /// Read half of an in-memory link: every received Vec is one PDU, a
    /// dropped sender is end of stream.
    pub(crate) struct ChannelReader(pub(crate) Receiver<Vec<u8>>);

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(pdu) => {
                    let n = pdu.len().min(buf.len());
                    buf[..n].copy_from_slice(&pdu[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }
    }

    /// Write half of an in-memory link: every write is one PDU.
    pub(crate) struct ChannelWriter(pub(crate) Sender<Vec<u8>>);

    impl Write for ChannelWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "peer gone"))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// The peer's ends of a link
    pub(crate) struct Peer {
        pub(crate) to_central: Sender<Vec<u8>>,
        pub(crate) from_central: Receiver<Vec<u8>>,
    }

    pub(crate) fn link(config: MultiplexerConfig) -> (RequestMultiplexer, Peer) {
        let (to_central, central_rx) = mpsc::channel();
        let (central_tx, from_central) = mpsc::channel();
        let mux = RequestMultiplexer::with_config(
            ChannelReader(central_rx),
            ChannelWriter(central_tx),
            Arc::new(SubscriptionRegistry::new()),
            config,
        )
        .unwrap();
        (
            mux,
            Peer {
                to_central,
                from_central,
            },
        )
    }

    #[test]
    fn test_request_gets_matching_response() {
        let (mux, peer) = link(MultiplexerConfig::default());

        let server = thread::spawn(move || {
            let request = peer.from_central.recv_timeout(WAIT).unwrap();
            assert_eq!(request, vec![0x0A, 0x03, 0x00]);
            peer.to_central.send(vec![0x0B, 0x42]).unwrap();
            peer
        });

        assert_eq!(mux.send_request(&[0x0A, 0x03, 0x00]).unwrap(), vec![0x0B, 0x42]);
        let _peer = server.join().unwrap();
    }

    #[test]
    fn test_error_response_is_returned_raw() {
        let (mux, peer) = link(MultiplexerConfig::default());

        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            peer.to_central
                .send(vec![0x01, 0x0A, 0x03, 0x00, 0x02])
                .unwrap();
            peer
        });

        let response = mux.send_request(&[0x0A, 0x03, 0x00]).unwrap();
        assert_eq!(response, vec![0x01, 0x0A, 0x03, 0x00, 0x02]);
        let _peer = server.join().unwrap();
    }

    #[test]
    fn test_error_for_another_request_is_a_mismatch() {
        let (mux, peer) = link(MultiplexerConfig {
            mismatch_policy: MismatchPolicy::FailFast,
            ..Default::default()
        });

        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            peer.to_central
                .send(vec![0x01, 0x12, 0x03, 0x00, 0x03])
                .unwrap();
            peer
        });

        assert!(matches!(
            mux.send_request(&[0x0A, 0x03, 0x00]),
            Err(Error::ProtocolMismatch {
                request: 0x0A,
                response: 0x01
            })
        ));
        let _peer = server.join().unwrap();
    }

    #[test]
    fn test_concurrent_requests_are_serialized() {
        let (mux, peer) = link(MultiplexerConfig::default());
        let mux = Arc::new(mux);

        // Answer each read with its own handle so callers can check they got
        // the right response, and verify only one request is ever in flight.
        let server = thread::spawn(move || {
            for _ in 0..8 {
                let request = peer.from_central.recv_timeout(WAIT).unwrap();
                assert!(peer
                    .from_central
                    .recv_timeout(Duration::from_millis(20))
                    .is_err());
                peer.to_central
                    .send(vec![0x0B, request[1], request[2]])
                    .unwrap();
            }
            peer
        });

        let callers: Vec<_> = (0..8u16)
            .map(|handle| {
                let mux = Arc::clone(&mux);
                thread::spawn(move || {
                    let [lo, hi] = handle.to_le_bytes();
                    let response = mux.send_request(&[0x0A, lo, hi]).unwrap();
                    assert_eq!(response, vec![0x0B, lo, hi]);
                })
            })
            .collect();

        for caller in callers {
            caller.join().unwrap();
        }
        let _peer = server.join().unwrap();
    }

    #[test]
    fn test_unsolicited_response_is_dropped() {
        let (mux, peer) = link(MultiplexerConfig::default());

        peer.to_central.send(vec![0x0B, 0x99]).unwrap();
        thread::sleep(Duration::from_millis(50));

        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            peer.to_central.send(vec![0x0B, 0x01]).unwrap();
            peer
        });
        assert_eq!(mux.send_request(&[0x0A, 0x01, 0x00]).unwrap(), vec![0x0B, 0x01]);
        let _peer = server.join().unwrap();
    }

    #[test]
    fn test_mismatch_log_and_continue() {
        let (mux, peer) = link(MultiplexerConfig::default());

        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            peer.to_central.send(vec![0x13]).unwrap();
            peer.to_central.send(vec![0x0B, 0x07]).unwrap();
            peer
        });

        assert_eq!(mux.send_request(&[0x0A, 0x01, 0x00]).unwrap(), vec![0x0B, 0x07]);
        let _peer = server.join().unwrap();
    }

    #[test]
    fn test_mismatch_fail_fast() {
        let (mux, peer) = link(MultiplexerConfig {
            mismatch_policy: MismatchPolicy::FailFast,
            ..Default::default()
        });

        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            peer.to_central.send(vec![0x13]).unwrap();
            peer
        });

        match mux.send_request(&[0x0A, 0x01, 0x00]) {
            Err(Error::ProtocolMismatch { request, response }) => {
                assert_eq!(request, 0x0A);
                assert_eq!(response, 0x13);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        let _peer = server.join().unwrap();
    }

    #[test]
    fn test_end_of_stream_fails_pending_and_later_requests() {
        let (mux, peer) = link(MultiplexerConfig::default());

        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            drop(peer.to_central);
            peer.from_central
        });

        assert!(matches!(
            mux.send_request(&[0x0A, 0x01, 0x00]),
            Err(Error::TransportClosed)
        ));
        let _from_central = server.join().unwrap();

        assert!(mux.is_closed());
        assert!(matches!(
            mux.send_request(&[0x0A, 0x01, 0x00]),
            Err(Error::TransportClosed)
        ));
        assert!(matches!(
            mux.send_command(&[0x52, 0x01, 0x00, 0x01]),
            Err(Error::TransportClosed)
        ));
    }

    #[test]
    fn test_close_releases_blocked_caller() {
        let (mux, peer) = link(MultiplexerConfig {
            request_timeout: None,
            ..Default::default()
        });
        let mux = Arc::new(mux);

        let caller = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.send_request(&[0x0A, 0x01, 0x00]))
        };

        peer.from_central.recv_timeout(WAIT).unwrap();
        mux.close();
        assert!(matches!(caller.join().unwrap(), Err(Error::TransportClosed)));
    }

    #[test]
    fn test_request_timeout_closes_link() {
        let (mux, peer) = link(MultiplexerConfig {
            request_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        match mux.send_request(&[0x0A, 0x05, 0x00]) {
            Err(Error::RequestTimeout { opcode, .. }) => assert_eq!(opcode, 0x0A),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(mux.is_closed());
        assert_eq!(peer.from_central.recv_timeout(WAIT).unwrap(), vec![0x0A, 0x05, 0x00]);

        // The late answer for 0x0005 followed by one for 0x0006 must never
        // complete a later read of 0x0006.
        let mux = Arc::new(mux);
        let caller = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.send_request(&[0x0A, 0x06, 0x00]))
        };
        peer.to_central.send(vec![0x0B, 0x55]).unwrap();
        peer.to_central.send(vec![0x0B, 0x66]).unwrap();

        assert!(matches!(caller.join().unwrap(), Err(Error::TransportClosed)));
        assert!(peer
            .from_central
            .recv_timeout(Duration::from_millis(100))
            .is_err());
    }

    #[test]
    fn test_truncated_error_response_is_a_mismatch() {
        let (mux, peer) = link(MultiplexerConfig::default());

        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            peer.to_central.send(vec![0x01, 0x0A]).unwrap();
            peer.to_central.send(vec![0x0B, 0x07]).unwrap();
            peer
        });
        assert_eq!(mux.send_request(&[0x0A, 0x01, 0x00]).unwrap(), vec![0x0B, 0x07]);
        let _peer = server.join().unwrap();

        let (mux, peer) = link(MultiplexerConfig {
            mismatch_policy: MismatchPolicy::FailFast,
            ..Default::default()
        });
        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            peer.to_central.send(vec![0x01, 0x0A]).unwrap();
            peer
        });
        assert!(matches!(
            mux.send_request(&[0x0A, 0x01, 0x00]),
            Err(Error::ProtocolMismatch {
                request: 0x0A,
                response: 0x01
            })
        ));
        let _peer = server.join().unwrap();
    }

    #[test]
    fn test_rejects_non_request() {
        let (mux, _peer) = link(MultiplexerConfig::default());
        assert!(matches!(mux.send_request(&[]), Err(Error::InvalidPdu(_))));
        assert!(matches!(mux.send_request(&[0x52, 0x01, 0x00]), Err(Error::InvalidPdu(_))));
    }

    #[test]
    fn test_notifications_and_indications_are_routed() {
        let (mux, peer) = link(MultiplexerConfig::default());
        let (tx, rx) = mpsc::channel();

        mux.registry()
            .subscribe(0x0025, move |handle, value| {
                tx.send((handle, value.to_vec())).unwrap();
            })
            .unwrap();

        peer.to_central.send(vec![0x1B, 0x25, 0x00, 0x01]).unwrap();
        peer.to_central.send(vec![0x1D, 0x25, 0x00, 0x02]).unwrap();
        // Nobody listens on 0x0026; still confirmed.
        peer.to_central.send(vec![0x1D, 0x26, 0x00, 0x03]).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0x0025, vec![0x01]));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0x0025, vec![0x02]));
        assert_eq!(peer.from_central.recv_timeout(WAIT).unwrap(), vec![0x1E]);
        assert_eq!(peer.from_central.recv_timeout(WAIT).unwrap(), vec![0x1E]);
    }

    #[test]
    fn test_notification_during_request() {
        let (mux, peer) = link(MultiplexerConfig::default());
        let (tx, rx) = mpsc::channel();
        mux.registry()
            .subscribe(0x0030, move |_, value| tx.send(value.to_vec()).unwrap())
            .unwrap();

        let server = thread::spawn(move || {
            peer.from_central.recv_timeout(WAIT).unwrap();
            peer.to_central.send(vec![0x1B, 0x30, 0x00, 0xAA]).unwrap();
            peer.to_central.send(vec![0x13]).unwrap();
            peer
        });

        assert_eq!(mux.send_request(&[0x12, 0x30, 0x00, 0x01]).unwrap(), vec![0x13]);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![0xAA]);
        let _peer = server.join().unwrap();
    }
}

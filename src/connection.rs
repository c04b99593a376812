//! Physical TCP connection: handshake, read loop, orderly close
//!
//! ```text
//! client                     server
//!   HELLO(role)      ---->
//!                    <----   HELLO_OK | REFUSED(reason)
//!   SESSION_KEY      ---->   (only with a session key builder)
//!   ... channel frames, sealed when a session key was sent ...
//!   CLOSE            ---->
//! ```

use crate::error::{Error, Result};
use crate::mux::{FrameSink, Multiplexer};
use crate::protocol::{frame, role, MAX_FRAME_SIZE};
use crate::protocol_core::{
    read_frame, read_frame_with_limit, validate_frame_size, write_frame, write_frame_with_limit,
};
use crate::session::{
    FrameOpener, FrameSealer, SessionKey, SessionKeyArrangement, SessionKeyBuilder,
    CLIENT_TO_SERVER, MAX_SEALED_FRAME_SIZE, SERVER_TO_CLIENT,
};
use parking_lot::{Condvar, Mutex};
use std::io::{BufReader, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection-level notifications. Called on the read thread.
pub trait ConnectionListener: Send + Sync {
    /// The connection is closed, whichever side initiated it.
    fn closed(&self, connection_id: u64);

    /// The peer sent something that violates the framing or authentication.
    fn malicious_input(&self, _connection_id: u64, _detail: &str) {}
}

/// Map socket timeouts and interrupts onto the crate's error kinds.
fn classify(e: Error, what: &str) -> Error {
    match e {
        Error::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            Error::timeout(what)
        }
        Error::Io(io) if io.kind() == ErrorKind::Interrupted => Error::interrupted(what),
        other => other,
    }
}

fn remaining(deadline: Instant, what: &str) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(Error::timeout(what));
    }
    Ok(left)
}

/// Everything needed to open one connection.
pub struct ConnectionRequest {
    host: String,
    port: u16,
    session_key_builder: Option<Arc<dyn SessionKeyBuilder>>,
}

impl ConnectionRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            session_key_builder: None,
        }
    }

    /// Consult `builder` for a session key during the handshake.
    pub fn with_session_key_builder(mut self, builder: Arc<dyn SessionKeyBuilder>) -> Self {
        self.session_key_builder = Some(builder);
        self
    }

    /// Connect and complete the handshake within `timeout`.
    ///
    /// The returned connection is idle: attach a multiplexer and call
    /// [`Connection::start`] to begin reading.
    pub fn request(self, timeout: Duration) -> Result<Connection> {
        let deadline = Instant::now() + timeout;
        let target = format!("{}:{}", self.host, self.port);

        let addrs: Vec<SocketAddr> = target
            .to_socket_addrs()
            .map_err(|e| classify(Error::Io(e), "resolving server address"))?
            .collect();
        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            let left = remaining(deadline, "connecting")?;
            match TcpStream::connect_timeout(&addr, left) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(%addr, "connect failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        let mut stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(classify(Error::Io(e), "connecting")),
            (None, None) => {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("{} did not resolve to any address", target),
                )))
            }
        };
        let address = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable Nagle: {}", e);
        }

        let left = remaining(deadline, "handshake")?;
        stream.set_read_timeout(Some(left))?;
        stream.set_write_timeout(Some(left))?;

        write_frame(&mut stream, frame::HELLO, &[role::CLIENT])
            .map_err(|e| classify(e, "handshake"))?;
        let (frame_type, payload) =
            read_frame(&mut stream).map_err(|e| classify(e, "handshake"))?;
        match frame_type {
            frame::HELLO_OK => {}
            frame::REFUSED => {
                return Err(Error::ConnectionRefused {
                    host: target,
                    reason: String::from_utf8_lossy(&payload).into_owned(),
                })
            }
            other => {
                return Err(Error::protocol(format!(
                    "expected HELLO_OK from {}, got frame type {}",
                    target, other
                )))
            }
        }

        let session_key = match &self.session_key_builder {
            Some(builder) => {
                let mut arrangement = SessionKeyArrangement::new(&mut stream);
                builder
                    .build_session_key(&mut arrangement)
                    .map_err(|e| classify(e, "session key exchange"))?
            }
            None => None,
        };

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;

        let connection = Connection::new(stream, address, session_key)?;
        info!(
            connection = connection.id(),
            %address,
            encrypted = connection.is_encrypted(),
            "connected"
        );
        Ok(connection)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Idle,
    Running,
    Closed,
}

struct FrameWriter {
    stream: TcpStream,
    sealer: Option<FrameSealer>,
}

impl FrameWriter {
    fn send(&mut self, frame_type: u8, payload: &[u8]) -> Result<()> {
        match self.sealer.as_mut() {
            Some(sealer) => {
                // The limit applies to the plaintext
                validate_frame_size(payload.len())?;
                let sealed = sealer.seal(frame_type, payload)?;
                write_frame_with_limit(&mut self.stream, frame_type, &sealed, MAX_SEALED_FRAME_SIZE)
            }
            None => write_frame(&mut self.stream, frame_type, payload),
        }
    }
}

struct ReadHalf {
    stream: BufReader<TcpStream>,
    opener: Option<FrameOpener>,
}

struct Shared {
    id: u64,
    address: SocketAddr,
    encrypted: bool,
    socket: TcpStream,
    writer: Mutex<FrameWriter>,
    reader: Mutex<Option<ReadHalf>>,
    listeners: Mutex<Vec<Weak<dyn ConnectionListener>>>,
    mux: Mutex<Option<Arc<Multiplexer>>>,
    status: Mutex<Status>,
    status_changed: Condvar,
}

impl Shared {
    fn status(&self) -> Status {
        *self.status.lock()
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    fn report_malicious(&self, detail: &str) {
        warn!(connection = self.id, "malicious input: {}", detail);
        for listener in self.listeners() {
            listener.malicious_input(self.id, detail);
        }
    }

    /// Runs exactly once, when the connection reaches `Closed`.
    fn finish(&self) {
        {
            let mut status = self.status.lock();
            if *status == Status::Closed {
                return;
            }
            *status = Status::Closed;
            self.status_changed.notify_all();
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        let mux = self.mux.lock().clone();
        if let Some(mux) = mux {
            mux.connection_lost();
        }
        info!(connection = self.id, address = %self.address, "connection closed");
        for listener in self.listeners() {
            listener.closed(self.id);
        }
    }

    fn read_loop(&self, mut half: ReadHalf) {
        let limit = match half.opener {
            Some(_) => MAX_SEALED_FRAME_SIZE,
            None => MAX_FRAME_SIZE,
        };
        loop {
            let (frame_type, payload) = match read_frame_with_limit(&mut half.stream, limit) {
                Ok(f) => f,
                Err(Error::MaliciousInput(detail)) => {
                    self.report_malicious(&detail);
                    break;
                }
                Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!(connection = self.id, "server closed the stream");
                    break;
                }
                Err(e) => {
                    if self.status() != Status::Closed {
                        debug!(connection = self.id, "read failed: {}", e);
                    }
                    break;
                }
            };
            let payload = match half.opener.as_mut() {
                Some(opener) => match opener.open(frame_type, payload) {
                    Ok(p) => p,
                    Err(e) => {
                        self.report_malicious(&e.to_string());
                        break;
                    }
                },
                None => payload,
            };

            match frame_type {
                frame::CLOSE => {
                    debug!(connection = self.id, "server sent CLOSE");
                    break;
                }
                t if frame::is_channel_frame(t) => {
                    let mux = self.mux.lock().clone();
                    match mux {
                        Some(mux) => {
                            if let Err(e) = mux.handle_frame(t, &payload) {
                                warn!(connection = self.id, "bad channel frame: {}", e);
                            }
                        }
                        None => debug!(connection = self.id, "channel frame without multiplexer"),
                    }
                }
                other => self.report_malicious(&format!("unexpected frame type {}", other)),
            }
        }
        self.finish();
    }
}

impl FrameSink for Shared {
    fn send_frame(&self, frame_type: u8, payload: &[u8]) -> Result<()> {
        if self.status() == Status::Closed {
            return Err(Error::NotConnected);
        }
        self.writer.lock().send(frame_type, payload)
    }
}

/// An established connection. Dropping it tears the socket down.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    fn new(stream: TcpStream, address: SocketAddr, key: Option<SessionKey>) -> Result<Self> {
        let (sealer, opener) = match &key {
            Some(key) => (
                Some(key.sealer(CLIENT_TO_SERVER)?),
                Some(key.opener(SERVER_TO_CLIENT)?),
            ),
            None => (None, None),
        };
        let writer = FrameWriter {
            stream: stream.try_clone()?,
            sealer,
        };
        let reader = ReadHalf {
            stream: BufReader::new(stream.try_clone()?),
            opener,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                address,
                encrypted: key.is_some(),
                socket: stream,
                writer: Mutex::new(writer),
                reader: Mutex::new(Some(reader)),
                listeners: Mutex::new(Vec::new()),
                mux: Mutex::new(None),
                status: Mutex::new(Status::Idle),
                status_changed: Condvar::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    pub fn is_encrypted(&self) -> bool {
        self.shared.encrypted
    }

    pub fn add_listener(&self, listener: Weak<dyn ConnectionListener>) {
        self.shared.listeners.lock().push(listener);
    }

    /// The connection's multiplexer, created on first use.
    pub fn attach_multiplexer(&self) -> Arc<Multiplexer> {
        let mut slot = self.shared.mux.lock();
        if let Some(mux) = slot.as_ref() {
            return mux.clone();
        }
        let sink: Weak<dyn FrameSink> = Arc::downgrade(&self.shared) as Weak<Shared>;
        let mux = Multiplexer::new(sink);
        *slot = Some(mux.clone());
        mux
    }

    /// Spawn the read loop. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let Some(half) = self.shared.reader.lock().take() else {
            return Ok(());
        };
        {
            let mut status = self.shared.status.lock();
            if *status != Status::Idle {
                return Ok(());
            }
            *status = Status::Running;
        }
        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("connection-{}", self.shared.id))
            .spawn(move || shared.read_loop(half))?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.status() == Status::Running
    }

    pub fn is_closed(&self) -> bool {
        self.shared.status() == Status::Closed
    }

    /// Send CLOSE and wait up to `timeout` for the server to hang up.
    ///
    /// On timeout the socket is torn down anyway and `Timeout` is returned.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        match self.shared.status() {
            Status::Closed => return Ok(()),
            Status::Idle => {
                self.shared.finish();
                return Ok(());
            }
            Status::Running => {}
        }

        debug!(connection = self.id(), "closing connection");
        if let Err(e) = self.shared.send_frame(frame::CLOSE, &[]) {
            debug!(connection = self.id(), "CLOSE not sent: {}", e);
        }
        let _ = self.shared.socket.shutdown(Shutdown::Write);

        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while *status != Status::Closed {
            if self
                .shared
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                drop(status);
                warn!(connection = self.id(), "server did not close in time");
                let _ = self.shared.socket.shutdown(Shutdown::Both);
                return Err(Error::timeout("closing connection"));
            }
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.shared.status() != Status::Closed {
            let _ = self.shared.socket.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Events {
        closed: AtomicUsize,
        malicious: Mutex<Vec<String>>,
    }

    impl ConnectionListener for Events {
        fn closed(&self, _id: u64) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn malicious_input(&self, _id: u64, detail: &str) {
            self.malicious.lock().push(detail.to_string());
        }
    }

    /// Accept one client, answer its HELLO with `reply`, then run `then`.
    fn serve_once(
        reply: (u8, Vec<u8>),
        then: impl FnOnce(&mut TcpStream) + Send + 'static,
    ) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let (t, payload) = read_frame(&mut s).unwrap();
            assert_eq!(t, frame::HELLO);
            assert_eq!(payload, vec![role::CLIENT]);
            write_frame(&mut s, reply.0, &reply.1).unwrap();
            then(&mut s);
        });
        (port, handle)
    }

    fn wait_closed(conn: &Connection) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !conn.is_closed() {
            assert!(Instant::now() < deadline, "connection never closed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn refused_handshake_carries_reason() {
        let (port, server) = serve_once((frame::REFUSED, b"server full".to_vec()), |_| {});
        let err = ConnectionRequest::new("127.0.0.1", port)
            .request(Duration::from_secs(5))
            .map(|c| c.id())
            .unwrap_err();
        match err {
            Error::ConnectionRefused { reason, .. } => assert_eq!(reason, "server full"),
            other => panic!("unexpected {other}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn silent_server_times_out_the_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = ConnectionRequest::new("127.0.0.1", port)
            .request(Duration::from_millis(200))
            .map(|c| c.id())
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
        drop(listener);
    }

    #[test]
    fn close_frame_from_server_notifies_listeners_once() {
        let (port, server) = serve_once((frame::HELLO_OK, Vec::new()), |s| {
            write_frame(s, frame::CLOSE, &[]).unwrap();
        });
        let conn = ConnectionRequest::new("127.0.0.1", port)
            .request(Duration::from_secs(5))
            .unwrap();
        let events = Arc::new(Events::default());
        let weak: Weak<dyn ConnectionListener> = Arc::downgrade(&events) as Weak<Events>;
        conn.add_listener(weak);
        conn.attach_multiplexer();
        conn.start().unwrap();

        wait_closed(&conn);
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
        assert!(conn.close(Duration::from_secs(1)).is_ok());
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
        server.join().unwrap();
    }

    #[test]
    fn unknown_frame_type_is_reported_as_malicious() {
        let (port, server) = serve_once((frame::HELLO_OK, Vec::new()), |s| {
            write_frame(s, 99, b"?").unwrap();
            write_frame(s, frame::CLOSE, &[]).unwrap();
        });
        let conn = ConnectionRequest::new("127.0.0.1", port)
            .request(Duration::from_secs(5))
            .unwrap();
        let events = Arc::new(Events::default());
        let weak: Weak<dyn ConnectionListener> = Arc::downgrade(&events) as Weak<Events>;
        conn.add_listener(weak);
        conn.start().unwrap();

        wait_closed(&conn);
        assert_eq!(events.malicious.lock().len(), 1);
        server.join().unwrap();
    }

    #[test]
    fn close_sends_close_and_waits_for_hangup() {
        let (port, server) = serve_once((frame::HELLO_OK, Vec::new()), |s| {
            let (t, _) = read_frame(s).unwrap();
            assert_eq!(t, frame::CLOSE);
            s.shutdown(Shutdown::Both).unwrap();
        });
        let conn = ConnectionRequest::new("127.0.0.1", port)
            .request(Duration::from_secs(5))
            .unwrap();
        conn.start().unwrap();
        assert!(conn.is_running());
        conn.close(Duration::from_secs(5)).unwrap();
        assert!(conn.is_closed());
        server.join().unwrap();
    }

    #[test]
    fn close_times_out_when_server_lingers() {
        let (port, server) = serve_once((frame::HELLO_OK, Vec::new()), |s| {
            // Read the CLOSE but keep the socket open past the client's timeout
            let _ = read_frame(s);
            thread::sleep(Duration::from_millis(500));
        });
        let conn = ConnectionRequest::new("127.0.0.1", port)
            .request(Duration::from_secs(5))
            .unwrap();
        conn.start().unwrap();
        let err = conn.close(Duration::from_millis(100)).unwrap_err();
        assert!(err.is_timeout());
        wait_closed(&conn);
        server.join().unwrap();
    }

    #[test]
    fn sealed_frames_may_carry_a_full_plaintext_frame() {
        let key = [9u8; crate::session::KEY_LEN];
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let key = SessionKey::from_bytes(key);
            let mut opener = key.opener(CLIENT_TO_SERVER).unwrap();
            let (t, sealed) = read_frame_with_limit(&mut s, MAX_SEALED_FRAME_SIZE).unwrap();
            assert_eq!(sealed.len(), MAX_SEALED_FRAME_SIZE);
            // First nonce: the rejected oversized frame did not consume one
            let plain = opener.open(t, sealed).unwrap();
            assert_eq!(plain.len(), MAX_FRAME_SIZE);

            let mut sealer = key.sealer(SERVER_TO_CLIENT).unwrap();
            let sealed = sealer.seal(frame::CLOSE, &vec![0u8; MAX_FRAME_SIZE]).unwrap();
            write_frame_with_limit(&mut s, frame::CLOSE, &sealed, MAX_SEALED_FRAME_SIZE).unwrap();
        });

        let stream = TcpStream::connect(address).unwrap();
        let conn = Connection::new(stream, address, Some(SessionKey::from_bytes(key))).unwrap();
        let events = Arc::new(Events::default());
        let weak: Weak<dyn ConnectionListener> = Arc::downgrade(&events) as Weak<Events>;
        conn.add_listener(weak);

        assert!(conn
            .shared
            .send_frame(frame::CHANNEL_DATA, &vec![0u8; MAX_FRAME_SIZE + 1])
            .is_err());
        conn.shared
            .send_frame(frame::CHANNEL_DATA, &vec![1u8; MAX_FRAME_SIZE])
            .unwrap();
        conn.start().unwrap();

        wait_closed(&conn);
        server.join().unwrap();
        assert!(events.malicious.lock().is_empty());
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
    }
}

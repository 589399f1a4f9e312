//! The raw, single-TCP-stream connection state machine:
//! `Pending → Connecting → Connected → {Disconnecting → Disconnected}`.
//!
//! This is the foundation [`crate::message_connection::MessageConnection`]
//! builds continuous framed reading on top of, mirroring the role
//! cratetorrent's `PeerSession` gives its inner `TcpStream` before wrapping
//! it in a `Framed` codec.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time;

use crate::cancel::CancellationToken;
use crate::conf::{ConnectionOptions, Endpoint};
use crate::flags::bitset;
use crate::wire;
use crate::ConnectionId;

bitset! {
    /// What a connection is for and how it was established, combined into
    /// one bitset (e.g. `Outbound | Indirect | Peer`).
    pub struct ConnectionTypeFlags: u16 {
        INBOUND = 1 << 0;
        OUTBOUND = 1 << 1;
        DIRECT = 1 << 2;
        INDIRECT = 1 << 3;
        PEER = 1 << 4;
        TRANSFER = 1 << 5;
        DISTRIBUTED = 1 << 6;
        SERVER = 1 << 7;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    Inactivity,
    Superseded,
    Error,
    Cancelled,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub enum Error {
    Timeout,
    Cancelled,
    Refused,
    NotConnected,
    Io(std::io::Error),
    WriteFailed(std::io::Error),
    Wire(wire::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "connection timed out"),
            Error::Cancelled => write!(f, "connection attempt was cancelled"),
            Error::Refused => write!(f, "connection refused"),
            Error::NotConnected => write!(f, "connection is not in the Connected state"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::WriteFailed(e) => write!(f, "write failed: {}", e),
            Error::Wire(e) => write!(f, "wire protocol error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => Error::Refused,
            ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl From<wire::Error> for Error {
    fn from(e: wire::Error) -> Self {
        Error::Wire(e)
    }
}

/// Events a [`Connection`] (or, once continuous reading starts, its
/// [`crate::message_connection::MessageConnection`] wrapper) reports to an
/// interested subscriber.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Connected,
    Disconnected {
        reason: DisconnectReason,
        cause: Option<String>,
    },
}

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// A freshly accepted socket handed off by the [`crate::listener::Listener`]
/// to whichever solicitation (`PierceFirewall`) or inbound request
/// (`PeerInit`) was waiting for it.
pub struct IncomingConnection {
    pub socket: TcpStream,
    pub peer_addr: Endpoint,
}

pub struct Connection {
    id: ConnectionId,
    endpoint: Endpoint,
    options: ConnectionOptions,
    type_flags: ConnectionTypeFlags,
    state: Mutex<State>,
    socket: Mutex<Option<TcpStream>>,
    last_activity: Mutex<Instant>,
    events: Option<EventSender>,
}

impl Connection {
    /// A not-yet-dialed outbound connection.
    pub fn new(
        id: ConnectionId,
        endpoint: Endpoint,
        options: ConnectionOptions,
        type_flags: ConnectionTypeFlags,
    ) -> Self {
        Self {
            id,
            endpoint,
            options,
            type_flags,
            state: Mutex::new(State::Pending),
            socket: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            events: None,
        }
    }

    /// Wraps a socket the [`crate::listener::Listener`] already accepted
    /// and initialized; starts out `Connected`.
    pub fn from_accepted(
        id: ConnectionId,
        endpoint: Endpoint,
        options: ConnectionOptions,
        type_flags: ConnectionTypeFlags,
        socket: TcpStream,
    ) -> Self {
        Self {
            id,
            endpoint,
            options,
            type_flags,
            state: Mutex::new(State::Connected),
            socket: Mutex::new(Some(socket)),
            last_activity: Mutex::new(Instant::now()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn type_flags(&self) -> ConnectionTypeFlags {
        self.type_flags
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    pub async fn last_activity(&self) -> Instant {
        *self.last_activity.lock().await
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.options.inactivity_timeout
    }

    async fn set_state(&self, s: State) {
        *self.state.lock().await = s;
    }

    pub(crate) async fn touch_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Re-marks the connection `Connected` after a [`Self::handoff_tcp_client`]
    /// call set it to `Disconnected`. Used by
    /// [`crate::message_connection::MessageConnection`], which takes over
    /// bookkeeping for the handed-off socket and needs this `Connection`'s
    /// state (read by the inactivity watchdog and by pool staleness checks)
    /// to reflect that the connection is still live. Only ever called right
    /// after construction, so the lock is uncontended.
    pub(crate) fn force_connected(&self) {
        if let Ok(mut state) = self.state.try_lock() {
            *state = State::Connected;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Dials [`Self::endpoint`], racing against `connect_timeout` and
    /// `cancel`. Idempotent when already `Connected`.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<(), Error> {
        if self.state().await == State::Connected {
            return Ok(());
        }
        self.set_state(State::Connecting).await;

        let endpoint = self.endpoint;
        let dial = async move {
            futures::select! {
                res = TcpStream::connect(endpoint).fuse() => res.map_err(Error::from),
                _ = cancel.cancelled().fuse() => Err(Error::Cancelled),
            }
        };
        let outcome = match time::timeout(self.options.connect_timeout, dial).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match outcome {
            Ok(socket) => {
                *self.socket.lock().await = Some(socket);
                self.touch_activity().await;
                self.set_state(State::Connected).await;
                self.emit(ConnectionEvent::Connected);
                Ok(())
            }
            Err(err) => {
                self.set_state(State::Disconnected).await;
                Err(err)
            }
        }
    }

    /// Reads exactly `n` bytes, resetting the inactivity timer on success.
    pub async fn read(&self, n: usize, cancel: CancellationToken) -> Result<Bytes, Error> {
        if self.state().await != State::Connected {
            return Err(Error::NotConnected);
        }
        let mut buf = vec![0u8; n];
        {
            let mut guard = self.socket.lock().await;
            let socket = guard.as_mut().ok_or(Error::NotConnected)?;
            futures::select! {
                res = socket.read_exact(&mut buf).fuse() => { res?; }
                _ = cancel.cancelled().fuse() => return Err(Error::Cancelled),
            }
        }
        self.touch_activity().await;
        Ok(Bytes::from(buf))
    }

    /// Writes `bytes` in full. Writes on a single connection are
    /// serialized by the socket lock, preserving FIFO order.
    pub async fn write(&self, bytes: Bytes, cancel: CancellationToken) -> Result<(), Error> {
        if self.state().await != State::Connected {
            return Err(Error::NotConnected);
        }
        let mut guard = self.socket.lock().await;
        let socket = guard.as_mut().ok_or(Error::NotConnected)?;
        futures::select! {
            res = socket.write_all(&bytes).fuse() => res.map_err(Error::WriteFailed)?,
            _ = cancel.cancelled().fuse() => return Err(Error::Cancelled),
        }
        Ok(())
    }

    /// Idempotent: closes the socket (if any) and emits `Disconnected`
    /// exactly once.
    pub async fn disconnect(&self, reason: DisconnectReason, cause: Option<String>) {
        {
            let mut state = self.state.lock().await;
            if *state == State::Disconnected {
                return;
            }
            *state = State::Disconnecting;
        }
        self.socket.lock().await.take();
        *self.state.lock().await = State::Disconnected;
        self.emit(ConnectionEvent::Disconnected { reason, cause });
    }

    /// Transfers ownership of the underlying socket out of this
    /// connection, e.g. to build a [`crate::message_connection::MessageConnection`]
    /// after the [`crate::listener::Listener`] used this `Connection` only
    /// to read the initialization header.
    pub async fn handoff_tcp_client(&self) -> Result<TcpStream, Error> {
        let socket = self.socket.lock().await.take().ok_or(Error::NotConnected)?;
        *self.state.lock().await = State::Disconnected;
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_read_write_round_trip() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let conn = Connection::new(
            0,
            addr,
            ConnectionOptions::default(),
            ConnectionTypeFlags::OUTBOUND | ConnectionTypeFlags::PEER,
        );
        conn.connect(CancellationToken::never()).await.unwrap();
        assert_eq!(conn.state().await, State::Connected);

        conn.write(Bytes::from_static(b"hello"), CancellationToken::never())
            .await
            .unwrap();
        let echoed = conn.read(5, CancellationToken::never()).await.unwrap();
        assert_eq!(&echoed[..], b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_with_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::new(
            1,
            addr,
            ConnectionOptions::default(),
            ConnectionTypeFlags::OUTBOUND,
        );
        let err = conn.connect(CancellationToken::never()).await.unwrap_err();
        assert!(matches!(err, Error::Refused));
        assert_eq!(conn.state().await, State::Disconnected);
    }

    #[tokio::test]
    async fn connect_is_idempotent_when_already_connected() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = listener.accept().await.unwrap();
        });

        let conn = Connection::new(
            2,
            addr,
            ConnectionOptions::default(),
            ConnectionTypeFlags::OUTBOUND,
        );
        conn.connect(CancellationToken::never()).await.unwrap();
        conn.connect(CancellationToken::never()).await.unwrap();
        assert_eq!(conn.state().await, State::Connected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_and_write_fail_before_connecting() {
        let conn = Connection::new(
            3,
            "127.0.0.1:1".parse().unwrap(),
            ConnectionOptions::default(),
            ConnectionTypeFlags::OUTBOUND,
        );
        assert!(matches!(
            conn.read(1, CancellationToken::never()).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            conn.write(Bytes::new(), CancellationToken::never()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_emits_once() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = listener.accept().await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            4,
            addr,
            ConnectionOptions::default(),
            ConnectionTypeFlags::OUTBOUND,
        )
        .with_events(tx);
        conn.connect(CancellationToken::never()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected)));

        conn.disconnect(DisconnectReason::Requested, None).await;
        conn.disconnect(DisconnectReason::Requested, None).await;
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent::Disconnected {
                reason: DisconnectReason::Requested,
                ..
            })
        ));
        assert!(rx.recv().now_or_never().flatten().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handoff_transfers_the_socket_and_marks_disconnected() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = listener.accept().await.unwrap();
        });

        let conn = Connection::new(
            5,
            addr,
            ConnectionOptions::default(),
            ConnectionTypeFlags::OUTBOUND,
        );
        conn.connect(CancellationToken::never()).await.unwrap();
        let _socket = conn.handoff_tcp_client().await.unwrap();
        assert_eq!(conn.state().await, State::Disconnected);
        assert!(matches!(
            conn.handoff_tcp_client().await,
            Err(Error::NotConnected)
        ));
        server.await.unwrap();
    }
}

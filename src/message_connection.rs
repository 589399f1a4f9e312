//! [`Connection`] plus a continuous framed-message read loop and an
//! ordered outbound write queue.
//!
//! The read side deliberately bypasses `tokio_util::codec::Framed` in
//! favor of direct reads off the split `ReadHalf`, so `MessageDataRead`
//! progress events can be emitted as a message's body streams in, which
//! `Framed`'s all-or-nothing `decode()` doesn't expose. The write side
//! keeps `Framed`'s codec (as `FramedWrite`), the same division of labor
//! cratetorrent's `PeerSession::run` draws when it calls
//! `socket.split()` and drives the stream and sink halves from two
//! different places.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{FutureExt, SinkExt};
use tokio::io::{split, AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;
use tokio_util::codec::FramedWrite;

use crate::cancel::{CancellationSource, CancellationToken};
use crate::connection::{Connection, ConnectionTypeFlags, DisconnectReason, Error, State};
use crate::wire::{self, codec::FrameCodec};
use crate::Username;

#[derive(Clone, Debug)]
pub enum MessageEvent {
    Connected,
    Disconnected {
        reason: DisconnectReason,
        cause: Option<String>,
    },
    /// Fires once per message, as soon as the length prefix and code are
    /// known (before the body is fully buffered).
    MessageReceived { code: u32, total_length: usize },
    /// Fires as a message's body streams in.
    MessageDataRead {
        code: u32,
        current: usize,
        total: usize,
    },
    /// Fires once the body is fully buffered; `bytes` is the whole message
    /// including its code, length prefix stripped.
    MessageRead { bytes: Bytes },
}

pub type MessageEventSender = mpsc::UnboundedSender<MessageEvent>;

type PendingWrite = (Bytes, oneshot::Sender<Result<(), Error>>);

/// A [`Connection`] that has started exchanging framed protocol messages.
pub struct MessageConnection {
    connection: Arc<Connection>,
    username: Option<Username>,
    code_width: usize,
    is_reading_continuously: AtomicBool,
    read_half: Mutex<Option<ReadHalf<TcpStream>>>,
    write_tx: mpsc::UnboundedSender<PendingWrite>,
    read_cancel: CancellationSource,
    events: Option<MessageEventSender>,
}

impl MessageConnection {
    /// Takes ownership of `socket` (typically obtained via
    /// [`Connection::handoff_tcp_client`]) and starts its outbound writer
    /// task immediately; reading only begins once
    /// [`start_reading_continuously`](Self::start_reading_continuously) is
    /// called.
    pub fn new(
        connection: Arc<Connection>,
        username: Option<Username>,
        socket: TcpStream,
        events: Option<MessageEventSender>,
    ) -> Arc<Self> {
        let code_width = if connection
            .type_flags()
            .contains(ConnectionTypeFlags::DISTRIBUTED)
        {
            1
        } else {
            4
        };
        connection.force_connected();

        let (read_half, write_half) = split(socket);
        let writer = FramedWrite::new(write_half, FrameCodec::default());
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(writer, write_rx));

        if let Some(timeout) = connection.inactivity_timeout() {
            tokio::spawn(watch_inactivity(connection.clone(), timeout));
        }

        Arc::new(Self {
            connection,
            username,
            code_width,
            is_reading_continuously: AtomicBool::new(false),
            read_half: Mutex::new(Some(read_half)),
            write_tx,
            read_cancel: CancellationSource::new(),
            events,
        })
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_reading_continuously(&self) -> bool {
        self.is_reading_continuously.load(Ordering::SeqCst)
    }

    fn emit(&self, event: MessageEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Idempotent: spawns exactly one reader task for the connection's
    /// lifetime.
    pub fn start_reading_continuously(self: &Arc<Self>) {
        if self.is_reading_continuously.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.read_loop().await });
    }

    /// Enqueues a framed write, guaranteeing ordering with every other
    /// write on this connection (a single writer task drains the queue).
    pub async fn write_message(&self, msg: Bytes, cancel: CancellationToken) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send((msg, tx))
            .map_err(|_| Error::NotConnected)?;
        futures::select! {
            res = rx.fuse() => res.map_err(|_| Error::NotConnected)??,
            _ = cancel.cancelled().fuse() => return Err(Error::Cancelled),
        }
        Ok(())
    }

    pub async fn disconnect(&self, reason: DisconnectReason, cause: Option<String>) {
        self.read_cancel.cancel();
        self.connection.disconnect(reason, cause.clone()).await;
        self.emit(MessageEvent::Disconnected { reason, cause });
    }

    async fn read_loop(self: Arc<Self>) {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(r) => r,
            None => return,
        };
        loop {
            let cancel = self.read_cancel.token();
            let outcome = futures::select! {
                res = self.read_one_message(&mut read_half).fuse() => res,
                _ = cancel.cancelled().fuse() => Err(Error::Cancelled),
            };
            match outcome {
                Ok(Some(bytes)) => self.emit(MessageEvent::MessageRead { bytes }),
                Ok(None) => break,
                Err(Error::Cancelled) => break,
                Err(e) => {
                    let cause = e.to_string();
                    self.disconnect(DisconnectReason::Error, Some(cause)).await;
                    break;
                }
            }
        }
    }

    /// Reads one complete message, or `Ok(None)` on a clean EOF.
    async fn read_one_message(
        &self,
        read_half: &mut ReadHalf<TcpStream>,
    ) -> Result<Option<Bytes>, Error> {
        let mut len_buf = [0u8; wire::LENGTH_PREFIX_LEN];
        match read_half.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::from(e)),
        }
        let len = u32::from_le_bytes(len_buf);
        wire::check_message_len(len)?;
        let len = len as usize;
        if len < self.code_width {
            return Err(Error::Wire(wire::Error::Truncated));
        }

        let mut body = BytesMut::new();
        body.resize(len, 0);
        read_half.read_exact(&mut body[..self.code_width]).await?;
        let mut code_bytes = [0u8; 4];
        code_bytes[..self.code_width].copy_from_slice(&body[..self.code_width]);
        let code = u32::from_le_bytes(code_bytes);
        self.emit(MessageEvent::MessageReceived {
            code,
            total_length: len,
        });

        let chunk = self.connection.options().read_buffer.max(1);
        let mut read_so_far = self.code_width;
        while read_so_far < len {
            let end = (read_so_far + chunk).min(len);
            read_half.read_exact(&mut body[read_so_far..end]).await?;
            read_so_far = end;
            self.emit(MessageEvent::MessageDataRead {
                code,
                current: read_so_far,
                total: len,
            });
        }

        self.connection.touch_activity().await;
        Ok(Some(body.freeze()))
    }
}

async fn run_writer(
    mut writer: FramedWrite<WriteHalf<TcpStream>, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<PendingWrite>,
) {
    while let Some((msg, reply)) = rx.recv().await {
        let result = writer
            .send(msg)
            .await
            .map_err(|e| Error::WriteFailed(std::io::Error::new(std::io::ErrorKind::Other, e)));
        let _ = reply.send(result);
    }
}

async fn watch_inactivity(connection: Arc<Connection>, timeout: std::time::Duration) {
    let mut ticker = time::interval(timeout);
    loop {
        ticker.tick().await;
        if connection.state().await != State::Connected {
            break;
        }
        if connection.last_activity().await.elapsed() >= timeout {
            connection
                .disconnect(DisconnectReason::Inactivity, None)
                .await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::ConnectionOptions;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn connected_pair(type_flags: ConnectionTypeFlags) -> (Arc<Connection>, TcpStream) {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let connection = Arc::new(Connection::from_accepted(
            0,
            addr,
            ConnectionOptions::default(),
            type_flags,
            client,
        ));
        (connection, server)
    }

    #[tokio::test]
    async fn write_message_is_received_whole_by_the_peer() {
        let (connection, mut server) =
            connected_pair(ConnectionTypeFlags::OUTBOUND | ConnectionTypeFlags::PEER).await;
        let socket = connection.handoff_tcp_client().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mc = MessageConnection::new(connection, None, socket, Some(tx));

        let framed = wire::server::set_listen_port(2234);
        mc.write_message(framed.clone(), CancellationToken::never())
            .await
            .unwrap();

        let mut received = vec![0u8; framed.len()];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut received)
            .await
            .unwrap();
        assert_eq!(received, framed.to_vec());
        let _ = rx.try_recv();
    }

    #[tokio::test]
    async fn continuous_reader_emits_message_received_then_message_read() {
        let (connection, mut server) =
            connected_pair(ConnectionTypeFlags::INBOUND | ConnectionTypeFlags::PEER).await;
        let socket = connection.handoff_tcp_client().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mc = MessageConnection::new(connection, None, socket, Some(tx));
        mc.start_reading_continuously();
        // idempotent: a second call must not spawn a second reader.
        mc.start_reading_continuously();

        let framed = wire::server::set_listen_port(2234);
        server.write_all(&framed).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            MessageEvent::MessageReceived {
                code: wire::server::SET_LISTEN_PORT,
                ..
            }
        ));
        let second = rx.recv().await.unwrap();
        match second {
            MessageEvent::MessageRead { bytes } => {
                assert_eq!(bytes.len(), framed.len() - wire::LENGTH_PREFIX_LEN);
            }
            other => panic!("expected MessageRead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnect_stops_the_reader_and_emits_once() {
        let (connection, server) =
            connected_pair(ConnectionTypeFlags::OUTBOUND | ConnectionTypeFlags::PEER).await;
        let socket = connection.handoff_tcp_client().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mc = MessageConnection::new(connection, None, socket, Some(tx));
        mc.start_reading_continuously();

        mc.disconnect(DisconnectReason::Requested, None).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            MessageEvent::Disconnected {
                reason: DisconnectReason::Requested,
                ..
            }
        ));
        drop(server);
    }
}

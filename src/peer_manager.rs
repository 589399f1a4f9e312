//! Pools and brokers peer connections: a `Username`-keyed pool of message
//! connections shared by every caller that wants to talk to that user, plus
//! the direct/indirect dial race used to establish one.
//!
//! The pool's "ask for it, get the same in-flight attempt everyone else
//! gets" behavior is built on `futures::future::Shared`, generalizing the
//! same tool cratetorrent could have reached for to coalesce concurrent
//! piece requests but didn't need to, since here multiple independent
//! callers (search, transfer, browse) routinely want a connection to the
//! same peer at once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::Shared;
use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time;

use crate::cancel::CancellationToken;
use crate::conf::{ConnectionOptions, Endpoint};
use crate::connection::{Connection, ConnectionTypeFlags, DisconnectReason, IncomingConnection, State};
use crate::error::{connection_error, Error};
use crate::message_connection::{MessageConnection, MessageEvent};
use crate::wait_key;
use crate::waiter::{Waiter, WaitKey};
use crate::wire::{
    self,
    init::{InitMessage, PeerInitType},
};
use crate::{ConnectionIdAllocator, Token, TokenAllocator, Username};

type MessageConnectionFuture =
    Shared<Pin<Box<dyn Future<Output = Result<Arc<MessageConnection>, String>> + Send>>>;

/// One event off a pooled connection, tagged with who it's from — the
/// manager-wide subscriber fans in every peer at once, so unlike a single
/// `MessageConnection`'s own event stream it has no other way to tell them
/// apart.
#[derive(Clone, Debug)]
pub struct PeerEvent {
    pub username: Username,
    pub event: MessageEvent,
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

pub struct PeerConnectionManager {
    waiter: Arc<Waiter>,
    server: Arc<MessageConnection>,
    connection_ids: Arc<ConnectionIdAllocator>,
    tokens: Arc<TokenAllocator>,
    options: ConnectionOptions,
    message_timeout: Duration,
    local_username: Username,
    events: Option<PeerEventSender>,
    message_connections: Mutex<HashMap<Username, MessageConnectionFuture>>,
    transfer_connections: Mutex<HashMap<(Username, Token), u32>>,
    pending_solicitations: Arc<Mutex<HashMap<Token, Username>>>,
}

impl PeerConnectionManager {
    pub fn new(
        waiter: Arc<Waiter>,
        server: Arc<MessageConnection>,
        connection_ids: Arc<ConnectionIdAllocator>,
        tokens: Arc<TokenAllocator>,
        options: ConnectionOptions,
        message_timeout: Duration,
        local_username: Username,
        events: Option<PeerEventSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            waiter,
            server,
            connection_ids,
            tokens,
            options,
            message_timeout,
            local_username,
            events,
            message_connections: Mutex::new(HashMap::new()),
            transfer_connections: Mutex::new(HashMap::new()),
            pending_solicitations: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn server(&self) -> &Arc<MessageConnection> {
        &self.server
    }

    pub(crate) fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    pub(crate) fn tokens(&self) -> &Arc<TokenAllocator> {
        &self.tokens
    }

    pub(crate) fn connection_ids(&self) -> &Arc<ConnectionIdAllocator> {
        &self.connection_ids
    }

    pub(crate) fn local_username(&self) -> &Username {
        &self.local_username
    }

    pub(crate) fn message_timeout(&self) -> Duration {
        self.message_timeout
    }

    pub async fn has_message_connection(&self, username: &str) -> bool {
        self.message_connections.lock().await.contains_key(username)
    }

    /// Peeks the pool for an already-established connection to `username`
    /// without dialing one. Used by callers reacting to a message that just
    /// arrived on it (so the target endpoint is already known) rather than
    /// initiating contact.
    pub async fn pooled_message_connection(&self, username: &str) -> Option<Arc<MessageConnection>> {
        let shared = self.message_connections.lock().await.get(username)?.clone();
        match shared.now_or_never() {
            Some(Ok(mc)) => Some(mc),
            _ => None,
        }
    }

    pub(crate) async fn take_pending_solicitation(&self, token: Token) -> Option<Username> {
        self.pending_solicitations.lock().await.remove(&token)
    }

    /// Obtains a live message connection to `username`, reusing a pending
    /// or already-established one when available.
    pub async fn message_connection(
        self: &Arc<Self>,
        username: Username,
        endpoint: Endpoint,
    ) -> Result<Arc<MessageConnection>, Error> {
        loop {
            let shared = {
                let mut map = self.message_connections.lock().await;
                if let Some(existing) = map.get(&username) {
                    existing.clone()
                } else {
                    let this = self.clone();
                    let user = username.clone();
                    let fut: Pin<Box<dyn Future<Output = Result<Arc<MessageConnection>, String>> + Send>> =
                        Box::pin(async move {
                            this.dial_message_connection(user, endpoint)
                                .await
                                .map_err(|e| e.to_string())
                        });
                    let shared = fut.shared();
                    map.insert(username.clone(), shared.clone());
                    shared
                }
            };
            match shared.await {
                Ok(mc) => {
                    if mc.connection().state().await != State::Disconnected {
                        return Ok(mc);
                    }
                    self.message_connections.lock().await.remove(&username);
                    continue;
                }
                Err(message) => {
                    self.message_connections.lock().await.remove(&username);
                    return Err(connection_error(&username, message));
                }
            }
        }
    }

    async fn dial_message_connection(
        self: &Arc<Self>,
        username: Username,
        endpoint: Endpoint,
    ) -> Result<Arc<MessageConnection>, Error> {
        let ctx = DialContext {
            waiter: self.waiter.clone(),
            server: self.server.clone(),
            local_username: self.local_username.clone(),
            message_timeout: self.message_timeout,
            connect_timeout: self.options.connect_timeout,
        };
        let (socket, is_direct) = race_connect(
            ctx,
            self.pending_solicitations.clone(),
            "SolicitedPeerConnection",
            username.clone(),
            endpoint,
            PeerInitType::Peer,
            self.tokens.next(),
            self.tokens.next(),
            None,
        )
        .await?;
        let type_flags = ConnectionTypeFlags::OUTBOUND
            | ConnectionTypeFlags::PEER
            | leg_flag(is_direct);
        let mc = self.spawn_message_connection(Some(username), endpoint, type_flags, socket);
        mc.start_reading_continuously();
        Ok(mc)
    }

    /// An already-accepted `"P"` connection handed off by the listener.
    pub async fn add_message_connection(
        self: &Arc<Self>,
        username: Username,
        socket: TcpStream,
        peer_addr: Endpoint,
    ) {
        let mc = self.spawn_message_connection(
            Some(username.clone()),
            peer_addr,
            ConnectionTypeFlags::INBOUND | ConnectionTypeFlags::PEER,
            socket,
        );
        mc.start_reading_continuously();
        self.install(username, mc).await;
    }

    /// An already-accepted `"F"` connection. Reads the remote's 4-byte
    /// transfer token and completes whatever download is waiting on it.
    pub async fn add_transfer_connection(
        self: &Arc<Self>,
        username: Username,
        _peer_init_token: Token,
        socket: TcpStream,
        peer_addr: Endpoint,
    ) {
        let id = self.connection_ids.next();
        let connection = Connection::from_accepted(
            id,
            peer_addr,
            self.options,
            ConnectionTypeFlags::INBOUND | ConnectionTypeFlags::TRANSFER,
            socket,
        );
        let remote_token = match connection.read(4, CancellationToken::never()).await {
            Ok(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Err(e) => {
                connection
                    .disconnect(DisconnectReason::Error, Some(e.to_string()))
                    .await;
                return;
            }
        };
        let socket = match connection.handoff_tcp_client().await {
            Ok(s) => s,
            Err(_) => return,
        };
        self.record_transfer_connection(username.clone(), remote_token)
            .await;
        self.waiter
            .complete(
                &wait_key!("DirectTransfer", username, remote_token),
                IncomingConnection { socket, peer_addr },
            )
            .await;
    }

    /// The remote solicited us via `ConnectToPeer type="F"`; dial them
    /// directly, pierce the firewall, then learn the transfer token they
    /// chose.
    pub async fn connect_transfer_for_download(
        self: &Arc<Self>,
        username: Username,
        endpoint: Endpoint,
        remote_token: Token,
    ) -> Result<(Arc<Connection>, Token), Error> {
        let id = self.connection_ids.next();
        let connection = Arc::new(Connection::new(
            id,
            endpoint,
            self.options,
            ConnectionTypeFlags::OUTBOUND | ConnectionTypeFlags::DIRECT | ConnectionTypeFlags::TRANSFER,
        ));
        let cancel = CancellationToken::never();
        connection.connect(cancel.clone()).await?;
        let pierce = InitMessage::PierceFirewall { token: remote_token }.encode();
        if let Err(e) = connection.write(pierce, cancel.clone()).await {
            connection
                .disconnect(DisconnectReason::Error, Some(e.to_string()))
                .await;
            return Err(e.into());
        }
        let token_bytes = match connection.read(4, cancel).await {
            Ok(bytes) => bytes,
            Err(e) => {
                connection
                    .disconnect(DisconnectReason::Error, Some(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };
        let token = u32::from_le_bytes([
            token_bytes[0],
            token_bytes[1],
            token_bytes[2],
            token_bytes[3],
        ]);
        self.record_transfer_connection(username, token).await;
        Ok((connection, token))
    }

    /// We solicit the remote for an upload; races direct and indirect like
    /// [`Self::message_connection`], but carries the transfer token through
    /// both legs and writes it raw after the handshake.
    pub async fn connect_transfer_for_upload(
        self: &Arc<Self>,
        username: Username,
        endpoint: Endpoint,
        token: Token,
    ) -> Result<Arc<Connection>, Error> {
        let mut w = wire::Writer::new();
        w.write_u32(token);
        let trailer = w.into_bytes();

        let ctx = DialContext {
            waiter: self.waiter.clone(),
            server: self.server.clone(),
            local_username: self.local_username.clone(),
            message_timeout: self.message_timeout,
            connect_timeout: self.options.connect_timeout,
        };
        let (socket, is_direct) = race_connect(
            ctx,
            self.pending_solicitations.clone(),
            "SolicitedTransferConnection",
            username.clone(),
            endpoint,
            PeerInitType::Transfer,
            token,
            token,
            Some(trailer),
        )
        .await?;
        let id = self.connection_ids.next();
        let type_flags = ConnectionTypeFlags::OUTBOUND | ConnectionTypeFlags::TRANSFER | leg_flag(is_direct);
        let connection = Arc::new(Connection::from_accepted(
            id, endpoint, self.options, type_flags, socket,
        ));
        self.record_transfer_connection(username, token).await;
        Ok(connection)
    }

    async fn record_transfer_connection(&self, username: Username, token: Token) {
        *self
            .transfer_connections
            .lock()
            .await
            .entry((username, token))
            .or_insert(0) += 1;
    }

    fn spawn_message_connection(
        self: &Arc<Self>,
        username: Option<Username>,
        endpoint: Endpoint,
        type_flags: ConnectionTypeFlags,
        socket: TcpStream,
    ) -> Arc<MessageConnection> {
        let id = self.connection_ids.next();
        let connection = Arc::new(Connection::new(id, endpoint, self.options, type_flags));
        let (tx, rx) = mpsc::unbounded_channel();
        let mc = MessageConnection::new(connection, username, socket, Some(tx));
        self.watch_disconnect(mc.clone(), rx);
        mc
    }

    /// Forwards every event of a pooled connection to the manager-wide
    /// subscriber (if any) and, on `Disconnected`, removes the pool entry
    /// if it's still the current one for that username.
    fn watch_disconnect(
        self: &Arc<Self>,
        mc: Arc<MessageConnection>,
        mut rx: mpsc::UnboundedReceiver<MessageEvent>,
    ) {
        let this = self.clone();
        let username = mc.username().cloned();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let (Some(tx), Some(username)) = (&this.events, &username) {
                    let _ = tx.send(PeerEvent {
                        username: username.clone(),
                        event: event.clone(),
                    });
                }
                if let MessageEvent::Disconnected { .. } = event {
                    if let Some(username) = &username {
                        this.remove_if_current(username, &mc).await;
                    }
                    break;
                }
            }
        });
    }

    /// Installs `mc` as the pool entry for `username`, superseding (but not
    /// disposing) whatever was there.
    async fn install(self: &Arc<Self>, username: Username, mc: Arc<MessageConnection>) {
        let fut: Pin<Box<dyn Future<Output = Result<Arc<MessageConnection>, String>> + Send>> =
            Box::pin(futures::future::ready(Ok(mc.clone())));
        let shared = fut.shared();
        let prior = {
            let mut map = self.message_connections.lock().await;
            map.insert(username.clone(), shared)
        };
        if let Some(prior) = prior {
            if let Some(Ok(prior_mc)) = prior.now_or_never() {
                if !Arc::ptr_eq(&prior_mc, &mc) {
                    log::debug!("superseding message connection to {}", username);
                    prior_mc.disconnect(DisconnectReason::Superseded, None).await;
                }
            }
        }
    }

    async fn remove_if_current(&self, username: &Username, mc: &Arc<MessageConnection>) {
        let mut map = self.message_connections.lock().await;
        let is_current = match map.get(username) {
            Some(shared) => matches!(shared.clone().now_or_never(), Some(Ok(current)) if Arc::ptr_eq(&current, mc)),
            None => false,
        };
        if is_current {
            map.remove(username);
        }
    }
}

pub(crate) fn leg_flag(is_direct: bool) -> ConnectionTypeFlags {
    if is_direct {
        ConnectionTypeFlags::DIRECT
    } else {
        ConnectionTypeFlags::INDIRECT
    }
}

/// Owned pieces every dial race needs, shared between
/// [`PeerConnectionManager`] and [`crate::distributed_manager::DistributedConnectionManager`].
/// Cloning an `Arc` here is cheap and lets both race legs run as genuinely
/// independent `tokio::spawn`ed tasks instead of borrowing from whatever
/// called in.
pub(crate) struct DialContext {
    pub waiter: Arc<Waiter>,
    pub server: Arc<MessageConnection>,
    pub local_username: Username,
    pub message_timeout: Duration,
    pub connect_timeout: Duration,
}

/// Races a direct dial against an indirect, server-brokered one, returning
/// whichever socket completes its handshake first. The loser (if it
/// eventually also succeeds) is dropped rather than kept around.
pub(crate) async fn race_connect(
    ctx: DialContext,
    pending_solicitations: Arc<Mutex<HashMap<Token, Username>>>,
    wait_key_prefix: &'static str,
    username: Username,
    endpoint: Endpoint,
    typ: PeerInitType,
    direct_token: Token,
    indirect_token: Token,
    trailer: Option<Bytes>,
) -> Result<(TcpStream, bool), Error> {
    let direct = direct_leg(
        endpoint,
        ctx.connect_timeout,
        ctx.local_username.clone(),
        typ,
        direct_token,
        trailer.clone(),
    );
    let indirect = indirect_leg(
        ctx.waiter.clone(),
        ctx.server.clone(),
        pending_solicitations,
        wait_key_prefix,
        username.clone(),
        indirect_token,
        ctx.message_timeout,
        ctx.local_username.clone(),
        typ,
        trailer,
    );

    let mut direct_task = tokio::spawn(direct);
    let mut indirect_task = tokio::spawn(indirect);

    let (first_is_direct, first) = futures::select! {
        res = (&mut direct_task).fuse() => (true, res),
        res = (&mut indirect_task).fuse() => (false, res),
    };
    let first_result = unwrap_join(first);

    if let Ok(socket) = first_result {
        let loser = if first_is_direct { indirect_task } else { direct_task };
        tokio::spawn(async move {
            if let Ok(Ok(stray)) = loser.await {
                log::debug!("connection established first, attempting to cancel the other leg");
                drop(stray);
            }
        });
        return Ok((socket, first_is_direct));
    }
    let first_err = first_result.unwrap_err();

    let second_result = if first_is_direct {
        unwrap_join(indirect_task.await)
    } else {
        unwrap_join(direct_task.await)
    };
    match second_result {
        Ok(socket) => Ok((socket, !first_is_direct)),
        Err(second_err) => {
            let (direct_err, indirect_err) = if first_is_direct {
                (first_err, second_err)
            } else {
                (second_err, first_err)
            };
            Err(connection_error(
                username,
                format!("direct: {}; indirect: {}", direct_err, indirect_err),
            ))
        }
    }
}

fn unwrap_join(res: Result<Result<TcpStream, Error>, tokio::task::JoinError>) -> Result<TcpStream, Error> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
    }
}

async fn direct_leg(
    endpoint: Endpoint,
    connect_timeout: Duration,
    local_username: Username,
    typ: PeerInitType,
    token: Token,
    trailer: Option<Bytes>,
) -> Result<TcpStream, Error> {
    use tokio::io::AsyncWriteExt;

    let mut socket = time::timeout(connect_timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::from)?;
    let init = InitMessage::PeerInit {
        username: local_username,
        typ,
        token,
    }
    .encode();
    socket.write_all(&init).await.map_err(Error::from)?;
    if let Some(trailer) = trailer {
        socket.write_all(&trailer).await.map_err(Error::from)?;
    }
    Ok(socket)
}

async fn indirect_leg(
    waiter: Arc<Waiter>,
    server: Arc<MessageConnection>,
    pending_solicitations: Arc<Mutex<HashMap<Token, Username>>>,
    wait_key_prefix: &'static str,
    username: Username,
    token: Token,
    message_timeout: Duration,
    local_username: Username,
    typ: PeerInitType,
    trailer: Option<Bytes>,
) -> Result<TcpStream, Error> {
    use tokio::io::AsyncWriteExt;

    pending_solicitations
        .lock()
        .await
        .insert(token, username.clone());
    let connect_msg = wire::server::connect_to_peer(&local_username, typ, token);
    if let Err(e) = server
        .write_message(connect_msg, CancellationToken::never())
        .await
    {
        pending_solicitations.lock().await.remove(&token);
        return Err(e.into());
    }

    let key = WaitKey::new(vec![
        wait_key_prefix.to_string(),
        username.clone(),
        token.to_string(),
    ]);
    let result = waiter
        .wait::<IncomingConnection>(key, Some(message_timeout))
        .await;
    pending_solicitations.lock().await.remove(&token);

    let mut socket = result.map_err(Error::from)?.socket;
    let pierce = InitMessage::PierceFirewall { token }.encode();
    socket.write_all(&pierce).await.map_err(Error::from)?;
    if let Some(trailer) = trailer {
        socket.write_all(&trailer).await.map_err(Error::from)?;
    }
    Ok(socket)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A `MessageConnection` wrapping one end of a loopback pair, suitable
    /// for standing in as the server connection in tests.
    pub(crate) async fn loopback_message_connection() -> (Arc<MessageConnection>, TcpStream) {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let connection = Arc::new(Connection::new(
            0,
            addr,
            ConnectionOptions::default(),
            ConnectionTypeFlags::OUTBOUND | ConnectionTypeFlags::SERVER,
        ));
        let mc = MessageConnection::new(connection, None, client, None);
        (mc, server_side)
    }

    fn manager_with_loopback_server(
        server: Arc<MessageConnection>,
    ) -> Arc<PeerConnectionManager> {
        PeerConnectionManager::new(
            Arc::new(Waiter::new(Duration::from_millis(200))),
            server,
            Arc::new(ConnectionIdAllocator::default()),
            Arc::new(TokenAllocator::default()),
            ConnectionOptions::default(),
            Duration::from_millis(200),
            "local".to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn add_message_connection_is_retrievable() {
        let (server, _server_socket) = loopback_message_connection().await;
        let manager = manager_with_loopback_server(server);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = TcpStream::connect(addr).await.unwrap();
        let (_accepted, peer_addr) = accept.await.unwrap();

        manager
            .clone()
            .add_message_connection("alice".to_string(), client, peer_addr)
            .await;
        assert!(manager.has_message_connection("alice").await);
    }

    #[tokio::test]
    async fn installing_a_connection_supersedes_the_prior_one() {
        let (server, _server_socket) = loopback_message_connection().await;
        let manager = manager_with_loopback_server(server);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client1 = TcpStream::connect(addr).await.unwrap();
        let (_accepted1, peer_addr) = accept.await.unwrap();
        manager
            .clone()
            .add_message_connection("bob".to_string(), client1, peer_addr)
            .await;

        let listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr2 = listener2.local_addr().unwrap();
        let accept2 = tokio::spawn(async move { listener2.accept().await.unwrap() });
        let client2 = TcpStream::connect(addr2).await.unwrap();
        let (_accepted2, peer_addr2) = accept2.await.unwrap();
        manager
            .clone()
            .add_message_connection("bob".to_string(), client2, peer_addr2)
            .await;

        assert!(manager.has_message_connection("bob").await);
    }
}

//! The top-level handle tying every layer together: one server connection,
//! the peer and distributed meshes it feeds, and the search/transfer
//! registries keyed by the tokens this session hands out.
//!
//! Mirrors the shape of cratetorrent's `Client` (spawn the engine, return a
//! handle, drive everything else from background tasks reacting to decoded
//! wire events) generalized from one torrent engine loop to the three event
//! sources this protocol has: the server connection, the peer mesh, and
//! whatever the caller does with the handles this module hands back.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};

use crate::cancel::CancellationToken;
use crate::conf::{Conf, Endpoint, Resolvers};
use crate::connection::{Connection, ConnectionTypeFlags};
use crate::diagnostics::{self, Diagnostic, DiagnosticLevel, DiagnosticSink};
use crate::distributed_manager::DistributedConnectionManager;
use crate::error::Error;
use crate::handlers::{self, PeerMessage};
use crate::listener::Listener;
use crate::message_connection::MessageConnection;
use crate::peer_manager::{PeerConnectionManager, PeerEvent};
use crate::search::{SearchInternal, SearchOptions};
use crate::transfer::{self, Direction, TransferInternal, TransferOptions};
use crate::wire::server::{LoginResult, ServerMessage};
use crate::wire::{self, peer};
use crate::waiter::Waiter;
use crate::{wait_key, ConnectionIdAllocator, Token, TokenAllocator, Username};

/// A logged-in session. Clone the handles it hands out (they're all `Arc`);
/// the session itself tears down when the last clone of the server event
/// loop's `Arc<Client>` is dropped and its connection is closed.
pub struct Client {
    conf: Conf,
    local_username: Username,
    waiter: Arc<Waiter>,
    tokens: Arc<TokenAllocator>,
    server: Arc<MessageConnection>,
    peer_manager: Arc<PeerConnectionManager>,
    distributed_manager: Arc<DistributedConnectionManager>,
    resolvers: Arc<dyn Resolvers>,
    diagnostics: Arc<dyn DiagnosticSink>,
    searches: Mutex<HashMap<Token, Arc<SearchInternal>>>,
    transfers: Mutex<HashMap<Token, Arc<TransferInternal>>>,
}

impl Client {
    /// Dials `server_endpoint`, logs in as `local_username`, and starts the
    /// background event loops that drive every other operation on the
    /// returned handle. Fails only if the TCP connection or the login
    /// handshake itself fails; everything after that point (peer dialing,
    /// search, transfer) degrades per-operation instead of tearing down the
    /// session.
    pub async fn connect(
        server_endpoint: Endpoint,
        local_username: Username,
        password: &str,
        conf: Conf,
        resolvers: Arc<dyn Resolvers>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Result<Arc<Self>, Error> {
        let waiter = Arc::new(Waiter::new(conf.message_timeout));
        let tokens = Arc::new(TokenAllocator::new(conf.starting_token));
        let connection_ids = Arc::new(ConnectionIdAllocator::default());

        let id = connection_ids.next();
        let connection = Arc::new(Connection::new(
            id,
            server_endpoint,
            conf.server_connection_options,
            ConnectionTypeFlags::OUTBOUND | ConnectionTypeFlags::SERVER,
        ));
        connection.connect(CancellationToken::never()).await?;
        let socket = connection.handoff_tcp_client().await?;

        let (server_events_tx, mut server_events_rx) = mpsc::unbounded_channel();
        let server = MessageConnection::new(
            connection,
            Some(local_username.clone()),
            socket,
            Some(server_events_tx),
        );
        server.start_reading_continuously();

        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let peer_manager = PeerConnectionManager::new(
            waiter.clone(),
            server.clone(),
            connection_ids.clone(),
            tokens.clone(),
            conf.peer_connection_options,
            conf.message_timeout,
            local_username.clone(),
            Some(peer_events_tx),
        );
        let distributed_manager = DistributedConnectionManager::new(
            peer_manager.clone(),
            connection_ids.clone(),
            conf.distributed_connection_options,
            conf.concurrent_distributed_children_limit,
            conf.parent_watchdog_period,
        );

        let client = Arc::new(Self {
            conf: conf.clone(),
            local_username: local_username.clone(),
            waiter: waiter.clone(),
            tokens,
            server: server.clone(),
            peer_manager: peer_manager.clone(),
            distributed_manager: distributed_manager.clone(),
            resolvers,
            diagnostics,
            searches: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
        });

        let login_loop_client = client.clone();
        tokio::spawn(async move {
            while let Some(event) = server_events_rx.recv().await {
                login_loop_client.handle_server_event(event).await;
            }
        });
        let peer_loop_client = client.clone();
        tokio::spawn(async move {
            let mut rx = peer_events_rx;
            while let Some(event) = rx.recv().await {
                peer_loop_client.handle_peer_event(event).await;
            }
        });

        server
            .write_message(
                wire::server::login(&local_username, password, CLIENT_VERSION),
                CancellationToken::never(),
            )
            .await?;
        let result: LoginResult = waiter
            .wait(wait_key!("Login"), None)
            .await
            .map_err(Error::from)?;
        if !result.success {
            server
                .disconnect(crate::connection::DisconnectReason::Requested, None)
                .await;
            return Err(Error::LoginRejected(result.message));
        }

        if let Some(port) = conf.listen_port {
            server
                .write_message(
                    wire::server::set_listen_port(port),
                    CancellationToken::never(),
                )
                .await?;
            let listener = Listener::new(
                waiter,
                peer_manager,
                distributed_manager,
                connection_ids,
                conf.incoming_connection_options,
                client.diagnostics.clone(),
                conf.minimum_diagnostic_level,
            );
            tokio::spawn(listener.run(port));
        }

        Ok(client)
    }

    pub fn local_username(&self) -> &Username {
        &self.local_username
    }

    pub fn peer_manager(&self) -> &Arc<PeerConnectionManager> {
        &self.peer_manager
    }

    pub fn distributed_manager(&self) -> &Arc<DistributedConnectionManager> {
        &self.distributed_manager
    }

    fn emit(&self, level: DiagnosticLevel, message: impl Into<String>) {
        diagnostics::emit(
            self.diagnostics.as_ref(),
            self.conf.minimum_diagnostic_level,
            Diagnostic::new(level, message),
        );
    }

    async fn handle_server_event(self: &Arc<Self>, event: crate::message_connection::MessageEvent) {
        use crate::message_connection::MessageEvent;
        match event {
            MessageEvent::MessageRead { bytes } => match handlers::decode_server_message(bytes) {
                Ok(msg) => self.handle_server_message(msg).await,
                Err(e) => self.emit(DiagnosticLevel::Debug, format!("undecodable server message: {}", e)),
            },
            MessageEvent::Disconnected { reason, cause } => {
                self.emit(
                    DiagnosticLevel::Warning,
                    format!("server connection disconnected ({:?}): {:?}", reason, cause),
                );
                self.waiter.cancel_all().await;
            }
            _ => {}
        }
    }

    async fn handle_server_message(self: &Arc<Self>, msg: ServerMessage) {
        match msg {
            ServerMessage::LoginResult(result) => {
                self.waiter.complete(&wait_key!("Login"), result).await;
            }
            ServerMessage::ConnectToPeer {
                username,
                typ,
                endpoint,
                token,
            } => {
                let peer_manager = self.peer_manager.clone();
                let distributed_manager = self.distributed_manager.clone();
                let connect_timeout = self.conf.peer_connection_options.connect_timeout;
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = handlers::respond_to_connect_to_peer(
                        &peer_manager,
                        &distributed_manager,
                        connect_timeout,
                        username,
                        typ,
                        endpoint,
                        token,
                    )
                    .await
                    {
                        this.emit(DiagnosticLevel::Debug, format!("connect-to-peer dial-back failed: {}", e));
                    }
                });
            }
            ServerMessage::PossibleParents(candidates) => {
                let distributed_manager = self.distributed_manager.clone();
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = distributed_manager.connect_to_parents(candidates).await {
                        this.emit(DiagnosticLevel::Debug, format!("no parent candidate succeeded: {}", e));
                    }
                });
            }
            ServerMessage::BranchLevel(level) => {
                self.emit(DiagnosticLevel::Debug, format!("server-assigned branch level {}", level));
            }
            ServerMessage::BranchRoot(root) => {
                self.emit(DiagnosticLevel::Debug, format!("server-assigned branch root {:?}", root));
            }
            ServerMessage::ChildDepth(depth) => {
                self.emit(DiagnosticLevel::Debug, format!("server-assigned child depth {}", depth));
            }
            ServerMessage::Unknown { code, .. } => {
                self.emit(DiagnosticLevel::Debug, format!("unrecognized server message code {}", code));
            }
        }
    }

    async fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        use crate::message_connection::MessageEvent;
        let PeerEvent { username, event } = event;
        if let MessageEvent::MessageRead { bytes } = event {
            match handlers::decode_peer_message(bytes) {
                Ok(msg) => self.handle_peer_message(username, msg).await,
                Err(e) => self.emit(DiagnosticLevel::Debug, format!("undecodable message from {}: {}", username, e)),
            }
        }
    }

    async fn handle_peer_message(self: &Arc<Self>, username: Username, msg: PeerMessage) {
        match msg {
            PeerMessage::SearchResponse(slim) => {
                let search = self.searches.lock().await.get(&slim.token).cloned();
                if let Some(search) = search {
                    search.try_add_response(slim).await;
                }
            }
            PeerMessage::QueueDownload(filename) => {
                let mc = match self.peer_manager.pooled_message_connection(&username).await {
                    Some(mc) => mc,
                    None => return,
                };
                let endpoint = mc.connection().endpoint();
                if let Err(rejection) = self.resolvers.queue_download(&username, endpoint, &filename).await {
                    let _ = mc
                        .write_message(peer::queue_failed(&filename, &rejection.reason), CancellationToken::never())
                        .await;
                } else {
                    self.emit(
                        DiagnosticLevel::Info,
                        format!("queued inbound download of {:?} for {}", filename, username),
                    );
                }
            }
            PeerMessage::SharedFileListRequest => {
                if let Some(mc) = self.peer_manager.pooled_message_connection(&username).await {
                    let endpoint = mc.connection().endpoint();
                    let response = self.resolvers.browse_response(&username, endpoint).await;
                    let _ = mc.write_message(response.encode(), CancellationToken::never()).await;
                }
            }
            PeerMessage::UserInfoRequest => {
                if let Some(mc) = self.peer_manager.pooled_message_connection(&username).await {
                    let endpoint = mc.connection().endpoint();
                    let response = self.resolvers.user_info_response(&username, endpoint).await;
                    let _ = mc.write_message(response.encode(), CancellationToken::never()).await;
                }
            }
            PeerMessage::PlaceInQueueRequest(filename) => {
                if let Some(mc) = self.peer_manager.pooled_message_connection(&username).await {
                    let endpoint = mc.connection().endpoint();
                    if let Some(place) = self
                        .resolvers
                        .place_in_queue_response(&username, endpoint, &filename)
                        .await
                    {
                        let _ = mc
                            .write_message(peer::place_in_queue_response(&filename, place), CancellationToken::never())
                            .await;
                    }
                }
            }
            PeerMessage::TransferRequest(req) => {
                // The remote announcing it's ready to upload to us: it chose
                // `req.token` itself, so there's no entry for it in our own
                // token-keyed registry yet — this is what `download()` is
                // waiting to learn.
                let key = incoming_transfer_request_key(&username, &req.filename);
                self.waiter.complete(&key, req).await;
            }
            PeerMessage::TransferResponse(resp) => {
                let transfer = self.transfers.lock().await.get(&resp.token).cloned();
                if let Some(transfer) = transfer {
                    let key = transfer::response_wait_key(
                        transfer.direction,
                        &transfer.username,
                        &transfer.filename,
                        resp.token,
                    );
                    self.waiter.complete(&key, resp).await;
                }
            }
            PeerMessage::QueueFailed { filename, reason } => {
                self.emit(
                    DiagnosticLevel::Warning,
                    format!("{} reported queue failure for {:?}: {}", username, filename, reason),
                );
            }
            PeerMessage::UploadFailed(filename) => {
                self.emit(
                    DiagnosticLevel::Warning,
                    format!("{} reported upload failure for {:?}", username, filename),
                );
            }
            PeerMessage::SharedFileList(_)
            | PeerMessage::UserInfoResponse(_)
            | PeerMessage::FolderContentsRequest(_)
            | PeerMessage::PlaceInQueueResponse { .. } => {
                // Answers to our own requests; callers that issued them poll
                // or await the connection directly rather than through this
                // fan-in loop, so there is nothing left to do here.
            }
            PeerMessage::Unknown { code, .. } => {
                self.emit(DiagnosticLevel::Debug, format!("unrecognized message code {} from {}", code, username));
            }
        }
    }

    /// Allocates a token, registers the search, and submits it to the
    /// server. Responses stream into the returned handle as they arrive off
    /// the peer mesh.
    pub async fn search(
        self: &Arc<Self>,
        query: impl Into<String>,
        options: SearchOptions,
    ) -> Arc<SearchInternal> {
        let token = self.tokens.next();
        let query = query.into();
        let search = SearchInternal::new(query.clone(), token, options);
        self.searches.lock().await.insert(token, search.clone());
        let _ = self
            .server
            .write_message(wire::server::file_search(token, &query), CancellationToken::never())
            .await;
        search
    }

    /// Drops a completed or abandoned search's registry entry. Does not
    /// itself cancel it; call [`SearchInternal::cancel`] first if it's still
    /// in progress.
    pub async fn forget_search(&self, token: Token) {
        self.searches.lock().await.remove(&token);
    }

    /// Download lifecycle: queues the request, waits for the remote's
    /// `TransferRequest` naming its chosen token, accepts it, then streams
    /// the file into `sink`.
    pub async fn download(
        self: &Arc<Self>,
        username: Username,
        endpoint: Endpoint,
        filename: String,
        size_hint: Option<u64>,
        sink: impl AsyncWrite + Unpin + Send + 'static,
        cancel: CancellationToken,
    ) -> Result<Arc<TransferInternal>, Error> {
        let token = self.tokens.next();
        let transfer = Arc::new(TransferInternal::new(
            Direction::Download,
            username.clone(),
            filename.clone(),
            token,
            size_hint,
            0,
            TransferOptions::default(),
        ));
        self.transfers.lock().await.insert(token, transfer.clone());
        transfer.mark_queued().await;

        let mc = self.peer_manager.message_connection(username.clone(), endpoint).await?;
        mc.write_message(peer::queue_download(&filename), cancel.clone()).await?;

        // The remote picks its own token for the eventual `TransferRequest`,
        // so we can't wait on it by token the way `upload` does; (username,
        // filename) is all we know in advance.
        let key = incoming_transfer_request_key(&username, &filename);
        let request = self
            .waiter
            .wait::<crate::wire::peer::TransferRequest>(key, Some(self.conf.message_timeout))
            .await;
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                transfer.fail(wait_failure_state(&e), e.to_string()).await;
                return Err(e.into());
            }
        };

        mc.write_message(
            transfer::accept(request.token, request.file_size).encode(),
            cancel.clone(),
        )
        .await?;

        let t = transfer.clone();
        let pm = self.peer_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = t.run_download(&pm, endpoint, request.token, sink, cancel).await {
                log::debug!("download of {:?} from {} failed: {}", t.filename, t.username, e);
            }
        });
        Ok(transfer)
    }

    /// Upload lifecycle: the mirror of [`Self::download`] — announces
    /// the queued upload, waits for acceptance, then streams `source`.
    pub async fn upload(
        self: &Arc<Self>,
        username: Username,
        endpoint: Endpoint,
        filename: String,
        file_size: Option<u64>,
        source: impl AsyncRead + Unpin + Send + 'static,
        cancel: CancellationToken,
    ) -> Result<Arc<TransferInternal>, Error> {
        let token = self.tokens.next();
        let transfer = Arc::new(TransferInternal::new(
            Direction::Upload,
            username.clone(),
            filename.clone(),
            token,
            file_size,
            0,
            TransferOptions::default(),
        ));
        self.transfers.lock().await.insert(token, transfer.clone());
        transfer.mark_queued().await;

        let mc = self.peer_manager.message_connection(username.clone(), endpoint).await?;
        mc.write_message(
            transfer::announce_upload(token, &filename, file_size).encode(),
            cancel.clone(),
        )
        .await?;

        let key = transfer::response_wait_key(Direction::Upload, &username, &filename, token);
        let response = self
            .waiter
            .wait::<crate::wire::peer::TransferResponse>(key, Some(self.conf.message_timeout))
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                transfer.fail(wait_failure_state(&e), e.to_string()).await;
                return Err(e.into());
            }
        };
        if !response.allowed {
            let reason = response.reason.unwrap_or_default();
            transfer.fail(crate::transfer::TransferState::REJECTED, reason.clone()).await;
            return Err(Error::TransferRejected(reason));
        }

        let t = transfer.clone();
        let pm = self.peer_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = t.run_upload(&pm, endpoint, source, cancel).await {
                log::debug!("upload of {:?} to {} failed: {}", t.filename, t.username, e);
            }
        });
        Ok(transfer)
    }

    /// Tears down the server connection, which cascades into failing every
    /// outstanding wait and letting the pooled peer connections' own
    /// inactivity watchdogs reap them.
    pub async fn disconnect(&self) {
        self.server
            .disconnect(crate::connection::DisconnectReason::Requested, None)
            .await;
        self.waiter.cancel_all().await;
    }
}

/// Reported to the server at login. Arbitrary but fixed, the way every
/// Soulseek client pins a version number the server's feature gating keys
/// off of.
const CLIENT_VERSION: u32 = 157;

/// Keys the wait for an inbound `TransferRequest` announcing a download
/// we've already queued. Unlike [`transfer::response_wait_key`] this can't
/// include a token: the remote hasn't told us one yet, that's the whole
/// point of waiting.
fn incoming_transfer_request_key(username: &Username, filename: &str) -> crate::waiter::WaitKey {
    wait_key!("IncomingTransferRequest", username, filename)
}

fn wait_failure_state(e: &crate::waiter::Error) -> crate::transfer::TransferState {
    match e {
        crate::waiter::Error::Timeout => crate::transfer::TransferState::TIMED_OUT,
        crate::waiter::Error::Cancelled => crate::transfer::TransferState::CANCELLED,
        crate::waiter::Error::Replaced | crate::waiter::Error::TypeMismatch => {
            crate::transfer::TransferState::ERRORED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::DefaultResolvers;
    use crate::diagnostics::NullDiagnosticSink;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn spawn_fake_server(accept_login: bool) -> (Endpoint, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            socket.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();

            let result = wire::server::LoginResult {
                success: accept_login,
                message: if accept_login { "ok".to_string() } else { "bad password".to_string() },
            };
            let mut w = wire::Writer::new();
            w.write_bool(result.success);
            w.write_string(&result.message);
            let framed = wire::frame(&wire::server::LOGIN.to_le_bytes(), &w.into_bytes());
            tokio::io::AsyncWriteExt::write_all(&mut socket, &framed)
                .await
                .unwrap();

            // keep the socket open for the duration of the test.
            let mut sink = vec![0u8; 1];
            let _ = socket.read(&mut sink).await;
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn connect_succeeds_on_successful_login_result() {
        let (addr, _server) = spawn_fake_server(true).await;
        let client = Client::connect(
            addr,
            "alice".to_string(),
            "hunter2",
            Conf::default(),
            Arc::new(DefaultResolvers),
            Arc::new(NullDiagnosticSink),
        )
        .await
        .unwrap();
        assert_eq!(client.local_username(), "alice");
    }

    #[tokio::test]
    async fn queue_download_rejection_is_written_back_to_the_requesting_peer() {
        let (addr, _server) = spawn_fake_server(true).await;
        let client = Client::connect(
            addr,
            "alice".to_string(),
            "hunter2",
            Conf::default(),
            Arc::new(DefaultResolvers),
            Arc::new(NullDiagnosticSink),
        )
        .await
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut peer_socket = tokio::net::TcpStream::connect(peer_addr).await.unwrap();
        let (accepted, accepted_addr) = accept.await.unwrap();
        client
            .peer_manager()
            .clone()
            .add_message_connection("bob".to_string(), accepted, accepted_addr)
            .await;

        let framed = peer::queue_download("song.flac");
        tokio::io::AsyncWriteExt::write_all(&mut peer_socket, &framed)
            .await
            .unwrap();

        let mut len_buf = [0u8; 4];
        peer_socket.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        peer_socket.read_exact(&mut body).await.unwrap();
        let code = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        assert_eq!(code, peer::QUEUE_FAILED);
        let mut r = wire::Reader::new(bytes::Bytes::copy_from_slice(&body[4..]));
        assert_eq!(r.read_string().unwrap(), "song.flac");
        assert_eq!(r.read_string().unwrap(), "downloads are not accepted");
    }

    #[tokio::test]
    async fn connect_fails_with_login_rejected_on_unsuccessful_result() {
        let (addr, _server) = spawn_fake_server(false).await;
        let err = Client::connect(
            addr,
            "alice".to_string(),
            "wrong",
            Conf::default(),
            Arc::new(DefaultResolvers),
            Arc::new(NullDiagnosticSink),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::LoginRejected(_)));
    }
}

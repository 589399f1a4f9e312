//! Accepts inbound TCP and routes each socket by its initialization
//! message: peer, transfer, or distributed, to whichever manager owns
//! that connection kind.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

use crate::cancel::CancellationToken;
use crate::conf::{ConnectionOptions, Endpoint};
use crate::connection::{Connection, ConnectionTypeFlags, DisconnectReason, Error};
use crate::diagnostics::{Diagnostic, DiagnosticLevel, DiagnosticSink};
use crate::distributed_manager::DistributedConnectionManager;
use crate::peer_manager::PeerConnectionManager;
use crate::wire::{self, init::InitMessage};
use crate::wire::init::PeerInitType;
use crate::waiter::Waiter;
use crate::{wait_key, ConnectionIdAllocator};

pub struct Listener {
    waiter: Arc<Waiter>,
    peer_manager: Arc<PeerConnectionManager>,
    distributed_manager: Arc<DistributedConnectionManager>,
    connection_ids: Arc<ConnectionIdAllocator>,
    options: ConnectionOptions,
    diagnostics: Arc<dyn DiagnosticSink>,
    minimum_diagnostic_level: DiagnosticLevel,
}

impl Listener {
    pub fn new(
        waiter: Arc<Waiter>,
        peer_manager: Arc<PeerConnectionManager>,
        distributed_manager: Arc<DistributedConnectionManager>,
        connection_ids: Arc<ConnectionIdAllocator>,
        options: ConnectionOptions,
        diagnostics: Arc<dyn DiagnosticSink>,
        minimum_diagnostic_level: DiagnosticLevel,
    ) -> Arc<Self> {
        Arc::new(Self {
            waiter,
            peer_manager,
            distributed_manager,
            connection_ids,
            options,
            diagnostics,
            minimum_diagnostic_level,
        })
    }

    /// Binds `port` and accepts forever. Returns only if the bind itself
    /// fails; per-connection failures are handled and logged internally.
    pub async fn run(self: Arc<Self>, port: u16) -> std::io::Result<()> {
        let tcp_listener = TokioTcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        loop {
            match tcp_listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_inbound(socket, peer_addr).await });
                }
                Err(e) => log::warn!("listener accept failed: {}", e),
            }
        }
    }

    async fn handle_inbound(&self, socket: TcpStream, peer_addr: Endpoint) {
        let id = self.connection_ids.next();
        let conn = Connection::from_accepted(
            id,
            peer_addr,
            self.options,
            ConnectionTypeFlags::INBOUND,
            socket,
        );
        match self.dispatch(&conn, peer_addr).await {
            Ok(()) => {}
            Err(Error::Wire(wire::Error::Decode(_))) => {
                self.diagnostic(
                    DiagnosticLevel::Warning,
                    format!(
                        "unrecognized initialization message from {}",
                        peer_addr
                    ),
                    None,
                );
                conn.disconnect(DisconnectReason::Error, None).await;
            }
            Err(e) => {
                log::debug!("closing inbound connection from {}: {}", peer_addr, e);
                conn.disconnect(DisconnectReason::Error, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn dispatch(&self, conn: &Connection, peer_addr: Endpoint) -> Result<(), Error> {
        let cancel = CancellationToken::never();
        let len_bytes = conn.read(wire::LENGTH_PREFIX_LEN, cancel.clone()).await?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let payload = conn.read(len as usize, cancel).await?;
        if payload.is_empty() {
            return Err(Error::Wire(wire::Error::Truncated));
        }
        let code = payload[0];
        let body = payload.slice(1..);
        let message = InitMessage::decode(code, body)?;
        match message {
            InitMessage::PierceFirewall { token } => {
                self.handle_pierce_firewall(conn, peer_addr, token).await
            }
            InitMessage::PeerInit {
                username,
                typ,
                token,
            } => {
                self.handle_peer_init(conn, peer_addr, username, typ, token)
                    .await
            }
        }
    }

    async fn handle_pierce_firewall(
        &self,
        conn: &Connection,
        peer_addr: Endpoint,
        token: crate::Token,
    ) -> Result<(), Error> {
        let socket = conn.handoff_tcp_client().await?;
        if let Some(username) = self.peer_manager.take_pending_solicitation(token).await {
            self.waiter
                .complete(
                    &wait_key!("SolicitedPeerConnection", username, token),
                    crate::connection::IncomingConnection { socket, peer_addr },
                )
                .await;
            return Ok(());
        }
        if let Some(username) = self
            .distributed_manager
            .take_pending_solicitation(token)
            .await
        {
            self.waiter
                .complete(
                    &wait_key!("SolicitedDistributedConnection", username, token),
                    crate::connection::IncomingConnection { socket, peer_addr },
                )
                .await;
            return Ok(());
        }
        self.diagnostic(
            DiagnosticLevel::Warning,
            format!("received PierceFirewall for unknown token {}", token),
            None,
        );
        Ok(())
    }

    async fn handle_peer_init(
        &self,
        conn: &Connection,
        peer_addr: Endpoint,
        username: crate::Username,
        typ: PeerInitType,
        token: crate::Token,
    ) -> Result<(), Error> {
        let socket = conn.handoff_tcp_client().await?;
        match typ {
            PeerInitType::Peer => {
                self.peer_manager
                    .add_message_connection(username, socket, peer_addr)
                    .await;
            }
            PeerInitType::Transfer => {
                self.peer_manager
                    .add_transfer_connection(username, token, socket, peer_addr)
                    .await;
            }
            PeerInitType::Distributed => {
                self.distributed_manager
                    .add_child_connection(username, token, socket, peer_addr)
                    .await;
            }
        }
        Ok(())
    }

    fn diagnostic(&self, level: DiagnosticLevel, message: String, cause: Option<String>) {
        let mut diagnostic = Diagnostic::new(level, message);
        if let Some(cause) = cause {
            diagnostic = diagnostic.with_cause(cause);
        }
        crate::diagnostics::emit(
            self.diagnostics.as_ref(),
            self.minimum_diagnostic_level,
            diagnostic,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Conf;
    use crate::diagnostics::NullDiagnosticSink;
    use crate::peer_manager::PeerConnectionManager;
    use crate::wire::init::InitMessage;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    /// Builds a listener wired to empty managers, sufficient to exercise
    /// the dispatch table without a live server connection.
    async fn test_listener() -> (Arc<Listener>, Arc<PeerConnectionManager>) {
        let conf = Conf::default();
        let waiter = Arc::new(Waiter::new(conf.message_timeout));
        let connection_ids = Arc::new(ConnectionIdAllocator::default());
        let tokens = Arc::new(crate::TokenAllocator::default());

        let (server_conn, _server_socket) = crate::peer_manager::tests::loopback_message_connection().await;

        let peer_manager = PeerConnectionManager::new(
            waiter.clone(),
            server_conn,
            connection_ids.clone(),
            tokens.clone(),
            conf.peer_connection_options,
            conf.message_timeout,
            "local".to_string(),
            None,
        );
        let distributed_manager = crate::distributed_manager::DistributedConnectionManager::new(
            peer_manager.clone(),
            connection_ids.clone(),
            conf.distributed_connection_options,
            conf.concurrent_distributed_children_limit,
            conf.parent_watchdog_period,
        );
        let listener = Listener::new(
            waiter,
            peer_manager.clone(),
            distributed_manager,
            connection_ids,
            conf.incoming_connection_options,
            Arc::new(NullDiagnosticSink),
            conf.minimum_diagnostic_level,
        );
        (listener, peer_manager)
    }

    #[tokio::test]
    async fn unknown_pierce_firewall_token_is_closed_without_panicking() {
        let (listener, _peer_manager) = test_listener().await;
        let tcp_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut tcp_listener = tcp_listener;
            let (mut socket, _) = tcp_listener.accept().await.unwrap();
            socket
                .write_all(&InitMessage::PierceFirewall { token: 999 }.encode())
                .await
                .unwrap();
        });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        listener.handle_inbound(client, addr).await;
    }

    #[tokio::test]
    async fn peer_init_installs_a_message_connection() {
        let (listener, peer_manager) = test_listener().await;
        let tcp_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut tcp_listener = tcp_listener;
            let (mut socket, _) = tcp_listener.accept().await.unwrap();
            socket
                .write_all(
                    &InitMessage::PeerInit {
                        username: "remote".to_string(),
                        typ: PeerInitType::Peer,
                        token: 1,
                    }
                    .encode(),
                )
                .await
                .unwrap();
        });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        listener.handle_inbound(client, addr).await;
        time_delay().await;
        assert!(peer_manager.has_message_connection("remote").await);
    }

    async fn time_delay() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

//! The distributed search tree: acquiring a parent, admitting children, and
//! keeping the server informed of this node's place in the tree.
//!
//! Reuses [`crate::peer_manager::race_connect`] for parent-candidate dialing
//! the same way a download and an upload share it for peer dialing — the
//! wire shape differs only in `PeerInitType` and in what happens once the
//! socket is open.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time;

use crate::cancel::CancellationToken;
use crate::conf::{ConnectionOptions, Endpoint};
use crate::connection::{Connection, ConnectionTypeFlags, DisconnectReason, State};
use crate::error::{connection_error, Error};
use crate::message_connection::{MessageConnection, MessageEvent};
use crate::peer_manager::{leg_flag, race_connect, DialContext, PeerConnectionManager};
use crate::wire::{self, distributed::DistributedMessage, init::PeerInitType};
use crate::{ConnectionIdAllocator, Token, Username};

struct DistributedState {
    branch_level: i32,
    branch_root: String,
    parent: Option<Arc<MessageConnection>>,
    children: HashMap<Username, Arc<MessageConnection>>,
    parent_candidate_list: Vec<(Username, Endpoint)>,
    status_hash: u64,
}

impl Default for DistributedState {
    fn default() -> Self {
        Self {
            branch_level: 0,
            branch_root: String::new(),
            parent: None,
            children: HashMap::new(),
            parent_candidate_list: Vec::new(),
            status_hash: 0,
        }
    }
}

pub struct DistributedConnectionManager {
    peer_manager: Arc<PeerConnectionManager>,
    connection_ids: Arc<ConnectionIdAllocator>,
    options: ConnectionOptions,
    concurrent_distributed_children_limit: u32,
    parent_watchdog_period: Duration,
    state: Mutex<DistributedState>,
    pending_solicitations: Arc<Mutex<HashMap<Token, Username>>>,
    last_parent_activity: Mutex<Instant>,
}

impl DistributedConnectionManager {
    pub fn new(
        peer_manager: Arc<PeerConnectionManager>,
        connection_ids: Arc<ConnectionIdAllocator>,
        options: ConnectionOptions,
        concurrent_distributed_children_limit: u32,
        parent_watchdog_period: Duration,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            peer_manager,
            connection_ids,
            options,
            concurrent_distributed_children_limit,
            parent_watchdog_period,
            state: Mutex::new(DistributedState::default()),
            pending_solicitations: Arc::new(Mutex::new(HashMap::new())),
            last_parent_activity: Mutex::new(Instant::now()),
        });
        tokio::spawn(this.clone().watchdog_loop());
        this
    }

    pub(crate) async fn take_pending_solicitation(&self, token: Token) -> Option<Username> {
        self.pending_solicitations.lock().await.remove(&token)
    }

    pub async fn has_parent(&self) -> bool {
        self.state.lock().await.parent.is_some()
    }

    pub async fn branch_level(&self) -> i32 {
        self.state.lock().await.branch_level
    }

    pub async fn child_count(&self) -> usize {
        self.state.lock().await.children.len()
    }

    /// Attempts every candidate concurrently, installing whichever first
    /// proves itself (branch info plus an initial search request).
    pub async fn connect_to_parents(
        self: &Arc<Self>,
        candidates: Vec<(Username, Endpoint)>,
    ) -> Result<(), Error> {
        {
            let mut state = self.state.lock().await;
            state.parent_candidate_list = candidates.clone();
        }
        let mut handles: Vec<_> = candidates
            .into_iter()
            .map(|(username, endpoint)| {
                let this = self.clone();
                tokio::spawn(async move { this.try_parent_candidate(username, endpoint).await })
            })
            .collect();

        let mut winner = None;
        while !handles.is_empty() {
            let (result, _index, remaining) = futures::future::select_all(handles).await;
            handles = remaining;
            if let Ok(Ok(candidate)) = result {
                winner = Some(candidate);
                break;
            }
        }
        for handle in handles {
            tokio::spawn(async move {
                if let Ok(Ok((_, mc, _, _, _))) = handle.await {
                    mc.disconnect(DisconnectReason::Superseded, None).await;
                }
            });
        }

        match winner {
            Some((username, mc, branch_level, branch_root, rx)) => {
                self.install_parent(username, mc, branch_level, branch_root, rx)
                    .await;
                Ok(())
            }
            None => {
                log::warn!("Failed to connect to any of the available parent candidates");
                Err(Error::ConnectionError {
                    message: "Failed to connect to any of the available parent candidates"
                        .to_string(),
                })
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn try_parent_candidate(
        self: Arc<Self>,
        username: Username,
        endpoint: Endpoint,
    ) -> Result<
        (
            Username,
            Arc<MessageConnection>,
            i32,
            String,
            mpsc::UnboundedReceiver<MessageEvent>,
        ),
        Error,
    > {
        let ctx = DialContext {
            waiter: self.peer_manager.waiter().clone(),
            server: self.peer_manager.server().clone(),
            local_username: self.peer_manager.local_username().clone(),
            message_timeout: self.peer_manager.message_timeout(),
            connect_timeout: self.options.connect_timeout,
        };
        let (socket, is_direct) = race_connect(
            ctx,
            self.pending_solicitations.clone(),
            "SolicitedDistributedConnection",
            username.clone(),
            endpoint,
            PeerInitType::Distributed,
            self.peer_manager.tokens().next(),
            self.peer_manager.tokens().next(),
            None,
        )
        .await?;

        let id = self.connection_ids.next();
        let type_flags = ConnectionTypeFlags::OUTBOUND | ConnectionTypeFlags::DISTRIBUTED | leg_flag(is_direct);
        let connection = Arc::new(Connection::new(id, endpoint, self.options, type_flags));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mc = MessageConnection::new(connection, Some(username.clone()), socket, Some(tx));
        mc.start_reading_continuously();

        let handshake_username = username.clone();
        let handshake = async move {
            let mut branch_level = None;
            let mut branch_root = None;
            loop {
                match rx.recv().await {
                    Some(MessageEvent::MessageRead { bytes }) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        let code = bytes[0];
                        let payload = bytes.slice(1..);
                        match DistributedMessage::decode(code, payload) {
                            Ok(DistributedMessage::BranchLevel(level)) => branch_level = Some(level),
                            Ok(DistributedMessage::BranchRoot(root)) => branch_root = Some(root),
                            Ok(DistributedMessage::SearchRequest { .. }) => {
                                if let (Some(level), Some(root)) = (branch_level, branch_root.clone()) {
                                    return Ok((level, root, rx));
                                }
                            }
                            _ => {}
                        }
                    }
                    Some(MessageEvent::Disconnected { .. }) | None => {
                        return Err(connection_error(
                            &handshake_username,
                            "disconnected before completing the parent handshake",
                        ));
                    }
                    _ => {}
                }
            }
        };

        match time::timeout(self.peer_manager.message_timeout(), handshake).await {
            Ok(Ok((level, root, rx))) => Ok((username, mc, level, root, rx)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                mc.disconnect(
                    DisconnectReason::Error,
                    Some("parent handshake timed out".to_string()),
                )
                .await;
                Err(Error::Timeout)
            }
        }
    }

    async fn install_parent(
        self: &Arc<Self>,
        username: Username,
        mc: Arc<MessageConnection>,
        branch_level: i32,
        branch_root: String,
        rx: mpsc::UnboundedReceiver<MessageEvent>,
    ) {
        let prior = {
            let mut state = self.state.lock().await;
            state.branch_level = branch_level;
            state.branch_root = branch_root;
            state.parent.replace(mc.clone())
        };
        if let Some(prior) = prior {
            if !Arc::ptr_eq(&prior, &mc) {
                prior.disconnect(DisconnectReason::Superseded, None).await;
            }
        }
        *self.last_parent_activity.lock().await = Instant::now();
        self.watch_parent(rx);
        let _ = username;
        self.update_status().await;
    }

    fn watch_parent(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<MessageEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    MessageEvent::MessageRead { bytes } => {
                        *this.last_parent_activity.lock().await = Instant::now();
                        if bytes.is_empty() {
                            continue;
                        }
                        let code = bytes[0];
                        let payload = bytes.slice(1..);
                        if let Ok(msg) = DistributedMessage::decode(code, payload) {
                            match msg {
                                DistributedMessage::BranchLevel(level) => {
                                    this.state.lock().await.branch_level = level;
                                }
                                DistributedMessage::BranchRoot(root) => {
                                    this.state.lock().await.branch_root = root;
                                }
                                _ => {}
                            }
                        }
                    }
                    MessageEvent::Disconnected { .. } => {
                        this.handle_parent_disconnect().await;
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    /// Parent disconnect and watchdog expiry share this path.
    async fn handle_parent_disconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.parent = None;
            state.branch_level = 0;
            state.branch_root = String::new();
        }
        self.update_status().await;
    }

    async fn watchdog_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.parent_watchdog_period);
        loop {
            ticker.tick().await;
            let parent = self.state.lock().await.parent.clone();
            let parent = match parent {
                Some(p) => p,
                None => continue,
            };
            let elapsed = self.last_parent_activity.lock().await.elapsed();
            if elapsed >= self.parent_watchdog_period {
                log::debug!("parent watchdog expired without inbound distributed activity");
                parent.disconnect(DisconnectReason::Inactivity, None).await;
                self.handle_parent_disconnect().await;
            }
        }
    }

    /// An already-accepted `"D"` connection, or the result of us dialing a
    /// candidate the server told us to (admission rules are the same
    /// either way).
    pub async fn add_child_connection(
        self: &Arc<Self>,
        username: Username,
        token: Token,
        socket: TcpStream,
        peer_addr: Endpoint,
    ) {
        let too_many = {
            let state = self.state.lock().await;
            state.children.len() as u32 >= self.concurrent_distributed_children_limit
        };
        if too_many {
            let cannot = wire::server::cannot_connect(token, &username);
            let _ = self
                .peer_manager
                .server()
                .write_message(cannot, CancellationToken::never())
                .await;
            log::debug!(
                "rejecting distributed child {}: concurrent_distributed_children_limit reached",
                username
            );
            return;
        }

        let id = self.connection_ids.next();
        let connection = Arc::new(Connection::new(
            id,
            peer_addr,
            self.options,
            ConnectionTypeFlags::INBOUND | ConnectionTypeFlags::DISTRIBUTED,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let mc = MessageConnection::new(connection, Some(username.clone()), socket, Some(tx));
        self.install_child(username, mc, rx).await;
    }

    async fn install_child(
        self: &Arc<Self>,
        username: Username,
        mc: Arc<MessageConnection>,
        rx: mpsc::UnboundedReceiver<MessageEvent>,
    ) {
        let prior = {
            let mut state = self.state.lock().await;
            state.children.insert(username.clone(), mc.clone())
        };
        if let Some(prior) = prior {
            if !Arc::ptr_eq(&prior, &mc) {
                prior.disconnect(DisconnectReason::Superseded, None).await;
            }
        }

        let (has_parent, branch_level, branch_root) = {
            let state = self.state.lock().await;
            (state.parent.is_some(), state.branch_level, state.branch_root.clone())
        };
        let cancel = CancellationToken::never();
        if has_parent {
            let _ = mc
                .write_message(wire::distributed::branch_level(branch_level + 1), cancel.clone())
                .await;
            let _ = mc
                .write_message(wire::distributed::branch_root(&branch_root), cancel)
                .await;
        } else {
            let _ = mc.write_message(wire::distributed::branch_level(0), cancel).await;
        }
        mc.start_reading_continuously();
        self.watch_child(username, rx);
    }

    fn watch_child(self: &Arc<Self>, username: Username, mut rx: mpsc::UnboundedReceiver<MessageEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let MessageEvent::Disconnected { .. } = event {
                    log::debug!("distributed child {} disconnected", username);
                    this.remove_child_if_current(&username).await;
                    break;
                }
            }
        });
    }

    async fn remove_child_if_current(&self, username: &Username) {
        self.state.lock().await.children.remove(username);
    }

    /// Forwards `bytes` to every child; a per-child write failure disposes
    /// that child without aborting the rest.
    pub async fn broadcast(self: &Arc<Self>, bytes: Bytes) {
        *self.last_parent_activity.lock().await = Instant::now();
        let children: Vec<_> = self.state.lock().await.children.clone().into_iter().collect();
        let cancel = CancellationToken::never();
        futures::future::join_all(children.into_iter().map(|(username, child)| {
            let bytes = bytes.clone();
            let cancel = cancel.clone();
            let this = self.clone();
            async move {
                if let Err(e) = child.write_message(bytes, cancel).await {
                    log::debug!("broadcast write to {} failed: {}", username, e);
                    child.disconnect(DisconnectReason::Error, Some(e.to_string())).await;
                    this.remove_child_if_current(&username).await;
                }
            }
        }))
        .await;
    }

    /// Recomputes and, if changed, pushes the node's status to the server,
    /// then re-broadcasts branch info to children.
    pub async fn update_status(self: &Arc<Self>) {
        let (has_parent, branch_level, branch_root) = {
            let state = self.state.lock().await;
            (state.parent.is_some(), state.branch_level, state.branch_root.clone())
        };
        let can_accept_children = {
            let state = self.state.lock().await;
            (state.children.len() as u32) < self.concurrent_distributed_children_limit
        };

        let mut hasher = DefaultHasher::new();
        has_parent.hash(&mut hasher);
        branch_level.hash(&mut hasher);
        branch_root.hash(&mut hasher);
        can_accept_children.hash(&mut hasher);
        let hash = hasher.finish();

        let (skip, server_connected) = {
            let state = self.state.lock().await;
            let server_connected = self.peer_manager.server().connection().state().await == State::Connected;
            (hash == state.status_hash && state.parent.is_some(), server_connected)
        };

        if !skip {
            self.state.lock().await.status_hash = hash;
            let mut messages = vec![
                wire::server::have_no_parent(!has_parent),
                wire::server::parents_ip(None),
                wire::server::branch_level(branch_level),
                wire::server::branch_root(&branch_root),
                wire::server::accept_children(can_accept_children),
            ];
            if has_parent {
                messages.push(wire::server::child_depth(0));
            }
            let cancel = CancellationToken::never();
            for message in messages {
                if let Err(e) = self
                    .peer_manager
                    .server()
                    .write_message(message, cancel.clone())
                    .await
                {
                    if server_connected {
                        log::warn!("failed to update distributed status: {}", e);
                    } else {
                        log::debug!("failed to update distributed status: {}", e);
                    }
                }
            }
        }

        let children: Vec<_> = self.state.lock().await.children.values().cloned().collect();
        let cancel = CancellationToken::never();
        for child in children {
            let _ = child
                .write_message(wire::distributed::branch_level(branch_level + 1), cancel.clone())
                .await;
            let _ = child
                .write_message(wire::distributed::branch_root(&branch_root), cancel.clone())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::Waiter;
    use crate::TokenAllocator;
    use tokio::net::TcpListener;

    async fn test_manager() -> Arc<DistributedConnectionManager> {
        let (server, _server_socket) = crate::peer_manager::tests::loopback_message_connection().await;
        let peer_manager = PeerConnectionManager::new(
            Arc::new(Waiter::new(Duration::from_millis(200))),
            server,
            Arc::new(ConnectionIdAllocator::default()),
            Arc::new(TokenAllocator::default()),
            ConnectionOptions::default(),
            Duration::from_millis(200),
            "local".to_string(),
            None,
        );
        DistributedConnectionManager::new(
            peer_manager,
            Arc::new(ConnectionIdAllocator::default()),
            ConnectionOptions::default(),
            1,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn child_beyond_the_limit_is_rejected_without_panicking() {
        let manager = test_manager().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut listener = listener;
            listener.accept().await.unwrap()
        });
        let client1 = TcpStream::connect(addr).await.unwrap();
        let (accepted1, peer_addr1) = accept.await.unwrap();
        manager
            .clone()
            .add_child_connection("alice".to_string(), 1, accepted1, peer_addr1)
            .await;
        drop(client1);
        assert_eq!(manager.child_count().await, 1);

        let listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr2 = listener2.local_addr().unwrap();
        let accept2 = tokio::spawn(async move {
            let mut listener2 = listener2;
            listener2.accept().await.unwrap()
        });
        let client2 = TcpStream::connect(addr2).await.unwrap();
        let (accepted2, peer_addr2) = accept2.await.unwrap();
        manager
            .clone()
            .add_child_connection("bob".to_string(), 2, accepted2, peer_addr2)
            .await;
        drop(client2);
        // still 1: bob was rejected since the limit (1) was already reached.
        assert_eq!(manager.child_count().await, 1);
    }
}

//! This module defines types used to configure the client and its parts.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    diagnostics::DiagnosticLevel,
    wire::peer::{BrowseResponse, SearchResponse, UserInfoResponse},
    Token, Username,
};

/// A fixed-size IP endpoint, as handed out by the server for peer and
/// distributed connection candidates.
pub type Endpoint = std::net::SocketAddr;

/// The global configuration for the client and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    /// Inbound listener port. `None` disables the listener entirely (the
    /// client can still originate connections, but can never be dialed
    /// directly, forcing every peer to fall back to the indirect path).
    pub listen_port: Option<u16>,

    /// Upper bound on [`crate::distributed_manager::DistributedConnectionManager`]
    /// child admissions.
    pub concurrent_distributed_children_limit: u32,

    /// Upper bound on concurrently pooled peer message connections.
    pub concurrent_peer_message_connection_limit: u32,

    /// Default timeout applied to [`crate::waiter::Waiter::wait`] calls that
    /// don't specify an explicit override.
    pub message_timeout: Duration,

    /// Whether private messages should be acknowledged automatically
    /// without surfacing them to the caller first.
    pub auto_acknowledge_private_messages: bool,

    /// The minimum severity a [`crate::diagnostics::Diagnostic`] must have
    /// to be forwarded to subscribers.
    pub minimum_diagnostic_level: DiagnosticLevel,

    /// The base value from which search/transfer/solicitation tokens are
    /// allocated.
    pub starting_token: u32,

    /// How often the distributed manager's parent watchdog ticks; if no
    /// inbound distributed traffic is observed within this window while a
    /// parent is set, the parent is treated as dead.
    pub parent_watchdog_period: Duration,

    pub server_connection_options: ConnectionOptions,
    pub peer_connection_options: ConnectionOptions,
    pub transfer_connection_options: ConnectionOptions,
    pub incoming_connection_options: ConnectionOptions,
    pub distributed_connection_options: ConnectionOptions,
}

impl Conf {
    /// Returns the configuration with reasonable defaults.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            listen_port: None,
            concurrent_distributed_children_limit: 100,
            concurrent_peer_message_connection_limit: 500,
            message_timeout: Duration::from_secs(5),
            auto_acknowledge_private_messages: true,
            minimum_diagnostic_level: DiagnosticLevel::Info,
            starting_token: 0,
            parent_watchdog_period: Duration::from_secs(30),
            server_connection_options: ConnectionOptions::default(),
            peer_connection_options: ConnectionOptions::default(),
            transfer_connection_options: ConnectionOptions::default(),
            incoming_connection_options: ConnectionOptions::default(),
            distributed_connection_options: ConnectionOptions::default(),
        }
    }
}

/// Per-connection-kind tunables.
///
/// `inactivity_timeout = None` disables the inactivity watchdog for that
/// connection kind (an idiomatic stand-in for a `-1` sentinel).
#[derive(Clone, Copy, Debug)]
pub struct ConnectionOptions {
    pub read_buffer: usize,
    pub write_buffer: usize,
    pub connect_timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub proxy_options: Option<ProxyOptions>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_buffer: 16 * 1024,
            write_buffer: 16 * 1024,
            connect_timeout: Duration::from_secs(10),
            inactivity_timeout: None,
            proxy_options: None,
        }
    }
}

/// SOCKS-style proxy configuration. The core only carries this through to
/// the dialer; proxy negotiation itself is outside this crate's scope.
#[derive(Clone, Copy, Debug)]
pub struct ProxyOptions {
    pub address: Endpoint,
}

/// User-supplied asynchronous callbacks the core consults while servicing
/// inbound peer requests it cannot answer on its own (browse, user info,
/// queueing, search matching).
///
/// Modeled as a trait object rather than a struct of function pointers so
/// that callers can close over arbitrary state (a share database, a
/// metadata cache) the way cratetorrent's disk/torrent actors close over
/// their own state; `async-trait` supplies the object-safe async methods
/// the way it does for the other example repos in this family of clients.
#[async_trait]
pub trait Resolvers: Send + Sync {
    /// Answers an inbound search query. Returning `None` means "no match",
    /// which the caller should treat as silently dropping the query rather
    /// than sending an empty response.
    async fn search_response(
        &self,
        username: &Username,
        token: Token,
        query: &str,
    ) -> Option<SearchResponse>;

    /// Answers an inbound browse request. Defaults to an empty share list.
    async fn browse_response(
        &self,
        username: &Username,
        endpoint: Endpoint,
    ) -> BrowseResponse {
        let _ = (username, endpoint);
        BrowseResponse::empty()
    }

    /// Answers an inbound user info request. Defaults to a blank profile.
    async fn user_info_response(
        &self,
        username: &Username,
        endpoint: Endpoint,
    ) -> UserInfoResponse {
        let _ = (username, endpoint);
        UserInfoResponse::blank()
    }

    /// Decides whether to accept an inbound `QueueDownload` request for
    /// `filename`. An `Err` return carries the user-visible rejection
    /// reason that gets sent back to the peer as an `UploadFailed`-style
    /// message.
    async fn queue_download(
        &self,
        username: &Username,
        endpoint: Endpoint,
        filename: &str,
    ) -> Result<(), QueueDownloadRejection>;

    /// Answers an inbound place-in-queue request. `None` means the file
    /// isn't queued for this peer at all.
    async fn place_in_queue_response(
        &self,
        username: &Username,
        endpoint: Endpoint,
        filename: &str,
    ) -> Option<u32> {
        let _ = (username, endpoint, filename);
        None
    }
}

/// The user-visible reason an inbound queue request was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDownloadRejection {
    pub reason: String,
}

impl QueueDownloadRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The default [`Resolvers`] implementation: rejects every inbound queue
/// request and answers everything else with the documented blank/empty
/// defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultResolvers;

#[async_trait]
impl Resolvers for DefaultResolvers {
    async fn search_response(
        &self,
        _username: &Username,
        _token: Token,
        _query: &str,
    ) -> Option<SearchResponse> {
        None
    }

    async fn queue_download(
        &self,
        _username: &Username,
        _endpoint: Endpoint,
        _filename: &str,
    ) -> Result<(), QueueDownloadRejection> {
        Err(QueueDownloadRejection::new("downloads are not accepted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let conf = Conf::default();
        assert_eq!(conf.concurrent_distributed_children_limit, 100);
        assert_eq!(conf.concurrent_peer_message_connection_limit, 500);
        assert_eq!(conf.message_timeout, Duration::from_secs(5));
        assert!(conf.auto_acknowledge_private_messages);
        assert_eq!(conf.minimum_diagnostic_level, DiagnosticLevel::Info);
        assert_eq!(conf.starting_token, 0);
        assert!(conf.listen_port.is_none());
    }

    #[tokio::test]
    async fn default_resolvers_reject_downloads() {
        let resolvers = DefaultResolvers::default();
        let err = resolvers
            .queue_download(
                &"alice".to_string(),
                "127.0.0.1:2234".parse().unwrap(),
                "music/track.mp3",
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason, "downloads are not accepted");
    }
}

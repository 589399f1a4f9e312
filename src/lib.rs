//! Connection and session core for a Soulseek peer-to-peer client.
//!
//! A running instance maintains one long-lived connection to the central
//! server and a variable-size mesh of peer connections used for messaging,
//! file transfers, and the distributed search overlay. This crate provides
//! the pieces that make that mesh tractable: a keyed typed-promise registry
//! ([`waiter`]), a layered connection abstraction ([`connection`],
//! [`message_connection`], [`listener`]), the peer and distributed
//! connection managers, and the search/transfer state machines.

// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod cancel;
pub mod client;
pub mod conf;
pub mod connection;
pub mod diagnostics;
pub mod distributed_manager;
pub mod error;
pub(crate) mod flags;
pub mod handlers;
pub mod listener;
pub mod message_connection;
pub mod peer_manager;
pub mod search;
pub mod transfer;
pub mod waiter;
pub mod wire;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A Soulseek username. Usernames are opaque, case-sensitive UTF-8 strings.
pub type Username = String;

/// A token correlating a request with its eventual response, e.g. a search
/// token, a transfer token, or an indirect-connect solicitation token.
pub type Token = u32;

/// The unique, process-stable id assigned to every [`connection::Connection`]
/// for its lifetime. It is how [`waiter::Waiter`] keys are scoped to a
/// specific connection instance.
pub type ConnectionId = u64;

/// Allocates monotonically increasing [`Token`]s, seeded from a configurable
/// base.
///
/// This generalizes cratetorrent's simple incrementing `TorrentId`
/// allocation to every place this core needs a fresh numeric identity:
/// search tokens, transfer tokens, and indirect-connect solicitation
/// tokens.
#[derive(Debug)]
pub struct TokenAllocator {
    next: AtomicU32,
}

impl TokenAllocator {
    /// Creates an allocator that will hand out `starting_token` first.
    pub fn new(starting_token: Token) -> Self {
        Self {
            next: AtomicU32::new(starting_token),
        }
    }

    /// Returns the next token and advances the counter.
    ///
    /// Wraps on overflow rather than panicking: the token space is large
    /// enough in practice that wraparound only matters after billions of
    /// allocations in a single session, at which point any still-pending
    /// solicitation from the first lap is long gone.
    pub fn next(&self) -> Token {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TokenAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A process-wide allocator of [`ConnectionId`]s, distinct from
/// [`TokenAllocator`] because connection ids are 64-bit and never reused
/// across a process's lifetime.
#[derive(Debug, Default)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn next(&self) -> ConnectionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

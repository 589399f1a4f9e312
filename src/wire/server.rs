//! Server domain: 4-byte message codes exchanged on the single long-lived
//! connection to the central server.
//!
//! Only the messages this core's operations actually touch are modeled
//! (login, listen port, indirect-connect brokering, and the distributed
//! tree's status broadcast). Room/chat and the rest of the login handshake
//! are out of scope. The numeric codes follow the widely mirrored
//! community documentation of the protocol; no canonical source table was
//! retrievable for this pack (see `DESIGN.md`), so interoperability should
//! be re-verified against a live server before shipping.

use std::net::Ipv4Addr;

use bytes::Bytes;

use super::{frame, init::PeerInitType, Error, Reader, Writer};
use crate::{conf::Endpoint, Token, Username};

pub const LOGIN: u32 = 1;
pub const SET_LISTEN_PORT: u32 = 2;
pub const FILE_SEARCH: u32 = 26;
pub const CONNECT_TO_PEER: u32 = 18;
pub const HAVE_NO_PARENT: u32 = 71;
pub const PARENTS_IP: u32 = 73;
pub const ACCEPT_CHILDREN: u32 = 100;
pub const POSSIBLE_PARENTS: u32 = 102;
pub const BRANCH_LEVEL: u32 = 126;
pub const BRANCH_ROOT: u32 = 127;
pub const CHILD_DEPTH: u32 = 129;
pub const CANNOT_CONNECT: u32 = 1001;

/// A message decoded off the server connection, or an unknown code
/// forwarded with its raw payload for the handler layer to decide what to
/// do with (per the wire codec's "unknown code" error-handling rule).
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    LoginResult(LoginResult),
    /// The server is relaying a peer's request that we dial them back.
    ConnectToPeer {
        username: Username,
        typ: PeerInitType,
        endpoint: Endpoint,
        token: Token,
    },
    PossibleParents(Vec<(Username, Endpoint)>),
    BranchLevel(i32),
    BranchRoot(String),
    ChildDepth(u32),
    Unknown { code: u32, payload: Bytes },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginResult {
    pub success: bool,
    /// The server's MOTD on success, or the rejection reason on failure.
    pub message: String,
}

impl ServerMessage {
    pub fn decode(code: u32, payload: Bytes) -> Result<Self, Error> {
        let mut r = Reader::new(payload.clone());
        match code {
            LOGIN => {
                let success = r.read_bool()?;
                let message = r.read_string()?;
                Ok(ServerMessage::LoginResult(LoginResult { success, message }))
            }
            CONNECT_TO_PEER => {
                let username = r.read_string()?;
                let typ_str = r.read_string()?;
                let typ = PeerInitType::parse(&typ_str).ok_or_else(|| {
                    Error::Decode(format!("unrecognized peer init type {:?}", typ_str))
                })?;
                let ip = Ipv4Addr::from(r.read_u32()?.to_be());
                let port = r.read_u32()? as u16;
                let token = r.read_u32()?;
                Ok(ServerMessage::ConnectToPeer {
                    username,
                    typ,
                    endpoint: (ip, port).into(),
                    token,
                })
            }
            POSSIBLE_PARENTS => {
                let count = r.read_u32()?;
                let mut candidates = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let username = r.read_string()?;
                    let ip = Ipv4Addr::from(r.read_u32()?.to_be());
                    let port = r.read_u32()? as u16;
                    candidates.push((username, Endpoint::from((ip, port))));
                }
                Ok(ServerMessage::PossibleParents(candidates))
            }
            BRANCH_LEVEL => Ok(ServerMessage::BranchLevel(r.read_i32()?)),
            BRANCH_ROOT => Ok(ServerMessage::BranchRoot(r.read_string()?)),
            CHILD_DEPTH => Ok(ServerMessage::ChildDepth(r.read_u32()?)),
            _ => Ok(ServerMessage::Unknown { code, payload }),
        }
    }
}

/// Encodes the login request.
pub fn login(username: &str, password: &str, client_version: u32) -> Bytes {
    let mut w = Writer::new();
    w.write_string(username);
    w.write_string(password);
    w.write_u32(client_version);
    frame(&LOGIN.to_le_bytes(), &w.into_bytes())
}

pub fn set_listen_port(port: u16) -> Bytes {
    let mut w = Writer::new();
    w.write_u32(port as u32);
    frame(&SET_LISTEN_PORT.to_le_bytes(), &w.into_bytes())
}

/// Submits a search query to the server, which relays it down the
/// distributed tree as a `ServerSearchRequest` from whichever node is
/// currently root of its branch.
pub fn file_search(token: Token, query: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_u32(token);
    w.write_string(query);
    frame(&FILE_SEARCH.to_le_bytes(), &w.into_bytes())
}

/// Requests the server notify `username` that we'd like them to connect
/// back to us, identified by `token`.
pub fn connect_to_peer(username: &str, typ: PeerInitType, token: Token) -> Bytes {
    let mut w = Writer::new();
    w.write_string(username);
    w.write_string(typ.as_str());
    w.write_u32(token);
    frame(&CONNECT_TO_PEER.to_le_bytes(), &w.into_bytes())
}

/// Tells the server we were unable to connect to `username` for the
/// solicitation identified by `token` (e.g. a rejected distributed child or
/// a failed indirect dial).
pub fn cannot_connect(token: Token, username: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_u32(token);
    w.write_string(username);
    frame(&CANNOT_CONNECT.to_le_bytes(), &w.into_bytes())
}

pub fn have_no_parent(value: bool) -> Bytes {
    let mut w = Writer::new();
    w.write_bool(value);
    frame(&HAVE_NO_PARENT.to_le_bytes(), &w.into_bytes())
}

/// `ip = None` encodes the "unknown" sentinel as `0.0.0.0`, the documented
/// convention for an unknown `ParentsIP`.
pub fn parents_ip(ip: Option<Ipv4Addr>) -> Bytes {
    let mut w = Writer::new();
    w.write_u32(u32::from_be_bytes(ip.unwrap_or(Ipv4Addr::UNSPECIFIED).octets()));
    frame(&PARENTS_IP.to_le_bytes(), &w.into_bytes())
}

pub fn branch_level(level: i32) -> Bytes {
    let mut w = Writer::new();
    w.write_i32(level);
    frame(&BRANCH_LEVEL.to_le_bytes(), &w.into_bytes())
}

pub fn branch_root(root: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_string(root);
    frame(&BRANCH_ROOT.to_le_bytes(), &w.into_bytes())
}

pub fn child_depth(depth: u32) -> Bytes {
    let mut w = Writer::new();
    w.write_u32(depth);
    frame(&CHILD_DEPTH.to_le_bytes(), &w.into_bytes())
}

pub fn accept_children(accept: bool) -> Bytes {
    let mut w = Writer::new();
    w.write_bool(accept);
    frame(&ACCEPT_CHILDREN.to_le_bytes(), &w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(framed: Bytes) -> (u32, Bytes) {
        let mut r = Reader::new(framed);
        let len = r.read_u32().unwrap() as usize;
        let code = r.read_u32().unwrap();
        let payload = r.read_raw(len - 4).unwrap();
        (code, payload)
    }

    #[test]
    fn connect_to_peer_round_trips() {
        let framed = connect_to_peer("bob", PeerInitType::Peer, 9);
        let (code, payload) = body(framed);
        assert_eq!(code, CONNECT_TO_PEER);
        // what we *send* omits the endpoint; what we *decode* (from the
        // server's relay to the other side) includes it, so round-trip the
        // inbound shape instead.
        let mut w = Writer::new();
        w.write_string("bob");
        w.write_string("P");
        w.write_u32(u32::from_be_bytes([10, 0, 0, 1]));
        w.write_u32(2234);
        w.write_u32(9);
        let decoded = ServerMessage::decode(CONNECT_TO_PEER, w.into_bytes()).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::ConnectToPeer {
                username: "bob".to_string(),
                typ: PeerInitType::Peer,
                endpoint: (Ipv4Addr::new(10, 0, 0, 1), 2234).into(),
                token: 9,
            }
        );
        let _ = payload;
    }

    #[test]
    fn possible_parents_round_trips() {
        let mut w = Writer::new();
        w.write_u32(2);
        w.write_string("a");
        w.write_u32(u32::from_be_bytes([1, 2, 3, 4]));
        w.write_u32(100);
        w.write_string("b");
        w.write_u32(u32::from_be_bytes([5, 6, 7, 8]));
        w.write_u32(200);
        let decoded = ServerMessage::decode(POSSIBLE_PARENTS, w.into_bytes()).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::PossibleParents(vec![
                ("a".to_string(), (Ipv4Addr::new(1, 2, 3, 4), 100).into()),
                ("b".to_string(), (Ipv4Addr::new(5, 6, 7, 8), 200).into()),
            ])
        );
    }

    #[test]
    fn unknown_code_is_forwarded_not_rejected() {
        let decoded = ServerMessage::decode(999_999, Bytes::from_static(b"xyz")).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::Unknown {
                code: 999_999,
                payload: Bytes::from_static(b"xyz"),
            }
        );
    }

    #[test]
    fn file_search_encodes_token_and_query() {
        let framed = file_search(7, "foo bar");
        let (code, payload) = body(framed);
        assert_eq!(code, FILE_SEARCH);
        let mut r = Reader::new(payload);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_string().unwrap(), "foo bar");
    }

    #[test]
    fn unknown_parents_ip_encodes_as_zero() {
        let framed = parents_ip(None);
        let (_, payload) = body(framed);
        let mut r = Reader::new(payload);
        assert_eq!(r.read_u32().unwrap(), 0);
    }
}

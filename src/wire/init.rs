//! Initialization domain: the 1-byte-code handshake exchanged on every
//! freshly accepted inbound TCP connection before the [`Listener`]
//! (`crate::listener`) knows what kind of connection it is.

use bytes::Bytes;

use super::{frame, Error, Reader, Writer};
use crate::{Token, Username};

pub const PIERCE_FIREWALL: u8 = 0;
pub const PEER_INIT: u8 = 1;

/// The three kinds of connection a `PeerInit` may announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerInitType {
    /// `"P"` — a peer message connection.
    Peer,
    /// `"F"` — a transfer (file data) connection.
    Transfer,
    /// `"D"` — a distributed search connection.
    Distributed,
}

impl PeerInitType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerInitType::Peer => "P",
            PeerInitType::Transfer => "F",
            PeerInitType::Distributed => "D",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P" => Some(PeerInitType::Peer),
            "F" => Some(PeerInitType::Transfer),
            "D" => Some(PeerInitType::Distributed),
            _ => None,
        }
    }
}

/// A decoded initialization message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitMessage {
    /// Sent by a peer who was asked by the server (via `ConnectToPeer`) to
    /// dial us back, proving it holds the token we solicited with.
    PierceFirewall { token: Token },
    /// Sent by a peer that dialed us directly, announcing who they are and
    /// what the connection is for.
    PeerInit {
        username: Username,
        typ: PeerInitType,
        token: Token,
    },
}

impl InitMessage {
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new();
        match self {
            InitMessage::PierceFirewall { token } => {
                w.write_u32(*token);
                frame(&[PIERCE_FIREWALL], &w.into_bytes())
            }
            InitMessage::PeerInit {
                username,
                typ,
                token,
            } => {
                w.write_string(username);
                w.write_string(typ.as_str());
                w.write_u32(*token);
                frame(&[PEER_INIT], &w.into_bytes())
            }
        }
    }

    pub fn decode(code: u8, payload: Bytes) -> Result<Self, Error> {
        let mut r = Reader::new(payload);
        match code {
            PIERCE_FIREWALL => Ok(InitMessage::PierceFirewall {
                token: r.read_u32()?,
            }),
            PEER_INIT => {
                let username = r.read_string()?;
                let typ_str = r.read_string()?;
                let typ = PeerInitType::parse(&typ_str).ok_or_else(|| {
                    Error::Decode(format!("unrecognized peer init type {:?}", typ_str))
                })?;
                let token = r.read_u32()?;
                Ok(InitMessage::PeerInit {
                    username,
                    typ,
                    token,
                })
            }
            other => Err(Error::Decode(format!(
                "unrecognized initialization code {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pierce_firewall_round_trips() {
        let msg = InitMessage::PierceFirewall { token: 7 };
        let encoded = msg.encode();
        let mut r = Reader::new(encoded);
        let len = r.read_u32().unwrap() as usize;
        let code = r.read_u8().unwrap();
        let payload = r.read_raw(len - 1).unwrap();
        assert_eq!(InitMessage::decode(code, payload).unwrap(), msg);
    }

    #[test]
    fn peer_init_round_trips_for_every_type() {
        for typ in [
            PeerInitType::Peer,
            PeerInitType::Transfer,
            PeerInitType::Distributed,
        ] {
            let msg = InitMessage::PeerInit {
                username: "alice".to_string(),
                typ,
                token: 42,
            };
            let encoded = msg.encode();
            let mut r = Reader::new(encoded);
            let len = r.read_u32().unwrap() as usize;
            let code = r.read_u8().unwrap();
            let payload = r.read_raw(len - 1).unwrap();
            assert_eq!(InitMessage::decode(code, payload).unwrap(), msg);
        }
    }

    #[test]
    fn unrecognized_code_is_an_error_not_a_panic() {
        let err = InitMessage::decode(99, Bytes::new()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}

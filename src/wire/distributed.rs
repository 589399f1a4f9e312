//! Distributed domain: 1-byte message codes exchanged over the distributed
//! search tree (`"D"`-type connections between parent and children).

use bytes::Bytes;

use super::{frame, Error, Reader, Writer};

pub const SEARCH_REQUEST: u8 = 3;
pub const BRANCH_LEVEL: u8 = 4;
pub const BRANCH_ROOT: u8 = 5;
pub const CHILD_DEPTH: u8 = 7;
pub const SERVER_SEARCH_REQUEST: u8 = 93;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DistributedMessage {
    /// A search query propagating down the tree from some ancestor.
    SearchRequest {
        username: String,
        token: u32,
        query: String,
    },
    /// A search query injected directly by the server rather than
    /// propagated from a parent (the root of a branch sees these).
    ServerSearchRequest {
        username: String,
        token: u32,
        query: String,
    },
    BranchLevel(i32),
    BranchRoot(String),
    ChildDepth(u32),
    Unknown { code: u8, payload: Bytes },
}

impl DistributedMessage {
    pub fn decode(code: u8, payload: Bytes) -> Result<Self, Error> {
        let mut r = Reader::new(payload.clone());
        match code {
            SEARCH_REQUEST => {
                let username = r.read_string()?;
                let token = r.read_u32()?;
                let query = r.read_string()?;
                Ok(DistributedMessage::SearchRequest {
                    username,
                    token,
                    query,
                })
            }
            SERVER_SEARCH_REQUEST => {
                let username = r.read_string()?;
                let token = r.read_u32()?;
                let query = r.read_string()?;
                Ok(DistributedMessage::ServerSearchRequest {
                    username,
                    token,
                    query,
                })
            }
            BRANCH_LEVEL => Ok(DistributedMessage::BranchLevel(r.read_i32()?)),
            BRANCH_ROOT => Ok(DistributedMessage::BranchRoot(r.read_string()?)),
            CHILD_DEPTH => Ok(DistributedMessage::ChildDepth(r.read_u32()?)),
            _ => Ok(DistributedMessage::Unknown { code, payload }),
        }
    }
}

pub fn search_request(username: &str, token: u32, query: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_string(username);
    w.write_u32(token);
    w.write_string(query);
    frame(&[SEARCH_REQUEST], &w.into_bytes())
}

pub fn branch_level(level: i32) -> Bytes {
    let mut w = Writer::new();
    w.write_i32(level);
    frame(&[BRANCH_LEVEL], &w.into_bytes())
}

pub fn branch_root(root: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_string(root);
    frame(&[BRANCH_ROOT], &w.into_bytes())
}

pub fn child_depth(depth: u32) -> Bytes {
    let mut w = Writer::new();
    w.write_u32(depth);
    frame(&[CHILD_DEPTH], &w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(framed: Bytes) -> (u8, Bytes) {
        let mut r = Reader::new(framed);
        let len = r.read_u32().unwrap() as usize;
        let code = r.read_u8().unwrap();
        let payload = r.read_raw(len - 1).unwrap();
        (code, payload)
    }

    #[test]
    fn branch_level_and_root_round_trip() {
        let (code, payload) = body(branch_level(3));
        assert_eq!(
            DistributedMessage::decode(code, payload).unwrap(),
            DistributedMessage::BranchLevel(3)
        );

        let (code, payload) = body(branch_root("root-user"));
        assert_eq!(
            DistributedMessage::decode(code, payload).unwrap(),
            DistributedMessage::BranchRoot("root-user".to_string())
        );
    }

    #[test]
    fn search_request_round_trips() {
        let (code, payload) = body(search_request("alice", 7, "foo bar"));
        assert_eq!(
            DistributedMessage::decode(code, payload).unwrap(),
            DistributedMessage::SearchRequest {
                username: "alice".to_string(),
                token: 7,
                query: "foo bar".to_string(),
            }
        );
    }

    #[test]
    fn unknown_code_is_forwarded() {
        let decoded = DistributedMessage::decode(255, Bytes::from_static(b"x")).unwrap();
        assert_eq!(
            decoded,
            DistributedMessage::Unknown {
                code: 255,
                payload: Bytes::from_static(b"x"),
            }
        );
    }
}

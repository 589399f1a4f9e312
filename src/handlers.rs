//! Message decoding and the small set of server-event reactions that don't
//! belong inside any one manager: turning a raw [`MessageEvent`] into a
//! typed domain message, and dialing back a peer who asked the server to
//! broker a connection to us.
//!
//! Deliberately has no dependency on [`crate::search`] or [`crate::transfer`]
//! — those sit above this module and hold the registries that decide what a
//! decoded message *means*; this module only knows how to decode one and how
//! to perform the one action (`ConnectToPeer` dial-back) no existing manager
//! owns.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time;

use crate::conf::Endpoint;
use crate::distributed_manager::DistributedConnectionManager;
use crate::error::Error;
use crate::peer_manager::PeerConnectionManager;
use crate::wire::{
    self,
    distributed::DistributedMessage,
    init::{InitMessage, PeerInitType},
    peer::{self, BrowseResponse, SlimSearchResponse, TransferRequest, TransferResponse, UserInfoResponse},
    server::ServerMessage,
};
use crate::{Token, Username};

/// A decoded peer-domain message, unified across the free-function decoders
/// in [`crate::wire::peer`] (which has no single enum of its own since most
/// of its types are independently round-tripped).
#[derive(Clone, Debug, PartialEq)]
pub enum PeerMessage {
    SharedFileListRequest,
    SharedFileList(BrowseResponse),
    SearchResponse(SlimSearchResponse),
    UserInfoRequest,
    UserInfoResponse(UserInfoResponse),
    FolderContentsRequest(String),
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    QueueDownload(String),
    PlaceInQueueResponse { filename: String, place: u32 },
    UploadFailed(String),
    QueueFailed { filename: String, reason: String },
    PlaceInQueueRequest(String),
    Unknown { code: u32, payload: Bytes },
}

/// Splits a message-connection payload (code prefix stripped by the wire
/// framing's length prefix alone) into its numeric code and body, per the
/// little-endian 4-byte-code convention every non-distributed domain uses.
fn split_code_u32(bytes: Bytes) -> Result<(u32, Bytes), wire::Error> {
    if bytes.len() < 4 {
        return Err(wire::Error::Truncated);
    }
    let code = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok((code, bytes.slice(4..)))
}

pub fn decode_server_message(bytes: Bytes) -> Result<ServerMessage, wire::Error> {
    let (code, payload) = split_code_u32(bytes)?;
    ServerMessage::decode(code, payload)
}

pub fn decode_distributed_message(bytes: Bytes) -> Result<DistributedMessage, wire::Error> {
    if bytes.is_empty() {
        return Err(wire::Error::Truncated);
    }
    DistributedMessage::decode(bytes[0], bytes.slice(1..))
}

pub fn decode_peer_message(bytes: Bytes) -> Result<PeerMessage, wire::Error> {
    let (code, payload) = split_code_u32(bytes)?;
    Ok(match code {
        peer::GET_SHARED_FILE_LIST => PeerMessage::SharedFileListRequest,
        peer::SHARED_FILE_LIST => PeerMessage::SharedFileList(BrowseResponse::decode(payload)?),
        peer::FILE_SEARCH_RESPONSE => PeerMessage::SearchResponse(SlimSearchResponse::decode(payload)?),
        peer::USER_INFO_REQUEST => PeerMessage::UserInfoRequest,
        peer::USER_INFO_RESPONSE => PeerMessage::UserInfoResponse(UserInfoResponse::decode(payload)?),
        peer::FOLDER_CONTENTS_REQUEST => {
            let mut r = wire::Reader::new(payload);
            PeerMessage::FolderContentsRequest(r.read_string()?)
        }
        peer::TRANSFER_REQUEST => PeerMessage::TransferRequest(TransferRequest::decode(payload)?),
        peer::TRANSFER_RESPONSE => PeerMessage::TransferResponse(TransferResponse::decode(payload)?),
        peer::QUEUE_DOWNLOAD => PeerMessage::QueueDownload(peer::decode_queue_download(payload)?),
        peer::PLACE_IN_QUEUE_RESPONSE => {
            let mut r = wire::Reader::new(payload);
            let filename = r.read_string()?;
            let place = r.read_u32()?;
            PeerMessage::PlaceInQueueResponse { filename, place }
        }
        peer::UPLOAD_FAILED => {
            let mut r = wire::Reader::new(payload);
            PeerMessage::UploadFailed(r.read_string()?)
        }
        peer::QUEUE_FAILED => {
            let mut r = wire::Reader::new(payload);
            let filename = r.read_string()?;
            let reason = r.read_string()?;
            PeerMessage::QueueFailed { filename, reason }
        }
        peer::PLACE_IN_QUEUE_REQUEST => {
            let mut r = wire::Reader::new(payload);
            PeerMessage::PlaceInQueueRequest(r.read_string()?)
        }
        _ => PeerMessage::Unknown { code, payload },
    })
}

/// Reacts to an inbound `ServerMessage::ConnectToPeer`: the remote couldn't
/// (or didn't try to) connect to us directly, so it asked the server to have
/// us dial it instead. We take the `direct_leg` role here — connect, send
/// `PierceFirewall`, then hand the raw socket to whichever manager owns
/// `typ`, exactly as if it had arrived through the listener.
pub async fn respond_to_connect_to_peer(
    peer_manager: &Arc<PeerConnectionManager>,
    distributed_manager: &Arc<DistributedConnectionManager>,
    connect_timeout: std::time::Duration,
    username: Username,
    typ: PeerInitType,
    endpoint: Endpoint,
    token: Token,
) -> Result<(), Error> {
    use tokio::io::AsyncWriteExt;

    let mut socket = time::timeout(connect_timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::from)?;
    let pierce = InitMessage::PierceFirewall { token }.encode();
    socket.write_all(&pierce).await.map_err(Error::from)?;

    match typ {
        PeerInitType::Peer => {
            peer_manager
                .add_message_connection(username, socket, endpoint)
                .await;
        }
        PeerInitType::Transfer => {
            peer_manager
                .add_transfer_connection(username, token, socket, endpoint)
                .await;
        }
        PeerInitType::Distributed => {
            distributed_manager
                .add_child_connection(username, token, socket, endpoint)
                .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Conf;
    use crate::wire::frame;
    use tokio::net::TcpListener;

    #[test]
    fn decode_peer_message_dispatches_queue_download() {
        let framed = peer::queue_download("song.flac");
        let mut r = wire::Reader::new(framed);
        let len = r.read_u32().unwrap() as usize;
        let payload = r.read_raw(len).unwrap();
        match decode_peer_message(payload).unwrap() {
            PeerMessage::QueueDownload(name) => assert_eq!(name, "song.flac"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn decode_peer_message_forwards_unknown_codes() {
        let framed = frame(&999_999u32.to_le_bytes(), b"xyz");
        let mut r = wire::Reader::new(framed);
        let len = r.read_u32().unwrap() as usize;
        let payload = r.read_raw(len).unwrap();
        match decode_peer_message(payload).unwrap() {
            PeerMessage::Unknown { code, .. } => assert_eq!(code, 999_999),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn decode_distributed_message_splits_single_byte_code() {
        let framed = wire::distributed::branch_level(5);
        let mut r = wire::Reader::new(framed);
        let len = r.read_u32().unwrap() as usize;
        let payload = r.read_raw(len).unwrap();
        assert_eq!(
            decode_distributed_message(payload).unwrap(),
            DistributedMessage::BranchLevel(5)
        );
    }

    #[tokio::test]
    async fn respond_to_connect_to_peer_installs_a_message_connection() {
        let conf = Conf::default();
        let waiter = Arc::new(crate::waiter::Waiter::new(conf.message_timeout));
        let connection_ids = Arc::new(crate::ConnectionIdAllocator::default());
        let tokens = Arc::new(crate::TokenAllocator::default());
        let (server_conn, _server_socket) =
            crate::peer_manager::tests::loopback_message_connection().await;
        let peer_manager = PeerConnectionManager::new(
            waiter,
            server_conn,
            connection_ids.clone(),
            tokens,
            conf.peer_connection_options,
            conf.message_timeout,
            "local".to_string(),
            None,
        );
        let distributed_manager = DistributedConnectionManager::new(
            peer_manager.clone(),
            connection_ids,
            conf.distributed_connection_options,
            conf.concurrent_distributed_children_limit,
            conf.parent_watchdog_period,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut listener = listener;
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut socket, &mut len_buf)
                .await
                .unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            tokio::io::AsyncReadExt::read_exact(&mut socket, &mut body)
                .await
                .unwrap();
        });

        respond_to_connect_to_peer(
            &peer_manager,
            &distributed_manager,
            std::time::Duration::from_secs(1),
            "remote".to_string(),
            PeerInitType::Peer,
            addr,
            42,
        )
        .await
        .unwrap();

        assert!(peer_manager.has_message_connection("remote").await);
    }
}

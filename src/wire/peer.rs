//! Peer domain: 4-byte message codes exchanged over a peer message
//! connection (the `"P"`-type connection negotiated via
//! [`super::init::PeerInitType::Peer`]).

use bytes::Bytes;

use super::{frame, Error, Reader, Writer};
use crate::{Token, Username};

pub const GET_SHARED_FILE_LIST: u32 = 4;
pub const SHARED_FILE_LIST: u32 = 5;
pub const FILE_SEARCH_RESPONSE: u32 = 9;
pub const USER_INFO_REQUEST: u32 = 15;
pub const USER_INFO_RESPONSE: u32 = 16;
pub const FOLDER_CONTENTS_REQUEST: u32 = 36;
pub const TRANSFER_REQUEST: u32 = 40;
pub const TRANSFER_RESPONSE: u32 = 41;
pub const QUEUE_DOWNLOAD: u32 = 43;
pub const PLACE_IN_QUEUE_RESPONSE: u32 = 44;
pub const UPLOAD_FAILED: u32 = 46;
pub const QUEUE_FAILED: u32 = 50;
pub const PLACE_IN_QUEUE_REQUEST: u32 = 51;

/// A single shared file entry, as exchanged in browse responses and search
/// results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub size: u64,
    pub extension: String,
    /// `(attribute type, value)` pairs, e.g. bitrate/duration/VBR flag.
    pub attrs: Vec<(u32, u32)>,
}

impl File {
    fn encode(&self, w: &mut Writer) {
        w.write_u8(1); // file code, constant in the real protocol
        w.write_string(&self.name);
        w.write_u64(self.size);
        w.write_string(&self.extension);
        w.write_u32(self.attrs.len() as u32);
        for (typ, value) in &self.attrs {
            w.write_u32(*typ);
            w.write_u32(*value);
        }
    }

    fn decode(r: &mut Reader) -> Result<Self, Error> {
        let _code = r.read_u8()?;
        let name = r.read_string()?;
        let size = r.read_u64()?;
        let extension = r.read_string()?;
        let attr_count = r.read_u32()?;
        let mut attrs = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            let typ = r.read_u32()?;
            let value = r.read_u32()?;
            attrs.push((typ, value));
        }
        Ok(File {
            name,
            size,
            extension,
            attrs,
        })
    }

    /// Skips a file entry without allocating its fields, returning nothing;
    /// used by [`SlimSearchResponse::decode`] to reach the trailer fields
    /// without materializing every file up front.
    fn skip(r: &mut Reader) -> Result<(), Error> {
        let _code = r.read_u8()?;
        r.skip_string()?;
        let _size = r.read_u64()?;
        r.skip_string()?;
        let attr_count = r.read_u32()?;
        for _ in 0..attr_count {
            let _ = r.read_u32()?;
            let _ = r.read_u32()?;
        }
        Ok(())
    }
}

/// A full directory listing, as returned by [`BrowseResponse`].
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BrowseResponse {
    pub directories: Vec<(String, Vec<File>)>,
}

impl BrowseResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new();
        w.write_u32(self.directories.len() as u32);
        for (name, files) in &self.directories {
            w.write_string(name);
            w.write_u32(files.len() as u32);
            for file in files {
                file.encode(&mut w);
            }
        }
        frame(&SHARED_FILE_LIST.to_le_bytes(), &w.into_bytes())
    }

    pub fn decode(payload: Bytes) -> Result<Self, Error> {
        let mut r = Reader::new(payload);
        let dir_count = r.read_u32()?;
        let mut directories = Vec::with_capacity(dir_count as usize);
        for _ in 0..dir_count {
            let name = r.read_string()?;
            let file_count = r.read_u32()?;
            let mut files = Vec::with_capacity(file_count as usize);
            for _ in 0..file_count {
                files.push(File::decode(&mut r)?);
            }
            directories.push((name, files));
        }
        Ok(Self { directories })
    }
}

/// A fully decoded search response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResponse {
    pub username: Username,
    pub token: Token,
    pub files: Vec<File>,
    pub free_upload_slots: bool,
    pub upload_speed: u32,
    pub queue_length: u32,
}

impl SearchResponse {
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new();
        w.write_string(&self.username);
        w.write_u32(self.token);
        w.write_u32(self.files.len() as u32);
        for file in &self.files {
            file.encode(&mut w);
        }
        w.write_bool(self.free_upload_slots);
        w.write_u32(self.upload_speed);
        w.write_u32(self.queue_length);
        frame(&FILE_SEARCH_RESPONSE.to_le_bytes(), &w.into_bytes())
    }
}

/// A partially decoded [`SearchResponse`]: the header and trailer fields
/// needed to evaluate [`crate::search::SearchOptions`] criteria are eagerly
/// parsed, while the file list is kept as an un-decoded byte range so a
/// response that fails the criteria never pays for allocating every file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlimSearchResponse {
    pub username: Username,
    pub token: Token,
    pub file_count: u32,
    pub free_upload_slots: bool,
    pub upload_speed: u32,
    pub queue_length: u32,
    files_raw: Bytes,
}

impl SlimSearchResponse {
    pub fn decode(payload: Bytes) -> Result<Self, Error> {
        let mut r = Reader::new(payload.clone());
        let username = r.read_string()?;
        let token = r.read_u32()?;
        let file_count = r.read_u32()?;
        let files_start = payload.len() - r.remaining();
        for _ in 0..file_count {
            File::skip(&mut r)?;
        }
        let files_end = payload.len() - r.remaining();
        let free_upload_slots = r.read_bool()?;
        let upload_speed = r.read_u32()?;
        let queue_length = r.read_u32()?;
        Ok(Self {
            username,
            token,
            file_count,
            free_upload_slots,
            upload_speed,
            queue_length,
            files_raw: payload.slice(files_start..files_end),
        })
    }

    /// Fully decodes the file list. Only called once a response has passed
    /// [`crate::search::SearchOptions`] criteria that don't require files.
    pub fn decode_files(&self) -> Result<Vec<File>, Error> {
        let mut r = Reader::new(self.files_raw.clone());
        let mut files = Vec::with_capacity(self.file_count as usize);
        for _ in 0..self.file_count {
            files.push(File::decode(&mut r)?);
        }
        Ok(files)
    }

    pub fn into_full(self) -> Result<SearchResponse, Error> {
        let files = self.decode_files()?;
        Ok(SearchResponse {
            username: self.username,
            token: self.token,
            files,
            free_upload_slots: self.free_upload_slots,
            upload_speed: self.upload_speed,
            queue_length: self.queue_length,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct UserInfoResponse {
    pub description: String,
    pub picture: Option<Bytes>,
    pub total_upload_count: u32,
    pub queue_size: u32,
    pub has_free_upload_slot: bool,
}

impl UserInfoResponse {
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new();
        w.write_string(&self.description);
        match &self.picture {
            Some(bytes) => {
                w.write_bool(true);
                w.write_u32(bytes.len() as u32);
                w.write_raw(bytes);
            }
            None => {
                w.write_bool(false);
            }
        }
        w.write_u32(self.total_upload_count);
        w.write_u32(self.queue_size);
        w.write_bool(self.has_free_upload_slot);
        frame(&USER_INFO_RESPONSE.to_le_bytes(), &w.into_bytes())
    }

    pub fn decode(payload: Bytes) -> Result<Self, Error> {
        let mut r = Reader::new(payload);
        let description = r.read_string()?;
        let has_picture = r.read_bool()?;
        let picture = if has_picture {
            let len = r.read_u32()? as usize;
            Some(r.read_raw(len)?)
        } else {
            None
        };
        let total_upload_count = r.read_u32()?;
        let queue_size = r.read_u32()?;
        let has_free_upload_slot = r.read_bool()?;
        Ok(Self {
            description,
            picture,
            total_upload_count,
            queue_size,
            has_free_upload_slot,
        })
    }
}

/// The direction-agnostic transfer request. `TransferRequest` doubles as
/// the peer-solicited-upload announcement and our own download request,
/// distinguished by the `direction` field (0 = upload from sender's
/// perspective, 1 = download).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: u32,
    pub token: Token,
    pub filename: String,
    pub file_size: Option<u64>,
}

impl TransferRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new();
        w.write_u32(self.direction);
        w.write_u32(self.token);
        w.write_string(&self.filename);
        if let Some(size) = self.file_size {
            w.write_u64(size);
        }
        frame(&TRANSFER_REQUEST.to_le_bytes(), &w.into_bytes())
    }

    pub fn decode(payload: Bytes) -> Result<Self, Error> {
        let mut r = Reader::new(payload);
        let direction = r.read_u32()?;
        let token = r.read_u32()?;
        let filename = r.read_string()?;
        let file_size = if r.remaining() >= 8 {
            Some(r.read_u64()?)
        } else {
            None
        };
        Ok(Self {
            direction,
            token,
            filename,
            file_size,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferResponse {
    pub token: Token,
    pub allowed: bool,
    /// Set when `allowed` is true and this is an upload-direction response:
    /// the size of the file about to be sent.
    pub file_size: Option<u64>,
    /// Set when `allowed` is false: the user-visible rejection reason.
    pub reason: Option<String>,
}

impl TransferResponse {
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new();
        w.write_u32(self.token);
        w.write_bool(self.allowed);
        if self.allowed {
            w.write_u64(self.file_size.unwrap_or_default());
        } else {
            w.write_string(self.reason.as_deref().unwrap_or(""));
        }
        frame(&TRANSFER_RESPONSE.to_le_bytes(), &w.into_bytes())
    }

    pub fn decode(payload: Bytes) -> Result<Self, Error> {
        let mut r = Reader::new(payload);
        let token = r.read_u32()?;
        let allowed = r.read_bool()?;
        if allowed {
            Ok(Self {
                token,
                allowed,
                file_size: Some(r.read_u64()?),
                reason: None,
            })
        } else {
            Ok(Self {
                token,
                allowed,
                file_size: None,
                reason: Some(r.read_string()?),
            })
        }
    }
}

pub fn queue_download(filename: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_string(filename);
    frame(&QUEUE_DOWNLOAD.to_le_bytes(), &w.into_bytes())
}

pub fn decode_queue_download(payload: Bytes) -> Result<String, Error> {
    Reader::new(payload).read_string()
}

pub fn upload_failed(filename: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_string(filename);
    frame(&UPLOAD_FAILED.to_le_bytes(), &w.into_bytes())
}

pub fn queue_failed(filename: &str, reason: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_string(filename);
    w.write_string(reason);
    frame(&QUEUE_FAILED.to_le_bytes(), &w.into_bytes())
}

pub fn place_in_queue_request(filename: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_string(filename);
    frame(&PLACE_IN_QUEUE_REQUEST.to_le_bytes(), &w.into_bytes())
}

pub fn place_in_queue_response(filename: &str, place: u32) -> Bytes {
    let mut w = Writer::new();
    w.write_string(filename);
    w.write_u32(place);
    frame(&PLACE_IN_QUEUE_RESPONSE.to_le_bytes(), &w.into_bytes())
}

pub fn get_shared_file_list() -> Bytes {
    frame(&GET_SHARED_FILE_LIST.to_le_bytes(), &[])
}

pub fn user_info_request() -> Bytes {
    frame(&USER_INFO_REQUEST.to_le_bytes(), &[])
}

pub fn folder_contents_request(folder: &str) -> Bytes {
    let mut w = Writer::new();
    w.write_string(folder);
    frame(&FOLDER_CONTENTS_REQUEST.to_le_bytes(), &w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(name: &str) -> File {
        File {
            name: name.to_string(),
            size: 1234,
            extension: "mp3".to_string(),
            attrs: vec![(0, 320), (1, 215)],
        }
    }

    #[test]
    fn search_response_round_trips() {
        let resp = SearchResponse {
            username: "carol".to_string(),
            token: 99,
            files: vec![sample_file("a.mp3"), sample_file("b.mp3")],
            free_upload_slots: true,
            upload_speed: 1_000_000,
            queue_length: 3,
        };
        let framed = resp.encode();
        let mut r = Reader::new(framed);
        let len = r.read_u32().unwrap() as usize;
        let code = r.read_u32().unwrap();
        assert_eq!(code, FILE_SEARCH_RESPONSE);
        let payload = r.read_raw(len - 4).unwrap();
        let slim = SlimSearchResponse::decode(payload).unwrap();
        assert_eq!(slim.username, "carol");
        assert_eq!(slim.token, 99);
        assert_eq!(slim.file_count, 2);
        assert!(slim.free_upload_slots);
        assert_eq!(slim.upload_speed, 1_000_000);
        assert_eq!(slim.queue_length, 3);
        let full = slim.into_full().unwrap();
        assert_eq!(full, resp);
    }

    #[test]
    fn slim_response_skips_files_without_decoding_them() {
        let resp = SearchResponse {
            username: "dan".to_string(),
            token: 1,
            files: vec![sample_file("only.flac")],
            free_upload_slots: false,
            upload_speed: 0,
            queue_length: 50,
        };
        let framed = resp.encode();
        let mut r = Reader::new(framed);
        let len = r.read_u32().unwrap() as usize;
        let _code = r.read_u32().unwrap();
        let payload = r.read_raw(len - 4).unwrap();
        let slim = SlimSearchResponse::decode(payload).unwrap();
        // trailer fields are available without ever calling decode_files
        assert_eq!(slim.queue_length, 50);
        assert_eq!(slim.decode_files().unwrap(), resp.files);
    }

    #[test]
    fn transfer_response_encodes_rejection_reason() {
        let resp = TransferResponse {
            token: 5,
            allowed: false,
            file_size: None,
            reason: Some("Queued".to_string()),
        };
        let framed = resp.encode();
        let mut r = Reader::new(framed);
        let len = r.read_u32().unwrap() as usize;
        let _code = r.read_u32().unwrap();
        let payload = r.read_raw(len - 4).unwrap();
        assert_eq!(TransferResponse::decode(payload).unwrap(), resp);
    }

    #[test]
    fn user_info_response_blank_default_has_no_picture() {
        let blank = UserInfoResponse::blank();
        assert!(blank.picture.is_none());
        assert_eq!(blank.description, "");
    }
}

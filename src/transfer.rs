//! Per-direction transfer state machine: token negotiation, progress
//! tracking, and the read/write loop that moves bytes once a transfer
//! connection is established.
//!
//! Actual file storage is out of this crate's scope (no file indexing or
//! share management, per the non-goals) — callers hand in anything
//! implementing `AsyncRead`/`AsyncWrite` as the local side of the transfer,
//! the same separation cratetorrent draws between its `PeerSession` (wire
//! I/O) and its `disk` actor (storage I/O).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::cancel::CancellationToken;
use crate::conf::Endpoint;
use crate::error::Error;
use crate::flags::bitset;
use crate::peer_manager::PeerConnectionManager;
use crate::wire::peer::{self, TransferRequest, TransferResponse};
use crate::{wait_key, Token, Username};

bitset! {
    /// Phase and completion reason combined into one flag set, checked
    /// with bitwise tests rather than string comparisons.
    pub struct TransferState: u16 {
        NONE = 0;
        QUEUED = 1 << 0;
        REQUESTED = 1 << 1;
        INITIALIZING = 1 << 2;
        IN_PROGRESS = 1 << 3;
        COMPLETED = 1 << 4;
        SUCCEEDED = 1 << 5;
        CANCELLED = 1 << 6;
        TIMED_OUT = 1 << 7;
        ERRORED = 1 << 8;
        REJECTED = 1 << 9;
        ABORTED = 1 << 10;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Clone, Copy, Debug)]
pub struct TransferOptions {
    /// Minimum spacing between two `average_speed` recomputations; successive
    /// `update_progress` calls inside this window still advance
    /// `bytes_transferred` but don't recompute the rate.
    pub progress_update_limit: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            progress_update_limit: Duration::from_millis(500),
        }
    }
}

struct ProgressState {
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    last_speed_sample: Instant,
    last_speed_bytes: u64,
    average_speed: f64,
}

/// Per-transfer state, progress statistics, and the byte counters its
/// progress rules are defined over.
pub struct TransferInternal {
    pub direction: Direction,
    pub username: Username,
    pub filename: String,
    pub token: Token,
    remote_token: Mutex<Option<Token>>,
    state: Mutex<TransferState>,
    size: Mutex<Option<u64>>,
    bytes_transferred: AtomicU64,
    exception: Mutex<Option<String>>,
    options: TransferOptions,
    progress: Mutex<ProgressState>,
}

impl TransferInternal {
    pub fn new(
        direction: Direction,
        username: Username,
        filename: String,
        token: Token,
        size: Option<u64>,
        start_offset: u64,
        options: TransferOptions,
    ) -> Self {
        let now = Instant::now();
        Self {
            direction,
            username,
            filename,
            token,
            remote_token: Mutex::new(None),
            state: Mutex::new(TransferState::NONE),
            size: Mutex::new(size),
            bytes_transferred: AtomicU64::new(start_offset),
            exception: Mutex::new(None),
            options,
            progress: Mutex::new(ProgressState {
                start_time: None,
                end_time: None,
                last_speed_sample: now,
                last_speed_bytes: start_offset,
                average_speed: 0.0,
            }),
        }
    }

    pub async fn state(&self) -> TransferState {
        *self.state.lock().await
    }

    pub async fn remote_token(&self) -> Option<Token> {
        *self.remote_token.lock().await
    }

    pub async fn size(&self) -> Option<u64> {
        *self.size.lock().await
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::SeqCst)
    }

    pub async fn percent_complete(&self) -> f64 {
        match *self.size.lock().await {
            Some(size) if size > 0 => {
                (self.bytes_transferred() as f64 / size as f64) * 100.0
            }
            _ => 0.0,
        }
    }

    pub async fn elapsed_time(&self) -> Option<Duration> {
        let progress = self.progress.lock().await;
        progress
            .start_time
            .map(|start| progress.end_time.unwrap_or_else(Instant::now) - start)
    }

    pub async fn average_speed(&self) -> f64 {
        self.progress.lock().await.average_speed
    }

    pub async fn remaining_time(&self) -> Option<Duration> {
        let speed = self.average_speed().await;
        let size = (*self.size.lock().await)?;
        if speed <= 0.0 {
            return None;
        }
        let remaining_bytes = size.saturating_sub(self.bytes_transferred()) as f64;
        Some(Duration::from_secs_f64(remaining_bytes / speed))
    }

    pub async fn exception(&self) -> Option<String> {
        self.exception.lock().await.clone()
    }

    async fn set_state(&self, new_state: TransferState) {
        *self.state.lock().await = new_state;
    }

    pub async fn mark_queued(&self) {
        self.set_state(TransferState::QUEUED).await;
    }

    pub async fn mark_requested(&self) {
        self.set_state(TransferState::REQUESTED).await;
    }

    pub async fn mark_initializing(&self, remote_token: Token) {
        *self.remote_token.lock().await = Some(remote_token);
        self.set_state(TransferState::INITIALIZING).await;
    }

    /// Transitions into `InProgress`, recording `start_time` the first time
    /// this is called.
    pub async fn mark_in_progress(&self) {
        {
            let mut progress = self.progress.lock().await;
            if progress.start_time.is_none() {
                progress.start_time = Some(Instant::now());
            }
        }
        self.set_state(TransferState::IN_PROGRESS).await;
    }

    /// Overrides `bytes_transferred` to `offset`, priming the progress
    /// baseline so the next `update_progress` computes a correct rate.
    pub async fn set_start_offset(&self, offset: u64) {
        self.bytes_transferred.store(offset, Ordering::SeqCst);
        let mut progress = self.progress.lock().await;
        progress.last_speed_bytes = offset;
        progress.last_speed_sample = Instant::now();
    }

    /// Advances `bytes_transferred` by `n` and, if `progress_update_limit`
    /// has elapsed since the last sample, recomputes `average_speed`.
    pub async fn update_progress(&self, n: u64) {
        let total = self.bytes_transferred.fetch_add(n, Ordering::SeqCst) + n;
        let mut progress = self.progress.lock().await;
        let elapsed = progress.last_speed_sample.elapsed();
        if elapsed >= self.options.progress_update_limit {
            let delta = total.saturating_sub(progress.last_speed_bytes) as f64;
            progress.average_speed = delta / elapsed.as_secs_f64();
            progress.last_speed_bytes = total;
            progress.last_speed_sample = Instant::now();
        }
    }

    /// Transitions into `Completed|reason`, the first time setting
    /// `end_time` and backfilling `start_time` if it was never set.
    pub async fn complete(&self, reason: TransferState) {
        {
            let mut progress = self.progress.lock().await;
            if progress.end_time.is_none() {
                let now = Instant::now();
                progress.end_time = Some(now);
                if progress.start_time.is_none() {
                    progress.start_time = Some(now);
                }
            }
        }
        self.set_state(TransferState::COMPLETED | reason).await;
    }

    pub async fn fail(&self, reason: TransferState, exception: impl Into<String>) {
        *self.exception.lock().await = Some(exception.into());
        self.complete(reason).await;
    }

    /// Requests the file, waits for acceptance, obtains a transfer
    /// connection, then streams `size` bytes into `sink`.
    pub async fn run_download(
        &self,
        peer_manager: &Arc<PeerConnectionManager>,
        endpoint: Endpoint,
        remote_token: Token,
        mut sink: impl AsyncWrite + Unpin,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        self.mark_requested().await;
        let mc = peer_manager
            .message_connection(self.username.clone(), endpoint)
            .await?;
        mc.write_message(peer::queue_download(&self.filename), cancel.clone())
            .await?;

        let (connection, chosen_token) = peer_manager
            .connect_transfer_for_download(self.username.clone(), endpoint, remote_token)
            .await?;
        self.mark_initializing(chosen_token).await;

        let offset = self.bytes_transferred();
        connection
            .write(Bytes::copy_from_slice(&offset.to_le_bytes()), cancel.clone())
            .await?;

        self.mark_in_progress().await;
        let size = self.size().await;
        let chunk = 64 * 1024usize;
        loop {
            if let Some(size) = size {
                if self.bytes_transferred() >= size {
                    break;
                }
            }
            let remaining = size.map(|s| (s - self.bytes_transferred()) as usize);
            let want = remaining.map(|r| r.min(chunk)).unwrap_or(chunk);
            if want == 0 {
                break;
            }
            match connection.read(want, cancel.clone()).await {
                Ok(bytes) => {
                    if let Err(e) = sink.write_all(&bytes).await {
                        self.fail(TransferState::ERRORED, e.to_string()).await;
                        return Err(Error::Io(e));
                    }
                    self.update_progress(bytes.len() as u64).await;
                }
                Err(e) => {
                    self.fail(TransferState::ERRORED, e.to_string()).await;
                    return Err(e.into());
                }
            }
        }
        self.complete(TransferState::SUCCEEDED).await;
        Ok(())
    }

    /// Mirror of [`Self::run_download`] for the upload direction: writes
    /// bytes read from `source` instead of reading them.
    pub async fn run_upload(
        &self,
        peer_manager: &Arc<PeerConnectionManager>,
        endpoint: Endpoint,
        mut source: impl AsyncRead + Unpin,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        self.mark_requested().await;
        let connection = peer_manager
            .connect_transfer_for_upload(self.username.clone(), endpoint, self.token)
            .await?;
        self.mark_initializing(self.token).await;

        let mut offset_buf = [0u8; 8];
        connection
            .read(8, cancel.clone())
            .await
            .map(|b| offset_buf.copy_from_slice(&b))?;
        let offset = u64::from_le_bytes(offset_buf);
        self.set_start_offset(offset).await;

        self.mark_in_progress().await;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    self.fail(TransferState::ERRORED, e.to_string()).await;
                    return Err(Error::Io(e));
                }
            };
            if let Err(e) = connection
                .write(Bytes::copy_from_slice(&buf[..n]), cancel.clone())
                .await
            {
                self.fail(TransferState::ERRORED, e.to_string()).await;
                return Err(e.into());
            }
            self.update_progress(n as u64).await;
        }
        self.complete(TransferState::SUCCEEDED).await;
        Ok(())
    }
}

/// Decodes an inbound [`TransferRequest`]/[`TransferResponse`] pair's
/// acceptance outcome into the `Waiter` key the lifecycle's step 3 awaits.
pub fn response_wait_key(direction: Direction, username: &Username, filename: &str, token: Token) -> crate::waiter::WaitKey {
    match direction {
        Direction::Download => wait_key!("Transfer", "Download", username, filename, token),
        Direction::Upload => wait_key!("Transfer", "Upload", username, filename, token),
    }
}

/// Builds the outbound `TransferRequest` announcing a queued upload to the
/// remote, the counterpart to an inbound `QueueDownload`.
pub fn announce_upload(token: Token, filename: &str, file_size: Option<u64>) -> TransferRequest {
    TransferRequest {
        direction: 0,
        token,
        filename: filename.to_string(),
        file_size,
    }
}

pub fn accept(token: Token, file_size: Option<u64>) -> TransferResponse {
    TransferResponse {
        token,
        allowed: true,
        file_size,
        reason: None,
    }
}

pub fn reject(token: Token, reason: impl Into<String>) -> TransferResponse {
    TransferResponse {
        token,
        allowed: false,
        file_size: None,
        reason: Some(reason.into()),
    }
}

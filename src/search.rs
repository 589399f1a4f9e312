//! Per-token search state: response aggregation against configurable
//! filters/limits, plus the structured-query parser/serializer used to
//! build and round-trip the wire `search_text`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, Notify};

use crate::cancel::CancellationToken;
use crate::flags::bitset;
use crate::wire::peer::{File, SearchResponse, SlimSearchResponse};
use crate::Token;

bitset! {
    /// Phase and completion reason combined into one flag set, checked with
    /// bitwise tests rather than string comparisons.
    pub struct SearchState: u16 {
        NONE = 0;
        IN_PROGRESS = 1 << 0;
        COMPLETED = 1 << 1;
        CANCELLED = 1 << 2;
        TIMED_OUT = 1 << 3;
        RESPONSE_LIMIT_REACHED = 1 << 4;
        FILE_LIMIT_REACHED = 1 << 5;
        ALL_SEARCH_REQUESTS_SENT = 1 << 6;
    }
}

/// Criteria and limits gating which responses a search keeps and when it
/// considers itself done.
#[derive(Clone)]
pub struct SearchOptions {
    pub filter_responses: bool,
    pub minimum_response_file_count: u32,
    /// The wire only carries a boolean "has a free upload slot"; a nonzero
    /// value here is treated as "require `free_upload_slots == true`".
    pub minimum_peer_free_upload_slots: u32,
    pub minimum_peer_upload_speed: u32,
    pub maximum_peer_queue_length: u32,
    pub file_filter: Option<Arc<dyn Fn(&File) -> bool + Send + Sync>>,
    pub response_limit: usize,
    pub file_limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            filter_responses: false,
            minimum_response_file_count: 0,
            minimum_peer_free_upload_slots: 0,
            minimum_peer_upload_speed: 0,
            maximum_peer_queue_length: u32::MAX,
            file_filter: None,
            response_limit: usize::MAX,
            file_limit: usize::MAX,
        }
    }
}

impl std::fmt::Debug for SearchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchOptions")
            .field("filter_responses", &self.filter_responses)
            .field("minimum_response_file_count", &self.minimum_response_file_count)
            .field("minimum_peer_free_upload_slots", &self.minimum_peer_free_upload_slots)
            .field("minimum_peer_upload_speed", &self.minimum_peer_upload_speed)
            .field("maximum_peer_queue_length", &self.maximum_peer_queue_length)
            .field("file_filter", &self.file_filter.as_ref().map(|_| "<fn>"))
            .field("response_limit", &self.response_limit)
            .field("file_limit", &self.file_limit)
            .finish()
    }
}

/// Per-token search state: accepts [`SlimSearchResponse`]s as they stream
/// in off peer connections and decides, one response at a time, whether to
/// keep them, and when enough have arrived to call the search done.
pub struct SearchInternal {
    search_text: String,
    token: Token,
    options: SearchOptions,
    state: Mutex<SearchState>,
    responses: Mutex<Vec<SearchResponse>>,
    file_count: AtomicU32,
    completion: Notify,
    response_received: Option<Arc<dyn Fn(&SearchResponse) + Send + Sync>>,
}

impl SearchInternal {
    pub fn new(search_text: impl Into<String>, token: Token, options: SearchOptions) -> Arc<Self> {
        Arc::new(Self {
            search_text: search_text.into(),
            token,
            options,
            state: Mutex::new(SearchState::IN_PROGRESS),
            responses: Mutex::new(Vec::new()),
            file_count: AtomicU32::new(0),
            completion: Notify::new(),
            response_received: None,
        })
    }

    pub fn with_response_received(
        search_text: impl Into<String>,
        token: Token,
        options: SearchOptions,
        callback: Arc<dyn Fn(&SearchResponse) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            search_text: search_text.into(),
            token,
            options,
            state: Mutex::new(SearchState::IN_PROGRESS),
            responses: Mutex::new(Vec::new()),
            file_count: AtomicU32::new(0),
            completion: Notify::new(),
            response_received: Some(callback),
        })
    }

    pub fn search_text(&self) -> &str {
        &self.search_text
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub async fn state(&self) -> SearchState {
        *self.state.lock().await
    }

    pub async fn responses(&self) -> Vec<SearchResponse> {
        self.responses.lock().await.clone()
    }

    fn response_meets_option_criteria(&self, slim: &SlimSearchResponse) -> bool {
        slim.file_count >= self.options.minimum_response_file_count
            && (self.options.minimum_peer_free_upload_slots == 0 || slim.free_upload_slots)
            && slim.upload_speed >= self.options.minimum_peer_upload_speed
            && slim.queue_length <= self.options.maximum_peer_queue_length
    }

    /// Evaluates one inbound response against the search's criteria and
    /// limits, possibly completing the search.
    pub async fn try_add_response(&self, slim: SlimSearchResponse) {
        {
            let state = self.state.lock().await;
            if !state.contains(SearchState::IN_PROGRESS) || slim.token != self.token {
                return;
            }
        }

        if self.options.filter_responses && !self.response_meets_option_criteria(&slim) {
            return;
        }

        let mut response = match slim.into_full() {
            Ok(r) => r,
            Err(_) => return,
        };

        if let Some(filter) = &self.options.file_filter {
            response.files.retain(|f| filter(f));
        }
        if self.options.filter_responses && response.files.is_empty() {
            return;
        }

        let added_files = response.files.len() as u32;
        if let Some(callback) = &self.response_received {
            callback(&response);
        }
        let response_count = {
            let mut responses = self.responses.lock().await;
            responses.push(response);
            responses.len()
        };
        let file_count = self.file_count.fetch_add(added_files, Ordering::SeqCst) + added_files;

        let mut state = self.state.lock().await;
        if !state.contains(SearchState::IN_PROGRESS) {
            return;
        }
        if file_count as usize >= self.options.file_limit {
            *state = SearchState::COMPLETED | SearchState::FILE_LIMIT_REACHED;
            drop(state);
            self.completion.notify_waiters();
        } else if response_count >= self.options.response_limit {
            *state = SearchState::COMPLETED | SearchState::RESPONSE_LIMIT_REACHED;
            drop(state);
            self.completion.notify_waiters();
        }
    }

    /// Called once every search request this token was going to generate
    /// (initial server broadcast plus any distributed rebroadcasts) has
    /// been sent, completing the search if nothing better has already.
    pub async fn mark_all_requests_sent(&self) {
        self.complete_with(SearchState::ALL_SEARCH_REQUESTS_SENT).await;
    }

    pub async fn cancel(&self) {
        self.complete_with(SearchState::CANCELLED).await;
    }

    pub(crate) async fn time_out(&self) {
        self.complete_with(SearchState::TIMED_OUT).await;
    }

    async fn complete_with(&self, reason: SearchState) {
        let mut state = self.state.lock().await;
        if state.contains(SearchState::COMPLETED) {
            return;
        }
        *state = SearchState::COMPLETED | reason;
        drop(state);
        self.completion.notify_waiters();
    }

    /// Suspends until the search reaches any `Completed` variant, or until
    /// `cancel` fires (in which case the search itself transitions to
    /// `Completed|Cancelled`).
    pub async fn wait_for_completion(&self, cancel: CancellationToken) -> SearchState {
        loop {
            {
                let state = self.state.lock().await;
                if state.contains(SearchState::COMPLETED) {
                    return *state;
                }
            }
            futures::select! {
                _ = self.completion.notified().fuse() => {}
                _ = cancel.cancelled().fuse() => {
                    self.cancel().await;
                }
            }
        }
    }
}

/// A parsed, structured search query: free-text terms plus the recognized
/// exclusion/constraint/flag syntax.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub query: String,
    pub exclusions: Vec<String>,
    pub minimum_bitrate: Option<u32>,
    pub minimum_file_size: Option<u64>,
    pub minimum_files_in_folder: Option<u32>,
    pub is_vbr: bool,
    pub is_cbr: bool,
}

/// Parses the raw wire `search_text` into a [`Query`]. Unrecognized numeric
/// constraints are silently discarded; everything not recognized as an
/// exclusion, constraint, or flag becomes part of the free-text `query`.
pub fn parse_query(text: &str) -> Query {
    let mut words = Vec::new();
    let mut exclusions = Vec::new();
    let mut minimum_bitrate = None;
    let mut minimum_file_size = None;
    let mut minimum_files_in_folder = None;
    let mut is_vbr = false;
    let mut is_cbr = false;

    for token in text.split_whitespace() {
        let lower = token.to_ascii_lowercase();
        if let Some(excl) = token.strip_prefix('-') {
            if !excl.is_empty() && !exclusions.contains(&excl.to_string()) {
                exclusions.push(excl.to_string());
            }
        } else if let Some(value) = lower.strip_prefix("mbr:") {
            if let Ok(n) = value.parse() {
                minimum_bitrate = Some(n);
            }
        } else if let Some(value) = lower.strip_prefix("mfs:") {
            if let Ok(n) = value.parse() {
                minimum_file_size = Some(n);
            }
        } else if let Some(value) = lower.strip_prefix("mfif:") {
            if let Ok(n) = value.parse() {
                minimum_files_in_folder = Some(n);
            }
        } else if lower == "isvbr" {
            is_vbr = true;
        } else if lower == "iscbr" {
            is_cbr = true;
        } else {
            words.push(token.to_string());
        }
    }

    Query {
        query: words.join(" "),
        exclusions,
        minimum_bitrate,
        minimum_file_size,
        minimum_files_in_folder,
        is_vbr,
        is_cbr,
    }
}

impl Query {
    /// Reconstructs the wire `search_text` in its fixed field order: bare
    /// terms and exclusions first, then the `filter:` qualifiers.
    pub fn serialize(&self) -> String {
        let mut out = self.query.clone();
        for excl in &self.exclusions {
            out.push_str(" -");
            out.push_str(excl);
        }
        if let Some(n) = self.minimum_bitrate {
            out.push_str(&format!(" mbr:{}", n));
        }
        if let Some(n) = self.minimum_file_size {
            out.push_str(&format!(" mfs:{}", n));
        }
        if let Some(n) = self.minimum_files_in_folder {
            out.push_str(&format!(" mfif:{}", n));
        }
        if self.is_vbr {
            out.push_str(" isvbr");
        }
        if self.is_cbr {
            out.push_str(" iscbr");
        }
        out
    }
}

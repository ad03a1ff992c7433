//! Search sessions: collect, filter, and aggregate responses for one token.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::{File, SearchResponse, SearchResponseSlim};
use crate::reader::MessageError;

pub type ResponseFilter = Arc<dyn Fn(&SearchResponse) -> bool + Send + Sync>;
pub type FileFilter = Arc<dyn Fn(&File) -> bool + Send + Sync>;

/// Acceptance criteria and completion limits for a search.
///
/// The numeric settings deserialize with their defaults; the two predicates
/// can only be set in code.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchOptions {
    /// Search only this user's shares.
    pub username: Option<String>,
    /// Seconds without an accepted response before the search times out.
    pub timeout_seconds: u64,
    pub response_limit: usize,
    pub file_limit: usize,
    pub filter_responses: bool,
    pub minimum_response_file_count: i32,
    pub minimum_peer_free_upload_slots: i32,
    pub maximum_peer_queue_length: i64,
    pub minimum_peer_upload_speed: i32,
    #[serde(skip)]
    pub response_filter: Option<ResponseFilter>,
    #[serde(skip)]
    pub file_filter: Option<FileFilter>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            username: None,
            timeout_seconds: 15,
            response_limit: 100,
            file_limit: 10_000,
            filter_responses: true,
            minimum_response_file_count: 1,
            minimum_peer_free_upload_slots: 0,
            maximum_peer_queue_length: 1_000_000,
            minimum_peer_upload_speed: 0,
            response_filter: None,
            file_filter: None,
        }
    }
}

impl std::fmt::Debug for SearchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchOptions")
            .field("username", &self.username)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("response_limit", &self.response_limit)
            .field("file_limit", &self.file_limit)
            .field("filter_responses", &self.filter_responses)
            .field("minimum_response_file_count", &self.minimum_response_file_count)
            .field("minimum_peer_free_upload_slots", &self.minimum_peer_free_upload_slots)
            .field("maximum_peer_queue_length", &self.maximum_peer_queue_length)
            .field("minimum_peer_upload_speed", &self.minimum_peer_upload_speed)
            .field("response_filter", &self.response_filter.is_some())
            .field("file_filter", &self.file_filter.is_some())
            .finish()
    }
}

impl SearchOptions {
    pub fn with_response_filter(
        mut self,
        filter: impl Fn(&SearchResponse) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.response_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_file_filter(mut self, filter: impl Fn(&File) -> bool + Send + Sync + 'static) -> Self {
        self.file_filter = Some(Arc::new(filter));
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Peer-level criteria, checked before any file is parsed.
    fn admits(&self, response: &SearchResponseSlim) -> bool {
        if !self.filter_responses {
            return true;
        }
        response.file_count >= self.minimum_response_file_count
            && i32::from(response.free_upload_slots) >= self.minimum_peer_free_upload_slots
            && response.queue_length <= self.maximum_peer_queue_length
            && response.upload_speed >= self.minimum_peer_upload_speed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchState {
    Requested,
    InProgress,
    Completed,
    TimedOut,
    Cancelled,
}

impl SearchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Cancelled)
    }
}

/// Notifications raised by a session, delivered on the channel given at creation.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    StateChanged {
        token: i32,
        previous: SearchState,
        state: SearchState,
    },
    ResponseReceived {
        token: i32,
        response: SearchResponse,
    },
}

struct Progress {
    state: SearchState,
    responses: Vec<SearchResponse>,
    file_count: usize,
    last_activity: Instant,
}

struct Inner {
    search_text: String,
    token: i32,
    options: SearchOptions,
    started_at: SystemTime,
    progress: Mutex<Progress>,
    state: watch::Sender<SearchState>,
    cancellation: CancellationToken,
    events: Option<mpsc::UnboundedSender<SearchEvent>>,
}

/// Handle to one outstanding search. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SearchSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SearchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSession")
            .field("search_text", &self.inner.search_text)
            .field("token", &self.inner.token)
            .field("state", &self.state())
            .finish()
    }
}

impl SearchSession {
    /// Create a session in `Requested`. Nothing runs until [`SearchSession::start`].
    pub fn new(
        search_text: impl Into<String>,
        token: i32,
        options: SearchOptions,
        events: Option<mpsc::UnboundedSender<SearchEvent>>,
    ) -> Self {
        let (state, _) = watch::channel(SearchState::Requested);
        Self {
            inner: Arc::new(Inner {
                search_text: search_text.into(),
                token,
                options,
                started_at: SystemTime::now(),
                progress: Mutex::new(Progress {
                    state: SearchState::Requested,
                    responses: Vec::new(),
                    file_count: 0,
                    last_activity: Instant::now(),
                }),
                state,
                cancellation: CancellationToken::new(),
                events,
            }),
        }
    }

    /// Move to `InProgress` and spawn the inactivity timer. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        {
            let mut progress = self.inner.lock();
            if progress.state != SearchState::Requested {
                return;
            }
            progress.last_activity = Instant::now();
            self.inner.transition(&mut progress, SearchState::InProgress);
        }
        tokio::spawn(run_timer(self.inner.clone()));
    }

    pub fn search_text(&self) -> &str {
        &self.inner.search_text
    }

    pub fn token(&self) -> i32 {
        self.inner.token
    }

    pub fn options(&self) -> &SearchOptions {
        &self.inner.options
    }

    pub fn started_at(&self) -> SystemTime {
        self.inner.started_at
    }

    pub fn state(&self) -> SearchState {
        self.inner.lock().state
    }

    /// Accepted responses, in arrival order.
    pub fn responses(&self) -> Vec<SearchResponse> {
        self.inner.lock().responses.clone()
    }

    pub fn file_count(&self) -> usize {
        self.inner.lock().file_count
    }

    /// The session's cancellation signal. Cancelling it ends the search as `Cancelled`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    /// Cancel the search. No-op once terminal.
    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
        let mut progress = self.inner.lock();
        self.inner.transition(&mut progress, SearchState::Cancelled);
    }

    /// Filter a response and, if accepted, append it. Returns whether it was kept.
    ///
    /// Files are only parsed for responses passing the peer-level criteria; a
    /// malformed file list is returned as an error and the response dropped.
    pub fn handle_incoming_response(
        &self,
        response: SearchResponseSlim,
    ) -> Result<bool, MessageError> {
        let token = self.inner.token;
        if self.state().is_terminal() {
            trace!(token, username = %response.username, "search is over, response discarded");
            return Ok(false);
        }

        let options = &self.inner.options;
        if !options.admits(&response) {
            trace!(token, username = %response.username, "response filtered out");
            return Ok(false);
        }

        let response = response.into_response()?;
        let response = match &options.file_filter {
            Some(keep) => {
                let files = response.files.iter().filter(|file| keep(*file)).cloned().collect();
                response.with_files(files)
            }
            None => response,
        };
        if let Some(keep) = &options.response_filter {
            if !keep(&response) {
                trace!(token, username = %response.username, "response rejected by filter");
                return Ok(false);
            }
        }

        let mut progress = self.inner.lock();
        if progress.state.is_terminal() {
            return Ok(false);
        }
        progress.file_count += response.file_count();
        progress.last_activity = Instant::now();
        progress.responses.push(response.clone());
        self.inner
            .emit(SearchEvent::ResponseReceived { token, response });

        if progress.responses.len() >= options.response_limit
            || progress.file_count >= options.file_limit
        {
            self.inner.transition(&mut progress, SearchState::Completed);
        }
        Ok(true)
    }

    /// Wait until the search is terminal and return the final state.
    pub async fn finished(&self) -> SearchState {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
        self.state()
    }

    /// Wait until the search is terminal, then return the accepted responses.
    /// Does not block the threads delivering responses.
    pub async fn wait_for_completion(&self) -> Vec<SearchResponse> {
        self.finished().await;
        self.responses()
    }

    /// Whether both handles refer to the same session.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SearchEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Apply a transition under the progress lock. Terminal states are final.
    fn transition(&self, progress: &mut Progress, state: SearchState) -> bool {
        let previous = progress.state;
        if previous.is_terminal() || previous == state {
            return false;
        }
        progress.state = state;
        self.state.send_replace(state);
        debug!(token = self.token, ?previous, ?state, "search state changed");
        self.emit(SearchEvent::StateChanged {
            token: self.token,
            previous,
            state,
        });
        true
    }

    fn finish(&self, state: SearchState) {
        let mut progress = self.lock();
        self.transition(&mut progress, state);
    }
}

/// Ends the search once `timeout` passes without an accepted response, or when cancelled.
async fn run_timer(inner: Arc<Inner>) {
    let timeout = inner.options.timeout();
    let mut state = inner.state.subscribe();
    loop {
        // a timeout past the clock's range never fires
        let deadline = inner.lock().last_activity.checked_add(timeout);
        let idle = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = inner.cancellation.cancelled() => {
                inner.finish(SearchState::Cancelled);
                return;
            }
            _ = state.wait_for(|s| s.is_terminal()) => return,
            _ = idle => {
                let idle_since = inner.lock().last_activity;
                if idle_since
                    .checked_add(timeout)
                    .is_some_and(|deadline| Instant::now() >= deadline)
                {
                    inner.finish(SearchState::TimedOut);
                    return;
                }
            }
        }
    }
}

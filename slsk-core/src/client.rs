//! Host-driven client: the host feeds received messages in and writes the
//! returned actions out. No I/O happens here.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::code::PeerCode;
use crate::protocol::{
    EnqueueDownloadRequest, FileSearchRequest, PlaceInQueueRequest, PlaceInQueueResponse,
    SearchResponse, SearchResponseSlim, TransferRequest, TransferRequestKind, TransferResponse,
    UploadDenied, UploadFailed, UserSearchRequest, WireMessage,
};
use crate::reader::{MessageError, MessageReader};
use crate::search::{SearchEvent, SearchOptions, SearchSession};
use crate::tracker::{TrackedTransfer, TransferTracker};
use crate::transfer::{Transfer, TransferDirection, TransferState};

/// Reason given when refusing a transfer that is untracked or already over.
const REFUSAL_CANCELLED: &str = "Cancelled";

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search text must not be empty")]
    EmptySearchText,
    #[error("a search with token {0} is already in progress")]
    DuplicateToken(i32),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Write the framed message to the named peer.
    SendMessage(String, Vec<u8>),
}

pub struct Client {
    searches: Arc<scc::HashMap<i32, SearchSession>>,
    transfers: TransferTracker,
    next_token: AtomicI32,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            searches: Arc::new(scc::HashMap::new()),
            transfers: TransferTracker::new(),
            next_token: AtomicI32::new(rand::thread_rng().gen_range(1..i32::MAX)),
        }
    }

    pub fn transfers(&self) -> &TransferTracker {
        &self.transfers
    }

    /// The active search registered under `token`, if any.
    pub fn search(&self, token: i32) -> Option<SearchSession> {
        self.searches.read(&token, |_, session| session.clone())
    }

    fn next_token(&self) -> i32 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Register and start a search, returning its handle and the server
    /// request to send. Without a `token` one is generated, skipping tokens in use.
    ///
    /// Must be called from within a tokio runtime. The session is
    /// unregistered once it reaches a terminal state.
    pub fn create_search(
        &self,
        search_text: &str,
        token: Option<i32>,
        options: SearchOptions,
        events: Option<mpsc::UnboundedSender<SearchEvent>>,
    ) -> Result<(SearchSession, Vec<u8>), SearchError> {
        if search_text.trim().is_empty() {
            return Err(SearchError::EmptySearchText);
        }

        let session = match token {
            Some(token) => {
                let session = SearchSession::new(search_text, token, options, events);
                self.searches
                    .insert(token, session.clone())
                    .map_err(|_| SearchError::DuplicateToken(token))?;
                session
            }
            None => loop {
                let token = self.next_token();
                let session =
                    SearchSession::new(search_text, token, options.clone(), events.clone());
                if self.searches.insert(token, session.clone()).is_ok() {
                    break session;
                }
            },
        };
        let token = session.token();

        let request = match &session.options().username {
            Some(username) => UserSearchRequest {
                username: username.clone(),
                token,
                search_text: search_text.to_owned(),
            }
            .to_bytes(),
            None => FileSearchRequest {
                token,
                search_text: search_text.to_owned(),
            }
            .to_bytes(),
        };
        let request = match request {
            Ok(request) => request,
            Err(error) => {
                self.searches.remove(&token);
                return Err(error.into());
            }
        };

        session.start();
        let searches = self.searches.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            let state = watched.finished().await;
            searches.remove_if(&token, |active| active.ptr_eq(&watched));
            debug!(token, ?state, "search finished");
        });

        debug!(token, search_text, "search started");
        Ok((session, request))
    }

    /// Wait for a search to finish and return its accepted responses in arrival order.
    pub async fn await_completion(&self, session: &SearchSession) -> Vec<SearchResponse> {
        session.wait_for_completion().await
    }

    /// Track a new download and build the request asking `username` to queue it.
    pub fn enqueue_download(
        &self,
        username: &str,
        filename: &str,
        cancellation: CancellationToken,
    ) -> Result<(TrackedTransfer, OutboundAction), MessageError> {
        let request = EnqueueDownloadRequest::new(filename).to_bytes()?;
        let mut transfer = Transfer::new(
            TransferDirection::Download,
            username,
            filename,
            self.next_token(),
        );
        let tracked = self
            .transfers
            .add_or_update(&transfer.transition(TransferState::Queued, None), cancellation);
        Ok((tracked, OutboundAction::SendMessage(username.to_owned(), request)))
    }

    /// Decode a message from a peer and route it. Malformed messages are
    /// logged and returned as errors without touching any state.
    pub fn on_message_received(
        &self,
        username: &str,
        bytes: impl Into<Bytes>,
    ) -> Result<Vec<OutboundAction>, MessageError> {
        self.route(username, bytes.into()).inspect_err(|error| {
            warn!(username, %error, "discarding malformed peer message");
        })
    }

    fn route(&self, username: &str, bytes: Bytes) -> Result<Vec<OutboundAction>, MessageError> {
        let raw = MessageReader::new(bytes.clone())?.read_code::<PeerCode>()?;
        let Ok(code) = PeerCode::try_from(raw) else {
            debug!(username, code = raw, "unknown peer message code");
            return Ok(Vec::new());
        };

        let mut actions = Vec::new();
        match code {
            PeerCode::SearchResponse => {
                let response = SearchResponseSlim::from_bytes(bytes)?;
                match self.search(response.token) {
                    Some(session) => {
                        session.handle_incoming_response(response)?;
                    }
                    None => debug!(
                        username,
                        token = response.token,
                        "search response for unknown token"
                    ),
                }
            }
            PeerCode::QueueDownload => {
                let request = EnqueueDownloadRequest::from_bytes(bytes)?;
                if self
                    .transfers
                    .get(TransferDirection::Upload, username, &request.filename)
                    .is_none()
                {
                    let mut transfer = Transfer::new(
                        TransferDirection::Upload,
                        username,
                        request.filename,
                        self.next_token(),
                    );
                    self.transfers.add_or_update(
                        &transfer.transition(TransferState::Queued, None),
                        CancellationToken::new(),
                    );
                }
            }
            PeerCode::PlaceInQueueRequest => {
                let request = PlaceInQueueRequest::from_bytes(bytes)?;
                if let Some(place_in_queue) = self.place_in_queue(username, &request.filename) {
                    let response = PlaceInQueueResponse {
                        filename: request.filename,
                        place_in_queue,
                    };
                    actions.push(OutboundAction::SendMessage(
                        username.to_owned(),
                        response.to_bytes()?,
                    ));
                }
            }
            PeerCode::TransferRequest => {
                let request = TransferRequest::from_bytes(bytes)?;
                let TransferRequestKind::Upload { size } = request.kind else {
                    debug!(username, filename = %request.filename, "ignoring legacy download request");
                    return Ok(actions);
                };
                let accepted = self.transfers.update(
                    TransferDirection::Download,
                    username,
                    &request.filename,
                    |transfer| {
                        if transfer.state.is_terminal() {
                            return false;
                        }
                        transfer.token = request.token;
                        transfer.size = size;
                        transfer.transition(TransferState::Initializing, None);
                        true
                    },
                );
                let response = match accepted {
                    Some(true) => TransferResponse::allowed(request.token, None),
                    Some(false) => {
                        debug!(username, filename = %request.filename, "refusing transfer for finished download");
                        TransferResponse::refused(request.token, REFUSAL_CANCELLED)
                    }
                    None => {
                        debug!(username, filename = %request.filename, "refusing untracked transfer");
                        TransferResponse::refused(request.token, REFUSAL_CANCELLED)
                    }
                };
                actions.push(OutboundAction::SendMessage(
                    username.to_owned(),
                    response.to_bytes()?,
                ));
            }
            PeerCode::UploadDenied => {
                let denied = UploadDenied::from_bytes(bytes)?;
                self.fail_download(username, &denied.filename, TransferState::Rejected, denied.message);
            }
            PeerCode::UploadFailed => {
                let failed = UploadFailed::from_bytes(bytes)?;
                self.fail_download(
                    username,
                    &failed.filename,
                    TransferState::Errored,
                    "Upload failed".to_owned(),
                );
            }
            other => debug!(username, code = ?other, "unhandled peer message"),
        }
        Ok(actions)
    }

    /// 1-based position of a queued upload among the user's queued uploads,
    /// in the order they were enqueued.
    fn place_in_queue(&self, username: &str, filename: &str) -> Option<i32> {
        let target = self
            .transfers
            .get(TransferDirection::Upload, username, filename)?
            .sequence();
        let ahead = self
            .transfers
            .tracked(TransferDirection::Upload, username)
            .iter()
            .take_while(|t| t.sequence() < target)
            .filter(|t| t.snapshot().state == TransferState::Queued)
            .count();
        i32::try_from(ahead + 1).ok()
    }

    fn fail_download(&self, username: &str, filename: &str, state: TransferState, message: String) {
        let updated = self
            .transfers
            .update(TransferDirection::Download, username, filename, |transfer| {
                transfer.transition(state, Some(message));
            });
        if updated.is_none() {
            debug!(username, filename, ?state, "no tracked download");
        }
    }

    /// Abandon every transfer to or from `username`: signal cancellation,
    /// then drop the entries. Returns how many entries were removed.
    pub fn on_peer_disconnected(&self, username: &str) -> usize {
        [TransferDirection::Download, TransferDirection::Upload]
            .into_iter()
            .map(|direction| {
                self.transfers.cancel_all(direction, username);
                self.transfers.try_remove(direction, username, None)
            })
            .sum()
    }
}

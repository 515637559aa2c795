//! Streaming chat over `/chat/stream`.
//!
//! One client owns at most one live stream session. Starting a send cancels
//! the previous session's token before the new request goes out; it does not
//! wait for the old task to wind down.

use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use reqwest::Response;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::auth::{AuthorizedTransport, error_from_response};
use crate::error::ClientError;
use crate::protocol::ChatRequest;
use crate::sse::{Chunk, SseDecoder};

const STREAM_PATH: &str = "/chat/stream";

#[derive(Debug)]
pub enum ChatEvent {
    Chunk(Chunk),
    /// Emitted once after the last chunk, also when the stream was aborted.
    Complete,
    Error(ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    Cancelled,
    Failed,
    /// Credentials were rejected even after a refresh. No event was emitted.
    SessionExpired,
}

#[derive(Clone)]
struct Session {
    id: Uuid,
    token: CancellationToken,
}

pub struct StreamingChatClient {
    transport: Arc<AuthorizedTransport>,
    current: Mutex<Option<Session>>,
}

impl StreamingChatClient {
    pub fn new(transport: Arc<AuthorizedTransport>) -> Self {
        Self {
            transport,
            current: Mutex::new(None),
        }
    }

    /// Sends one chat request and reports its output through `on_event`,
    /// in arrival order. `Complete` and `Error` are mutually exclusive and
    /// emitted at most once.
    pub async fn send<F, Fut>(&self, request: &ChatRequest, mut on_event: F) -> SendOutcome
    where
        F: FnMut(ChatEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let session = self.begin_session();
        let span = info_span!("chat_stream", session = %session.id);

        let outcome = self
            .run(request, &session.token, &mut on_event)
            .instrument(span)
            .await;

        self.end_session(session.id);
        outcome
    }

    /// Signals the current session's cancellation token. Output delivered
    /// so far stays valid; the send finishes with `Complete`.
    pub fn abort_stream(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(session) = current.as_ref() {
                debug!(session = %session.id, "aborting chat stream");
                session.token.cancel();
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.current
            .lock()
            .map(|current| current.is_some())
            .unwrap_or(false)
    }

    /// Runs `send` on a background task and exposes its events as a stream.
    pub fn spawn_send(self: &Arc<Self>, request: ChatRequest) -> ChatStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            client
                .send(&request, |event| {
                    let _ = tx.send(event);
                    std::future::ready(())
                })
                .await
        });

        ChatStream {
            events: UnboundedReceiverStream::new(rx),
            handle,
        }
    }

    fn begin_session(&self) -> Session {
        let session = Session {
            id: Uuid::new_v4(),
            token: CancellationToken::new(),
        };

        match self.current.lock() {
            Ok(mut current) => {
                if let Some(previous) = current.replace(session.clone()) {
                    debug!(session = %previous.id, "superseding chat stream");
                    previous.token.cancel();
                }
            }
            Err(_) => warn!("chat session slot poisoned; running without supersession"),
        }

        session
    }

    fn end_session(&self, id: Uuid) {
        if let Ok(mut current) = self.current.lock() {
            if current.as_ref().is_some_and(|session| session.id == id) {
                *current = None;
            }
        }
    }

    async fn run<F, Fut>(
        &self,
        request: &ChatRequest,
        token: &CancellationToken,
        on_event: &mut F,
    ) -> SendOutcome
    where
        F: FnMut(ChatEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let url = self.transport.url(STREAM_PATH);
        let dispatch = self
            .transport
            .send(|http| Ok(http.post(&url).multipart(request.to_form()?)));

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return cancelled(on_event).await,
            response = dispatch => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(ClientError::SessionExpired) => {
                debug!("chat stream ended by expired session");
                return SendOutcome::SessionExpired;
            }
            Err(_) if token.is_cancelled() => return cancelled(on_event).await,
            Err(err) => return failed(on_event, err).await,
        };

        if !response.status().is_success() {
            let err = error_from_response(response).await;
            return failed(on_event, err).await;
        }

        self.read_stream(response, token, on_event).await
    }

    async fn read_stream<F, Fut>(
        &self,
        response: Response,
        token: &CancellationToken,
        on_event: &mut F,
    ) -> SendOutcome
    where
        F: FnMut(ChatEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut body = pin!(response.bytes_stream());
        let mut decoder = SseDecoder::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return cancelled(on_event).await,
                next = body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    for chunk in decoder.feed(&bytes) {
                        if token.is_cancelled() {
                            return cancelled(on_event).await;
                        }
                        on_event(ChatEvent::Chunk(chunk)).await;
                    }
                }
                Some(Err(_)) if token.is_cancelled() => return cancelled(on_event).await,
                Some(Err(err)) => return failed(on_event, err.into()).await,
                None => break,
            }
        }

        for chunk in decoder.finish() {
            if token.is_cancelled() {
                return cancelled(on_event).await;
            }
            on_event(ChatEvent::Chunk(chunk)).await;
        }

        on_event(ChatEvent::Complete).await;
        SendOutcome::Completed
    }
}

async fn cancelled<F, Fut>(on_event: &mut F) -> SendOutcome
where
    F: FnMut(ChatEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    debug!("chat stream cancelled");
    on_event(ChatEvent::Complete).await;
    SendOutcome::Cancelled
}

async fn failed<F, Fut>(on_event: &mut F, err: ClientError) -> SendOutcome
where
    F: FnMut(ChatEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    warn!(error = %err, "chat stream failed");
    on_event(ChatEvent::Error(err)).await;
    SendOutcome::Failed
}

/// Events of a spawned send plus the task that produces them.
pub struct ChatStream {
    events: UnboundedReceiverStream<ChatEvent>,
    handle: JoinHandle<SendOutcome>,
}

impl ChatStream {
    pub async fn outcome(self) -> SendOutcome {
        drop(self.events);
        self.handle.await.unwrap_or(SendOutcome::Failed)
    }
}

impl Stream for ChatStream {
    type Item = ChatEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

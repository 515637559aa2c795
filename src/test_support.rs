//! In-process backend used by the async tests.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use futures::StreamExt;
use serde_json::{Value, json};

use crate::auth::{AuthorizedTransport, SessionExpiredHook};
use crate::credentials::{Credentials, MemoryCredentialStore};
use crate::protocol::{Conversation, Message, VideoStatus};

#[derive(Debug, Clone, Default)]
pub(crate) struct ChatScript {
    pub(crate) pieces: Vec<Vec<u8>>,
    pub(crate) hold_open: bool,
    pub(crate) stall: bool,
    pub(crate) failure: Option<(u16, Value)>,
}

impl ChatScript {
    pub(crate) fn pieces<I, P>(pieces: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            pieces: pieces.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Accepts the request but never sends response headers.
    pub(crate) fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    pub(crate) fn failing(status: u16, body: Value) -> Self {
        Self {
            failure: Some((status, body)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedChat {
    pub(crate) authorization: Option<String>,
    pub(crate) fields: HashMap<String, String>,
}

pub(crate) struct BackendState {
    valid_access: Mutex<String>,
    refresh_token: String,
    challenge_status: StatusCode,
    reject_all: bool,
    pub(crate) refresh_calls: AtomicUsize,
    authorizations: Mutex<Vec<Option<String>>>,
    chat_scripts: Mutex<VecDeque<ChatScript>>,
    pub(crate) chat_requests: Mutex<Vec<RecordedChat>>,
    pub(crate) conversations: Mutex<Vec<Conversation>>,
    pub(crate) messages: Mutex<HashMap<String, Vec<Message>>>,
    video_statuses: Mutex<VecDeque<VideoStatus>>,
    pub(crate) video_calls: Mutex<Vec<String>>,
    pub(crate) status_polls: AtomicUsize,
}

impl BackendState {
    pub(crate) fn new(valid_access: &str, refresh_token: &str) -> Self {
        Self {
            valid_access: Mutex::new(valid_access.to_string()),
            refresh_token: refresh_token.to_string(),
            challenge_status: StatusCode::UNAUTHORIZED,
            reject_all: false,
            refresh_calls: AtomicUsize::new(0),
            authorizations: Mutex::new(Vec::new()),
            chat_scripts: Mutex::new(VecDeque::new()),
            chat_requests: Mutex::new(Vec::new()),
            conversations: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            video_statuses: Mutex::new(VecDeque::new()),
            video_calls: Mutex::new(Vec::new()),
            status_polls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_challenge_status(mut self, status: u16) -> Self {
        self.challenge_status = StatusCode::from_u16(status).unwrap();
        self
    }

    pub(crate) fn rejecting_all(mut self) -> Self {
        self.reject_all = true;
        self
    }

    pub(crate) fn with_chat(self, script: ChatScript) -> Self {
        self.chat_scripts.lock().unwrap().push_back(script);
        self
    }

    pub(crate) fn with_video_statuses(self, statuses: Vec<VideoStatus>) -> Self {
        self.video_statuses.lock().unwrap().extend(statuses);
        self
    }

    pub(crate) fn authorizations(&self) -> Vec<Option<String>> {
        self.authorizations.lock().unwrap().clone()
    }

    pub(crate) fn chat_requests(&self) -> Vec<RecordedChat> {
        self.chat_requests.lock().unwrap().clone()
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        let header = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.authorizations.lock().unwrap().push(header.clone());

        let expected = format!("Bearer {}", self.valid_access.lock().unwrap());
        match header {
            Some(value) if !self.reject_all && value == expected => Ok(()),
            _ => Err(self.challenge_status),
        }
    }
}

pub(crate) struct MockBackend {
    pub(crate) base_url: String,
    pub(crate) state: Arc<BackendState>,
}

impl MockBackend {
    pub(crate) async fn start(state: BackendState) -> Self {
        let state = Arc::new(state);
        let api = axum::Router::new()
            .route("/chat/stream", post(chat_stream))
            .route("/auth/refresh", post(refresh))
            .route(
                "/conversations",
                get(list_conversations).post(create_conversation),
            )
            .route(
                "/conversations/:id",
                patch(rename_conversation).delete(delete_conversation),
            )
            .route("/conversations/:id/messages", get(list_messages))
            .route("/videos/upload", post(upload_video))
            .route("/videos/:id/transcribe", post(start_transcription))
            .route("/videos/:id/analyze", post(start_analysis))
            .route("/videos/:id/status", get(video_status));
        let app = axum::Router::new()
            .nest("/api", api)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/api", addr),
            state,
        }
    }
}

pub(crate) fn transport_for(
    backend: &MockBackend,
    access_token: &str,
    refresh_token: Option<&str>,
) -> (AuthorizedTransport, Arc<AtomicUsize>) {
    let store = Arc::new(MemoryCredentialStore::new(Credentials::new(
        access_token,
        refresh_token.map(str::to_string),
    )));
    let expired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&expired);
    let hook: SessionExpiredHook = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (
        AuthorizedTransport::new(&backend.base_url, store, hook),
        expired,
    )
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn chat_stream(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut fields = HashMap::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let value = match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let mime = field.content_type().unwrap_or_default().to_string();
                let bytes = field.bytes().await.unwrap_or_default();
                format!("file:{}:{}:{}", file_name, mime, bytes.len())
            }
            None => field.text().await.unwrap_or_default(),
        };
        fields.insert(name, value);
    }

    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    state.chat_requests.lock().unwrap().push(RecordedChat {
        authorization,
        fields,
    });

    let script = state
        .chat_scripts
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_default();

    if script.stall {
        futures::future::pending::<()>().await;
    }
    if let Some((status, body)) = script.failure {
        return (StatusCode::from_u16(status).unwrap(), Json(body)).into_response();
    }

    let pieces = futures::stream::iter(script.pieces).then(|piece| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, Infallible>(piece)
    });
    let body = if script.hold_open {
        Body::from_stream(pieces.chain(futures::stream::pending()))
    } else {
        Body::from_stream(pieces)
    };

    (StatusCode::OK, [(CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn refresh(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if header != Some(format!("Bearer {}", state.refresh_token).as_str()) {
        return error_json(StatusCode::UNAUTHORIZED, "invalid refresh token");
    }

    let access_token = state.valid_access.lock().unwrap().clone();
    Json(json!({ "access_token": access_token })).into_response()
}

async fn list_conversations(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    Json(state.conversations.lock().unwrap().clone()).into_response()
}

async fn create_conversation(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    let mut conversations = state.conversations.lock().unwrap();
    let conversation = Conversation {
        id: format!("c{}", conversations.len() + 1),
        title: body["title"].as_str().unwrap_or_default().to_string(),
        created_at: Some("2026-10-16T00:00:00Z".to_string()),
        updated_at: None,
    };
    conversations.push(conversation.clone());
    Json(conversation).into_response()
}

async fn rename_conversation(
    State(state): State<Arc<BackendState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    let mut conversations = state.conversations.lock().unwrap();
    match conversations.iter_mut().find(|c| c.id == id) {
        Some(conversation) => {
            conversation.title = body["title"].as_str().unwrap_or_default().to_string();
            Json(conversation.clone()).into_response()
        }
        None => error_json(StatusCode::NOT_FOUND, "conversation not found"),
    }
}

async fn delete_conversation(
    State(state): State<Arc<BackendState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    let mut conversations = state.conversations.lock().unwrap();
    let before = conversations.len();
    conversations.retain(|c| c.id != id);
    if conversations.len() == before {
        return error_json(StatusCode::NOT_FOUND, "conversation not found");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn list_messages(
    State(state): State<Arc<BackendState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    let messages = state
        .messages
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_default();
    Json(messages).into_response()
}

async fn upload_video(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut description = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let bytes = field.bytes().await.unwrap_or_default();
                description.push(format!("{}={}:{}", name, file_name, bytes.len()));
            }
            None => {
                let text = field.text().await.unwrap_or_default();
                description.push(format!("{}={}", name, text));
            }
        }
    }

    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    state
        .video_calls
        .lock()
        .unwrap()
        .push(format!("upload {}", description.join(" ")));
    Json(json!({ "video_id": "v1" })).into_response()
}

async fn start_transcription(
    State(state): State<Arc<BackendState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    state
        .video_calls
        .lock()
        .unwrap()
        .push(format!("transcribe {}", id));
    Json(json!({ "ok": true })).into_response()
}

async fn start_analysis(
    State(state): State<Arc<BackendState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    state
        .video_calls
        .lock()
        .unwrap()
        .push(format!("analyze {}", id));
    Json(json!({ "ok": true })).into_response()
}

// Pops scripted statuses in order and repeats the last one.
async fn video_status(
    State(state): State<Arc<BackendState>>,
    Path(_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = state.authorize(&headers) {
        return error_json(status, "token expired");
    }
    state.status_polls.fetch_add(1, Ordering::SeqCst);
    let mut statuses = state.video_statuses.lock().unwrap();
    let status = if statuses.len() > 1 {
        statuses.pop_front()
    } else {
        statuses.front().cloned()
    };
    match status {
        Some(status) => Json(status).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "video not found"),
    }
}

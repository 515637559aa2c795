//! Client for the Nurture child-development backend: streamed AI chat,
//! conversation history and video analysis, all behind one bearer-token
//! session that refreshes itself once when the backend rejects it.

pub mod auth;
pub mod chat;
pub mod config;
pub mod conversations;
pub mod credentials;
pub mod error;
pub mod protocol;
pub mod sse;
pub mod video;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use auth::{AuthorizedTransport, SessionExpiredHook, login_redirect};
pub use chat::{ChatEvent, ChatStream, SendOutcome, StreamingChatClient};
pub use config::{ClientConfig, PollPolicy, VideoPollConfig};
pub use conversations::ConversationsApi;
pub use credentials::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use error::{ClientError, ClientResult};
pub use protocol::{
    ChatRequest, Conversation, HistoryTurn, ImageAttachment, Message, VideoStage, VideoStatus,
};
pub use sse::Chunk;
pub use video::VideoClient;

/// Every API surface shares one transport, so a refresh made by one caller
/// is seen by the others.
pub struct NurtureClient {
    config: ClientConfig,
    transport: Arc<AuthorizedTransport>,
    chat: Arc<StreamingChatClient>,
    conversations: ConversationsApi,
    videos: VideoClient,
}

impl NurtureClient {
    pub fn new(config: ClientConfig) -> Self {
        let store = Arc::new(FileCredentialStore::new(config.credentials_path.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Self {
        let hook = login_redirect(config.login_url.clone());
        Self::with_parts(config, store, hook)
    }

    pub fn with_parts(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        on_session_expired: SessionExpiredHook,
    ) -> Self {
        let transport = Arc::new(AuthorizedTransport::new(
            &config.base_url,
            store,
            on_session_expired,
        ));

        Self {
            chat: Arc::new(StreamingChatClient::new(Arc::clone(&transport))),
            conversations: ConversationsApi::new(Arc::clone(&transport)),
            videos: VideoClient::new(Arc::clone(&transport), config.video),
            transport,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn chat(&self) -> &Arc<StreamingChatClient> {
        &self.chat
    }

    pub fn conversations(&self) -> &ConversationsApi {
        &self.conversations
    }

    pub fn videos(&self) -> &VideoClient {
        &self.videos
    }

    pub fn credentials(&self) -> ClientResult<Credentials> {
        self.transport.store().load()
    }

    pub fn login(&self, credentials: &Credentials) -> ClientResult<()> {
        self.transport.store().save(credentials)
    }

    pub fn logout(&self) -> ClientResult<()> {
        self.transport.store().clear()
    }
}

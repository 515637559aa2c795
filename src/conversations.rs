use std::sync::Arc;

use tracing::debug;

use crate::auth::AuthorizedTransport;
use crate::error::ClientResult;
use crate::protocol::{Conversation, ConversationTitle, HistoryTurn, Message};

pub struct ConversationsApi {
    transport: Arc<AuthorizedTransport>,
}

impl ConversationsApi {
    pub fn new(transport: Arc<AuthorizedTransport>) -> Self {
        Self { transport }
    }

    pub async fn list(&self) -> ClientResult<Vec<Conversation>> {
        self.transport.get_json("/conversations").await
    }

    pub async fn create(&self, title: &str) -> ClientResult<Conversation> {
        let conversation: Conversation = self
            .transport
            .post_json("/conversations", &ConversationTitle { title })
            .await?;
        debug!(conversation = %conversation.id, "conversation created");
        Ok(conversation)
    }

    pub async fn rename(&self, id: &str, title: &str) -> ClientResult<Conversation> {
        self.transport
            .patch_json(&format!("/conversations/{}", id), &ConversationTitle { title })
            .await
    }

    pub async fn delete(&self, id: &str) -> ClientResult<()> {
        self.transport
            .delete(&format!("/conversations/{}", id))
            .await?;
        debug!(conversation = %id, "conversation deleted");
        Ok(())
    }

    pub async fn messages(&self, id: &str) -> ClientResult<Vec<Message>> {
        self.transport
            .get_json(&format!("/conversations/{}/messages", id))
            .await
    }

    /// Stored thread as chat history, oldest first.
    pub async fn history(&self, id: &str) -> ClientResult<Vec<HistoryTurn>> {
        let messages = self.messages(id).await?;
        Ok(messages.iter().map(HistoryTurn::from).collect())
    }
}

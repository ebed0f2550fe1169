use revchat_protocol::openai::ChatMessage;

/// One logical chat-completion request, already routed to a back-end. The
/// model id keeps its backend prefix (`You.com:`, `X.ai:`, `Grok.com:`);
/// adapters strip it before talking upstream.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// The message the upstream actually receives as the "query". History
    /// travels through back-end-specific side channels.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(|m| m.content.as_str())
    }
}

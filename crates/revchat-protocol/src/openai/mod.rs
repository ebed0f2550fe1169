pub mod chat;
pub mod models;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, ChunkDelta, Usage,
};
pub use models::{ModelInfo, ModelList};

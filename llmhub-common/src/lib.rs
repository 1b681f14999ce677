//! LLMHub Common Types
//!
//! Shared types used by the provider and consumer tooling.

pub mod chat;
pub mod protocol;
pub mod status;

pub use chat::{
    ApiErrorResponse, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChatMessage, Choice, ModelEntry, ModelList, Usage,
};
pub use protocol::{
    GatewayMessage, Heartbeat, InferenceParams, InferenceResponse, ProviderMessage, Registration,
    RequestEnvelope, RequestError, StreamToken, PROVIDER_WS_PATH,
};
pub use status::{HealthResponse, ProviderStatus};

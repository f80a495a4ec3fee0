//! Request/response translation between the OpenAI Chat Completions wire
//! format and the Anthropic Messages format, plus the streaming pipelines
//! shared with the transparent proxy route.

pub mod openai_compat;
pub mod streaming;

pub use openai_compat::{
    AnthropicResponse, OpenAiChatRequest, scrub_browser_headers, transform_openai_request,
    transform_openai_response,
};
pub use streaming::{anthropic_to_openai_stream, passthrough_with_meter};

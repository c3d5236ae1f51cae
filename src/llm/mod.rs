//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）与按名构造

pub mod mock;
pub mod openai;
pub mod providers;
pub mod traits;

pub use mock::{MockLlmClient, MockReply};
pub use openai::OpenAiClient;
pub use providers::{ProviderRegistry, ProviderSettings};
pub use traits::{estimate_tokens, Completion, LlmClient, LlmError, Usage};

pub mod aistudio;
pub mod antigravity;
pub mod claude;
pub mod claudecode;
pub mod codex;
pub mod custom;
pub mod deepseek;
pub mod geminicli;
pub mod glm;
pub mod http_client;
pub mod iflow;
pub mod nvidia;
pub mod oauth_common;
pub mod openai;
pub mod qwen;
pub mod vertex;
pub mod vertexexpress;

pub use aistudio::AIStudioProvider;
pub use antigravity::AntigravityProvider;
pub use claude::ClaudeProvider;
pub use claudecode::ClaudeCodeProvider;
pub use codex::CodexProvider;
pub use custom::CustomProvider;
pub use deepseek::DeepSeekProvider;
pub use geminicli::GeminiCliProvider;
pub use glm::GlmProvider;
pub use iflow::IFlowProvider;
pub use nvidia::NvidiaProvider;
pub use openai::OpenAIProvider;
pub use qwen::QwenProvider;
pub use vertex::VertexProvider;
pub use vertexexpress::VertexExpressProvider;

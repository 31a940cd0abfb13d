//! Model and memory collaborators used by the agent runtime.

pub mod llm;
pub mod memory;

pub use llm::{
    LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, LlmRole, MockProvider,
    OpenAiCompatibleProvider,
};
pub use memory::{InMemoryMemory, Memory, MemoryEntry, MemoryError, GLOBAL_SCOPE};

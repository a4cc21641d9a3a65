mod client;
pub mod extract;
pub mod gate;
pub mod structured;
pub mod types;

pub use client::{ApiError, GeminiClient};
pub use gate::{Aborted, GateGenerator, LlmGate};
pub use structured::{
    GenerateOptions, ModelChain, ParseOutcome, StructuredClient, TextGenerator,
};
pub use types::{GenerateContentRequest, GenerateContentResponse, GenerationConfig};

pub mod article;
pub mod artifacts;
pub mod events;
pub mod image_prompt;
pub mod outline;
pub mod prompts;
pub mod repair;
pub mod research;
pub mod run;

use gemini_client::{StructuredClient, TextGenerator};

/// The structured LLM client the pipeline stages share. The generator is
/// boxed so per-request key overrides and test fakes plug in uniformly.
pub type Llm = StructuredClient<Box<dyn TextGenerator>>;

pub use events::{OutboundEvent, StageEmitter};
pub use run::{is_abort, PipelineDeps};

//! Independent image-prompt flow: one structured LLM call that yields either
//! slide descriptors or a free-form visual brief.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use briefwire_common::util::truncate_to_char_boundary;
use gemini_client::{GenerateOptions, ParseOutcome};

use crate::prompts;
use crate::Llm;

const MAX_SLIDES: usize = 5;
/// Article text is trimmed before prompting; the tail adds nothing visual.
const MAX_ARTICLE_CHARS: usize = 12_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlideDescriptor {
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub visual: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImagePromptPayload {
    Slides { slides: Vec<SlideDescriptor> },
    Brief { brief: String },
}

pub async fn generate_image_prompt(
    llm: &Llm,
    article: &str,
    cancel: &CancellationToken,
) -> Result<ImagePromptPayload> {
    let prompt = prompts::image_prompt(truncate_to_char_boundary(article, MAX_ARTICLE_CHARS));
    let opts = GenerateOptions {
        fallback_to_text: true,
        ..Default::default()
    };

    let outcome: ParseOutcome<ImagePromptPayload> =
        llm.generate_and_parse(&prompt, &opts, cancel).await?;

    Ok(match outcome {
        ParseOutcome::Parsed {
            value: ImagePromptPayload::Slides { mut slides },
            raw,
        } => {
            slides.truncate(MAX_SLIDES);
            if slides.is_empty() {
                ImagePromptPayload::Brief {
                    brief: raw.trim().to_string(),
                }
            } else {
                ImagePromptPayload::Slides { slides }
            }
        }
        ParseOutcome::Parsed { value, .. } => value,
        ParseOutcome::Fallback { raw } => ImagePromptPayload::Brief {
            brief: raw.trim().to_string(),
        },
    })
}

//! Instructions sent to the model for each correction stage.

use super::{StageSettings, StreamParams};
use crate::settings::ToneTarget;

const OUTPUT_RULES: &str = "RULES:
1. Output only the corrected text, nothing else
2. Keep the same meaning and intent
3. Keep the same number of sentences
4. Do NOT add new ideas or change the topic
5. Do NOT respond conversationally or explain your changes";

const NOISE_INSTRUCTION: &str = "You clean up fast, noisy typing.

The text was typed quickly, so letters may be transposed (teh -> the), missing (bcause -> because), \
doubled (writting -> writing), hit on an adjacent key (wprds -> words), or words may be run together \
or split apart.

Fix ONLY these typing errors. Do not change grammar, word choice or punctuation beyond that.";

const CONTEXT_INSTRUCTION: &str = "You fix grammar and coherence in the last part of a text.

You will be given the text that comes before it for reference. Use it to match tense, person and \
capitalization, but rewrite ONLY the final part.";

const REVIEW_INSTRUCTION: &str = "Answer ONLY with REASONABLE or UNREASONABLE.";

fn review_message(original: &str, proposal: &str) -> String {
    format!(
        "You are checking whether a rewrite of quickly typed text is reasonable.

ORIGINAL: {}

REWRITE: {}

Is this rewrite REASONABLE? Consider:
- Does it keep the apparent meaning and topic?
- Does it keep a similar structure (sentence count)?
- Is it what someone typing fast most likely meant?

Answer ONLY: REASONABLE or UNREASONABLE",
        original, proposal
    )
}

fn tone_instruction(target: ToneTarget) -> String {
    let style = match target {
        ToneTarget::None => "neutral",
        ToneTarget::Casual => "casual and relaxed",
        ToneTarget::Professional => "clear and professional",
        ToneTarget::Friendly => "warm and friendly",
        ToneTarget::Concise => "short and to the point",
    };
    format!(
        "You adjust the tone of a short passage so it reads as {}.\n\nChange wording only as much as the tone requires.",
        style
    )
}

/// System prompt for the stage described by `settings`.
pub fn system_prompt(settings: &StageSettings) -> String {
    let instruction = match settings {
        StageSettings::Noise { .. } => NOISE_INSTRUCTION.to_string(),
        StageSettings::Context { .. } => CONTEXT_INSTRUCTION.to_string(),
        StageSettings::Tone { target, .. } => tone_instruction(*target),
        StageSettings::Review { .. } => return REVIEW_INSTRUCTION.to_string(),
    };
    format!("{}\n\n{}", instruction, OUTPUT_RULES)
}

/// User message for a request: the span to rewrite, plus preceding context
/// for the context stage. A review carries the span and the rewrite instead.
pub fn user_message(params: &StreamParams) -> String {
    let region = params.region_text();
    if let StageSettings::Review { proposal, .. } = &params.settings {
        return review_message(region, proposal);
    }
    let before = params.context_before().trim();
    if before.is_empty() {
        format!("Text:\n{}", region)
    } else {
        format!("Preceding text (do not rewrite):\n{}\n\nText:\n{}", before, region)
    }
}

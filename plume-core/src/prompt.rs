use serde::{Deserialize, Serialize};

/// A positive/negative prompt pair. The two halves are only meaningful together.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub positive: String,
    pub negative: String,
}

impl Default for PromptPair {
    fn default() -> Self {
        Self {
            positive: "a scenic mountain landscape at golden hour, highly detailed, \
                       vivid colors, masterpiece, best quality"
                .to_string(),
            negative: "blurry, lowres, out of focus, deformed, disfigured, bad anatomy, \
                       extra limbs, poorly drawn, watermark, text"
                .to_string(),
        }
    }
}

impl PromptPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }

    /// Picks the prompts a request actually runs with.
    ///
    /// When either side is empty the whole pair is swapped for `defaults`, never just the
    /// empty half.
    pub fn resolve<'a>(
        positive: &'a str,
        negative: &'a str,
        defaults: &'a PromptPair,
    ) -> (&'a str, &'a str) {
        if positive.is_empty() || negative.is_empty() {
            (&defaults.positive, &defaults.negative)
        } else {
            (positive, negative)
        }
    }
}

//! Context compaction
//!
//! After every turn the rolling context is replaced, never appended to, by a
//! short summary of the prior context and the latest interaction. The size
//! bound is enforced on the model output itself, so it holds no matter what
//! the model returns.

use super::prompts;
use super::BoundedModel;
use crate::telemetry::preview;
use sdk::ArtifactKind;
use tracing::{debug, warn};

pub struct ContextCompactor {
    model: BoundedModel,
    word_budget: usize,
    char_budget: usize,
}

impl ContextCompactor {
    pub fn new(model: BoundedModel, word_budget: usize, char_budget: usize) -> Self {
        Self {
            model,
            word_budget,
            char_budget,
        }
    }

    /// New context replacing `prior_context`
    ///
    /// If the model call fails the prior context is kept (re-bounded).
    pub async fn compact(
        &self,
        prior_context: &str,
        request: &str,
        answer: &str,
        produced: &[ArtifactKind],
    ) -> String {
        let messages = prompts::compact(prior_context, request, answer, produced, self.word_budget);

        match self.model.text(messages).await {
            Ok(summary) => {
                let context = enforce_budget(&summary, self.word_budget, self.char_budget);
                debug!(
                    previous = %preview(prior_context, 100),
                    updated = %preview(&context, 100),
                    "Context compacted"
                );
                context
            }
            Err(e) => {
                warn!("Context compaction failed, keeping prior context: {}", e);
                enforce_budget(prior_context, self.word_budget, self.char_budget)
            }
        }
    }
}

/// Bound `text` to `word_budget` words, then to `char_budget` characters
///
/// Whitespace is normalized to single spaces. The char cut happens on a char
/// boundary.
pub fn enforce_budget(text: &str, word_budget: usize, char_budget: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().take(word_budget).collect();
    let joined = words.join(" ");

    if joined.chars().count() <= char_budget {
        joined
    } else {
        joined.chars().take(char_budget).collect::<String>().trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_text_untouched() {
        assert_eq!(enforce_budget("Unit T_01 pumps", 30, 240), "Unit T_01 pumps");
    }

    #[test]
    fn test_word_budget() {
        let text = "one two three four five";
        assert_eq!(enforce_budget(text, 3, 240), "one two three");
    }

    #[test]
    fn test_char_budget_on_char_boundary() {
        assert_eq!(enforce_budget("mantención ñandú", 30, 8), "mantenci");
        assert_eq!(enforce_budget("ñññ ñññ", 30, 4), "ñññ");
    }

    proptest! {
        #[test]
        fn prop_budget_always_holds(
            text in "\\PC{0,600}",
            words in 1usize..60,
            chars in 1usize..300,
        ) {
            let bounded = enforce_budget(&text, words, chars);
            prop_assert!(bounded.split_whitespace().count() <= words);
            prop_assert!(bounded.chars().count() <= chars);
        }
    }
}

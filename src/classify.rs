use crate::{
    error::Result,
    message::truncate_chars,
    service::{strip_code_fence, ChatModel, ChatRequest},
};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use tracing::trace;

const CLASSIFIER_PROMPT: &str = "You are a classifier. Determine if the following text contains a cooking recipe \
and select high-level food categories such as soup, meat, fish, vegetables, fermentation, desserts, experiments, beverages.\n\
Return JSON: {\"is_recipe\": true|false, \"categories\": [\"soup\", \"meat\", ...]}.\n\
Use lowercase categories; return empty list if uncertain.";

const CLASSIFIER_MAX_TOKENS: u32 = 150;

/// Synonyms folded into a canonical category name.
static CATEGORY_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("soups", "soup"),
        ("broth", "soup"),
        ("beef", "meat"),
        ("pork", "meat"),
        ("poultry", "meat"),
        ("chicken", "meat"),
        ("seafood", "fish"),
        ("vegetable", "vegetables"),
        ("salads", "salad"),
        ("side", "sides"),
        ("side dish", "sides"),
        ("sauces", "sauce"),
        ("dessert", "desserts"),
        ("bread", "baking"),
        ("fermented", "fermentation"),
        ("pickles", "fermentation"),
        ("beverage", "beverages"),
        ("drink", "beverages"),
        ("drinks", "beverages"),
        ("experiment", "experiments"),
    ]
    .into_iter()
    .collect()
});

/// Classifier verdict for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// The message contains a cooking recipe
    Recipe,
    /// Anything else
    NotRecipe,
}

/// Result of classifying one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Recipe or not
    pub label: Label,
    /// Canonical, deduplicated food categories
    pub categories: Vec<String>,
}

impl Classification {
    /// Returns true if the message was labeled as a recipe.
    #[must_use]
    pub fn is_recipe(&self) -> bool {
        self.label == Label::Recipe
    }
}

/// Decides whether message text is a recipe using a chat model.
pub(crate) struct Classifier<'a> {
    model: &'a dyn ChatModel,
    max_input_chars: usize,
}

impl<'a> Classifier<'a> {
    pub(crate) fn new(model: &'a dyn ChatModel, max_input_chars: usize) -> Self {
        Self {
            model,
            max_input_chars,
        }
    }

    /// Classifies the text with a single model call.
    ///
    /// # Errors
    ///
    /// Returns an error only if the model call itself fails; unparseable
    /// replies degrade to a prefix check.
    pub(crate) fn classify(&self, text: &str) -> Result<Classification> {
        let reply = self.model.complete(&ChatRequest {
            system: CLASSIFIER_PROMPT,
            user: truncate_chars(text, self.max_input_chars),
            max_tokens: CLASSIFIER_MAX_TOKENS,
        })?;

        let classification = parse_reply(&reply);
        trace!("Classified as {:?}", classification);
        Ok(classification)
    }
}

/// Parses a classifier reply.
///
/// Expects `{"is_recipe": bool, "categories": [...]}`; anything that is not
/// a JSON object counts as a recipe only if it starts with "recipe".
fn parse_reply(reply: &str) -> Classification {
    match serde_json::from_str::<Value>(strip_code_fence(reply)) {
        Ok(Value::Object(obj)) => {
            let is_recipe = match obj.get("is_recipe") {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
                _ => false,
            };
            let raw: Vec<String> = match obj.get("categories") {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Classification {
                label: if is_recipe { Label::Recipe } else { Label::NotRecipe },
                categories: normalize_categories(raw),
            }
        }
        _ => {
            let answer = reply.trim().to_lowercase();
            Classification {
                label: if answer.starts_with("recipe") {
                    Label::Recipe
                } else {
                    Label::NotRecipe
                },
                categories: Vec::new(),
            }
        }
    }
}

/// Lowercases, trims, maps synonyms and deduplicates categories, keeping
/// first-seen order.
#[must_use]
pub fn normalize_categories<I, S>(categories: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for raw in categories {
        let key = raw.as_ref().trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        let canonical = CATEGORY_ALIASES
            .get(key.as_str())
            .map_or(key.clone(), |c| (*c).to_string());
        if !normalized.contains(&canonical) {
            normalized.push(canonical);
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::service::testing::ScriptedChat;

    #[test]
    fn test_parse_json_reply() {
        let c = parse_reply(r#"{"is_recipe": true, "categories": ["Soups", "broth", "beef"]}"#);
        assert!(c.is_recipe());
        assert_eq!(c.categories, vec!["soup", "meat"]);
    }

    #[test]
    fn test_parse_fenced_reply() {
        let c = parse_reply("```json\n{\"is_recipe\": false, \"categories\": \"fish\"}\n```");
        assert_eq!(c.label, Label::NotRecipe);
        assert_eq!(c.categories, vec!["fish"]);
    }

    #[test]
    fn test_parse_plain_text_reply() {
        assert!(parse_reply("Recipe.").is_recipe());
        assert!(!parse_reply("not_recipe").is_recipe());
        assert!(parse_reply("recipe").categories.is_empty());
    }

    #[test]
    fn test_normalize_categories() {
        assert_eq!(
            normalize_categories(["  Drinks ", "beverage", "", "Side Dish", "tapas"]),
            vec!["beverages", "sides", "tapas"]
        );
    }

    #[test]
    fn test_classifier_truncates_input() {
        let model = ScriptedChat::new(|_| Ok(r#"{"is_recipe": true}"#.to_string()));
        let classifier = Classifier::new(&model, 5);

        let c = classifier.classify("tomato soup with basil").unwrap();
        assert!(c.is_recipe());
        assert_eq!(model.calls.lock().unwrap()[0], "tomat");
    }

    #[test]
    fn test_classifier_propagates_service_errors() {
        let model = ScriptedChat::new(|_| Err(Error::service("chat", "timeout")));
        let classifier = Classifier::new(&model, 100);
        assert!(classifier.classify("soup").is_err());
    }
}

use crate::{
    classify::Classifier,
    error::{Error, Result},
    message::{truncate_chars, Message},
    recipe::RecipeRecord,
    service::{strip_code_fence, ChatModel, ChatRequest},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

const EXTRACTION_PROMPT: &str = "Extract a structured cooking recipe from the text.\n\
Output strictly in the following JSON format:\n\n\
{\n  \"title\": \"\",\n  \"ingredients\": [],\n  \"steps\": [],\n  \"time\": \"\",\n  \"temperature\": \"\",\n  \"notes\": \"\"\n}";

const COMPLETION_PROMPT: &str = "You are improving an incomplete recipe. Using the provided text, produce a complete cooking recipe. \
If details are missing, infer plausible ingredients and steps consistent with the dish. \
Output strictly in JSON with non-empty title, at least 5 ingredients, and at least 3 steps:\n\n\
{\n  \"title\": \"\",\n  \"ingredients\": [],\n  \"steps\": [],\n  \"time\": \"\",\n  \"temperature\": \"\",\n  \"notes\": \"\"\n}";

const EXTRACTION_MAX_TOKENS: u32 = 500;
const COMPLETION_MAX_TOKENS: u32 = 700;
const MIN_INGREDIENTS: usize = 2;
const MIN_STEPS: usize = 2;

/// Recipe fields as returned by the extraction model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExtractedRecipe {
    /// Recipe title
    #[serde(deserialize_with = "lenient_string")]
    pub title: String,
    /// Ingredients, in order
    #[serde(deserialize_with = "lenient_list")]
    pub ingredients: Vec<String>,
    /// Steps, in order
    #[serde(deserialize_with = "lenient_list")]
    pub steps: Vec<String>,
    /// Total time
    #[serde(deserialize_with = "lenient_optional")]
    pub time: Option<String>,
    /// Cooking temperature
    #[serde(deserialize_with = "lenient_optional")]
    pub temperature: Option<String>,
    /// Notes
    #[serde(deserialize_with = "lenient_optional")]
    pub notes: Option<String>,
}

impl ExtractedRecipe {
    /// Parses a model reply, tolerating code fences and loose field types.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is not a JSON object.
    pub fn parse(reply: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(strip_code_fence(reply))
            .map_err(|e| Error::service("extraction", format!("unparseable reply: {e}")))?;
        if !value.is_object() {
            return Err(Error::service("extraction", "reply is not a JSON object"));
        }
        let recipe: Self = serde_json::from_value(value)?;
        Ok(recipe)
    }

    /// Returns true if the recipe has a title and enough ingredients and
    /// steps to be worth publishing.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.title.is_empty()
            && self.ingredients.len() >= MIN_INGREDIENTS
            && self.steps.len() >= MIN_STEPS
    }

    /// Combines the extracted fields with the source message.
    #[must_use]
    pub fn into_record(self, message: &Message, categories: Vec<String>) -> RecipeRecord {
        RecipeRecord {
            title: self.title,
            ingredients: self.ingredients,
            steps: self.steps,
            time: self.time,
            temperature: self.temperature,
            notes: self.notes,
            categories,
            created_at: message.timestamp,
            source_conversation_id: message.conversation_id.clone(),
            source_message_id: message.source_message_id(),
        }
    }
}

/// Tagged result of classifying and extracting one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// The message holds a recipe and it was extracted
    Recipe(RecipeRecord),
    /// The classifier says the message is not a recipe
    NotRecipe,
    /// A service call failed or the result was unusable
    Failed(String),
}

/// Classify-then-extract over a chat model.
///
/// Performs no deduplication; that belongs to the artifact writer.
pub(crate) struct Extractor<'a> {
    model: &'a dyn ChatModel,
    classifier: Classifier<'a>,
    max_input_chars: usize,
    complete_partial: bool,
}

impl<'a> Extractor<'a> {
    pub(crate) fn new(model: &'a dyn ChatModel, max_input_chars: usize, complete_partial: bool) -> Self {
        Self {
            model,
            classifier: Classifier::new(model, max_input_chars),
            max_input_chars,
            complete_partial,
        }
    }

    /// Runs both stages for one message.
    #[instrument(skip_all, fields(message = %message.identity()))]
    pub(crate) fn process(&self, message: &Message) -> ExtractionOutcome {
        let classification = match self.classifier.classify(&message.text) {
            Ok(c) => c,
            Err(e) => return ExtractionOutcome::Failed(format!("classification: {e}")),
        };

        if !classification.is_recipe() {
            return ExtractionOutcome::NotRecipe;
        }

        match self.extract(&message.text) {
            Ok(recipe) => {
                ExtractionOutcome::Recipe(recipe.into_record(message, classification.categories))
            }
            Err(e) => ExtractionOutcome::Failed(format!("extraction: {e}")),
        }
    }

    /// Extracts a complete recipe from the text.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails, the reply is unparseable, or the
    /// recipe is incomplete (after the optional completion pass).
    pub(crate) fn extract(&self, text: &str) -> Result<ExtractedRecipe> {
        let recipe = self.request(EXTRACTION_PROMPT, EXTRACTION_MAX_TOKENS, text)?;
        if recipe.is_complete() {
            return Ok(recipe);
        }

        if !self.complete_partial {
            return Err(Error::service("extraction", incomplete_reason(&recipe)));
        }

        debug!("Partial extraction ({}); requesting completion", incomplete_reason(&recipe));
        let completed = self.request(COMPLETION_PROMPT, COMPLETION_MAX_TOKENS, text)?;
        if completed.is_complete() {
            Ok(completed)
        } else {
            Err(Error::service(
                "extraction",
                format!("still {} after completion", incomplete_reason(&completed)),
            ))
        }
    }

    fn request(&self, system: &str, max_tokens: u32, text: &str) -> Result<ExtractedRecipe> {
        let reply = self.model.complete(&ChatRequest {
            system,
            user: truncate_chars(text, self.max_input_chars),
            max_tokens,
        })?;
        ExtractedRecipe::parse(&reply)
    }
}

fn incomplete_reason(recipe: &ExtractedRecipe) -> String {
    format!(
        "incomplete recipe (title: {}, {} ingredients, {} steps)",
        if recipe.title.is_empty() { "missing" } else { "present" },
        recipe.ingredients.len(),
        recipe.steps.len()
    )
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn lenient_string<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(scalar_text(&value).unwrap_or_default())
}

fn lenient_optional<'de, D: serde::Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(scalar_text(&value))
}

fn lenient_list<'de, D: serde::Deserializer<'de>>(
    d: D,
) -> std::result::Result<Vec<String>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        Value::String(s) => s
            .lines()
            .map(|line| line.trim().trim_start_matches(['-', '*']).trim())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    })
}

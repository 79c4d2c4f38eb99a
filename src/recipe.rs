use crate::message::IdentityKey;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Length of the message id prefix used in fallback slugs.
const FALLBACK_ID_CHARS: usize = 12;

/// A structured recipe ready to be published.
///
/// Optional fields are `None` when the source had nothing for them; they
/// are omitted from the artifact, never written as empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeRecord {
    /// Recipe title
    pub title: String,

    /// Ingredients, in order
    pub ingredients: Vec<String>,

    /// Preparation steps, in order
    pub steps: Vec<String>,

    /// Total time, free-form (e.g. "30 min")
    pub time: Option<String>,

    /// Cooking temperature, free-form (e.g. "180°C")
    pub temperature: Option<String>,

    /// Additional notes
    pub notes: Option<String>,

    /// Canonical food categories from classification
    pub categories: Vec<String>,

    /// Creation time of the source message; drives the date path
    pub created_at: DateTime<Utc>,

    /// Conversation the recipe was extracted from
    pub source_conversation_id: String,

    /// Message the recipe was extracted from
    pub source_message_id: String,
}

impl RecipeRecord {
    /// Returns the identity key of this record.
    #[must_use]
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.source_conversation_id, &self.source_message_id)
    }

    /// Returns the slug for this record, falling back to the message id
    /// when the title has no alphanumeric characters.
    #[must_use]
    pub fn slug(&self) -> String {
        let slug = slugify(&self.title);
        if !slug.is_empty() {
            return slug;
        }

        let prefix: String = self.source_message_id.chars().take(FALLBACK_ID_CHARS).collect();
        let id_slug = slugify(&prefix);
        if id_slug.is_empty() {
            "recipe".to_string()
        } else {
            format!("recipe-{id_slug}")
        }
    }

    /// Returns the frontmatter tags: `recipe` followed by the categories.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        std::iter::once("recipe".to_string())
            .chain(self.categories.iter().filter(|c| *c != "recipe").cloned())
            .collect()
    }
}

/// Normalizes a title into a filesystem and URL safe slug.
///
/// Lowercases, turns every run of non-alphanumeric characters into a single
/// hyphen, and trims hyphens from both ends. Letters outside ASCII are kept.
#[must_use]
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_hyphen = false;

    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    slug
}

/// Relative artifact path (without extension) for a date, slug and
/// disambiguator: `{YYYY}/{MM}/{DD}-{slug}` or `{YYYY}/{MM}/{DD}-{slug}-{n}`.
///
/// `n` of 0 or 1 means no suffix.
#[must_use]
pub(crate) fn dated_stem(date: &DateTime<Utc>, slug: &str, n: usize) -> PathBuf {
    let name = if n > 1 {
        format!("{}-{}-{}", date.format("%d"), slug, n)
    } else {
        format!("{}-{}", date.format("%d"), slug)
    };
    PathBuf::from(date.format("%Y").to_string())
        .join(date.format("%m").to_string())
        .join(name)
}

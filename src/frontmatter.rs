//! Recipe document format: a YAML frontmatter block followed by Markdown.
//!
//! Headers are written by hand rather than through a YAML serializer so the
//! field order and quoting are stable byte for byte, and so a single field
//! can be added later without reformatting the rest of the file.

use crate::{
    error::{Error, Result},
    message::IdentityKey,
    recipe::RecipeRecord,
};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

const DELIMITER: &str = "---";

/// Canonical header field order.
pub(crate) const FIELD_ORDER: &[&str] = &[
    "title",
    "date",
    "tags",
    "categories",
    "source_thread",
    "source_message_id",
    "image",
    "temperature",
    "time",
];

const INGREDIENT_HEADINGS: &[&str] = &["ingredients", "ингредиенты"];
const STEP_HEADINGS: &[&str] = &["steps", "шаги"];
const NOTE_HEADINGS: &[&str] = &["notes", "примечания"];

/// Renders the frontmatter block (including both delimiters) for a record.
///
/// Optional fields that are absent are left out entirely.
#[must_use]
pub(crate) fn render_header(record: &RecipeRecord) -> String {
    let mut out = String::from("---\n");
    push_field(&mut out, "title", &record.title);
    push_field(&mut out, "date", &record.created_at.to_rfc3339());
    push_list(&mut out, "tags", &record.tags());
    if !record.categories.is_empty() {
        push_list(&mut out, "categories", &record.categories);
    }
    push_field(&mut out, "source_thread", &record.source_conversation_id);
    push_field(&mut out, "source_message_id", &record.source_message_id);
    if let Some(temperature) = &record.temperature {
        push_field(&mut out, "temperature", temperature);
    }
    if let Some(time) = &record.time {
        push_field(&mut out, "time", time);
    }
    out.push_str("---\n");
    out
}

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("{key}: {}\n", quote(value)));
}

fn push_list(out: &mut String, key: &str, values: &[String]) {
    let items: Vec<String> = values.iter().map(|v| quote(v)).collect();
    out.push_str(&format!("{key}: [{}]\n", items.join(", ")));
}

/// Quotes a string as a YAML double-quoted scalar.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() || matches!(c, '\u{2028}' | '\u{2029}' | '\u{feff}') => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Ingredients, steps and notes read back from a recipe document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeSections {
    /// Ingredient lines
    pub ingredients: Vec<String>,
    /// Step lines without numbering
    pub steps: Vec<String>,
    /// Notes paragraph(s)
    pub notes: Option<String>,
}

/// A parsed recipe file.
#[derive(Debug, Clone)]
pub struct RecipeDocument {
    path: PathBuf,
    text: String,
    header: Range<usize>,
    body_start: usize,
    fields: Mapping,
}

impl RecipeDocument {
    /// Reads and parses a recipe file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or has no valid header.
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(path, text)
    }

    /// Parses recipe text read from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text has no frontmatter block or the block is
    /// not a YAML mapping.
    pub fn parse(path: impl Into<PathBuf>, text: String) -> Result<Self> {
        let path = path.into();
        let (header, body_start) = split(&text)
            .ok_or_else(|| Error::frontmatter(&path, "missing '---' delimited header"))?;

        let fields = match serde_yaml::from_str::<Value>(&text[header.clone()]) {
            Ok(Value::Mapping(mapping)) => mapping,
            Ok(Value::Null) => Mapping::new(),
            Ok(_) => return Err(Error::frontmatter(&path, "header is not a mapping")),
            Err(e) => return Err(Error::frontmatter(&path, e.to_string())),
        };

        Ok(Self {
            path,
            text,
            header,
            body_start,
            fields,
        })
    }

    /// Path the document was read from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Markdown body after the header.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.text[self.body_start..]
    }

    /// Returns a scalar header field as a trimmed, non-empty string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.fields.get(key).and_then(scalar_string)
    }

    /// Returns a list header field; a single scalar becomes a one-item list.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(Value::Sequence(items)) => items.iter().filter_map(scalar_string).collect(),
            Some(value) => scalar_string(value).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Recipe title, falling back to the file stem.
    #[must_use]
    pub fn title(&self) -> String {
        self.get_str("title").unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        })
    }

    /// Non-empty `image` field, if any.
    #[must_use]
    pub fn image(&self) -> Option<String> {
        self.get_str("image")
    }

    /// Identity key from `source_thread` and `source_message_id`.
    #[must_use]
    pub fn identity(&self) -> Option<IdentityKey> {
        Some(IdentityKey::new(
            self.get_str("source_thread")?,
            self.get_str("source_message_id")?,
        ))
    }

    /// Reads ingredients, steps and notes from the body sections, falling
    /// back to header fields of the same name.
    #[must_use]
    pub fn sections(&self) -> RecipeSections {
        let mut sections = parse_sections(self.body());
        if sections.ingredients.is_empty() {
            sections.ingredients = self.get_list("ingredients");
        }
        if sections.steps.is_empty() {
            sections.steps = self.get_list("steps");
        }
        if sections.notes.is_none() {
            sections.notes = self.get_str("notes");
        }
        sections
    }

    /// Returns the document text with `image` set to `url`.
    ///
    /// Only the image line changes: an existing blank `image:` line is
    /// replaced, otherwise a new line is inserted at its canonical position.
    /// Every other byte is preserved.
    #[must_use]
    pub fn with_image(&self, url: &str) -> String {
        let header = &self.text[self.header.clone()];
        let newline = if header.contains("\r\n") { "\r\n" } else { "\n" };
        let line = format!("image: {}{}", quote(url), newline);

        let keys = top_level_keys(header);
        let position = |key: &str| FIELD_ORDER.iter().position(|k| *k == key);
        let image_position = position("image").unwrap_or(FIELD_ORDER.len());

        // (start, end) of the byte range to replace, relative to the header
        let (start, end) = if let Some(i) = keys.iter().position(|(k, _)| k == "image") {
            let start = keys[i].1;
            let end = keys.get(i + 1).map_or(header.len(), |(_, offset)| *offset);
            (start, end)
        } else {
            let after = keys
                .iter()
                .enumerate()
                .filter(|(_, (k, _))| position(k.as_str()).is_some_and(|p| p < image_position))
                .map(|(i, _)| i)
                .last();
            let at = match after {
                Some(i) => keys.get(i + 1).map_or(header.len(), |(_, offset)| *offset),
                None => header.len(),
            };
            (at, at)
        };

        let start = self.header.start + start;
        let end = self.header.start + end;
        let mut out = String::with_capacity(self.text.len() + line.len());
        out.push_str(&self.text[..start]);
        out.push_str(&line);
        out.push_str(&self.text[end..]);
        out
    }
}

/// Locates the header block.
///
/// Returns the byte range of the header content (between the delimiters)
/// and the offset where the body starts.
fn split(text: &str) -> Option<(Range<usize>, usize)> {
    let first_line_end = text.find('\n')?;
    if text[..first_line_end].trim_end_matches('\r') != DELIMITER {
        return None;
    }

    let header_start = first_line_end + 1;
    let mut offset = header_start;
    for line in text[header_start..].split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            return Some((header_start..offset, offset + line.len()));
        }
        offset += line.len();
    }
    None
}

/// Top-level keys of a header with the byte offset of their line.
fn top_level_keys(header: &str) -> Vec<(String, usize)> {
    let mut keys = Vec::new();
    let mut offset = 0;
    for line in header.split_inclusive('\n') {
        let starts_block = line
            .chars()
            .next()
            .is_some_and(|c| !c.is_whitespace() && c != '-' && c != '#');
        if starts_block {
            if let Some((key, _)) = line.split_once(':') {
                keys.push((key.trim().trim_matches(['"', '\'']).to_string(), offset));
            }
        }
        offset += line.len();
    }
    keys
}

fn scalar_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Other,
    Ingredients,
    Steps,
    Notes,
}

fn parse_sections(body: &str) -> RecipeSections {
    let mut sections = RecipeSections::default();
    let mut notes: Vec<&str> = Vec::new();
    let mut current = Section::Other;

    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            let heading = heading.trim().to_lowercase();
            current = if INGREDIENT_HEADINGS.contains(&heading.as_str()) {
                Section::Ingredients
            } else if STEP_HEADINGS.contains(&heading.as_str()) {
                Section::Steps
            } else if NOTE_HEADINGS.contains(&heading.as_str()) {
                Section::Notes
            } else {
                Section::Other
            };
            continue;
        }

        match current {
            Section::Ingredients => {
                if let Some(item) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
                    sections.ingredients.push(item.trim().to_string());
                }
            }
            Section::Steps => {
                if let Some(step) = strip_step_number(trimmed) {
                    sections.steps.push(step.to_string());
                }
            }
            Section::Notes => notes.push(line),
            Section::Other => {}
        }
    }

    let notes = notes.join("\n");
    let notes = notes.trim();
    if !notes.is_empty() {
        sections.notes = Some(notes.to_string());
    }
    sections
}

/// Strips a leading `1.` / `1)` marker from a step line.
fn strip_step_number(line: &str) -> Option<&str> {
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let rest = line[digits..]
        .strip_prefix('.')
        .or_else(|| line[digits..].strip_prefix(')'))?;
    let step = rest.trim();
    (!step.is_empty()).then_some(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record() -> RecipeRecord {
        RecipeRecord {
            title: "Tomato \"Best\" Soup".to_string(),
            ingredients: vec!["tomatoes".to_string(), "salt".to_string()],
            steps: vec!["chop".to_string(), "simmer".to_string()],
            time: Some("30 min".to_string()),
            temperature: None,
            notes: None,
            categories: vec!["soup".to_string()],
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
            source_conversation_id: "c1".to_string(),
            source_message_id: "m1".to_string(),
        }
    }

    const DOC: &str = "---\ntitle: \"Tomato Soup\"\ndate: \"2024-03-05T10:00:00+00:00\"\n\
tags: [\"recipe\", \"soup\"]\nsource_thread: \"c1\"\nsource_message_id: \"m1\"\ntime: \"30 min\"\n---\n\n\
## Ingredients\n- tomatoes\n- salt\n\n## Steps\n1. Chop the tomatoes. Then rest.\n2. Simmer\n\n## Notes\nServe hot.\n";

    #[test]
    fn test_render_header_omits_absent_fields() {
        let header = render_header(&record());
        assert!(header.starts_with("---\ntitle: \"Tomato \\\"Best\\\" Soup\"\n"));
        assert!(header.contains("time: \"30 min\"\n"));
        assert!(header.contains("tags: [\"recipe\", \"soup\"]\n"));
        assert!(!header.contains("temperature"));
        assert!(!header.contains("image"));
        assert!(header.ends_with("---\n"));
    }

    #[test]
    fn test_rendered_header_parses_back() {
        let text = format!("{}\nbody\n", render_header(&record()));
        let doc = RecipeDocument::parse("a.md", text).unwrap();
        assert_eq!(doc.title(), "Tomato \"Best\" Soup");
        assert_eq!(doc.get_list("tags"), vec!["recipe", "soup"]);
        assert_eq!(doc.identity(), Some(IdentityKey::new("c1", "m1")));
        assert_eq!(doc.get_str("date").as_deref(), Some("2024-03-05T10:00:00+00:00"));
    }

    #[test]
    fn test_quote_escapes_control_characters() {
        assert_eq!(quote("a\nb\t\"c\"\\"), "\"a\\nb\\t\\\"c\\\"\\\\\"");
        assert_eq!(quote("\u{1}"), "\"\\u0001\"");
        let parsed: String = serde_yaml::from_str(&quote("line\u{2028}sep: x")).unwrap();
        assert_eq!(parsed, "line\u{2028}sep: x");
    }

    #[test]
    fn test_parse_requires_header() {
        assert!(RecipeDocument::parse("a.md", "# Soup\n".to_string()).is_err());
        assert!(RecipeDocument::parse("a.md", "---\ntitle: x\n".to_string()).is_err());
        assert!(RecipeDocument::parse("a.md", "---\n- a\n---\n".to_string()).is_err());
    }

    #[test]
    fn test_lenient_field_types() {
        let doc = RecipeDocument::parse(
            "a.md",
            "---\nsource_message_id: 42\ntags: soup\nimage: \"\"\n---\n".to_string(),
        )
        .unwrap();
        assert_eq!(doc.get_str("source_message_id").as_deref(), Some("42"));
        assert_eq!(doc.get_list("tags"), vec!["soup"]);
        assert_eq!(doc.image(), None);
        assert_eq!(doc.identity(), None);
    }

    #[test]
    fn test_sections() {
        let doc = RecipeDocument::parse("a.md", DOC.to_string()).unwrap();
        let sections = doc.sections();
        assert_eq!(sections.ingredients, vec!["tomatoes", "salt"]);
        assert_eq!(sections.steps, vec!["Chop the tomatoes. Then rest.", "Simmer"]);
        assert_eq!(sections.notes.as_deref(), Some("Serve hot."));
    }

    #[test]
    fn test_sections_fall_back_to_header_lists() {
        let doc = RecipeDocument::parse(
            "a.md",
            "---\ntitle: Борщ\ningredients:\n- свёкла\n- капуста\n---\n\n## Шаги\n1) Варить\n".to_string(),
        )
        .unwrap();
        let sections = doc.sections();
        assert_eq!(sections.ingredients, vec!["свёкла", "капуста"]);
        assert_eq!(sections.steps, vec!["Варить"]);
    }

    #[test]
    fn test_with_image_inserts_at_canonical_position() {
        let doc = RecipeDocument::parse("a.md", DOC.to_string()).unwrap();
        let patched = doc.with_image("/images/2024/03/05-tomato-soup.jpg");

        let expected = DOC.replace(
            "source_message_id: \"m1\"\n",
            "source_message_id: \"m1\"\nimage: \"/images/2024/03/05-tomato-soup.jpg\"\n",
        );
        assert_eq!(patched, expected);
    }

    #[test]
    fn test_with_image_after_multiline_field() {
        let text = "---\ntitle: Soup\ntags:\n  - recipe\n  - soup\nnotes: x\n---\nbody\n";
        let doc = RecipeDocument::parse("a.md", text.to_string()).unwrap();
        assert_eq!(
            doc.with_image("/i.jpg"),
            "---\ntitle: Soup\ntags:\n  - recipe\n  - soup\nimage: \"/i.jpg\"\nnotes: x\n---\nbody\n"
        );
    }

    #[test]
    fn test_with_image_replaces_blank_line() {
        let text = "---\ntitle: Soup\nimage:\ntime: 5 min\n---\nbody\n";
        let doc = RecipeDocument::parse("a.md", text.to_string()).unwrap();
        assert_eq!(
            doc.with_image("/i.jpg"),
            "---\ntitle: Soup\nimage: \"/i.jpg\"\ntime: 5 min\n---\nbody\n"
        );
    }

    #[test]
    fn test_with_image_appends_when_no_known_fields() {
        let text = "---\nlayout: post\n---\nbody\n";
        let doc = RecipeDocument::parse("a.md", text.to_string()).unwrap();
        assert_eq!(
            doc.with_image("/i.jpg"),
            "---\nlayout: post\nimage: \"/i.jpg\"\n---\nbody\n"
        );
    }

    #[test]
    fn test_strip_step_number() {
        assert_eq!(strip_step_number("12. Bake"), Some("Bake"));
        assert_eq!(strip_step_number("3) Serve"), Some("Serve"));
        assert_eq!(strip_step_number("Bake"), None);
        assert_eq!(strip_step_number("1."), None);
    }
}

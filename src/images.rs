use crate::{
    config::Config,
    error::{Error, Result},
    frontmatter::{RecipeDocument, RecipeSections},
    message::truncate_chars,
    service::ImageModel,
    writer::{list_artifacts, url_path, write_file_atomic},
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

const IMAGE_EXTENSION: &str = "jpg";
const MAX_DESCRIPTION_CHARS: usize = 200;

const PROMPT_PREAMBLE: &str = "Generate a food photography image of the finished dish.\n\
Style: minimalistic, soft natural lighting, shallow depth-of-field.\n\
Subject: final plated dish.";

/// Counters for one image stage run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageStats {
    /// Artifacts examined
    pub scanned: usize,
    /// Artifacts that already had an image
    pub already_illustrated: usize,
    /// Images generated and linked
    pub generated: usize,
    /// Images already on disk that were linked without generating
    pub reused: usize,
    /// Artifacts that would get an image (dry run)
    pub pending: usize,
    /// Generation or write failures; those artifacts stay eligible
    pub failed: usize,
    /// Artifacts whose header could not be read
    pub unreadable: usize,
}

/// Fills in missing `image` fields.
///
/// Writes image files and the `image` header line, nothing else.
pub(crate) struct ImageMaterializer<'a> {
    model: Option<&'a dyn ImageModel>,
    recipes_dir: PathBuf,
    images_dir: PathBuf,
    url_prefix: String,
    dry_run: bool,
}

enum Linked {
    Generated,
    Reused,
    AlreadyIllustrated,
}

impl<'a> ImageMaterializer<'a> {
    pub(crate) fn new(config: &Config, model: Option<&'a dyn ImageModel>) -> Self {
        Self {
            model,
            recipes_dir: config.recipes_dir.clone(),
            images_dir: config.images_dir.clone(),
            url_prefix: config.image_url_prefix.clone(),
            dry_run: config.dry_run,
        }
    }

    /// Processes every artifact in path order.
    #[instrument(skip_all, fields(recipes = %self.recipes_dir.display()))]
    pub(crate) fn run(&self) -> ImageStats {
        let mut stats = ImageStats::default();

        for path in list_artifacts(&self.recipes_dir) {
            stats.scanned += 1;

            let doc = match RecipeDocument::read(&path) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("Skipping unreadable artifact: {}", e);
                    stats.unreadable += 1;
                    continue;
                }
            };

            if doc.image().is_some() {
                stats.already_illustrated += 1;
                continue;
            }

            let Some(rel) = pathdiff::diff_paths(&path, &self.recipes_dir) else {
                warn!("Artifact outside recipes directory: {}", path.display());
                stats.failed += 1;
                continue;
            };

            if self.dry_run {
                info!("[dry run] would illustrate {}", rel.display());
                stats.pending += 1;
                continue;
            }

            match self.illustrate(&doc, &rel) {
                Ok(Linked::Generated) => stats.generated += 1,
                Ok(Linked::Reused) => stats.reused += 1,
                Ok(Linked::AlreadyIllustrated) => stats.already_illustrated += 1,
                Err(e) => {
                    warn!("Image for {} failed: {}", rel.display(), e);
                    stats.failed += 1;
                }
            }
        }

        info!(
            "Images: {} generated, {} reused, {} failed",
            stats.generated, stats.reused, stats.failed
        );
        stats
    }

    fn illustrate(&self, doc: &RecipeDocument, rel: &Path) -> Result<Linked> {
        let image_rel = rel.with_extension(IMAGE_EXTENSION);
        let image_path = self.images_dir.join(&image_rel);
        let url = format!("{}/{}", self.url_prefix, url_path(&image_rel));

        let linked = if image_path.exists() {
            debug!("Reusing {}", image_path.display());
            Linked::Reused
        } else {
            let model = self
                .model
                .ok_or_else(|| Error::service("image", "no image service configured"))?;
            let prompt = build_prompt(&doc.title(), &doc.sections());
            let bytes = model.generate(&prompt)?;
            write_file_atomic(&image_path, &bytes)?;
            debug!("Wrote {} ({} bytes)", image_path.display(), bytes.len());
            Linked::Generated
        };

        // The artifact may have changed since the scan.
        let current = RecipeDocument::read(doc.path())?;
        if current.image().is_some() {
            return Ok(Linked::AlreadyIllustrated);
        }
        write_file_atomic(current.path(), current.with_image(&url).as_bytes())?;

        info!("Linked {} -> {}", rel.display(), url);
        Ok(linked)
    }
}

/// Builds the image prompt for a recipe.
pub(crate) fn build_prompt(title: &str, sections: &RecipeSections) -> String {
    let mut lines = vec![PROMPT_PREAMBLE.to_string(), format!("Recipe: {title}")];
    if !sections.ingredients.is_empty() {
        lines.push(format!("Ingredients: {}", sections.ingredients.join(", ")));
    }
    if let Some(description) = short_description(sections) {
        lines.push(format!("Description: {description}"));
    }
    lines.join("\n")
}

fn short_description(sections: &RecipeSections) -> Option<String> {
    let source = sections
        .notes
        .as_deref()
        .or_else(|| sections.steps.first().map(String::as_str))?;
    let sentence = first_sentence(source);
    let short = truncate_chars(sentence, MAX_DESCRIPTION_CHARS).trim();
    (!short.is_empty()).then(|| short.to_string())
}

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\n' {
            return text[..i].trim_end();
        }
        if matches!(c, '.' | '!' | '?') && chars.peek().is_none_or(|(_, next)| next.is_whitespace()) {
            return &text[..i + c.len_utf8()];
        }
    }
    text
}

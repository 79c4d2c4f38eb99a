use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_IMAGE_MODEL: &str = "gpt-image-1";
const DEFAULT_IMAGE_SIZE: &str = "1024x1024";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_IMAGE_URL_PREFIX: &str = "/images";
const DEFAULT_MAX_INPUT_CHARS: usize = 6_000;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Where conversation transcripts are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Directory of cached per-thread JSON files (`<thread_id>.json`)
    ThreadCache(PathBuf),
    /// A single chat export dump (`conversations.json`)
    ExportDump(PathBuf),
}

impl SourceKind {
    /// Returns the path backing this source.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::ThreadCache(p) | Self::ExportDump(p) => p,
        }
    }
}

/// Pipeline stages selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    /// Load, classify, extract and write recipes
    pub extract: bool,
    /// Generate missing images
    pub images: bool,
    /// Rebuild the menu and archives page
    pub menu: bool,
}

impl Stages {
    /// All stages, in pipeline order.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            extract: true,
            images: true,
            menu: true,
        }
    }

    /// Only the extraction stage.
    #[must_use]
    pub const fn extract_only() -> Self {
        Self {
            extract: true,
            images: false,
            menu: false,
        }
    }

    /// Only the image stage.
    #[must_use]
    pub const fn images_only() -> Self {
        Self {
            extract: false,
            images: true,
            menu: false,
        }
    }

    /// Only the menu stage.
    #[must_use]
    pub const fn menu_only() -> Self {
        Self {
            extract: false,
            images: false,
            menu: true,
        }
    }

    /// Returns true if the selected stages call an external service.
    ///
    /// Image generation is skipped in dry runs; extraction still classifies.
    #[must_use]
    pub const fn needs_services(self, dry_run: bool) -> bool {
        self.extract || (self.images && !dry_run)
    }
}

impl Default for Stages {
    fn default() -> Self {
        Self::all()
    }
}

/// Configuration for the recipe-press pipeline.
///
/// Use [`Config::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Site root; relative directories below are resolved against it
    pub root_dir: PathBuf,

    /// Conversation source (required by the extract stage)
    pub source: Option<SourceKind>,

    /// Directory holding recipe Markdown files
    pub recipes_dir: PathBuf,

    /// Directory holding generated images
    pub images_dir: PathBuf,

    /// URL prefix written to the `image` frontmatter field
    pub image_url_prefix: String,

    /// Site configuration file whose menu is regenerated
    pub site_config_path: PathBuf,

    /// Static archives page written by the menu stage
    pub archives_page_path: PathBuf,

    /// Chat model used for classification and extraction
    pub chat_model: String,

    /// Image model used for illustrations
    pub image_model: String,

    /// Requested image size
    pub image_size: String,

    /// Base URL of the OpenAI-compatible API
    pub api_base: String,

    /// API key for the external services
    pub api_key: Option<String>,

    /// Timeout for a single external request
    pub request_timeout: Duration,

    /// Message text is truncated to this many characters before any call
    pub max_input_chars: usize,

    /// Only messages from these author roles are considered (empty = all)
    pub only_roles: Vec<String>,

    /// Ask the model to complete partial extractions instead of skipping them
    pub complete_partial: bool,

    /// Dry run mode: outcomes are computed and reported, nothing is written
    /// and no images are generated
    pub dry_run: bool,

    /// Stages to execute
    pub stages: Stages,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use recipe_press::{Config, Stages};
    ///
    /// let config = Config::builder()
    ///     .root_dir(".")
    ///     .stages(Stages::menu_only())
    ///     .build()
    ///     .expect("valid configuration");
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// Credentials are not checked here; they are required only when the
    /// built-in service client is constructed.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Root directory doesn't exist
    /// - The extract stage is enabled without an existing source
    /// - Numeric limits are zero
    pub fn validate(&self) -> Result<()> {
        if !self.root_dir.exists() {
            return Err(Error::config(format!(
                "Root directory does not exist: {}",
                self.root_dir.display()
            )));
        }

        if !self.root_dir.is_dir() {
            return Err(Error::config(format!(
                "Root path is not a directory: {}",
                self.root_dir.display()
            )));
        }

        if self.stages.extract {
            match &self.source {
                None => {
                    return Err(Error::config(
                        "The extract stage requires a conversation source. \
                        Use Config::builder().source(SourceKind::ExportDump(..))",
                    ));
                }
                Some(SourceKind::ThreadCache(dir)) if !dir.is_dir() => {
                    return Err(Error::config(format!(
                        "Thread cache directory does not exist: {}",
                        dir.display()
                    )));
                }
                Some(SourceKind::ExportDump(file)) if !file.is_file() => {
                    return Err(Error::config(format!(
                        "Export file does not exist: {}",
                        file.display()
                    )));
                }
                Some(_) => {}
            }
        }

        if self.max_input_chars == 0 {
            return Err(Error::config("max_input_chars must be greater than 0"));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::config("request_timeout must be greater than 0"));
        }

        if self.recipes_dir == self.images_dir {
            return Err(Error::config(format!(
                "recipes_dir and images_dir must differ: {}",
                self.recipes_dir.display()
            )));
        }

        Ok(())
    }

    /// Returns the configured API key, or a missing-credential error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCredential`] if no non-empty key is set.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::missing_credential("OPENAI_API_KEY"))
    }
}

/// Builder for creating a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    root_dir: Option<PathBuf>,
    source: Option<SourceKind>,
    recipes_dir: Option<PathBuf>,
    images_dir: Option<PathBuf>,
    image_url_prefix: Option<String>,
    site_config_path: Option<PathBuf>,
    archives_page_path: Option<PathBuf>,
    chat_model: Option<String>,
    image_model: Option<String>,
    image_size: Option<String>,
    api_base: Option<String>,
    api_key: Option<String>,
    request_timeout: Option<Duration>,
    max_input_chars: Option<usize>,
    only_roles: Vec<String>,
    complete_partial: bool,
    dry_run: bool,
    stages: Option<Stages>,
}

impl ConfigBuilder {
    /// Sets the site root directory.
    #[must_use]
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(path.into());
        self
    }

    /// Sets the conversation source.
    #[must_use]
    pub fn source(mut self, source: SourceKind) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the recipes directory (default: `<root>/recipes`).
    #[must_use]
    pub fn recipes_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.recipes_dir = Some(path.into());
        self
    }

    /// Sets the images directory (default: `<root>/images`).
    #[must_use]
    pub fn images_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.images_dir = Some(path.into());
        self
    }

    /// Sets the URL prefix for image references (default: `/images`).
    #[must_use]
    pub fn image_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.image_url_prefix = Some(prefix.into());
        self
    }

    /// Sets the site configuration file (default: `<root>/site/config.yaml`).
    #[must_use]
    pub fn site_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.site_config_path = Some(path.into());
        self
    }

    /// Sets the archives page path
    /// (default: `<root>/site/static/archives/index.html`).
    #[must_use]
    pub fn archives_page_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.archives_page_path = Some(path.into());
        self
    }

    /// Sets the chat model name.
    #[must_use]
    pub fn chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = Some(model.into());
        self
    }

    /// Sets the image model name.
    #[must_use]
    pub fn image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = Some(model.into());
        self
    }

    /// Sets the requested image size (e.g. `1024x1024`).
    #[must_use]
    pub fn image_size(mut self, size: impl Into<String>) -> Self {
        self.image_size = Some(size.into());
        self
    }

    /// Sets the API base URL.
    #[must_use]
    pub fn api_base(mut self, url: impl Into<String>) -> Self {
        self.api_base = Some(url.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the timeout for each external request.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of message characters sent to the model.
    #[must_use]
    pub fn max_input_chars(mut self, chars: usize) -> Self {
        self.max_input_chars = Some(chars);
        self
    }

    /// Restricts processing to messages from the given author roles.
    #[must_use]
    pub fn only_roles(mut self, roles: Vec<String>) -> Self {
        self.only_roles = roles;
        self
    }

    /// Enables the completion pass for partial extractions.
    #[must_use]
    pub fn complete_partial(mut self, enabled: bool) -> Self {
        self.complete_partial = enabled;
        self
    }

    /// Enables dry run mode (no file writes, no image generation).
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Selects the stages to run.
    #[must_use]
    pub fn stages(mut self, stages: Stages) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<Config> {
        let root_dir = self.root_dir.unwrap_or_else(|| PathBuf::from("."));
        let resolve = |path: Option<PathBuf>, default: &str| {
            let path = path.unwrap_or_else(|| PathBuf::from(default));
            if path.is_absolute() {
                path
            } else {
                root_dir.join(path)
            }
        };

        let source = self.source.map(|source| match source {
            SourceKind::ThreadCache(p) if p.is_relative() => {
                SourceKind::ThreadCache(root_dir.join(p))
            }
            SourceKind::ExportDump(p) if p.is_relative() => {
                SourceKind::ExportDump(root_dir.join(p))
            }
            other => other,
        });

        let config = Config {
            source,
            recipes_dir: resolve(self.recipes_dir, "recipes"),
            images_dir: resolve(self.images_dir, "images"),
            site_config_path: resolve(self.site_config_path, "site/config.yaml"),
            archives_page_path: resolve(
                self.archives_page_path,
                "site/static/archives/index.html",
            ),
            image_url_prefix: self
                .image_url_prefix
                .map(|p| p.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_IMAGE_URL_PREFIX.to_string()),
            chat_model: self
                .chat_model
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            image_model: self
                .image_model
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            image_size: self
                .image_size
                .unwrap_or_else(|| DEFAULT_IMAGE_SIZE.to_string()),
            api_base: self
                .api_base
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: self.api_key,
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_input_chars: self.max_input_chars.unwrap_or(DEFAULT_MAX_INPUT_CHARS),
            only_roles: self.only_roles,
            complete_partial: self.complete_partial,
            dry_run: self.dry_run,
            stages: self.stages.unwrap_or_default(),
            root_dir,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_default_paths_resolve_against_root() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::builder()
            .root_dir(temp.path())
            .stages(Stages::menu_only())
            .build()
            .unwrap();

        assert_eq!(config.recipes_dir, temp.path().join("recipes"));
        assert_eq!(config.images_dir, temp.path().join("images"));
        assert_eq!(config.site_config_path, temp.path().join("site/config.yaml"));
        assert_eq!(config.chat_model, DEFAULT_CHAT_MODEL);
        assert_eq!(config.max_input_chars, DEFAULT_MAX_INPUT_CHARS);
    }

    #[test]
    fn test_invalid_root_dir() {
        let result = Config::builder()
            .root_dir("/nonexistent/path/that/should/not/exist")
            .stages(Stages::menu_only())
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_extract_requires_source() {
        let temp = assert_fs::TempDir::new().unwrap();
        let err = Config::builder()
            .root_dir(temp.path())
            .stages(Stages::extract_only())
            .build()
            .unwrap_err();

        assert!(err.is_config());
    }

    #[test]
    fn test_missing_export_file_is_fatal() {
        let temp = assert_fs::TempDir::new().unwrap();
        let result = Config::builder()
            .root_dir(temp.path())
            .source(SourceKind::ExportDump("export/conversations.json".into()))
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_relative_source_resolves_against_root() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("export/conversations.json").write_str("[]").unwrap();

        let config = Config::builder()
            .root_dir(temp.path())
            .source(SourceKind::ExportDump("export/conversations.json".into()))
            .build()
            .unwrap();

        assert_eq!(
            config.source.unwrap().path(),
            temp.path().join("export/conversations.json")
        );
    }

    #[test]
    fn test_require_api_key() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::builder()
            .root_dir(temp.path())
            .stages(Stages::menu_only())
            .api_key("   ")
            .build()
            .unwrap();

        assert!(config.require_api_key().is_err());
    }

    #[test]
    fn test_stages_needing_services() {
        assert!(Stages::all().needs_services(false));
        assert!(Stages::extract_only().needs_services(true));
        assert!(!Stages::images_only().needs_services(true));
        assert!(!Stages::menu_only().needs_services(false));
    }

    #[test]
    fn test_zero_input_chars_rejected() {
        let temp = assert_fs::TempDir::new().unwrap();
        let result = Config::builder()
            .root_dir(temp.path())
            .stages(Stages::menu_only())
            .max_input_chars(0)
            .build();

        assert!(result.is_err());
    }
}

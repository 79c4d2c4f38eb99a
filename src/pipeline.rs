use crate::{
    config::Config,
    error::{Error, Result},
    extract::{ExtractionOutcome, Extractor},
    images::{ImageMaterializer, ImageStats},
    menu::{MenuRebuilder, MenuStats},
    service::{ChatModel, ImageModel, OpenAiClient},
    source::{LoadStats, SourceLoader},
    writer::{ArtifactWriter, WriteOutcome},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Counters for the extract stage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtractStats {
    /// Messages considered
    pub messages: usize,

    /// Messages whose identity already has an artifact (not reclassified)
    pub already_imported: usize,

    /// Messages classified as something other than a recipe
    pub not_recipe: usize,

    /// New artifacts created
    pub created: usize,

    /// Extracted recipes whose identity turned up on disk at write time
    pub skipped_existing: usize,

    /// Messages that failed classification, extraction or writing
    pub failed: usize,
}

/// Statistics collected during pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Source loading counters (extract stage only)
    pub source: Option<LoadStats>,

    /// Extract stage counters
    pub extract: Option<ExtractStats>,

    /// Image stage counters
    pub images: Option<ImageStats>,

    /// Menu stage counters
    pub menu: Option<MenuStats>,

    /// Whether this was a dry run
    pub dry_run: bool,

    /// Total execution time
    pub duration: Duration,

    /// Time spent extracting
    pub extract_duration: Duration,

    /// Time spent on images
    pub image_duration: Duration,

    /// Time spent rebuilding the menu
    pub menu_duration: Duration,
}

impl PipelineStats {
    /// Total number of per-item failures across stages.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.extract.map_or(0, |s| s.failed) + self.images.map_or(0, |s| s.failed)
    }

    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        if self.dry_run {
            println!("║          Pipeline Summary (dry run)                   ║");
        } else {
            println!("║            Pipeline Execution Summary                 ║");
        }
        println!("╠═══════════════════════════════════════════════════════╣");

        if let (Some(source), Some(extract)) = (&self.source, &self.extract) {
            println!("║ Extract                                               ║");
            println!(
                "║   Conversations:      {:>8}                        ║",
                source.conversations
            );
            println!(
                "║   Messages:           {:>8}                        ║",
                extract.messages
            );
            println!(
                "║   Already imported:   {:>8}                        ║",
                extract.already_imported
            );
            println!(
                "║   Not recipes:        {:>8}                        ║",
                extract.not_recipe
            );
            println!(
                "║   Created:            {:>8}                        ║",
                extract.created
            );
            println!(
                "║   Skipped existing:   {:>8}                        ║",
                extract.skipped_existing
            );
            println!(
                "║   Failed:             {:>8}                        ║",
                extract.failed
            );
            println!("║                                                       ║");
        }

        if let Some(images) = &self.images {
            println!("║ Images                                                ║");
            println!(
                "║   Generated:          {:>8}                        ║",
                images.generated
            );
            println!(
                "║   Reused:             {:>8}                        ║",
                images.reused
            );
            if self.dry_run {
                println!(
                    "║   Pending:            {:>8}                        ║",
                    images.pending
                );
            }
            println!(
                "║   Failed:             {:>8}                        ║",
                images.failed
            );
            println!("║                                                       ║");
        }

        if let Some(menu) = &self.menu {
            println!("║ Menu                                                  ║");
            println!(
                "║   Categories:         {:>8}                        ║",
                menu.categories
            );
            println!(
                "║   Recipes listed:     {:>8}                        ║",
                menu.recipes
            );
            println!("║                                                       ║");
        }

        println!("║ Timing Breakdown:                                     ║");
        println!(
            "║   - Extract:          {:>8.2}s                     ║",
            self.extract_duration.as_secs_f64()
        );
        println!(
            "║   - Images:           {:>8.2}s                     ║",
            self.image_duration.as_secs_f64()
        );
        println!(
            "║   - Menu:             {:>8.2}s                     ║",
            self.menu_duration.as_secs_f64()
        );
        println!(
            "║   - Total:            {:>8.2}s                     ║",
            self.duration.as_secs_f64()
        );
        if self.dry_run {
            println!("║                                                       ║");
            println!("║ ⚠ No files were written (dry run mode)               ║");
        }
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

/// Main pipeline orchestrator: extract, illustrate, rebuild the menu.
pub struct Pipeline {
    config: Config,
    chat: Option<Arc<dyn ChatModel>>,
    image: Option<Arc<dyn ImageModel>>,
}

impl Pipeline {
    /// Creates a pipeline backed by the bundled OpenAI-compatible client.
    ///
    /// The client is only built when a selected stage needs it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - The API key is missing for stages that call a service
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        if !config.stages.needs_services(config.dry_run) {
            return Ok(Self {
                config,
                chat: None,
                image: None,
            });
        }

        let client = Arc::new(OpenAiClient::from_config(&config)?);
        let chat: Arc<dyn ChatModel> = client.clone();
        let image: Arc<dyn ImageModel> = client;
        Ok(Self {
            config,
            chat: Some(chat),
            image: Some(image),
        })
    }

    /// Creates a pipeline with caller-provided services.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn with_services(
        config: Config,
        chat: Arc<dyn ChatModel>,
        image: Arc<dyn ImageModel>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            chat: Some(chat),
            image: Some(image),
        })
    }

    /// Executes the selected stages in order and returns statistics.
    ///
    /// # Process
    ///
    /// 1. **Extract**: Loads messages, classifies and extracts recipes, and
    ///    publishes new artifacts
    /// 2. **Images**: Generates images for artifacts without one
    /// 3. **Menu**: Rebuilds the site menu and archives page
    ///
    /// Per-item failures are logged and counted; they never abort a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage cannot start (unreadable source, invalid
    /// site config) or a menu output cannot be written.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use recipe_press::{Config, Pipeline, SourceKind};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::builder()
    ///     .root_dir(".")
    ///     .source(SourceKind::ExportDump("export/conversations.json".into()))
    ///     .api_key(std::env::var("OPENAI_API_KEY")?)
    ///     .build()?;
    ///
    /// let stats = Pipeline::new(config)?.run()?;
    /// stats.print_summary();
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self), fields(root_dir = %self.config.root_dir.display()))]
    pub fn run(self) -> Result<PipelineStats> {
        let start_time = Instant::now();
        let stages = self.config.stages;
        info!("Starting pipeline execution");

        let mut stats = PipelineStats {
            source: None,
            extract: None,
            images: None,
            menu: None,
            dry_run: self.config.dry_run,
            duration: Duration::ZERO,
            extract_duration: Duration::ZERO,
            image_duration: Duration::ZERO,
            menu_duration: Duration::ZERO,
        };

        if stages.extract {
            info!("Stage 1/3: Extracting recipes...");
            let stage_start = Instant::now();
            let (source, extract) = self.extract()?;
            stats.extract_duration = stage_start.elapsed();
            info!(
                "✓ {} created, {} already imported, {} failed in {:.2}s",
                extract.created,
                extract.already_imported,
                extract.failed,
                stats.extract_duration.as_secs_f64()
            );
            stats.source = Some(source);
            stats.extract = Some(extract);
        }

        if stages.images {
            info!("Stage 2/3: Generating images...");
            let stage_start = Instant::now();
            let model = if self.config.dry_run {
                None
            } else {
                self.image.as_deref()
            };
            stats.images = Some(ImageMaterializer::new(&self.config, model).run());
            stats.image_duration = stage_start.elapsed();
        }

        if stages.menu {
            info!("Stage 3/3: Rebuilding menu...");
            let stage_start = Instant::now();
            stats.menu = Some(MenuRebuilder::new(&self.config)?.run()?);
            stats.menu_duration = stage_start.elapsed();
        }

        stats.duration = start_time.elapsed();
        info!(
            "✓ Pipeline completed in {:.2}s",
            stats.duration.as_secs_f64()
        );
        Ok(stats)
    }

    fn extract(&self) -> Result<(LoadStats, ExtractStats)> {
        let source = self
            .config
            .source
            .clone()
            .ok_or_else(|| Error::config("The extract stage requires a conversation source"))?;
        let chat = self
            .chat
            .as_deref()
            .ok_or_else(|| Error::missing_credential("OPENAI_API_KEY"))?;

        let (messages, load_stats) =
            SourceLoader::new(source, self.config.only_roles.clone()).load()?;
        info!(
            "Loaded {} messages from {} conversations",
            load_stats.messages, load_stats.conversations
        );

        let mut writer = ArtifactWriter::new(&self.config)?;
        let extractor = Extractor::new(
            chat,
            self.config.max_input_chars,
            self.config.complete_partial,
        );
        let mut stats = ExtractStats {
            messages: messages.len(),
            ..ExtractStats::default()
        };

        for message in &messages {
            let identity = message.identity();
            if writer.index().contains(&identity) {
                debug!("{} already imported", identity);
                stats.already_imported += 1;
                continue;
            }

            match extractor.process(message) {
                ExtractionOutcome::Recipe(record) => match writer.write(&record) {
                    Ok(WriteOutcome::Created(_)) => stats.created += 1,
                    Ok(WriteOutcome::SkippedExisting(_)) => stats.skipped_existing += 1,
                    Err(e) => {
                        warn!("Failed to write recipe from {}: {}", identity, e);
                        stats.failed += 1;
                    }
                },
                ExtractionOutcome::NotRecipe => {
                    debug!("{} is not a recipe", identity);
                    stats.not_recipe += 1;
                }
                ExtractionOutcome::Failed(reason) => {
                    warn!("Skipping {}: {}", identity, reason);
                    stats.failed += 1;
                }
            }
        }

        Ok((load_stats, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{SourceKind, Stages},
        service::testing::{FixedImage, ScriptedChat},
    };
    use assert_fs::prelude::*;
    use std::fs;

    const EXPORT: &str = r#"[
        {"id": "c1", "create_time": 1709640000, "mapping": {
            "n1": {"message": {"id": "m1", "create_time": 1709640000,
                   "author": {"role": "assistant"},
                   "content": {"parts": ["Tomato soup: tomatoes, salt. Chop and simmer."]}}},
            "n2": {"message": {"id": "m2", "create_time": 1709640100,
                   "author": {"role": "user"},
                   "content": {"parts": ["Thanks, see you tomorrow"]}}},
            "n3": {"message": {"id": "m3", "create_time": 1709640200,
                   "author": {"role": "assistant"},
                   "content": {"parts": ["Broken soup draft"]}}}
        }}
    ]"#;

    const SOUP_JSON: &str = r#"{"title": "Tomato Soup", "ingredients": ["tomatoes", "salt"],
        "steps": ["Chop the tomatoes.", "Simmer"], "time": "30 min"}"#;

    fn chat() -> Arc<ScriptedChat> {
        Arc::new(ScriptedChat::new(|req| {
            if req.system.starts_with("You are a classifier") {
                return Ok(if req.user.contains("soup") {
                    r#"{"is_recipe": true, "categories": ["soups"]}"#.to_string()
                } else {
                    r#"{"is_recipe": false}"#.to_string()
                });
            }
            if req.user.contains("Broken") {
                return Err(Error::service("chat", "HTTP 500"));
            }
            Ok(SOUP_JSON.to_string())
        }))
    }

    fn config(temp: &assert_fs::TempDir, stages: Stages, dry_run: bool) -> Config {
        temp.child("export/conversations.json").write_str(EXPORT).unwrap();
        Config::builder()
            .root_dir(temp.path())
            .source(SourceKind::ExportDump("export/conversations.json".into()))
            .stages(stages)
            .dry_run(dry_run)
            .build()
            .unwrap()
    }

    #[test]
    fn test_full_run() {
        let temp = assert_fs::TempDir::new().unwrap();
        let chat = chat();
        let pipeline = Pipeline::with_services(
            config(&temp, Stages::all(), false),
            chat.clone(),
            Arc::new(FixedImage::new(b"jpeg")),
        )
        .unwrap();

        let stats = pipeline.run().unwrap();

        let extract = stats.extract.unwrap();
        assert_eq!(extract.messages, 3);
        assert_eq!(extract.created, 1);
        assert_eq!(extract.not_recipe, 1);
        assert_eq!(extract.failed, 1);
        assert_eq!(stats.images.unwrap().generated, 1);
        assert_eq!(stats.menu.unwrap().categories, 1);
        assert_eq!(stats.failures(), 1);

        let recipe = fs::read_to_string(temp.path().join("recipes/2024/03/05-tomato-soup.md")).unwrap();
        assert!(recipe.starts_with("---\ntitle: \"Tomato Soup\"\n"));
        assert!(recipe.contains("time: \"30 min\"\n"));
        assert!(!recipe.contains("temperature"));
        assert!(recipe.contains("image: \"/images/2024/03/05-tomato-soup.jpg\"\n"));
        temp.child("images/2024/03/05-tomato-soup.jpg").assert(&b"jpeg"[..]);

        let site = fs::read_to_string(temp.path().join("site/config.yaml")).unwrap();
        assert!(site.contains("/categories/soup/"));
    }

    #[test]
    fn test_classifier_error_does_not_stop_the_batch() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("export/conversations.json")
            .write_str(
                r#"[{"id": "c1", "create_time": 1709640000, "mapping": {
                    "n1": {"message": {"id": "m1", "create_time": 1709640000,
                           "author": {"role": "assistant"},
                           "content": {"parts": ["Flaky soup notes"]}}},
                    "n2": {"message": {"id": "m2", "create_time": 1709640100,
                           "author": {"role": "assistant"},
                           "content": {"parts": ["Tomato soup: tomatoes, salt. Chop and simmer."]}}}
                }}]"#,
            )
            .unwrap();
        let config = Config::builder()
            .root_dir(temp.path())
            .source(SourceKind::ExportDump("export/conversations.json".into()))
            .stages(Stages::extract_only())
            .build()
            .unwrap();
        let chat = Arc::new(ScriptedChat::new(|req| {
            if req.system.starts_with("You are a classifier") {
                return if req.user.contains("Flaky") {
                    Err(Error::service("chat", "HTTP 503"))
                } else {
                    Ok(r#"{"is_recipe": true, "categories": ["soups"]}"#.to_string())
                };
            }
            Ok(SOUP_JSON.to_string())
        }));

        let stats = Pipeline::with_services(config, chat, Arc::new(FixedImage::new(b"jpeg")))
            .unwrap()
            .run()
            .unwrap();

        let extract = stats.extract.unwrap();
        assert_eq!(extract.failed, 1);
        assert_eq!(extract.created, 1);
        let recipe = fs::read_to_string(temp.path().join("recipes/2024/03/05-tomato-soup.md")).unwrap();
        assert!(recipe.contains("source_message_id: \"m2\"\n"));
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let temp = assert_fs::TempDir::new().unwrap();
        let chat = chat();
        let image: Arc<dyn ImageModel> = Arc::new(FixedImage::new(b"jpeg"));
        let config = config(&temp, Stages::all(), false);

        Pipeline::with_services(config.clone(), chat.clone(), image.clone())
            .unwrap()
            .run()
            .unwrap();
        let recipe_path = temp.path().join("recipes/2024/03/05-tomato-soup.md");
        let recipe_first = fs::read(&recipe_path).unwrap();
        let site_first = fs::read(temp.path().join("site/config.yaml")).unwrap();
        let calls_first = chat.call_count();

        let stats = Pipeline::with_services(config, chat.clone(), image)
            .unwrap()
            .run()
            .unwrap();

        let extract = stats.extract.unwrap();
        assert_eq!(extract.already_imported, 1);
        assert_eq!(extract.created, 0);
        assert_eq!(stats.images.unwrap().generated, 0);
        // The non-recipe and the failed message are retried; the published one is not
        assert_eq!(chat.call_count(), calls_first + 3);
        assert_eq!(fs::read(&recipe_path).unwrap(), recipe_first);
        assert_eq!(fs::read(temp.path().join("site/config.yaml")).unwrap(), site_first);
        assert_eq!(
            crate::writer::list_artifacts(&temp.path().join("recipes")).len(),
            1
        );
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let temp = assert_fs::TempDir::new().unwrap();
        let image = Arc::new(FixedImage::new(b"jpeg"));
        let pipeline = Pipeline::with_services(
            config(&temp, Stages::all(), true),
            chat(),
            image.clone(),
        )
        .unwrap();

        let stats = pipeline.run().unwrap();

        assert!(stats.dry_run);
        assert_eq!(stats.extract.unwrap().created, 1);
        assert!(image.prompts.lock().unwrap().is_empty());
        assert!(!temp.child("recipes").exists());
        assert!(!temp.child("site").exists());
    }

    #[test]
    fn test_menu_only_needs_no_credentials() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::builder()
            .root_dir(temp.path())
            .stages(Stages::menu_only())
            .build()
            .unwrap();

        let stats = Pipeline::new(config).unwrap().run().unwrap();
        assert!(stats.extract.is_none());
        assert!(stats.menu.is_some());
        let site = fs::read_to_string(temp.path().join("site/config.yaml")).unwrap();
        assert!(site.contains("/archives/"));
        assert!(site.contains("/recipes/"));
    }

    #[test]
    fn test_extract_requires_api_key() {
        let temp = assert_fs::TempDir::new().unwrap();
        let err = Pipeline::new(config(&temp, Stages::extract_only(), false))
            .err()
            .unwrap();
        assert!(err.is_config());
    }
}

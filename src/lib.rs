//! # recipe-press
//!
//! Turns chat transcripts into a static recipe site.
//!
//! ## Features
//!
//! - Reads cached thread files or a chat export dump
//! - Classifies messages and extracts structured recipes with a chat model
//! - Publishes one Markdown file per source message, never overwriting
//! - Generates an illustration for every recipe that lacks one
//! - Rebuilds the site menu and a static archives page
//!
//! ## Quick Start
//!
//! ```no_run
//! use recipe_press::{Config, Pipeline, SourceKind};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::builder()
//!     .root_dir(".")
//!     .source(SourceKind::ThreadCache("threads".into()))
//!     .api_key(std::env::var("OPENAI_API_KEY")?)
//!     .build()?;
//!
//! Pipeline::new(config)?.run()?.print_summary();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The library follows a pipeline architecture:
//! 1. **Source**: Loads and deduplicates messages
//! 2. **Classify/Extract**: Turns recipe messages into [`RecipeRecord`]s
//! 3. **Writer**: Publishes `recipes/{YYYY}/{MM}/{DD}-{slug}.md` atomically
//! 4. **Images**: Fills in missing `image` fields
//! 5. **Menu**: Regenerates navigation from the current artifacts
//!
//! Re-running over the same input creates nothing new: every artifact is
//! keyed by its source conversation and message.

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod classify;
mod config;
mod error;
mod extract;
mod frontmatter;
mod images;
mod menu;
mod message;
mod pipeline;
mod recipe;
mod service;
mod source;
mod template;
mod writer;

pub use classify::{normalize_categories, Classification, Label};
pub use config::{Config, ConfigBuilder, SourceKind, Stages};
pub use error::{Error, Result};
pub use extract::{ExtractedRecipe, ExtractionOutcome};
pub use frontmatter::{RecipeDocument, RecipeSections};
pub use images::ImageStats;
pub use menu::MenuStats;
pub use message::{IdentityKey, Message, MessageKey};
pub use pipeline::{ExtractStats, Pipeline, PipelineStats};
pub use recipe::{slugify, RecipeRecord};
pub use service::{ChatModel, ChatRequest, ImageModel, OpenAiClient};
pub use source::LoadStats;
pub use writer::{ArtifactIndex, WriteOutcome};

/// Runs the selected pipeline stages with the given configuration.
///
/// This is the main entry point for the library.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid
/// - A stage that calls a service has no API key
/// - The conversation source cannot be read
/// - The site config cannot be rewritten
///
/// # Examples
///
/// ```no_run
/// use recipe_press::{run, Config, Stages};
///
/// # fn main() -> anyhow::Result<()> {
/// let config = Config::builder()
///     .root_dir(".")
///     .stages(Stages::menu_only())
///     .build()?;
///
/// run(config)?;
/// # Ok(())
/// # }
/// ```
pub fn run(config: Config) -> Result<PipelineStats> {
    Pipeline::new(config)?.run()
}

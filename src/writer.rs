use crate::{
    config::Config,
    error::{Error, Result},
    frontmatter::{render_header, RecipeDocument},
    message::IdentityKey,
    recipe::{dated_stem, RecipeRecord},
    template::TemplateEngine,
};
use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Write},
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const ARTIFACT_EXTENSION: &str = "md";

/// Result of writing one recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new artifact was published at this path
    Created(PathBuf),
    /// An artifact with the same identity already exists at this path
    SkippedExisting(PathBuf),
}

impl WriteOutcome {
    /// Path of the new or existing artifact.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(p) | Self::SkippedExisting(p) => p,
        }
    }
}

/// Lists every recipe artifact under `recipes_dir` in sorted path order.
///
/// A missing directory yields an empty list.
pub(crate) fn list_artifacts(recipes_dir: &Path) -> Vec<PathBuf> {
    if !recipes_dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(recipes_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to read directory entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_artifact(entry.path()))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Joins relative path components with `/` for use in a URL.
pub(crate) fn url_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_artifact(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    !hidden && path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION)
}

/// Identity key to artifact path, built from artifact headers on disk.
#[derive(Debug, Default)]
pub struct ArtifactIndex {
    by_identity: HashMap<IdentityKey, PathBuf>,
}

impl ArtifactIndex {
    /// Scans every artifact under `recipes_dir`.
    ///
    /// Files without a readable identity are ignored. When several files
    /// share an identity, the first in path order wins.
    #[must_use]
    pub fn scan(recipes_dir: &Path) -> Self {
        let mut index = Self::default();
        for path in list_artifacts(recipes_dir) {
            index.add_from_disk(path);
        }
        debug!("Indexed {} existing artifacts", index.len());
        index
    }

    /// Re-reads the artifacts directly inside `dir`, picking up files added
    /// since the index was built.
    pub fn refresh_dir(&mut self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_artifact(path))
            .collect();
        paths.sort();

        for path in paths {
            if !self.by_identity.values().any(|known| *known == path) {
                self.add_from_disk(path);
            }
        }
    }

    fn add_from_disk(&mut self, path: PathBuf) {
        match RecipeDocument::read(&path) {
            Ok(doc) => {
                if let Some(identity) = doc.identity() {
                    self.by_identity.entry(identity).or_insert(path);
                }
            }
            Err(e) => debug!("Not indexing {}: {}", path.display(), e),
        }
    }

    /// Returns the artifact path for an identity, if one exists.
    #[must_use]
    pub fn get(&self, identity: &IdentityKey) -> Option<&Path> {
        self.by_identity.get(identity).map(PathBuf::as_path)
    }

    /// Returns true if an artifact exists for the identity.
    #[must_use]
    pub fn contains(&self, identity: &IdentityKey) -> bool {
        self.by_identity.contains_key(identity)
    }

    /// Records a newly published artifact.
    pub fn insert(&mut self, identity: IdentityKey, path: PathBuf) {
        self.by_identity.entry(identity).or_insert(path);
    }

    /// Number of indexed artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }
}

/// Creates recipe artifacts, at most one per identity key.
///
/// Existing artifacts are never modified.
pub(crate) struct ArtifactWriter {
    recipes_dir: PathBuf,
    dry_run: bool,
    template_engine: TemplateEngine,
    index: ArtifactIndex,
}

impl ArtifactWriter {
    /// Creates a writer and indexes the artifacts already on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if template engine initialization fails.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            recipes_dir: config.recipes_dir.clone(),
            dry_run: config.dry_run,
            template_engine: TemplateEngine::new()?,
            index: ArtifactIndex::scan(&config.recipes_dir),
        })
    }

    pub(crate) fn index(&self) -> &ArtifactIndex {
        &self.index
    }

    /// Renders the full artifact text for a record.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub(crate) fn render(&self, record: &RecipeRecord) -> Result<String> {
        let header = render_header(record);
        let body = self.template_engine.render_recipe_body(record)?;
        Ok(format!("{header}\n{body}"))
    }

    /// Publishes a record unless its identity already has an artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or a filesystem operation fails.
    pub(crate) fn write(&mut self, record: &RecipeRecord) -> Result<WriteOutcome> {
        let identity = record.identity();
        let slug = record.slug();
        let base = self.candidate(record, &slug, 1);

        if let Some(day_dir) = base.parent() {
            self.index.refresh_dir(day_dir);
        }

        if let Some(existing) = self.index.get(&identity) {
            debug!("{} already published at {}", identity, existing.display());
            return Ok(WriteOutcome::SkippedExisting(existing.to_path_buf()));
        }

        let content = self.render(record)?;

        if let Some(day_dir) = base.parent().filter(|_| !self.dry_run) {
            fs::create_dir_all(day_dir).map_err(|e| Error::io(day_dir, e))?;
        }

        let mut n = 1;
        let path = loop {
            let candidate = self.candidate(record, &slug, n);
            n += 1;

            if candidate.exists() || self.is_planned(&candidate) {
                continue;
            }
            if self.dry_run || publish(&candidate, &content)? {
                break candidate;
            }
        };

        if self.dry_run {
            info!("[dry run] would create {}", path.display());
        } else {
            info!("Created {}", path.display());
        }
        self.index.insert(identity, path.clone());
        Ok(WriteOutcome::Created(path))
    }

    fn candidate(&self, record: &RecipeRecord, slug: &str, n: usize) -> PathBuf {
        self.recipes_dir
            .join(dated_stem(&record.created_at, slug, n))
            .with_extension(ARTIFACT_EXTENSION)
    }

    // Dry runs publish nothing, so paths handed out earlier in the run are
    // tracked only in the index.
    fn is_planned(&self, path: &Path) -> bool {
        self.dry_run && self.index.by_identity.values().any(|p| p == path)
    }
}

/// Writes `content` to a temp file beside `target` and links it into place
/// without replacing anything already there.
///
/// Returns `Ok(false)` if `target` appeared in the meantime.
fn publish(target: &Path, content: &str) -> Result<bool> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::config(format!("Invalid artifact path: {}", target.display())))?;
    let temp_path = target.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut temp_file = fs::File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|e| Error::io(&temp_path, e))?;
    temp_file.sync_all().map_err(|e| Error::io(&temp_path, e))?;
    drop(temp_file);

    let published = match fs::hard_link(&temp_path, target) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
        // No hard links on this filesystem; fall back to a checked rename.
        Err(_) if target.exists() => false,
        Err(_) => {
            fs::rename(&temp_path, target).map_err(|e| Error::io(target, e))?;
            return Ok(true);
        }
    };

    if let Err(e) = fs::remove_file(&temp_path) {
        warn!("Failed to remove temp file {}: {}", temp_path.display(), e);
    }
    Ok(published)
}

/// Writes a file atomically, replacing any previous content.
///
/// Content goes to a temporary file in the same directory, is synced to
/// disk, and is then renamed over `path`. Readers see either the old file
/// or the complete new one.
pub(crate) fn write_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut temp_file = fs::File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;
    temp_file
        .write_all(content)
        .map_err(|e| Error::io(&temp_path, e))?;
    temp_file.sync_all().map_err(|e| Error::io(&temp_path, e))?;
    drop(temp_file);

    fs::rename(&temp_path, path).map_err(|e| Error::io(path, e))?;
    Ok(())
}

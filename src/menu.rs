//! Site navigation and archives page, recomputed from scratch on every run.
//!
//! Both outputs depend only on the current artifact set, so two runs in a
//! row produce byte-identical files.

use crate::{
    config::Config,
    error::{Error, Result},
    frontmatter::RecipeDocument,
    recipe::slugify,
    template::{ArchiveEntry, ArchiveYear, TemplateEngine},
    writer::{list_artifacts, url_path, write_file_atomic},
};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

const FIRST_CATEGORY_WEIGHT: u64 = 10;

/// Counters for one menu stage run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MenuStats {
    /// Recipes listed on the archives page
    pub recipes: usize,
    /// Distinct categories in the menu
    pub categories: usize,
    /// Artifacts that could not be read
    pub unreadable: usize,
}

#[derive(Debug, Serialize)]
struct MenuEntry {
    name: String,
    url: String,
    weight: u64,
}

#[derive(Debug)]
struct ListedRecipe {
    date: DateTime<Utc>,
    rel: PathBuf,
    title: String,
}

/// Regenerates `menu.main` in the site config and the static archives page.
pub(crate) struct MenuRebuilder {
    recipes_dir: PathBuf,
    site_config_path: PathBuf,
    archives_page_path: PathBuf,
    dry_run: bool,
    template_engine: TemplateEngine,
}

impl MenuRebuilder {
    /// Creates a rebuilder from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if template engine initialization fails.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            recipes_dir: config.recipes_dir.clone(),
            site_config_path: config.site_config_path.clone(),
            archives_page_path: config.archives_page_path.clone(),
            dry_run: config.dry_run,
            template_engine: TemplateEngine::new()?,
        })
    }

    /// Rebuilds both outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the site config is not a YAML mapping, or if
    /// rendering or writing fails.
    #[instrument(skip_all, fields(recipes = %self.recipes_dir.display()))]
    pub(crate) fn run(&self) -> Result<MenuStats> {
        let mut stats = MenuStats::default();
        let mut recipes = Vec::new();
        let mut categories = BTreeSet::new();

        for path in list_artifacts(&self.recipes_dir) {
            let doc = match RecipeDocument::read(&path) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("Skipping unreadable artifact: {}", e);
                    stats.unreadable += 1;
                    continue;
                }
            };
            let Some(rel) = pathdiff::diff_paths(&path, &self.recipes_dir) else {
                continue;
            };

            categories.extend(artifact_categories(&doc));
            let Some(date) = artifact_date(&doc, &rel) else {
                warn!("No date for {}; leaving it off the archives page", rel.display());
                continue;
            };
            recipes.push(ListedRecipe {
                date,
                title: doc.title(),
                rel,
            });
        }

        // Newest first; same instant falls back to path order.
        recipes.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.rel.cmp(&b.rel)));
        stats.recipes = recipes.len();
        stats.categories = categories.len();

        let mut site = load_site_config(&self.site_config_path)?;
        let base_url = site
            .get("baseURL")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();

        set_main_menu(&mut site, &categories)?;
        let config_text = serde_yaml::to_string(&Value::Mapping(site))?;
        let archives = self
            .template_engine
            .render_archives(&group_by_year(&recipes, &base_url))?;

        if self.dry_run {
            info!(
                "[dry run] would write menu with {} categories and {} archived recipes",
                stats.categories, stats.recipes
            );
            return Ok(stats);
        }

        write_file_atomic(&self.site_config_path, config_text.as_bytes())?;
        debug!("Wrote {}", self.site_config_path.display());
        write_file_atomic(&self.archives_page_path, archives.as_bytes())?;
        debug!("Wrote {}", self.archives_page_path.display());

        info!(
            "Menu rebuilt: {} categories, {} recipes",
            stats.categories, stats.recipes
        );
        Ok(stats)
    }
}

fn load_site_config(path: &Path) -> Result<Mapping> {
    if !path.exists() {
        return Ok(Mapping::new());
    }

    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    match serde_yaml::from_str::<Value>(&text)? {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(Error::config(format!(
            "Site config is not a YAML mapping: {}",
            path.display()
        ))),
    }
}

/// Replaces `menu.main`, keeping every other key where it was.
fn set_main_menu(site: &mut Mapping, categories: &BTreeSet<String>) -> Result<()> {
    let mut entries = vec![
        MenuEntry {
            name: "By date".to_string(),
            url: "/archives/".to_string(),
            weight: 1,
        },
        MenuEntry {
            name: "Tags".to_string(),
            url: "/tags/".to_string(),
            weight: 2,
        },
    ];
    for (weight, category) in (FIRST_CATEGORY_WEIGHT..).zip(categories) {
        entries.push(MenuEntry {
            name: category.clone(),
            url: format!("/categories/{}/", slugify(category)),
            weight,
        });
    }
    entries.push(MenuEntry {
        name: "All recipes".to_string(),
        url: "/recipes/".to_string(),
        weight: 999,
    });

    let main = serde_yaml::to_value(&entries)?;
    let menu_key = Value::String("menu".to_string());
    match site.get_mut(&menu_key) {
        Some(Value::Mapping(menu)) => {
            menu.insert(Value::String("main".to_string()), main);
        }
        _ => {
            let mut menu = Mapping::new();
            menu.insert(Value::String("main".to_string()), main);
            site.insert(menu_key, Value::Mapping(menu));
        }
    }
    Ok(())
}

/// Categories of an artifact, falling back to tags other than `recipe`.
fn artifact_categories(doc: &RecipeDocument) -> Vec<String> {
    let categories = doc.get_list("categories");
    let raw = if categories.is_empty() {
        doc.get_list("tags")
            .into_iter()
            .filter(|tag| tag != "recipe")
            .collect()
    } else {
        categories
    };
    raw.into_iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !slugify(c).is_empty())
        .collect()
}

/// Date from the `date` field, else from the `YYYY/MM/DD-` path layout.
fn artifact_date(doc: &RecipeDocument, rel: &Path) -> Option<DateTime<Utc>> {
    if let Some(raw) = doc.get_str("date") {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Some(date) = raw
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    date_from_path(rel)
}

fn date_from_path(rel: &Path) -> Option<DateTime<Utc>> {
    let parts: Vec<String> = url_path(rel).split('/').map(str::to_string).collect();
    let [year, month, file] = parts.as_slice() else {
        return None;
    };
    let day = file.get(..2)?;
    NaiveDate::parse_from_str(&format!("{year}-{month}-{day}"), "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|n| n.and_utc())
}

fn group_by_year(recipes: &[ListedRecipe], base_url: &str) -> Vec<ArchiveYear> {
    let mut years: Vec<ArchiveYear> = Vec::new();
    for recipe in recipes {
        let entry = ArchiveEntry {
            title: recipe.title.clone(),
            url: format!(
                "{}/recipes/{}/",
                base_url,
                url_path(&recipe.rel.with_extension(""))
            ),
            date: recipe.date.format("%Y-%m-%d").to_string(),
        };
        match years.last_mut() {
            Some(group) if group.year == recipe.date.year() => group.entries.push(entry),
            _ => years.push(ArchiveYear {
                year: recipe.date.year(),
                entries: vec![entry],
            }),
        }
    }
    years
}

use crate::{
    error::{Error, Result},
    recipe::RecipeRecord,
};
use serde::Serialize;
use tera::{Context, Tera};

// The `.html` suffix turns on autoescaping; `.md` leaves text as written.
const RECIPE_TEMPLATE: &str = "recipe.md";
const ARCHIVES_TEMPLATE: &str = "archives.html";

#[derive(Serialize)]
struct RecipeBody<'a> {
    ingredients: &'a [String],
    steps: &'a [String],
    notes: Option<&'a str>,
}

/// One year section of the archives page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ArchiveYear {
    pub(crate) year: i32,
    pub(crate) entries: Vec<ArchiveEntry>,
}

/// One recipe link on the archives page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ArchiveEntry {
    pub(crate) title: String,
    pub(crate) url: String,
    /// `YYYY-MM-DD`
    pub(crate) date: String,
}

/// Template engine for recipe bodies and the archives page.
pub(crate) struct TemplateEngine {
    tera: Tera,
}

impl TemplateEngine {
    /// Creates a template engine with the built-in templates.
    ///
    /// # Errors
    ///
    /// Returns an error if template registration fails.
    pub(crate) fn new() -> Result<Self> {
        let mut tera = Tera::default();
        Self::register_builtin_templates(&mut tera)?;
        Ok(Self { tera })
    }

    fn register_builtin_templates(tera: &mut Tera) -> Result<()> {
        tera.add_raw_template(RECIPE_TEMPLATE, include_str!("../templates/recipe.md.tera"))
            .map_err(|e| Error::template(RECIPE_TEMPLATE, e))?;

        tera.add_raw_template(
            ARCHIVES_TEMPLATE,
            include_str!("../templates/archives.html.tera"),
        )
        .map_err(|e| Error::template(ARCHIVES_TEMPLATE, e))?;

        Ok(())
    }

    /// Renders the Markdown body (ingredients, steps, notes) of a recipe.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub(crate) fn render_recipe_body(&self, record: &RecipeRecord) -> Result<String> {
        let body = RecipeBody {
            ingredients: &record.ingredients,
            steps: &record.steps,
            notes: record.notes.as_deref(),
        };
        let context = Context::from_serialize(&body)?;

        self.tera
            .render(RECIPE_TEMPLATE, &context)
            .map_err(|e| Error::template(RECIPE_TEMPLATE, e))
    }

    /// Renders the static archives page.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub(crate) fn render_archives(&self, years: &[ArchiveYear]) -> Result<String> {
        let mut context = Context::new();
        context.insert("years", years);

        self.tera
            .render(ARCHIVES_TEMPLATE, &context)
            .map_err(|e| Error::template(ARCHIVES_TEMPLATE, e))
    }
}

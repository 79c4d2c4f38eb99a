use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use recipe_press::{Config, Pipeline, SourceKind, Stages};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "recipe-press",
    version,
    author,
    about = "Turn chat transcripts into a static recipe site",
    long_about = "Turn chat transcripts into a static recipe site.\n\n\
    Reads cached threads or a chat export, extracts recipes with a chat model, \
    writes one Markdown file per recipe, illustrates them, and rebuilds the site menu. \
    Re-running never duplicates or overwrites a published recipe.\n\n\
    USAGE EXAMPLES:\n  \
      # Full run over an export dump\n  \
      recipe-press run --export export/conversations.json\n\n  \
      # Extract only, from cached threads, previewing without writing\n  \
      recipe-press extract --threads threads --dry-run\n\n  \
      # Rebuild the menu (no API key needed)\n  \
      recipe-press menu"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Site root; recipes/, images/ and site/ live below it
    #[arg(short, long, global = true, default_value = ".", value_name = "PATH")]
    root: PathBuf,

    /// Dry run (report outcomes, write nothing, generate no images)
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract, illustrate and rebuild the menu
    Run {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        service: ServiceArgs,
        #[command(flatten)]
        extract: ExtractArgs,
    },
    /// Extract recipes from conversations
    Extract {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        service: ServiceArgs,
        #[command(flatten)]
        extract: ExtractArgs,
    },
    /// Generate images for recipes that have none
    Images {
        #[command(flatten)]
        service: ServiceArgs,
    },
    /// Rebuild the site menu and archives page
    Menu,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// Directory of cached thread files (<thread_id>.json)
    #[arg(long, value_name = "DIR")]
    threads: Option<PathBuf>,

    /// Chat export dump (conversations.json)
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,
}

impl SourceArgs {
    fn into_source(self) -> Option<SourceKind> {
        self.threads
            .map(SourceKind::ThreadCache)
            .or_else(|| self.export.map(SourceKind::ExportDump))
    }
}

#[derive(Args, Debug)]
struct ServiceArgs {
    /// API key for the chat and image services
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, env = "OPENAI_API_BASE", value_name = "URL")]
    api_base: Option<String>,

    /// Chat model for classification and extraction
    #[arg(long, value_name = "NAME")]
    model: Option<String>,

    /// Image model
    #[arg(long, value_name = "NAME")]
    image_model: Option<String>,

    /// Timeout per request, in seconds
    #[arg(long, default_value_t = 120, value_name = "SECS")]
    timeout: u64,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Characters of message text sent to the model
    #[arg(long, default_value_t = 6_000)]
    max_input_chars: usize,

    /// Only consider messages from this author role (repeatable)
    #[arg(long = "role", value_name = "ROLE")]
    roles: Vec<String>,

    /// Ask the model to complete partial recipes instead of skipping them
    #[arg(long)]
    complete_partial: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose)?;

    let mut builder = Config::builder().root_dir(cli.root).dry_run(cli.dry_run);

    let (stages, source, service, extract) = match cli.command {
        Command::Run {
            source,
            service,
            extract,
        } => (Stages::all(), Some(source), Some(service), Some(extract)),
        Command::Extract {
            source,
            service,
            extract,
        } => (Stages::extract_only(), Some(source), Some(service), Some(extract)),
        Command::Images { service } => (Stages::images_only(), None, Some(service), None),
        Command::Menu => (Stages::menu_only(), None, None, None),
    };
    builder = builder.stages(stages);

    if let Some(source) = source.and_then(SourceArgs::into_source) {
        builder = builder.source(source);
    }

    if let Some(service) = service {
        builder = builder.request_timeout(Duration::from_secs(service.timeout));
        if let Some(key) = service.api_key {
            builder = builder.api_key(key);
        }
        if let Some(base) = service.api_base {
            builder = builder.api_base(base);
        }
        if let Some(model) = service.model {
            builder = builder.chat_model(model);
        }
        if let Some(model) = service.image_model {
            builder = builder.image_model(model);
        }
    }

    if let Some(extract) = extract {
        builder = builder
            .max_input_chars(extract.max_input_chars)
            .only_roles(extract.roles)
            .complete_partial(extract.complete_partial);
    }

    let config = builder.build().context("Failed to build configuration")?;

    let stats = Pipeline::new(config)
        .context("Failed to create pipeline")?
        .run()
        .context("Pipeline execution failed")?;

    stats.print_summary();
    Ok(())
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("recipe_press=info"),
        1 => EnvFilter::new("recipe_press=debug"),
        _ => EnvFilter::new("recipe_press=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .init();

    Ok(())
}

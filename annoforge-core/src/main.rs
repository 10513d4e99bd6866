//! annoforge - batch caption tool for image corpora
//!
//! Every subcommand opens (and scans) a corpus folder, performs one
//! operation through the core library and prints the result on stdout.
//! Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use annoforge_common::config::{self, SettingsStore, TomlConfig};
use annoforge_common::events::EventBus;
use annoforge_core::inference::CommandInferenceEngine;
use annoforge_core::models::AnnotationState;
use annoforge_core::services::{
    csv_transfer, text_operations, FindPattern, PromptRegistry, Scope, SearchQuery,
};
use annoforge_core::CorpusSession;

/// Command-line arguments for annoforge
#[derive(Parser, Debug)]
#[command(name = "annoforge")]
#[command(about = "Batch caption generation and editing for image corpora")]
#[command(version)]
struct Args {
    /// Configuration file (overrides ANNOFORGE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Concurrent inference jobs (overrides [generation] worker_limit)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the available prompt types
    Prompts,

    /// Scan a corpus folder and report its records
    Scan { folder: PathBuf },

    /// Generate captions
    Generate {
        folder: PathBuf,
        /// Prompt type for every submitted image
        #[arg(long)]
        prompt_type: Option<String>,
        /// Restrict to these image ids
        #[arg(long, num_args = 1..)]
        only: Vec<String>,
        /// Regenerate images that already have a caption
        #[arg(long)]
        include_done: bool,
    },

    /// Replace one caption
    Edit {
        folder: PathBuf,
        id: String,
        text: String,
    },

    /// Assign a prompt type to images
    SetPrompt {
        folder: PathBuf,
        prompt_type: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Find and replace text in captions (preview unless --apply)
    Replace {
        folder: PathBuf,
        find: String,
        replace: String,
        #[arg(long)]
        ignore_case: bool,
        #[arg(long)]
        apply: bool,
        #[arg(long, num_args = 1..)]
        only: Vec<String>,
    },

    /// List ids whose id or caption matches a term
    Search {
        folder: PathBuf,
        term: String,
        #[arg(long)]
        regex: bool,
        #[arg(long)]
        invert: bool,
    },

    /// Export captions to CSV
    Export { folder: PathBuf, csv: PathBuf },

    /// Import captions from CSV
    Import { folder: PathBuf, csv: PathBuf },

    /// Show or change the saved session defaults
    Defaults {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt_type: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = config::resolve_config_path(args.config.as_deref());
    let toml_config = config::load_toml_config(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    // RUST_LOG wins over the config file
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| toml_config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if config_path.exists() {
        info!("Config: {}", config_path.display());
    } else {
        info!("Config {} not found, using defaults", config_path.display());
    }

    let settings = SettingsStore::new(config_path.clone());
    let event_bus = EventBus::default();

    match args.command {
        Command::Prompts => {
            for prompt in PromptRegistry::builtin().all() {
                println!("{:<28} {:<20} {}", prompt.id, prompt.label, prompt.template);
            }
        }

        Command::Scan { folder } => {
            let (session, report) = open(&folder, &toml_config, &settings, event_bus)?;
            println!(
                "{} images ({} added, {} removed)",
                report.total,
                report.added.len(),
                report.removed.len()
            );
            for record in session.store().snapshot() {
                println!("{:<12} {:<28} {}", record.state, record.prompt_type, record.id);
            }
        }

        Command::Generate {
            folder,
            prompt_type,
            only,
            include_done,
        } => {
            let defaults = settings.load_defaults()?;
            let Some(engine) =
                CommandInferenceEngine::from_config(&toml_config.inference, defaults.last_model.as_deref())
            else {
                bail!("No [inference] command configured in {}", config_path.display());
            };

            let (session, _) = open(&folder, &toml_config, &settings, event_bus)?;
            let store = session.store();
            let ids: Vec<String> = if only.is_empty() {
                store
                    .snapshot()
                    .into_iter()
                    .filter(|r| include_done || r.state != AnnotationState::Done)
                    .map(|r| r.id)
                    .collect()
            } else {
                only
            };
            if ids.is_empty() {
                println!("Nothing to generate");
                return Ok(());
            }

            let workers = args
                .workers
                .unwrap_or_else(|| toml_config.generation.effective_worker_limit());
            let scheduler = session.start_scheduler(Arc::new(engine), workers);
            let receipt = scheduler.submit(&ids, prompt_type.as_deref())?;
            info!(
                batch_id = %receipt.batch_id,
                accepted = receipt.accepted.len(),
                skipped = receipt.skipped.len(),
                workers,
                "Generating captions"
            );

            let progress = tokio::select! {
                progress = scheduler.wait(receipt.batch_id) => progress,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, cancelling queued jobs");
                    scheduler.cancel(receipt.batch_id);
                    scheduler.wait(receipt.batch_id).await
                }
            };
            scheduler.shutdown().await;

            if let Some(p) = progress {
                println!(
                    "done {}, failed {}, skipped {}, cancelled {}",
                    p.done, p.failed, p.skipped, p.cancelled
                );
            }
            for id in &receipt.accepted {
                if let Some(record) = store.get(id) {
                    if let Some(error) = &record.last_error {
                        println!("FAILED {}: {}", id, error);
                    }
                }
            }
        }

        Command::Edit { folder, id, text } => {
            let (session, _) = open(&folder, &toml_config, &settings, event_bus)?;
            session.store().edit_caption(&id, &text)?;
            println!("Updated {}", id);
        }

        Command::SetPrompt {
            folder,
            prompt_type,
            ids,
        } => {
            let (session, _) = open(&folder, &toml_config, &settings, event_bus)?;
            let not_found = session.store().set_prompt_type(&ids, &prompt_type)?;
            println!("Assigned to {} images", ids.len() - not_found.len());
            for id in not_found {
                println!("NOT FOUND {}", id);
            }
        }

        Command::Replace {
            folder,
            find,
            replace,
            ignore_case,
            apply,
            only,
        } => {
            let (session, _) = open(&folder, &toml_config, &settings, event_bus)?;
            let pattern = FindPattern::new(&find, ignore_case)?;
            let scope = if only.is_empty() {
                Scope::All
            } else {
                Scope::Ids(only)
            };
            let preview = text_operations::find_replace(session.store(), &pattern, &replace, &scope);
            for entry in &preview.entries {
                println!("{}\n  - {}\n  + {}", entry.id, entry.before, entry.after);
            }

            if !apply {
                println!("{} captions would change (use --apply)", preview.len());
                return Ok(());
            }
            let report = text_operations::commit(session.store(), &preview);
            println!(
                "applied {}, stale {}, not found {}, failed {}",
                report.applied.len(),
                report.skipped_stale.len(),
                report.not_found.len(),
                report.failed.len()
            );
            for (id, error) in &report.failed {
                println!("FAILED {}: {}", id, error);
            }
        }

        Command::Search {
            folder,
            term,
            regex,
            invert,
        } => {
            let (session, _) = open(&folder, &toml_config, &settings, event_bus)?;
            let query = SearchQuery { term, regex, invert };
            for id in text_operations::search(session.store(), &query) {
                println!("{}", id);
            }
        }

        Command::Export { folder, csv } => {
            let (session, _) = open(&folder, &toml_config, &settings, event_bus)?;
            let rows = csv_transfer::export_csv(session.store(), &csv)?;
            println!("Exported {} rows to {}", rows, csv.display());
        }

        Command::Import { folder, csv } => {
            let (session, _) = open(&folder, &toml_config, &settings, event_bus)?;
            let report = csv_transfer::import_csv(session.store(), &csv)?;
            println!(
                "updated {}, unchanged {}, not found {}, failed {}",
                report.updated.len(),
                report.unchanged.len(),
                report.not_found.len(),
                report.failed.len()
            );
            for id in &report.not_found {
                println!("NOT FOUND {}", id);
            }
            for (id, error) in &report.failed {
                println!("FAILED {}: {}", id, error);
            }
        }

        Command::Defaults { model, prompt_type } => {
            let mut defaults = settings.load_defaults()?;
            if model.is_none() && prompt_type.is_none() {
                println!("last_model          = {}", defaults.last_model.as_deref().unwrap_or("-"));
                println!("default_prompt_type = {}", defaults.default_prompt_type);
                return Ok(());
            }
            if let Some(model) = model {
                defaults.last_model = Some(model);
            }
            if let Some(prompt_type) = prompt_type {
                defaults.default_prompt_type = PromptRegistry::builtin().resolve(&prompt_type)?.id.clone();
            }
            if settings.save_defaults(&defaults)? {
                println!("Saved defaults to {}", settings.path().display());
            } else {
                println!("Defaults unchanged");
            }
        }
    }

    Ok(())
}

fn open(
    folder: &Path,
    toml_config: &TomlConfig,
    settings: &SettingsStore,
    event_bus: EventBus,
) -> Result<(CorpusSession, annoforge_core::services::ScanReport)> {
    let defaults = settings.load_defaults()?;
    let opened = CorpusSession::open(folder, toml_config, &defaults, event_bus)
        .with_context(|| format!("Failed to open corpus {}", folder.display()))?;
    info!(folder = %folder.display(), images = opened.1.total, "Corpus opened");
    Ok(opened)
}

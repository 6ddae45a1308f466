use anyhow::{Context, anyhow};
use canonry::catalog::HttpCatalog;
use canonry::cli::{Args, Command, RunArgs};
use canonry::config::Config;
use canonry::data::aliases::AliasIndex;
use canonry::data::classifier::MatchClassifier;
use canonry::data::credits::CreditStringParser;
use canonry::data::matching::ConfidenceScorer;
use canonry::data::models::{EntityId, EntityType, LocalRecord};
use canonry::data::pg::PgStore;
use canonry::data::seed;
use canonry::data::store::{MatchStore, MemoryStore};
use canonry::error::RunError;
use canonry::logging::setup_logging;
use canonry::report::RunReport;
use canonry::scheduler::{BatchScheduler, RunOptions};
use canonry::utils::read_json_file;
use clap::Parser;
use futures::StreamExt;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Instrument, error, info, warn};

/// Exit status for run-level failures, as opposed to startup errors.
const RUN_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Logging depends on the config, so config errors go straight to stderr
    if let Some(path) = &args.config
        && !path.exists()
    {
        eprintln!("Configuration file {} does not exist", path.display());
        return ExitCode::FAILURE;
    }
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&config.log_level, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting canonry"
    );

    let outcome = match args.command {
        Command::Run(run_args) => run(run_args, &config).await,
        Command::Resolve {
            entity_type,
            text,
            aliases,
        } => resolve(entity_type, &text, aliases.as_deref(), &config).await,
        Command::ParseCredits {
            text,
            show,
            aliases,
        } => parse_credits(&show, &text, aliases.as_deref(), &config).await,
        Command::Promote {
            entity_type,
            entity_id,
            text,
        } => promote(entity_type, EntityId(entity_id), &text, &config).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "canonry failed");
            ExitCode::FAILURE
        }
    }
}

/// Connect to PostgreSQL when a database URL is configured.
async fn connect(config: &Config) -> anyhow::Result<Option<PgStore>> {
    match config.database_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(Some(PgStore::connect(url).await?)),
        _ => Ok(None),
    }
}

/// Stored aliases first, then the seed file, then seal.
async fn build_alias_index(pg: Option<&PgStore>, seed_file: Option<&Path>) -> anyhow::Result<Arc<AliasIndex>> {
    let index = AliasIndex::new();
    if let Some(pg) = pg {
        pg.load_aliases(&index).await?;
    }
    if let Some(path) = seed_file {
        seed::load_file(&index, path)?;
    }
    index.seal();
    info!(
        entities = index.entity_count(),
        aliases = index.alias_count(),
        "Alias index ready"
    );
    Ok(Arc::new(index))
}

async fn resolve(
    entity_type: EntityType,
    text: &str,
    seed_file: Option<&Path>,
    config: &Config,
) -> anyhow::Result<ExitCode> {
    let index = build_alias_index(connect(config).await?.as_ref(), seed_file).await?;
    let resolution = index.resolve(text, entity_type);
    let output = serde_json::json!({
        "raw_text": text,
        "entity_type": entity_type,
        "resolved": resolution.is_resolved(),
        "entity": resolution.entity(),
        "label": resolution.label(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(ExitCode::SUCCESS)
}

async fn parse_credits(
    show: &str,
    text: &str,
    seed_file: Option<&Path>,
    config: &Config,
) -> anyhow::Result<ExitCode> {
    let index = build_alias_index(connect(config).await?.as_ref(), seed_file).await?;
    let entries = CreditStringParser::new(&index).parse(show, text);
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(ExitCode::SUCCESS)
}

async fn promote(
    entity_type: EntityType,
    entity_id: EntityId,
    text: &str,
    config: &Config,
) -> anyhow::Result<ExitCode> {
    let pg = connect(config)
        .await?
        .ok_or_else(|| anyhow!("promote needs a database (set DATABASE_URL)"))?;
    let index = build_alias_index(Some(&pg), None).await?;
    let token = index.promote(text, entity_type, entity_id)?;
    let saved = pg.save_aliases(&index.new_aliases()).await?;
    info!(
        raw_text = text,
        %entity_type,
        %entity_id,
        saved,
        tracked = token.is_some(),
        "Alias promoted"
    );
    Ok(ExitCode::SUCCESS)
}

async fn run(args: RunArgs, config: &Config) -> anyhow::Result<ExitCode> {
    let records: Vec<LocalRecord> = read_json_file(&args.records, "records file")?;

    let pg = connect(config).await?;
    let aliases = build_alias_index(pg.as_ref(), args.aliases.as_deref()).await?;
    let store: Arc<dyn MatchStore> = match &pg {
        Some(pg) => Arc::new(pg.clone()),
        None => Arc::new(MemoryStore::new()),
    };

    let catalog = Arc::new(HttpCatalog::new(&config.catalog.base_url, config.catalog.timeout)?);
    let scorer = Arc::new(ConfidenceScorer::new(aliases.clone()));
    let scheduler = match BatchScheduler::new(
        config.scheduler_config(),
        catalog,
        scorer,
        MatchClassifier::new(store),
    ) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!(error = %e, "Refusing to start run");
            return Ok(ExitCode::from(RUN_FAILED));
        }
    };

    let mut report = RunReport::new();
    let span = tracing::info_span!("run", run_id = report.run_id.as_str());
    let mut stream = scheduler.run(records, RunOptions { resume: args.resume });

    let cancel = stream.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight records");
            cancel.cancel();
        }
    });

    async {
        while let Some(item) = stream.next().await {
            report.push(item);
        }
    }
    .instrument(span)
    .await;
    interrupt.abort();

    let summary = stream.summary();
    let report = report.finish(&summary, &aliases);

    if let Some(pg) = &pg {
        pg.save_aliases(&report.new_aliases)
            .await
            .context("Failed to save new aliases")?;
        pg.save_unresolved(&report.unresolved_tokens)
            .await
            .context("Failed to save unresolved tokens")?;
    }

    let json = report.to_json()?;
    match &args.report {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?,
        None => println!("{json}"),
    }

    info!(
        run_id = report.run_id.as_str(),
        high = report.tiers.high,
        medium = report.tiers.medium,
        low = report.tiers.low,
        none = report.tiers.none,
        failed = report.failures.len(),
        skipped = report.skipped,
        unresolved = report.unresolved_tokens.len(),
        "Run complete"
    );

    if let Some(fatal) = summary.fatal {
        error!(error = %fatal, "Run failed");
        return Ok(ExitCode::from(RUN_FAILED));
    }
    if summary.fetch.catalog_unreachable() {
        let e = RunError::CatalogUnreachable {
            failed: summary.fetch.failed as usize,
        };
        error!(error = %e, "Run failed");
        return Ok(ExitCode::from(RUN_FAILED));
    }
    if summary.cancelled {
        warn!("Run was cancelled before every record was processed");
    }

    Ok(ExitCode::SUCCESS)
}

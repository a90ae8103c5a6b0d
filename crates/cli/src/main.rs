use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use remedy_policy::config::{config_path, StorageBackend};
use remedy_policy::{
    load_config, normalize_action, Action, ActionSet, AttackCategory, Context, EngineConfig,
    FileStore, PolicyEngine, RewardShaper, ScenarioSampler, Severity, SnapshotStore,
    SqliteStore, TrainingLoop, TrainingReport, FALLBACK_ACTION,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "remedy", version, about = "Remedy: lernende Abwehr-Policy")]
struct Cli {
    /// Konfigurationsdatei (Standard: $REMEDY_CONFIG oder ./configs/remedy.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Mehr Logausgabe
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Policy in simulierten Vorfällen trainieren und Snapshot speichern
    Train {
        #[arg(long, default_value_t = 1000)]
        episodes: u64,
        /// Seed für Engine und Simulator (überschreibt `seed` aus der Konfiguration)
        #[arg(long)]
        seed: Option<u64>,
        /// Gespeicherten Snapshot ignorieren und leer beginnen
        #[arg(long)]
        fresh: bool,
        /// Logs zusätzlich in diese Datei schreiben
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Nur diese Angriffskategorien trainieren (mehrfach angebbar)
        #[arg(long = "category")]
        categories: Vec<AttackCategory>,
    },
    /// Aktion für einen Vorfall wählen (Ausgabe als JSON)
    Decide {
        #[arg(long)]
        severity: Severity,
        #[arg(long)]
        category: AttackCategory,
        #[arg(long)]
        confidence: f64,
        #[arg(long, default_value_t = 1)]
        assets: u32,
        /// ATT&CK-Technik (mehrfach angebbar)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Gelernte Zustände als Tabelle anzeigen
    Qtable {
        /// Nur die K meistbesuchten Zustände
        #[arg(long)]
        top: Option<usize>,
    },
    /// Engine-Statistik als JSON
    Stats,
    /// Externen Aktionsnamen auf die feste Aktionsmenge abbilden
    Normalize { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_file = match &cli.command {
        Commands::Train { log_file, .. } => log_file.clone(),
        _ => None,
    };
    let _guard = init_tracing(cli.verbose, log_file.as_deref())?;

    let path = cli.config.unwrap_or_else(config_path);
    let config = load_config(&path)?;

    match cli.command {
        Commands::Train {
            episodes,
            seed,
            fresh,
            categories,
            ..
        } => {
            let mut config = config;
            if seed.is_some() {
                config.seed = seed;
            }
            let report = train(config, episodes, fresh, categories).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Decide {
            severity,
            category,
            confidence,
            assets,
            tags,
        } => {
            let context =
                Context::new(severity, category, confidence, assets)?.with_techniques(tags);
            let engine = open_engine(&config, false)?;
            let decision = engine.decide(&context);
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Qtable { top } => {
            let engine = open_engine(&config, false)?;
            print_qtable(&engine, top);
        }
        Commands::Stats => {
            let engine = open_engine(&config, false)?;
            println!("{}", serde_json::to_string_pretty(&engine.statistics())?);
        }
        Commands::Normalize { name } => {
            let action = normalize_action(&name);
            let exact = name.parse::<Action>().is_ok();
            if exact {
                println!("{action}");
            } else {
                println!("{action} (fallback for {name:?}, default {FALLBACK_ACTION})");
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { "info" };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log file {} has no file name", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

fn open_store(config: &EngineConfig) -> Box<dyn SnapshotStore> {
    let dir = config.storage.resolved_dir();
    match config.storage.backend {
        StorageBackend::File => Box::new(FileStore::new(dir)),
        StorageBackend::Sqlite => Box::new(SqliteStore::in_dir(&dir)),
    }
}

fn open_engine(config: &EngineConfig, fresh: bool) -> anyhow::Result<PolicyEngine> {
    let actions = ActionSet::all();
    let engine = if fresh {
        PolicyEngine::new(config, actions)?
    } else {
        PolicyEngine::restore(open_store(config).as_ref(), config, actions)?
    };
    Ok(engine)
}

async fn train(
    config: EngineConfig,
    episodes: u64,
    fresh: bool,
    categories: Vec<AttackCategory>,
) -> anyhow::Result<TrainingReport> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current episode");
            on_signal.cancel();
        }
    });

    tokio::task::spawn_blocking(move || {
        let store = open_store(&config);
        let engine = open_engine(&config, fresh)?;
        let simulator = config.simulator.build()?;
        let shaper = RewardShaper::new(config.reward);
        let mut rng = match config.seed {
            // decorrelate from the engine's exploration stream
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        let mut sampler = ScenarioSampler::new(categories);

        let report = TrainingLoop::new(&engine, simulator.as_ref(), shaper).run(
            &mut sampler,
            episodes,
            &cancel,
            &mut rng,
        )?;
        engine.save_to(store.as_ref())?;
        info!(store = %store.location(), "snapshot written");
        Ok::<_, anyhow::Error>(report)
    })
    .await
    .context("training task join failed")?
}

fn print_qtable(engine: &PolicyEngine, top: Option<usize>) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct Row {
        state: String,
        visits: u64,
        #[tabled(rename = "best action")]
        best: String,
        #[tabled(rename = "Q best")]
        q_best: String,
        #[tabled(rename = "Q mean")]
        q_mean: String,
    }

    let table = engine.table();
    let mut entries: Vec<_> = table.iter().collect();
    entries.sort_by(|a, b| b.1.visits.cmp(&a.1.visits).then_with(|| a.0.cmp(b.0)));
    if let Some(k) = top {
        entries.truncate(k);
    }

    let rows: Vec<Row> = entries
        .into_iter()
        .map(|(key, entry)| {
            let best = remedy_policy::selector::best_action(entry, engine.actions());
            let n = entry.q_values.len().max(1) as f64;
            Row {
                state: key.to_string(),
                visits: entry.visits,
                best: best.to_string(),
                q_best: format!("{:.3}", entry.q(best)),
                q_mean: format!("{:.3}", entry.q_values.values().sum::<f64>() / n),
            }
        })
        .collect();

    if rows.is_empty() {
        println!("(no learned states)");
        return;
    }
    println!("{}", Table::new(rows));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn decide_arguments_parse_into_domain_types() {
        let cli = Cli::parse_from([
            "remedy",
            "decide",
            "--severity",
            "critical",
            "--category",
            "lateral_movement",
            "--confidence",
            "0.9",
            "--assets",
            "5",
            "--tag",
            "T1021",
        ]);
        match cli.command {
            Commands::Decide {
                severity,
                category,
                tags,
                ..
            } => {
                assert_eq!(severity, Severity::Critical);
                assert_eq!(category, AttackCategory::LateralMovement);
                assert_eq!(tags, vec!["T1021".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

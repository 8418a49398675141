mod config;
mod server;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use cf_core::{
    ExcitationEvent, FieldEngine, Location, ObservationKind, ObservationRequest, ObservationTarget,
    QuantizedCoordinate,
};
use cf_store::{Store, StoreError};
use clap::{Parser, Subcommand};
use rmcp::{ServiceExt, transport::stdio};
use uuid::Uuid;

use crate::config::{CliConfig, DB_FILE};

#[derive(Parser)]
#[command(name = "cfield", about = "Cognitive field engine CLI and MCP server")]
struct Cli {
    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start MCP server on stdio transport
    Serve,

    /// Excite the field at a grid cell
    Excite {
        /// Valence
        #[arg(long, allow_negative_numbers = true)]
        v: i64,
        /// Arousal
        #[arg(long, allow_negative_numbers = true)]
        a: i64,
        /// Epistemic
        #[arg(long, allow_negative_numbers = true)]
        e: i64,
        /// |ψ| of the excitation
        #[arg(long, default_value_t = 1.0)]
        magnitude: f64,
        /// Bind the cell to this entity
        #[arg(long)]
        entity: Option<Uuid>,
    },

    /// Measure a grid cell
    Observe {
        #[arg(long, allow_negative_numbers = true)]
        v: i64,
        #[arg(long, allow_negative_numbers = true)]
        a: i64,
        #[arg(long, allow_negative_numbers = true)]
        e: i64,
        /// similarity, resonance, attention or direct_access
        #[arg(long, default_value = "direct_access")]
        kind: ObservationKind,
    },

    /// Advance the simulation
    Step {
        #[arg(long, default_value_t = 1)]
        ticks: u32,
        /// Override the configured timestep
        #[arg(long)]
        dt: Option<f64>,
    },

    /// Show field statistics
    Stats,

    /// Export state to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Import state from a JSON file
    Import {
        /// Input file path
        path: PathBuf,
    },
}

/// Store plus the engine restored from it.
pub(crate) struct Field {
    pub config: CliConfig,
    pub store: Store,
    pub engine: FieldEngine,
}

impl Field {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let config = CliConfig::load(dir)?;
        let store = Store::open(&dir.join(DB_FILE)).context("failed to open field store")?;
        let mut engine = FieldEngine::new(config.engine.clone());
        let snapshot = store.load_snapshot().context("failed to load field state")?;
        engine
            .restore(snapshot)
            .context("failed to restore field state")?;
        Ok(Self {
            config,
            store,
            engine,
        })
    }

    /// Write changed cells, folding in concurrent writes from other
    /// processes until the save lands.
    pub fn save(&mut self) -> Result<()> {
        for attempt in 1..=SAVE_ATTEMPTS {
            match self.try_save() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    tracing::warn!(attempt, "field changed on disk, rebasing: {e}");
                    let stored = self
                        .store
                        .load_snapshot()
                        .context("failed to reload field state")?;
                    self.engine
                        .rebase(stored)
                        .context("failed to rebase field state")?;
                }
                Err(e) => return Err(e).context("failed to save field state"),
            }
        }
        bail!("failed to save field state: still conflicting after {SAVE_ATTEMPTS} attempts")
    }

    fn try_save(&mut self) -> Result<(), StoreError> {
        let synced = self.store.save_snapshot(&self.engine.snapshot())?;
        self.engine.mark_synced(synced);
        Ok(())
    }
}

const SAVE_ATTEMPTS: u32 = 3;

fn open_field() -> Result<Field> {
    Field::open(&config::data_dir())
}

/// Open the field, run `op` and save. If another process wrote the same
/// cells in between, `op` is rerun on freshly loaded state.
fn with_field<T>(mut op: impl FnMut(&mut Field) -> Result<T>) -> Result<T> {
    for attempt in 1..=SAVE_ATTEMPTS {
        let mut field = open_field()?;
        let out = op(&mut field)?;
        match field.try_save() {
            Ok(()) => return Ok(out),
            Err(e) if e.is_conflict() => {
                tracing::warn!(attempt, "field changed on disk, retrying: {e}");
            }
            Err(e) => return Err(e).context("failed to save field state"),
        }
    }
    bail!("failed to save field state: still conflicting after {SAVE_ATTEMPTS} attempts")
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve => cmd_serve().await,
        Commands::Excite {
            v,
            a,
            e,
            magnitude,
            entity,
        } => cmd_excite([*v, *a, *e], *magnitude, *entity),
        Commands::Observe { v, a, e, kind } => cmd_observe([*v, *a, *e], *kind),
        Commands::Step { ticks, dt } => cmd_step(&cli, *ticks, *dt),
        Commands::Stats => cmd_stats(),
        Commands::Export { path } => cmd_export(path),
        Commands::Import { path } => cmd_import(path),
    }
}

async fn cmd_serve() -> Result<()> {
    let field = open_field()?;
    tracing::info!(
        nodes = field.engine.index().len(),
        entities = field.engine.entity_ids().len(),
        "starting MCP server"
    );

    let server = server::FieldServer::new(field)?;
    let maintenance = server.spawn_maintenance();
    let service = server
        .clone()
        .serve(stdio())
        .await
        .context("failed to start MCP server")?;
    tokio::select! {
        quit = service.waiting() => {
            let reason = quit?;
            tracing::info!("MCP session ended: {reason:?}");
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
    }

    server.shutdown();
    maintenance
        .await
        .context("maintenance task panicked")?
        .context("failed to persist on shutdown")?;
    Ok(())
}

fn cmd_excite(grid: [i64; 3], magnitude: f64, entity: Option<Uuid>) -> Result<()> {
    let (coord, energy) = with_field(|field| {
        let mut event = ExcitationEvent::new(Location::Grid(grid), magnitude);
        if let Some(id) = entity {
            event = event.with_entity(id);
        }
        let coord = field.engine.excite(event).context("failed to excite field")?;
        let energy = field
            .engine
            .excitation_at(coord)
            .map(|ex| ex.energy())
            .unwrap_or_default();
        Ok((coord, energy))
    })?;

    println!("excited {coord} energy={energy:.6}");
    if let Some(id) = entity {
        println!("entity {id}");
    }
    Ok(())
}

fn cmd_observe(grid: [i64; 3], kind: ObservationKind) -> Result<()> {
    let mut field = open_field()?;
    let coord = QuantizedCoordinate::new(grid[0], grid[1], grid[2])
        .context("coordinate is off the grid")?;
    let outcome = field
        .engine
        .observe(&ObservationRequest::new(
            ObservationTarget::Coordinate(coord),
            kind,
        ))
        .context("observation failed")?;

    let m = &outcome.measurement;
    if m.is_vacuum() {
        println!("vacuum at {coord} ({})", kind.as_str());
    } else {
        println!(
            "{} at {coord}: value={:.6} probability={:.6}",
            kind.as_str(),
            m.value,
            m.collapse_probability
        );
    }
    Ok(())
}

fn cmd_step(cli: &Cli, ticks: u32, dt: Option<f64>) -> Result<()> {
    let (time, energy, worst) = with_field(|field| {
        let mut worst = 0.0_f64;
        for _ in 0..ticks {
            let report = field.engine.tick(dt).context("tick failed")?;
            worst = worst.max(report.cycle.relative_error);
            if cli.verbose {
                eprintln!(
                    "--- tick {}: passes={}, halvings={}, global={}, folds={}, drift={:.2e} ---",
                    report.tick,
                    report.local.passes,
                    report.local.halvings,
                    report.global.is_some(),
                    report.folds.len(),
                    report.cycle.relative_error
                );
            }
        }
        Ok((field.engine.time(), field.engine.total_energy(), worst))
    })?;

    println!("stepped {ticks} ticks. t={time:.4}, energy={energy:.6}, max_drift={worst:.2e}");
    Ok(())
}

fn cmd_stats() -> Result<()> {
    let field = open_field()?;
    let stats = field.engine.stats();

    println!("time:       {:.4}", stats.time);
    println!("ticks:      {}", stats.ticks);
    println!("nodes:      {}", stats.nodes);
    println!("regions:    {}", stats.regions);
    println!("entities:   {}", stats.entities);
    println!(
        "energy:     {:.6} (stored={:.6}, vacuum={:.6})",
        stats.total_energy, stats.stored_energy, stats.vacuum_energy
    );
    Ok(())
}

fn cmd_export(path: &Path) -> Result<()> {
    let field = open_field()?;
    field
        .store
        .export_json_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("exported to {}", path.display());
    Ok(())
}

fn cmd_import(path: &Path) -> Result<()> {
    let field = open_field()?;
    field
        .store
        .import_json_file(path)
        .context("failed to import JSON")?;

    let field = open_field().context("failed to load state after import")?;
    println!(
        "imported from {}. nodes={}, entities={}",
        path.display(),
        field.engine.index().len(),
        field.engine.entity_ids().len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(v: i64, a: i64, e: i64) -> QuantizedCoordinate {
        QuantizedCoordinate::new(v, a, e).unwrap()
    }

    #[test]
    fn test_save_rebases_onto_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut serve = Field::open(dir.path()).unwrap();
        serve
            .engine
            .excite(ExcitationEvent::new(Location::Grid([0, 0, 0]), 1.0))
            .unwrap();
        serve.save().unwrap();

        let mut oneshot = Field::open(dir.path()).unwrap();
        oneshot
            .engine
            .excite(ExcitationEvent::new(Location::Grid([0, 0, 0]), 2.0))
            .unwrap();
        oneshot.save().unwrap();
        let theirs = oneshot.engine.excitation_at(at(0, 0, 0)).cloned();

        serve.engine.tick(None).unwrap();
        serve
            .engine
            .excite(ExcitationEvent::new(Location::Grid([5, 5, 5]), 1.0))
            .unwrap();
        serve.save().unwrap();

        let reopened = Field::open(dir.path()).unwrap();
        assert_eq!(reopened.engine.index().len(), 2);
        assert_eq!(reopened.engine.excitation_at(at(0, 0, 0)).cloned(), theirs);
        assert!(reopened.engine.index().contains(at(5, 5, 5)));
    }
}

mod terrain;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use glam::Vec3;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use voxstream_common::{StreamSettings, TerraformEdit};
use voxstream_stream::{StreamCoordinator, TickTimer};

use terrain::NoiseTerrain;

const SETTLE_TICKS: usize = 500;
const WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "voxstream-cli", about = "Drive the chunk streamer headlessly")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (YAML). Defaults are used when absent.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and effective settings
    Info,
    /// Walk an observer across noise terrain and report stream counters
    Simulate {
        /// Number of ticks to run
        #[arg(short, long, default_value = "60")]
        ticks: usize,
        /// Distance moved along +X per tick
        #[arg(long, default_value = "4.0")]
        speed: f32,
        /// Observer height
        #[arg(long, default_value = "30.0")]
        height: f32,
        /// Terrain seed
        #[arg(short, long, default_value = "42")]
        seed: u32,
        /// Carve a pit under the observer every N ticks (0 = never)
        #[arg(long, default_value = "0")]
        edit_every: usize,
        /// Print the final counters as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stream in around a point and print the signed distance and gradient there
    Sample {
        #[arg(allow_hyphen_values = true)]
        x: f32,
        #[arg(allow_hyphen_values = true)]
        y: f32,
        #[arg(allow_hyphen_values = true)]
        z: f32,
        /// Terrain seed
        #[arg(short, long, default_value = "42")]
        seed: u32,
    },
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<StreamSettings> {
    match path {
        Some(path) => StreamSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(StreamSettings::default()),
    }
}

/// Tick until the stream has nothing left to do.
fn settle(stream: &mut StreamCoordinator, observer: Vec3) -> anyhow::Result<()> {
    for _ in 0..SETTLE_TICKS {
        stream.tick(observer);
        if stream.is_idle() {
            return Ok(());
        }
        if !stream.wait_for_completion(WAIT) {
            bail!("device jobs did not finish within {WAIT:?}");
        }
    }
    bail!("stream did not settle after {SETTLE_TICKS} ticks")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Info => {
            println!("voxstream-cli v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "chunk: dims={} voxel={} size={}",
                settings.chunk_dims,
                settings.voxel_size,
                settings.chunk_size()
            );
            println!(
                "sdf: halo={} iso={} max_edit_radius={}",
                settings.halo, settings.iso_level, settings.max_edit_radius
            );
            println!(
                "radius: surface={} (y >= {}) deep={} (y <= {}) unload_buffer={} vertical_weight={}",
                settings.surface_radius,
                settings.water_level,
                settings.deep_radius,
                settings.deep_level,
                settings.unload_buffer,
                settings.vertical_weight
            );
            println!(
                "budget: builds_per_tick={} workers={}",
                settings.max_builds_per_tick, settings.worker_threads
            );
        }
        Commands::Simulate {
            ticks,
            speed,
            height,
            seed,
            edit_every,
            json,
        } => {
            let terrain = Arc::new(NoiseTerrain::new(seed));
            let mut stream = StreamCoordinator::with_density(settings, terrain.clone())?;
            let mut timer = TickTimer::new(ticks.max(1));

            for i in 0..ticks {
                let observer = Vec3::new(i as f32 * speed, height, 0.0);
                let dt = stream.tick(observer).tick_time;
                timer.record(dt);
                if edit_every > 0 && i % edit_every == 0 {
                    let ground = terrain.height(observer.x, observer.z);
                    let pit = TerraformEdit::new(Vec3::new(observer.x, ground, observer.z), -1.0, 2.0);
                    let affected = stream.apply_terraform_edit(pit);
                    tracing::info!(tick = i, affected = affected.len(), "pit carved");
                }
                stream.wait_for_completion(WAIT);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(stream.stats())?);
            } else {
                println!("{}", stream.stats());
                println!(
                    "tick time: avg={:?} min={:?} max={:?} over {} ticks",
                    timer.average(),
                    timer.min(),
                    timer.max(),
                    timer.count()
                );
            }
            stream.shutdown();
        }
        Commands::Sample { x, y, z, seed } => {
            let point = Vec3::new(x, y, z);
            let mut stream = StreamCoordinator::with_density(settings, Arc::new(NoiseTerrain::new(seed)))?;
            settle(&mut stream, point)?;

            let coord = stream.grid().world_to_chunk(point);
            match stream.store().sample_sdf(point) {
                Some(d) => println!("sdf({x}, {y}, {z}) = {d:.4}  [chunk {coord}]"),
                None => println!("sdf({x}, {y}, {z}) unavailable: chunk {coord} has no field"),
            }
            match stream.store().sample_gradient(point) {
                Some(g) => println!("gradient = ({:.4}, {:.4}, {:.4})", g.x, g.y, g.z),
                None => println!("gradient unavailable"),
            }
            if let Some(chunk) = stream.store().get(coord) {
                println!(
                    "chunk: triangles={} biomes={:#b} spawn_candidates={} edits={}",
                    chunk.mesh.as_ref().map_or(0, |m| m.triangle_count()),
                    chunk.biome_mask.0,
                    chunk.spawn_candidates.len(),
                    chunk.edits.len()
                );
            }
            stream.shutdown();
        }
    }

    Ok(())
}

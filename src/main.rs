// =============================================================================
// game-env: drive an external game binary as a step/reset environment
// =============================================================================
// Run:
//   cargo run --release -- run game_config.json --port 12000 --pre-init-port 12001
//   cargo run --release -- run game_config.json --port 12000 --policy null --episodes 3

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use game_env_harness::{GameConfig, GameEnv, HarnessConfig, Policy, run_episodes};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "game-env", about = "Step/reset harness for an external game process")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play episodes against the game with a baseline policy
    Run(RunArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Game configuration JSON
    config: PathBuf,
    #[arg(long)]
    port: u16,
    /// Port for the background instance; ignored unless the config enables pre_init
    #[arg(long)]
    pre_init_port: Option<u16>,
    #[arg(long, default_value = "workdir")]
    workdir: PathBuf,
    #[arg(long, default_value = "5")]
    episodes: usize,
    #[arg(long, value_enum, default_value = "random")]
    policy: Policy,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    training: bool,
    /// Same as --seed 1234
    #[arg(long, default_value_t = false)]
    deterministic: bool,
}

// =============================================================================
// Run
// =============================================================================

fn run(args: &RunArgs) -> Result<()> {
    let game = GameConfig::load(&args.config)
        .with_context(|| format!("loading game config {}", args.config.display()))?;
    let config_path = std::fs::canonicalize(&args.config)
        .with_context(|| format!("resolving {}", args.config.display()))?;
    std::fs::create_dir_all(&args.workdir)
        .with_context(|| format!("creating work dir {}", args.workdir.display()))?;
    let workdir = std::fs::canonicalize(&args.workdir)?;

    let harness = HarnessConfig::from_game_config(
        &game,
        config_path,
        &workdir,
        args.port,
        args.pre_init_port,
        args.training,
    );
    let time_limit = harness.env.time_limit;

    eprintln!(
        "Game: {} ({})",
        game.config_name.as_deref().unwrap_or("unnamed"),
        game.game_exe.display()
    );
    eprintln!(
        "Port: {}  Pre-init: {}  Policy: {:?}  Episodes: {}",
        harness.port,
        harness
            .pre_init_port
            .map_or_else(|| "off".to_string(), |p| p.to_string()),
        args.policy,
        args.episodes,
    );

    let seed = if args.deterministic { Some(1234) } else { args.seed };
    let mut rng = match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };

    let mut env = GameEnv::new(harness).context("building environment")?;
    let started = Instant::now();
    let stats = run_episodes(&mut env, args.policy, args.episodes, time_limit, &mut rng);
    let closed = env.close().context("closing environment");
    let stats = stats?;
    closed?;

    eprintln!(
        "\nEpisodes: {}  avg_reward={:.2}  max_reward={:.2}  avg_steps={:.1}  ({:.1}s)",
        stats.episodes,
        stats.avg_reward,
        stats.max_reward,
        stats.avg_steps,
        started.elapsed().as_secs_f64(),
    );
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => run(args),
    }
}

use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use storyreel_contracts::cache::{AssetCache, CacheLimits, JsonFileBackend};
use storyreel_engine::{AssetRequest, DryrunGenerator, ProductionEngine};

#[derive(Debug, Parser)]
#[command(name = "storyreel", version, about = "Storyreel production engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover a script breakdown from raw model output
    Breakdown(BreakdownArgs),
    /// Generate (or fetch from cache) one scene asset
    Generate(GenerateArgs),
    /// Inspect or reset a run's asset cache
    Cache(CacheArgs),
}

#[derive(Debug, Parser)]
struct BreakdownArgs {
    /// Raw model output file, or `-` for stdin
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "cinematic")]
    style: String,
    #[arg(long, default_value = "1280x720")]
    resolution: String,
    #[arg(long, default_value = "16:9")]
    aspect: String,
    #[arg(long, default_value_t = 0)]
    seed: i64,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct CacheArgs {
    #[arg(long)]
    out: PathBuf,
    #[command(subcommand)]
    action: CacheAction,
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// Print entry count and byte usage as JSON
    Stats,
    /// Remove every cached asset
    Clear,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("storyreel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Breakdown(args) => run_breakdown(args),
        Command::Generate(args) => run_generate(args),
        Command::Cache(args) => run_cache(args),
    }
}

fn run_breakdown(args: BreakdownArgs) -> Result<i32> {
    let raw = read_input(&args.input)?;
    let engine = open_engine(&args.out, args.events)?;

    let breakdown = engine.breakdown_script(&raw)?;
    let out_path = engine.run_dir().join("breakdown.json");
    fs::write(&out_path, serde_json::to_string_pretty(&breakdown)?)
        .with_context(|| format!("failed to write {}", out_path.display()))?;

    println!(
        "breakdown: {} characters, {} scenes -> {}",
        breakdown.characters.len(),
        breakdown.scenes.len(),
        out_path.display()
    );
    engine.finish()?;
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let engine = open_engine(&args.out, args.events)?;
    let request = AssetRequest {
        prompt: args.prompt,
        style: args.style,
        resolution: args.resolution,
        aspect_ratio: args.aspect,
        seed: args.seed,
    };

    let outcome = engine.scene_asset(&request)?;
    let out_path = engine
        .run_dir()
        .join(format!("asset-{}.uri", outcome.fingerprint));
    fs::write(&out_path, &outcome.payload)
        .with_context(|| format!("failed to write {}", out_path.display()))?;

    let source = if outcome.cached { "cache" } else { "generated" };
    println!("asset {} ({source}) -> {}", outcome.fingerprint, out_path.display());
    engine.finish()?;
    Ok(0)
}

fn run_cache(args: CacheArgs) -> Result<i32> {
    let cache = AssetCache::open(
        Box::new(JsonFileBackend::new(args.out.join("assets.json"))),
        CacheLimits::from_env(),
        None,
    );
    match args.action {
        CacheAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
        CacheAction::Clear => {
            cache.clear();
            println!("cache cleared");
        }
    }
    Ok(0)
}

fn open_engine(out: &PathBuf, events: Option<PathBuf>) -> Result<ProductionEngine> {
    let events_path = events.unwrap_or_else(|| out.join("events.jsonl"));
    ProductionEngine::new(
        out,
        events_path,
        Box::new(DryrunGenerator),
        CacheLimits::from_env(),
    )
}

fn read_input(path: &PathBuf) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read stdin")?;
        return Ok(raw);
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

//! shardgen - sharded checkpoint loading and text sampling
//!
//! ## Commands
//!
//! - `init-config` - Write the default configuration file
//! - `create-checkpoint` - Save randomly initialised weights for a preset
//! - `list` - List checkpoints in the store
//! - `inspect` - Show checkpoint metadata and parameters
//! - `plan` - Show how a checkpoint would be placed on the device mesh
//! - `next-token` - Show the most likely next tokens for a prompt
//! - `sample` - Sample continuations for one or more prompts

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shardgen::tensor::ops::softmax_rows;
use shardgen::{
    format_bytes, init_params, init_production_logging, init_simple_logging, ByteTokenizer,
    CheckpointLoader, CheckpointStore, Config, DType, DecoderTransformer, DeviceCapabilities,
    DeviceMesh, MeshAxis, ModelConfig, SampleRequest, Sampler, SamplingMethod, ShardLoader,
    ShardedParams, ShardingPlan, ShardingStrategy, Tokenizer, Transformer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Sharded checkpoint loading and text sampling
#[derive(Parser, Debug)]
#[command(name = "shardgen")]
#[command(about = "Load model checkpoints sharded over a device mesh and sample text", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.shardgen/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    #[command(flatten)]
    Checkpoint(CheckpointCommands),
}

/// Commands that run against the configured checkpoint store
#[derive(Subcommand, Debug)]
enum CheckpointCommands {
    /// Save randomly initialised weights for a model preset
    CreateCheckpoint {
        /// Checkpoint name in the store
        #[arg(long)]
        id: String,

        /// Model preset (tiny, small)
        #[arg(long, default_value = "tiny")]
        preset: String,

        /// Initialisation seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Storage dtype (f32, bf16), defaults to the configured dtype
        #[arg(long)]
        dtype: Option<String>,
    },

    /// List checkpoints in the store
    List,

    /// Show checkpoint metadata and parameters
    Inspect {
        /// Checkpoint name or path
        checkpoint: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show partition specs and per-device memory for a checkpoint
    Plan {
        /// Checkpoint name or path
        checkpoint: String,

        #[command(flatten)]
        placement: PlacementArgs,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the most likely next tokens for a prompt
    NextToken {
        /// Checkpoint name or path
        checkpoint: String,

        #[arg(long)]
        prompt: String,

        /// Number of candidates to show
        #[arg(long, default_value = "10")]
        top_k: usize,

        #[command(flatten)]
        placement: PlacementArgs,
    },

    /// Sample continuations for one or more prompts
    Sample {
        /// Checkpoint name or path
        checkpoint: String,

        /// Prompt (repeat for a batch)
        #[arg(long = "prompt", required = true)]
        prompts: Vec<String>,

        #[arg(long)]
        max_new_tokens: Option<usize>,

        /// Sampling method (greedy, random, top_k, top_p)
        #[arg(long)]
        sampling: Option<String>,

        #[arg(long, default_value = "1.0")]
        temperature: f32,

        #[arg(long, default_value = "40")]
        top_k: usize,

        #[arg(long, default_value = "0.9")]
        top_p: f32,

        /// Include the prompt in the output
        #[arg(long)]
        echo: bool,

        /// Token that must never be produced (repeatable)
        #[arg(long = "forbid")]
        forbidden: Vec<String>,

        /// Sampler seed, defaults to the configured seed
        #[arg(long)]
        seed: Option<u64>,

        #[command(flatten)]
        placement: PlacementArgs,

        /// Print JSON output
        #[arg(long)]
        json: bool,
    },
}

/// Overrides for the configured mesh and strategy
#[derive(clap::Args, Debug)]
struct PlacementArgs {
    /// Number of virtual devices on a single mesh axis
    #[arg(long)]
    devices: Option<usize>,

    /// Sharding strategy (replicated, fsdp, tensor_parallel)
    #[arg(long)]
    strategy: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };

    let command = match cli.command {
        Commands::InitConfig { force } => {
            init_simple_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            return cmd_init_config(config_path, force);
        }
        Commands::Checkpoint(command) => command,
    };

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    if config.logging.log_to_file {
        init_production_logging(&level, config.log_dir())?;
    } else {
        init_simple_logging(&level)?;
    }

    let store = CheckpointStore::new(config.checkpoint_dir()).context("Failed to open checkpoint store")?;

    match command {
        CheckpointCommands::CreateCheckpoint {
            id,
            preset,
            seed,
            dtype,
        } => {
            let dtype = match dtype {
                Some(d) => d.parse::<DType>()?,
                None => config.checkpoints.dtype,
            };
            cmd_create_checkpoint(&store, &id, &preset, seed, dtype)?;
        }

        CheckpointCommands::List => cmd_list(&store)?,

        CheckpointCommands::Inspect { checkpoint, json } => cmd_inspect(&store, &checkpoint, json).await?,

        CheckpointCommands::Plan {
            checkpoint,
            placement,
            json,
        } => cmd_plan(&store, &config, &checkpoint, &placement, json).await?,

        CheckpointCommands::NextToken {
            checkpoint,
            prompt,
            top_k,
            placement,
        } => cmd_next_token(&store, &config, &checkpoint, &prompt, top_k, &placement).await?,

        CheckpointCommands::Sample {
            checkpoint,
            prompts,
            max_new_tokens,
            sampling,
            temperature,
            top_k,
            top_p,
            echo,
            forbidden,
            seed,
            placement,
            json,
        } => {
            let sampling = match sampling.as_deref() {
                None => config.sampler.sampling.clone(),
                Some("greedy") => SamplingMethod::Greedy,
                Some("random") => SamplingMethod::Random { temperature },
                Some("top_k") | Some("top-k") => SamplingMethod::TopK { k: top_k, temperature },
                Some("top_p") | Some("top-p") => SamplingMethod::TopP { p: top_p, temperature },
                Some(other) => bail!("Unknown sampling method '{}'", other),
            };
            let request = SampleRequest::new(max_new_tokens.unwrap_or(config.sampler.max_new_tokens))
                .with_echo(echo)
                .with_forbidden_tokens(forbidden)
                .with_sampling(sampling);
            let seed = seed.unwrap_or(config.sampler.seed);
            cmd_sample(&store, &config, &checkpoint, &prompts, &request, seed, &placement, json).await?;
        }
    }

    Ok(())
}

fn cmd_init_config(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(&path)?;
    println!("✓ Configuration saved to: {}", path.display());
    Ok(())
}

fn cmd_create_checkpoint(store: &CheckpointStore, id: &str, preset: &str, seed: u64, dtype: DType) -> Result<()> {
    let model = ModelConfig::preset(preset)?;
    println!("🔧 Initializing '{}' weights (seed {})...", preset, seed);
    let params = init_params(&model, seed)?;
    let metadata = store
        .save(id, &params, &model, dtype)
        .with_context(|| format!("Failed to save checkpoint '{}'", id))?;

    println!("\n✅ Checkpoint saved");
    println!("   Name:       {}", metadata.name);
    println!("   ID:         {}", metadata.checkpoint_id);
    println!("   Parameters: {}", metadata.num_params());
    println!("   Dtype:      {}", metadata.dtype);
    println!("   Size:       {}", format_bytes(metadata.size_bytes));
    println!("   Path:       {}", store.resolve(id).display());
    Ok(())
}

fn cmd_list(store: &CheckpointStore) -> Result<()> {
    use colored::Colorize;

    let checkpoints = store.list()?;
    println!("\n{}", "Checkpoints".bold().cyan());
    println!("{}", "===========".cyan());
    if checkpoints.is_empty() {
        println!("  (none in {})", store.root().display());
        return Ok(());
    }
    for meta in checkpoints {
        println!(
            "  {:<20} {:>10} params  {:<5} {:>10}  {}m old",
            meta.name.as_str().green(),
            meta.num_params(),
            meta.dtype,
            format_bytes(meta.size_bytes),
            meta.age().as_secs() / 60
        );
    }
    Ok(())
}

async fn cmd_inspect(store: &CheckpointStore, checkpoint: &str, json: bool) -> Result<()> {
    use colored::Colorize;

    let loader = CheckpointLoader::new(store.clone());
    let meta = loader.metadata(checkpoint).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
        return Ok(());
    }

    println!("\n{}", format!("Checkpoint {}", meta.name).as_str().bold().cyan());
    println!("  ID:          {}", meta.checkpoint_id);
    println!("  Format:      v{}", meta.format_version);
    println!("  Dtype:       {}", meta.dtype);
    println!("  Parameters:  {}", meta.num_params());
    println!("  Size:        {}", format_bytes(meta.size_bytes));

    let m = &meta.model;
    println!("\n{}", "Model:".bold());
    println!(
        "  layers={} embed={} hidden={} heads={} kv_heads={} head_dim={} vocab={}",
        m.num_layers, m.embed_dim, m.hidden_dim, m.num_heads, m.num_kv_heads, m.head_dim, m.vocab_size
    );

    println!("\n{}", "Tensors:".bold());
    for entry in &meta.tensors {
        println!(
            "  {:<36} {:<14} {:>10}  {}",
            entry.name,
            format!("{:?}", entry.shape),
            format_bytes(entry.size_bytes),
            entry.sha256.get(..12).unwrap_or(&entry.sha256)
        );
    }
    Ok(())
}

/// Mesh and strategy from config, with command-line overrides
fn placement(config: &Config, args: &PlacementArgs) -> Result<(DeviceMesh, ShardingStrategy)> {
    let caps = DeviceCapabilities::detect();
    let axis = config.sharding.axis().unwrap_or("data").to_string();

    let strategy = match &args.strategy {
        Some(name) => ShardingStrategy::from_name(name, &axis)?,
        None => config.sharding.clone(),
    };
    let mesh = match args.devices {
        Some(n) => DeviceMesh::virtual_host(vec![MeshAxis::new(axis, n)], &caps)?,
        None => config.build_mesh(&caps)?,
    };
    Ok((mesh, strategy))
}

async fn cmd_plan(
    store: &CheckpointStore,
    config: &Config,
    checkpoint: &str,
    args: &PlacementArgs,
    json: bool,
) -> Result<()> {
    use colored::Colorize;

    let (mesh, strategy) = placement(config, args)?;
    let loader = CheckpointLoader::new(store.clone());
    let meta = loader.metadata(checkpoint).await?;
    let plan = ShardingPlan::build(&strategy, &mesh, &meta.metas())?;

    if json {
        let specs: serde_json::Map<String, serde_json::Value> = plan
            .iter()
            .map(|(name, t)| (name.clone(), serde_json::json!(t.spec.to_string())))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "checkpoint": meta.name,
                "strategy": strategy,
                "mesh": mesh.to_string(),
                "specs": specs,
                "bytes_per_device": plan.bytes_per_device(),
            }))?
        );
        return Ok(());
    }

    println!(
        "\n{}",
        format!("Sharding plan: {} on mesh ({})", strategy.name(), mesh)
            .as_str()
            .bold()
            .cyan()
    );
    for (name, t) in plan.iter() {
        let spec = t.spec.to_string();
        let spec = if t.is_replicated() {
            spec.as_str().normal()
        } else {
            spec.as_str().green()
        };
        println!("  {:<36} {:<14} {}", name, format!("{:?}", t.meta.shape), spec);
    }

    println!("\n{}", "Memory per device:".bold());
    for (device, bytes) in mesh.devices().iter().zip(plan.bytes_per_device()) {
        println!("  device {:<3} {:>10}", device.id, format_bytes(bytes));
    }
    println!(
        "  {} of {} parameters sharded, full copy {}",
        plan.num_sharded(),
        plan.len(),
        format_bytes(meta.size_bytes)
    );
    Ok(())
}

async fn load(
    store: &CheckpointStore,
    config: &Config,
    checkpoint: &str,
    args: &PlacementArgs,
) -> Result<(ModelConfig, ShardedParams)> {
    let (mesh, strategy) = placement(config, args)?;
    let loader = CheckpointLoader::new(store.clone());
    let (meta, params) = loader
        .load_checkpoint(checkpoint, &strategy, &mesh)
        .await
        .with_context(|| format!("Failed to load checkpoint '{}'", checkpoint))?;
    Ok((meta.model, params))
}

async fn cmd_next_token(
    store: &CheckpointStore,
    config: &Config,
    checkpoint: &str,
    prompt: &str,
    top_k: usize,
    args: &PlacementArgs,
) -> Result<()> {
    let (model_config, params) = load(store, config, checkpoint, args).await?;
    let model = DecoderTransformer::new(model_config)?;
    let tokenizer = ByteTokenizer::new();

    let mut tokens = vec![tokenizer.special_tokens().bos];
    tokens.extend(tokenizer.encode(prompt));
    let probs = softmax_rows(&model.forward(&params, &tokens)?)?;

    let mut ranked: Vec<(usize, f32)> = probs.row(tokens.len() - 1).iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    println!("Next token after {:?}:", prompt);
    for (id, p) in ranked.into_iter().take(top_k) {
        println!("  {:>5}  {:<8} {:.4}", id, format!("{:?}", tokenizer.decode(&[id as u32])), p);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_sample(
    store: &CheckpointStore,
    config: &Config,
    checkpoint: &str,
    prompts: &[String],
    request: &SampleRequest,
    seed: u64,
    args: &PlacementArgs,
    json: bool,
) -> Result<()> {
    let (model_config, params) = load(store, config, checkpoint, args).await?;
    let mut sampler = Sampler::new(
        Arc::new(DecoderTransformer::new(model_config)?),
        Arc::new(ByteTokenizer::new()),
        Arc::new(params),
        config.sampler.cache_length,
        seed,
    )?;

    let output = sampler.sample(prompts, request)?;
    info!(dtype = %sampler.dtype(), "Sampled from checkpoint");
    sampler.stats().log_summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for (prompt, text) in prompts.iter().zip(&output.text) {
        println!("\n> {}", prompt);
        println!("{}", text);
    }
    sampler.stats().display();
    Ok(())
}

//! CLI: quantize a safetensors checkpoint and save it for reloading.

use anyhow::{Context, Result};
use clap::Parser;
use quanto_resolver::core::io::{load_checkpoint_dir, load_checkpoint_file};
use quanto_resolver::{
    default_backend, save_pretrained, FloatDtype, LoadOptions, QuantizationConfig, Resolver,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "quantize_model",
    about = "Quantize the linear layers of a safetensors checkpoint"
)]
struct Args {
    /// Checkpoint file or directory of shards
    input: PathBuf,

    /// Directory to write the quantized checkpoint into
    output: PathBuf,

    /// Weight precision: float8, int8, int4 or int2
    #[arg(long, default_value = "int8")]
    weights: String,

    /// Optional activation precision: float8 or int8
    #[arg(long)]
    activations: Option<String>,

    /// Module to leave unquantized (repeatable)
    #[arg(long = "exclude", value_name = "MODULE")]
    exclude: Vec<String>,

    /// Module kept unquantized in float32 (repeatable)
    #[arg(long = "keep-fp32", value_name = "MODULE")]
    keep_fp32: Vec<String>,

    /// Dtype for unquantized tensors: float32, float16 or bfloat16
    #[arg(long)]
    dtype: Option<String>,

    /// Read weights/activations/modules_to_not_convert from a JSON file instead
    #[arg(long, conflicts_with_all = ["activations", "exclude"])]
    config: Option<PathBuf>,

    /// Convert modules in parallel
    #[arg(long)]
    parallel: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => QuantizationConfig::from_json_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut config = QuantizationConfig::new(args.weights.clone())
                .with_modules_to_not_convert(args.exclude.clone());
            config.activations = args.activations.clone();
            config
        }
    };
    let validated = config.validate()?;

    let dtype = args
        .dtype
        .as_deref()
        .map(str::parse::<FloatDtype>)
        .transpose()?;
    let options = LoadOptions {
        dtype,
        keep_in_fp32_modules: args.keep_fp32.clone(),
        parallel: args.parallel,
    };

    println!("Input  : {}", args.input.display());
    println!("Output : {}", args.output.display());
    println!("Weights: {}", validated.weight_precision);
    if let Some(act) = validated.activation_precision {
        println!("Activations: {act}");
    }

    let backend = default_backend();
    let checkpoint = if args.input.is_dir() {
        load_checkpoint_dir(&args.input, backend.as_ref())
    } else {
        load_checkpoint_file(&args.input, backend.as_ref())
    }
    .with_context(|| format!("loading {}", args.input.display()))?;
    if checkpoint.metadata.is_some() {
        anyhow::bail!("{} is already quantized", args.input.display());
    }

    let dense_bytes = checkpoint.tree.size_in_bytes();
    let (model, report) = Resolver::with_options(validated, options)
        .with_backend(backend)
        .into_model(checkpoint.tree)?;
    save_pretrained(&model, &args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    println!(
        "Done in {:.2}s. Quantized: {}, skipped: {}",
        report.total_time_seconds, report.quantized_modules, report.skipped_modules
    );
    println!(
        "Size: {:.2} MiB -> {:.2} MiB",
        dense_bytes as f64 / (1024.0 * 1024.0),
        model.memory_footprint() as f64 / (1024.0 * 1024.0)
    );
    for name in &report.unmatched_exclusions {
        println!("  [WARN] excluded module {name:?} not found");
    }

    if !report.mse_stats.is_empty() {
        println!("\nMSE Statistics:");
        for (name, mse) in report.mse_stats.iter() {
            println!("  {}: {:.6e}", name, mse);
        }
    }

    Ok(())
}

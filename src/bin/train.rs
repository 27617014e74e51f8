//! WTA autoencoder training binary.
//!
//! Trains a fully-connected winner-take-all autoencoder on a headerless CSV of
//! floats (one sample per row) or on a synthetic sparse dataset. Writes JSONL
//! metrics, periodic checkpoints and optionally the learned dictionary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use fcwta::{
    evaluate, load_model, save_checkpoint, train_epoch, ModelConfig, OptimizerKind, Session,
    WtaModel,
};
use log::{info, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "fcwta-train",
    about = "Train a winner-take-all autoencoder with lifetime sparsity"
)]
struct Args {
    /// Headerless CSV of floats, one sample per row
    #[arg(long)]
    data: Option<PathBuf>,

    /// Samples to generate when no --data is given
    #[arg(long, default_value_t = 1000)]
    synthetic_samples: usize,

    /// Input dimension of the synthetic dataset
    #[arg(long, default_value_t = 16)]
    synthetic_dim: usize,

    /// JSON model config; overrides the model flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Mini-batch size (the mask needs exactly this many samples)
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Fraction of the batch each hidden unit may fire for
    #[arg(long, default_value_t = 0.05)]
    sparsity: f64,

    /// Width of the code
    #[arg(long, default_value_t = 16)]
    hidden_units: usize,

    /// Number of ReLU encode layers
    #[arg(long, default_value_t = 3)]
    encode_layers: usize,

    #[arg(long, default_value_t = 1e-2)]
    learning_rate: f32,

    /// Decode with an independent matrix instead of the transposed encoder
    #[arg(long, default_value_t = false)]
    untied: bool,

    /// Update rule: sgd, momentum or adam
    #[arg(long, default_value = "adam")]
    optimizer: OptimizerKind,

    /// Number of training epochs
    #[arg(long, default_value_t = 20)]
    epochs: usize,

    /// Seed for shuffling and synthetic data
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Keep sample order fixed
    #[arg(long, default_value_t = false)]
    no_shuffle: bool,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "data/output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Checkpoint directory
    #[arg(long, default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Save checkpoint every N epochs (0 = only at the end)
    #[arg(long, default_value_t = 5)]
    checkpoint_every: usize,

    /// Resume from checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Write the learned dictionary as CSV
    #[arg(long)]
    dictionary_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let data = match &args.data {
        Some(path) => load_csv(path)?,
        None => {
            info!(
                "no --data given, generating {} synthetic samples of dim {}",
                args.synthetic_samples, args.synthetic_dim
            );
            synthetic_dataset(args.synthetic_samples, args.synthetic_dim, args.seed)
        }
    };

    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent).context("failed to create metrics output directory")?;
    }
    fs::create_dir_all(&args.checkpoint_dir).context("failed to create checkpoint directory")?;

    let mut session = Session::new();
    let model = if let Some(ckpt_path) = &args.resume {
        info!("resuming from checkpoint {}", ckpt_path.display());
        let (checkpoint, model) = load_model(ckpt_path, &mut session)
            .with_context(|| format!("failed to load checkpoint {}", ckpt_path.display()))?;
        info!("resumed at global_step={}", checkpoint.global_step);
        model
    } else {
        let config = model_config(&args, data.ncols())?;
        WtaModel::build(config, &mut session)?
    };
    let config = model.config().clone();
    if data.ncols() != config.input_dim {
        bail!(
            "dataset has {} columns, model expects input_dim {}",
            data.ncols(),
            config.input_dim
        );
    }

    let mut metrics_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)
        .context("failed to open metrics file")?;

    info!("WTA autoencoder training");
    info!(
        "  samples: {}, input_dim: {}, hidden_units: {}, encode_layers: {}",
        data.nrows(),
        config.input_dim,
        config.hidden_units,
        config.encode_layers
    );
    info!(
        "  batch_size: {}, sparsity: {} (k={}), optimizer: {} lr={}, tied: {}",
        config.batch_size,
        config.sparsity,
        model.k(),
        config.optimizer,
        config.learning_rate,
        config.tie_weights
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    for epoch in 1..=args.epochs {
        let epoch_start = Instant::now();
        let metrics = train_epoch(&model, &mut session, &data, !args.no_shuffle, &mut rng)
            .with_context(|| format!("epoch {epoch} failed"))?;
        let eval = evaluate(&model, &mut session, &data)?;
        let elapsed = epoch_start.elapsed().as_secs_f32();

        info!(
            "epoch {:3} | train loss: {:.4} | eval loss: {:.4} | step: {} | {:.1}s",
            epoch,
            metrics.avg_loss,
            eval.avg_loss,
            session.global_step(),
            elapsed
        );

        let epoch_event = serde_json::json!({
            "type": "epoch",
            "epoch": epoch,
            "global_step": session.global_step(),
            "train": metrics,
            "eval_loss": eval.avg_loss,
            "elapsed_secs": elapsed,
        });
        writeln!(metrics_file, "{epoch_event}").context("failed to write metrics")?;

        if args.checkpoint_every > 0 && epoch % args.checkpoint_every == 0 {
            let ckpt_path = args.checkpoint_dir.join(format!("epoch_{epoch:03}.json"));
            match save_checkpoint(&model, &session, &ckpt_path) {
                Ok(()) => {
                    let ckpt_event = serde_json::json!({
                        "type": "checkpoint",
                        "epoch": epoch,
                        "global_step": session.global_step(),
                        "path": ckpt_path.to_string_lossy(),
                    });
                    writeln!(metrics_file, "{ckpt_event}")
                        .context("failed to write checkpoint event")?;
                }
                Err(e) => warn!("checkpoint save failed: {e}"),
            }
        }

        metrics_file.flush().context("failed to flush metrics")?;
    }

    let final_path = args.checkpoint_dir.join("final.json");
    save_checkpoint(&model, &session, &final_path)?;
    info!("training complete, final checkpoint: {}", final_path.display());

    if let Some(path) = &args.dictionary_out {
        let dictionary = model.dictionary(&session)?;
        write_csv(path, &dictionary)?;
        info!(
            "wrote {}x{} dictionary to {}",
            dictionary.nrows(),
            dictionary.ncols(),
            path.display()
        );
    }

    Ok(())
}

fn model_config(args: &Args, input_dim: usize) -> Result<ModelConfig> {
    if let Some(path) = &args.config {
        let config = ModelConfig::from_json_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        return Ok(config);
    }
    Ok(ModelConfig {
        sparsity: args.sparsity,
        hidden_units: args.hidden_units,
        encode_layers: args.encode_layers,
        learning_rate: args.learning_rate,
        tie_weights: !args.untied,
        optimizer: args.optimizer,
        ..ModelConfig::new(input_dim, args.batch_size)
    })
}

/// Read a headerless CSV of floats into `[rows, cols]`.
fn load_csv(path: &Path) -> Result<Array2<f32>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut values = Vec::new();
    let mut cols = None;
    let mut rows = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        match cols {
            None => cols = Some(record.len()),
            Some(n) if n != record.len() => {
                bail!("row {} has {} fields, expected {}", line + 1, record.len(), n)
            }
            Some(_) => {}
        }
        for field in record.iter() {
            let value: f32 = field
                .parse()
                .with_context(|| format!("row {}: cannot parse {field:?}", line + 1))?;
            values.push(value);
        }
        rows += 1;
    }

    let cols = cols.context("dataset is empty")?;
    info!("loaded {rows}x{cols} samples from {}", path.display());
    Ok(Array2::from_shape_vec((rows, cols), values)?)
}

fn write_csv(path: &Path, matrix: &Array2<f32>) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(File::create(path)?);
    for row in matrix.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Samples built from a few random prototypes, each sample activating one
/// prototype with a random gain plus small noise.
fn synthetic_dataset(samples: usize, dim: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let num_prototypes = dim.clamp(1, 8);
    let prototypes = Array2::<f32>::from_shape_fn((num_prototypes, dim), |_| {
        if rng.gen_bool(0.25) {
            rng.gen_range(0.5..1.0)
        } else {
            0.0
        }
    });

    let mut data = Array2::zeros((samples, dim));
    for mut row in data.rows_mut() {
        let p = rng.gen_range(0..num_prototypes);
        let gain: f32 = rng.gen_range(0.5..1.5);
        for (x, &proto) in row.iter_mut().zip(prototypes.row(p)) {
            *x = gain * proto + rng.gen_range(0.0..0.05);
        }
    }
    data
}

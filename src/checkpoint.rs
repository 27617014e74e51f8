//! Checkpoint persistence.
//!
//! A [`Checkpoint`] holds everything a session needs to resume: the model
//! configuration, every parameter value, `global_step` and the optimizer's
//! slot tensors. It is stored as one JSON document; `serde_json` is built with
//! `float_roundtrip`, so every `f32` reads back bit-identical.
//!
//! Files are written to a temporary sibling, synced, then renamed over the
//! target, so a crash leaves either the old checkpoint or the new one.

use crate::core::{WtaError, WtaResult};
use crate::model::WtaModel;
use crate::optim::OptimizerState;
use crate::session::Session;
use crate::ModelConfig;
use log::info;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub config: ModelConfig,
    pub global_step: u64,
    pub params: BTreeMap<String, ArrayD<f32>>,
    pub optimizer: Option<OptimizerState>,
}

impl Checkpoint {
    /// Snapshot `model`'s parameters and the session's optimizer state.
    pub fn capture(model: &WtaModel, session: &Session) -> WtaResult<Self> {
        model.check_session(session)?;
        Ok(Self {
            format_version: FORMAT_VERSION,
            config: model.config().clone(),
            global_step: session.global_step(),
            params: session.store().snapshot(),
            optimizer: session.optimizer_state(),
        })
    }

    pub fn to_bytes(&self) -> WtaResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// # Errors
    /// `Serialization` for malformed input, `InvalidConfig` for an
    /// unsupported `format_version`.
    pub fn from_bytes(bytes: &[u8]) -> WtaResult<Self> {
        let checkpoint: Self = serde_json::from_slice(bytes)?;
        if checkpoint.format_version != FORMAT_VERSION {
            return Err(WtaError::InvalidConfig(format!(
                "unsupported checkpoint format_version {} (expected {})",
                checkpoint.format_version, FORMAT_VERSION
            )));
        }
        Ok(checkpoint)
    }

    /// Check that this checkpoint describes the same architecture as `config`.
    ///
    /// Batch size, sparsity, learning rate and initializers may differ.
    pub fn check_compatible(&self, config: &ModelConfig) -> WtaResult<()> {
        let saved = &self.config;
        let fields = [
            ("input_dim", saved.input_dim, config.input_dim),
            ("hidden_units", saved.hidden_units, config.hidden_units),
            ("encode_layers", saved.encode_layers, config.encode_layers),
            (
                "tie_weights",
                usize::from(saved.tie_weights),
                usize::from(config.tie_weights),
            ),
        ];
        for (field, stored, current) in fields {
            if stored != current {
                return Err(WtaError::InvalidConfig(format!(
                    "checkpoint {field} is {stored}, model has {current}"
                )));
            }
        }
        if saved.name != config.name {
            return Err(WtaError::InvalidConfig(format!(
                "checkpoint scope {:?} does not match model scope {:?}",
                saved.name, config.name
            )));
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Write `model`'s checkpoint to `path`, replacing any existing file.
pub fn save_checkpoint(model: &WtaModel, session: &Session, path: &Path) -> WtaResult<()> {
    let checkpoint = Checkpoint::capture(model, session)?;
    let bytes = checkpoint.to_bytes()?;

    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    info!(
        "saved checkpoint {} (global_step={}, {} params)",
        path.display(),
        checkpoint.global_step,
        checkpoint.params.len()
    );
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> WtaResult<Checkpoint> {
    let bytes = fs::read(path)?;
    Checkpoint::from_bytes(&bytes)
}

/// Build a model from the checkpoint's own config into `session` and restore it.
pub fn load_model(path: &Path, session: &mut Session) -> WtaResult<(Checkpoint, WtaModel)> {
    let checkpoint = load_checkpoint(path)?;
    let model = WtaModel::build(checkpoint.config.clone(), session)?;
    model.restore(session, &checkpoint)?;
    Ok((checkpoint, model))
}

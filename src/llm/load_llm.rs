use super::models::{Architecture, CausalLm};
use super::util;
use crate::error::{Error, Result};
use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};
use candle_nn::VarMap;
use hf_hub::{
    api::sync::{Api, ApiRepo},
    Repo, RepoType,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

const MAX_REPO_ID_LEN: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl DeviceKind {
    pub fn create(self) -> Result<Device> {
        match self {
            DeviceKind::Cuda => Ok(Device::new_cuda(0)?),
            DeviceKind::Metal => Ok(Device::new_metal(0)?),
            DeviceKind::Cpu => Ok(Device::Cpu),
        }
    }
}

/// Accelerators usable by this build on this machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub cuda: bool,
    pub metal: bool,
}

impl Capabilities {
    pub fn probe() -> Self {
        Self {
            cuda: cuda_is_available(),
            metal: metal_is_available(),
        }
    }

    pub fn has(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Cuda => self.cuda,
            DeviceKind::Metal => self.metal,
            DeviceKind::Cpu => true,
        }
    }
}

/// First entry of `priority` that is available, the CPU when none is.
pub fn resolve_device(priority: &[DeviceKind], caps: Capabilities) -> DeviceKind {
    priority
        .iter()
        .copied()
        .find(|kind| caps.has(*kind))
        .unwrap_or(DeviceKind::Cpu)
}

pub fn device(
    cpu: bool,
    priority: &[DeviceKind],
    caps: Capabilities,
) -> Result<(DeviceKind, Device)> {
    let kind = if cpu {
        DeviceKind::Cpu
    } else {
        resolve_device(priority, caps)
    };
    if kind == DeviceKind::Cpu && !cpu {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("running on CPU, to run on GPU, build with `--features cuda`");
        }
    }
    Ok((kind, kind.create()?))
}

pub fn dtype(requested: Option<&str>, device: &Device) -> Result<DType> {
    match requested {
        Some("f32") => Ok(DType::F32),
        Some("f16") => Ok(DType::F16),
        Some("bf16") => Ok(DType::BF16),
        Some(other) => Err(Error::Norm {
            message: format!("unsupported dtype `{other}`"),
        }),
        None if device.is_cpu() => Ok(DType::F32),
        None => Ok(DType::F16),
    }
}

/// Where the pretrained artifacts of a model come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Hub(String),
    Local(PathBuf),
}

impl ModelSource {
    /// An existing directory is used as is, anything else must look like a hub repo id.
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(Error::InvalidModelId(id.to_string()));
        }
        let path = Path::new(id);
        if path.is_dir() {
            return Ok(ModelSource::Local(path.to_path_buf()));
        }
        if is_repo_id(id) {
            Ok(ModelSource::Hub(id.to_string()))
        } else {
            Err(Error::InvalidModelId(id.to_string()))
        }
    }

    pub fn name(&self) -> String {
        match self {
            ModelSource::Hub(id) => id.clone(),
            ModelSource::Local(path) => path.display().to_string(),
        }
    }

    /// Resolves the config, tokenizer and weight files, downloading them when needed.
    pub fn fetch(&self, revision: &str) -> Result<ModelFiles> {
        match self {
            ModelSource::Hub(id) => {
                tracing::info!(model = %id, revision, "fetching model from the hub");
                let api = Api::new()?;
                let repo = api.repo(Repo::with_revision(
                    id.clone(),
                    RepoType::Model,
                    revision.to_string(),
                ));
                let config = repo.get("config.json")?;
                let tokenizer = repo.get("tokenizer.json")?;
                let weights = match repo.get("model.safetensors") {
                    Ok(file) => vec![file],
                    Err(e) => {
                        tracing::debug!("no single weight file ({e}), trying sharded index");
                        hub_load_safetensors(&repo, "model.safetensors.index.json")?
                    }
                };
                Ok(ModelFiles {
                    config,
                    tokenizer,
                    weights,
                })
            }
            ModelSource::Local(dir) => local_files(dir),
        }
    }
}

fn is_repo_id(id: &str) -> bool {
    if id.len() > MAX_REPO_ID_LEN || id.contains("--") || id.contains("..") {
        return false;
    }
    let segments: Vec<&str> = id.split('/').collect();
    if segments.len() > 2 {
        return false;
    }
    segments.iter().all(|segment| {
        !segment.is_empty()
            && !segment.starts_with(&['-', '.'][..])
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

fn local_files(dir: &Path) -> Result<ModelFiles> {
    let require = |name: &str| -> Result<PathBuf> {
        let file = dir.join(name);
        if file.is_file() {
            Ok(file)
        } else {
            Err(Error::MissingArtifact(file.display().to_string()))
        }
    };
    let config = require("config.json")?;
    let tokenizer = require("tokenizer.json")?;
    let weights = crate::utility::find_files_with_extension(dir, "safetensors")?;
    if weights.is_empty() {
        return Err(Error::MissingArtifact(format!(
            "{}/*.safetensors",
            dir.display()
        )));
    }
    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn hub_load_safetensors(repo: &ApiRepo, json_file: &str) -> Result<Vec<PathBuf>> {
    let json_file = repo.get(json_file)?;
    let json: serde_json::Value = serde_json::from_reader(std::fs::File::open(json_file)?)?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        _ => return Err(Error::MissingArtifact("weight_map".to_string())),
    };
    let shards: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    shards
        .into_iter()
        .map(|shard| repo.get(shard).map_err(Error::from))
        .collect()
}

pub fn read_config(files: &ModelFiles) -> Result<serde_json::Value> {
    Ok(serde_json::from_slice(&std::fs::read(&files.config)?)?)
}

pub fn load_model(
    config: serde_json::Value,
    files: &ModelFiles,
    device: &Device,
    dtype: DType,
    use_flash_attn: bool,
) -> Result<CausalLm> {
    let arch = Architecture::detect(&config)?;
    tracing::info!(?arch, ?dtype, shards = files.weights.len(), "initializing model");

    let varmap = VarMap::new();
    let vb = util::from_mmaped_safetensors(&varmap, &files.weights, dtype, device, false)?;

    CausalLm::load(arch, config, vb, use_flash_attn)
}

pub fn load_tokenizer(files: &ModelFiles) -> Result<Tokenizer> {
    tracing::debug!(file = %files.tokenizer.display(), "loading tokenizer");
    Tokenizer::from_file(&files.tokenizer).map_err(Error::tokenizer)
}

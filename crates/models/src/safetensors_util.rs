use anyhow::Result;
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use tch::{nn, Kind, Tensor};

pub const WEIGHTS_NAME: &str = "pytorch_model.safetensors";

/// Outcome of copying a weights file into a var store by tensor name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// In the var store but not in the file; left at their initial values.
    pub missing: Vec<String>,
    /// In the file but not in the var store; ignored.
    pub unexpected: Vec<String>,
}

/// Loads every tensor whose name exists in `vs`. Loading an encoder checkpoint
/// into a model with a different task head is expected to report the head as
/// missing.
pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<LoadReport> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut report = LoadReport::default();

    for (name, view) in tensors.tensors() {
        if let Some(var) = variables.get_mut(&name) {
            let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
            let kind = match view.dtype() {
                safetensors::Dtype::F32 => Kind::Float,
                safetensors::Dtype::F64 => Kind::Double,
                safetensors::Dtype::F16 => Kind::Half,
                safetensors::Dtype::BF16 => Kind::BFloat16,
                _ => return Err(anyhow::anyhow!("Unsupported dtype for {}: {:?}", name, view.dtype())),
            };
            if var.size() != shape {
                return Err(anyhow::anyhow!(
                    "Shape mismatch for {}: checkpoint {:?}, model {:?}",
                    name,
                    shape,
                    var.size()
                ));
            }

            let data = view.data();
            let tch_tensor = Tensor::from_data_size(data, &shape, kind)
                .to_kind(var.kind())
                .to_device(device);

            tch::no_grad(|| {
                var.copy_(&tch_tensor);
            });
            log::debug!("Loaded tensor: {}", name);
            report.loaded.push(name);
        } else {
            report.unexpected.push(name);
        }
    }

    let loaded: HashSet<&String> = report.loaded.iter().collect();
    report.missing = variables
        .keys()
        .filter(|name| !loaded.contains(name))
        .cloned()
        .collect();
    report.missing.sort();
    report.unexpected.sort();

    if !report.missing.is_empty() {
        log::info!("Weights not found in checkpoint, left initialized: {:?}", report.missing);
    }
    if !report.unexpected.is_empty() {
        log::info!("Checkpoint weights not used by this model: {:?}", report.unexpected);
    }

    Ok(report)
}

pub fn save_safetensors<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    // tch picks the safetensors writer from the extension.
    vs.save(path)?;
    Ok(())
}

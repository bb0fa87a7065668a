use crate::error::{Error, Result};
use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use tqdm::Iter;

/// Load tensors into a VarBuilder backed by a VarMap using MmapedSafetensors.
/// Set `silent` to not show a progress bar.
pub fn from_mmaped_safetensors<'a, P: AsRef<Path>>(
    map: &VarMap,
    paths: &[P],
    dtype: DType,
    device: &Device,
    silent: bool,
) -> Result<VarBuilder<'a>> {
    {
        let mut ws = map.data().lock().map_err(|e| Error::Norm {
            message: e.to_string(),
        })?;

        let tensors = unsafe { candle_core::safetensors::MmapedSafetensors::multi(paths)? };
        let names: Vec<String> = tensors.tensors().into_iter().map(|(name, _)| name).collect();

        let load = |name: &str| -> Result<Var> {
            let tensor = tensors.load(name, device)?.to_dtype(dtype)?;
            Ok(Var::from_tensor(&tensor)?)
        };

        if silent {
            for name in names {
                let var = load(&name)?;
                ws.insert(name, var);
            }
        } else {
            for name in names.into_iter().tqdm() {
                let var = load(&name)?;
                ws.insert(name, var);
            }
        }
    }

    Ok(VarBuilder::from_varmap(map, dtype, device))
}

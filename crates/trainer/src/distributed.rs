use anyhow::{bail, Context, Result};
use std::env;
use tch::{Cuda, Device};

use crate::collective::{Collective, CollectiveConfig};

/// Device placement and process-group membership of this process.
pub struct DeviceSetup {
    pub device: Device,
    /// Accelerators this process drives; more than one only in single-process mode.
    pub n_gpu: usize,
    pub is_master: bool,
    pub collective: Option<Collective>,
}

impl DeviceSetup {
    pub fn world_size(&self) -> usize {
        self.collective.as_ref().map_or(1, Collective::world_size)
    }

    pub fn rank(&self) -> usize {
        self.collective.as_ref().map_or(0, Collective::rank)
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Result<T> {
    let raw = env::var(name).with_context(|| format!("{} is not set", name))?;
    raw.parse()
        .map_err(|_| anyhow::anyhow!("{} has invalid value '{}'", name, raw))
}

/// Reads the rendezvous block the launcher sets on every worker.
pub fn collective_config_from_env() -> Result<CollectiveConfig> {
    Ok(CollectiveConfig {
        rank: env_var("RANK")?,
        world_size: env_var("WORLD_SIZE")?,
        master_addr: env_var("MASTER_ADDR")?,
        master_port: env_var("MASTER_PORT")?,
    })
}

/// Picks the devices for this process. With `local_rank == -1` the process
/// owns every visible accelerator; otherwise it owns the one matching its
/// local rank and joins the collective described by its environment.
pub fn setup_distributed(local_rank: i64, no_cuda: bool) -> Result<DeviceSetup> {
    let cuda = !no_cuda && Cuda::is_available();

    if local_rank == -1 {
        let (device, n_gpu) = if cuda {
            (Device::Cuda(0), Cuda::device_count() as usize)
        } else {
            (Device::Cpu, 0)
        };
        log::info!("device: {:?}, n_gpu: {}", device, n_gpu);
        return Ok(DeviceSetup {
            device,
            n_gpu,
            is_master: true,
            collective: None,
        });
    }
    if local_rank < 0 {
        bail!("local rank must be -1 or a process index, got {}", local_rank);
    }

    let device = if cuda {
        Device::Cuda(local_rank as usize)
    } else {
        Device::Cpu
    };
    let config = collective_config_from_env()?;
    let collective = Collective::connect(&config)?;
    log::info!(
        "device: {:?}, rank: {}/{}, local rank: {}",
        device,
        config.rank,
        config.world_size,
        local_rank
    );

    Ok(DeviceSetup {
        device,
        n_gpu: 1,
        is_master: config.is_main_process(),
        collective: Some(collective),
    })
}

/// Same seed on every process so that model initialization agrees.
pub fn set_random_seeds(seed: u64, n_gpu: usize) {
    tch::manual_seed(seed as i64);
    if n_gpu > 0 {
        tch::Cuda::manual_seed_all(seed);
    }
}

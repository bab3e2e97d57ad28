//! Multi-process launch of the training workflow, one worker per local
//! accelerator.

use clap::Parser;
use serde::Deserialize;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use trainer::{default_exp_name, TrainParams};

use crate::args::DistributedTrainCli;
use crate::error::{Result, TapeError};
use crate::logging::{level_from_request, setup_logging};
use crate::request::{FromRunRequest, RunRequest};
use crate::train::{check_extensions, check_gradient_accumulation, Extensions};

/// Where this node sits in the run and how its workers find rank 0.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchConfig {
    pub nnodes: usize,
    pub node_rank: usize,
    pub nproc_per_node: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl FromRunRequest for LaunchConfig {
    const FIELDS: &'static [&'static str] = &[
        "nnodes",
        "node_rank",
        "nproc_per_node",
        "master_addr",
        "master_port",
    ];
}

impl LaunchConfig {
    pub fn world_size(&self) -> usize {
        self.nproc_per_node * self.nnodes
    }

    fn validate(&self) -> Result<()> {
        if self.nnodes == 0 || self.nproc_per_node == 0 {
            return Err(TapeError::config(format!(
                "nnodes and nproc_per_node must be at least 1, got {} and {}",
                self.nnodes, self.nproc_per_node
            )));
        }
        if self.node_rank >= self.nnodes {
            return Err(TapeError::config(format!(
                "node_rank {} is out of range for {} nodes",
                self.node_rank, self.nnodes
            )));
        }
        Ok(())
    }

    /// Environment block of the worker with `local_rank` on this node.
    pub fn worker_env(&self, local_rank: usize) -> Vec<(String, String)> {
        let rank = self.nproc_per_node * self.node_rank + local_rank;
        let mut env = vec![
            ("MASTER_ADDR".to_string(), self.master_addr.clone()),
            ("MASTER_PORT".to_string(), self.master_port.to_string()),
            ("WORLD_SIZE".to_string(), self.world_size().to_string()),
            ("RANK".to_string(), rank.to_string()),
            ("LOCAL_RANK".to_string(), local_rank.to_string()),
        ];
        if self.nproc_per_node > 1 {
            env.push(("OMP_NUM_THREADS".to_string(), "1".to_string()));
        }
        env
    }
}

fn terminate(children: &mut Vec<(usize, Child)>) {
    for (rank, child) in children.iter_mut() {
        if let Err(err) = child.kill() {
            log::warn!("Could not kill worker {}: {}", rank, err);
        }
        let _ = child.wait();
    }
    children.clear();
}

/// How long workers may keep running once another worker has failed.
pub const FAILURE_GRACE: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Starts `config.nproc_per_node` workers, each built by `command_for` from a
/// copy of `request` carrying its local rank, and waits for all of them.
///
/// Fails with the first worker to fail. The others get [`FAILURE_GRACE`] to
/// exit on their own before they are killed. A worker that cannot be started
/// stops the launch and kills the ones already running.
pub fn launch<F>(request: &RunRequest, config: &LaunchConfig, command_for: F) -> Result<()>
where
    F: FnMut(usize, &RunRequest) -> Result<Command>,
{
    launch_with_grace(request, config, FAILURE_GRACE, command_for)
}

/// [`launch`] with an explicit grace period after the first failure.
pub fn launch_with_grace<F>(
    request: &RunRequest,
    config: &LaunchConfig,
    grace: Duration,
    mut command_for: F,
) -> Result<()>
where
    F: FnMut(usize, &RunRequest) -> Result<Command>,
{
    config.validate()?;

    let mut children: Vec<(usize, Child)> = Vec::with_capacity(config.nproc_per_node);
    for local_rank in 0..config.nproc_per_node {
        let worker_request = request.with("local_rank", local_rank as i64);
        let spawned = command_for(local_rank, &worker_request).and_then(|mut command| {
            command.envs(config.worker_env(local_rank));
            command.spawn().map_err(TapeError::from)
        });
        match spawned {
            Ok(child) => children.push((local_rank, child)),
            Err(err) => {
                log::error!("Failed to start worker {}: {}", local_rank, err);
                terminate(&mut children);
                return Err(err);
            }
        }
    }
    log::debug!("Started {} workers", children.len());

    let mut first_failure: Option<TapeError> = None;
    let mut kill_at: Option<Instant> = None;
    while !children.is_empty() {
        let mut running = Vec::with_capacity(children.len());
        for (rank, mut child) in children {
            let failure = match child.try_wait() {
                Ok(None) => {
                    running.push((rank, child));
                    continue;
                }
                Ok(Some(status)) if status.success() => continue,
                Ok(Some(status)) => {
                    log::error!("Worker {} failed: {}", rank, status);
                    TapeError::WorkerFailure {
                        rank,
                        code: status.code(),
                    }
                }
                Err(err) => {
                    log::error!("Lost track of worker {}: {}", rank, err);
                    let _ = child.kill();
                    let _ = child.wait();
                    TapeError::Io(err)
                }
            };
            if first_failure.is_none() {
                first_failure = Some(failure);
                kill_at = Some(Instant::now() + grace);
            }
        }
        children = running;

        if children.is_empty() {
            break;
        }
        if kill_at.is_some_and(|at| Instant::now() >= at) {
            log::warn!(
                "Stopping {} workers still running after a worker failed",
                children.len()
            );
            terminate(&mut children);
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Re-runs this executable as a training worker for `request`.
pub fn worker_command(_local_rank: usize, request: &RunRequest) -> Result<Command> {
    let mut command = Command::new(std::env::current_exe()?);
    command.arg("worker").arg("--request").arg(request.to_json()?);
    Ok(command)
}

/// Checks a distributed training request in the parent, names the
/// experiment once for every worker and launches them.
pub fn launch_distributed_train<F>(request: &RunRequest, command_for: F) -> Result<()>
where
    F: FnMut(usize, &RunRequest) -> Result<Command>,
{
    let worker_request = request.with("local_rank", 0);
    check_gradient_accumulation(&worker_request)?;
    check_extensions(&worker_request, &Extensions::detect())?;
    let params: TrainParams = worker_request.resolve()?;
    let config: LaunchConfig = request.resolve()?;

    let exp_name = params
        .exp_name
        .unwrap_or_else(|| default_exp_name(&params.task, &params.model_type));
    log::info!(
        "Launching {} workers (world size {}) for {}",
        config.nproc_per_node,
        config.world_size(),
        exp_name
    );
    launch(&request.with("exp_name", exp_name), &config, command_for)
}

/// Runs distributed training for `request`, or for the process arguments
/// when none is given.
pub fn run_train_distributed(request: Option<RunRequest>) -> Result<()> {
    let request = match request {
        Some(request) => request,
        None => RunRequest::from_args(&DistributedTrainCli::parse().args)?,
    };
    setup_logging(-1, None, level_from_request(&request)?)?;
    launch_distributed_train(&request, worker_command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(nproc_per_node: usize) -> LaunchConfig {
        LaunchConfig {
            nnodes: 2,
            node_rank: 1,
            nproc_per_node,
            master_addr: "10.0.0.1".to_string(),
            master_port: 29501,
        }
    }

    #[test]
    fn worker_env_places_ranks_after_earlier_nodes() {
        let env = config(4).worker_env(3);
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("RANK"), Some("7"));
        assert_eq!(get("WORLD_SIZE"), Some("8"));
        assert_eq!(get("LOCAL_RANK"), Some("3"));
        assert_eq!(get("MASTER_PORT"), Some("29501"));
        assert_eq!(get("OMP_NUM_THREADS"), Some("1"));
        assert_eq!(
            config(1).worker_env(0).iter().find(|(k, _)| k == "OMP_NUM_THREADS"),
            None
        );
    }

    #[test]
    fn out_of_range_node_rank_is_rejected() {
        let config = LaunchConfig {
            node_rank: 2,
            ..config(1)
        };
        let err = launch(&RunRequest::new(), &config, |_, _| {
            panic!("no worker should be built")
        })
        .unwrap_err();
        assert!(matches!(err, TapeError::Config(_)));
    }
}

//! Gradient averaging across worker processes.
//!
//! Rank 0 listens on the master address; every other rank connects to it.
//! Reductions gather on rank 0 and broadcast the result back, which is enough
//! for the handful of processes a single node runs.

use anyhow::Result;
use tch::nn::VarStore;

/// Where and how the processes of one run meet.
#[derive(Debug, Clone)]
pub struct CollectiveConfig {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl CollectiveConfig {
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(feature = "distributed")]
mod tcp {
    use super::CollectiveConfig;
    use anyhow::{bail, Context, Result};
    use std::io::{ErrorKind, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
    const RETRY_INTERVAL: Duration = Duration::from_millis(100);

    pub struct Collective {
        rank: usize,
        world_size: usize,
        /// Rank 0: one stream per peer, indexed by `rank - 1`. Others: the
        /// stream to rank 0.
        peers: Vec<TcpStream>,
    }

    impl Collective {
        pub fn connect(config: &CollectiveConfig) -> Result<Self> {
            Self::connect_within(config, CONNECT_TIMEOUT)
        }

        /// Like `connect`, failing once `timeout` passes without every rank
        /// joining.
        pub fn connect_within(config: &CollectiveConfig, timeout: Duration) -> Result<Self> {
            let address = format!("{}:{}", config.master_addr, config.master_port);
            let deadline = Instant::now() + timeout;
            let peers = if config.rank == 0 {
                let listener = TcpListener::bind(&address)
                    .with_context(|| format!("Rank 0: failed to listen on {}", address))?;
                listener.set_nonblocking(true)?;
                log::info!(
                    "Rank 0: waiting for {} peers on {}",
                    config.world_size - 1,
                    address
                );

                let mut slots: Vec<Option<TcpStream>> =
                    (1..config.world_size).map(|_| None).collect();
                let mut joined = 0;
                while joined + 1 < config.world_size {
                    let mut stream = match listener.accept() {
                        Ok((stream, _)) => stream,
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            if Instant::now() >= deadline {
                                bail!(
                                    "Rank 0: only {} of {} peers joined on {} within {:?}",
                                    joined,
                                    config.world_size - 1,
                                    address,
                                    timeout
                                );
                            }
                            std::thread::sleep(RETRY_INTERVAL);
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    };
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(timeout))?;
                    let mut buf = [0u8; 4];
                    stream
                        .read_exact(&mut buf)
                        .context("Rank 0: peer connected without a handshake")?;
                    stream.set_read_timeout(None)?;
                    let rank = u32::from_le_bytes(buf) as usize;
                    if rank == 0 || rank >= config.world_size || slots[rank - 1].is_some() {
                        bail!("Rank 0: unexpected handshake from rank {}", rank);
                    }
                    slots[rank - 1] = Some(stream);
                    joined += 1;
                }
                slots.into_iter().flatten().collect()
            } else {
                let mut stream = loop {
                    match TcpStream::connect(&address) {
                        Ok(stream) => break stream,
                        Err(err) if Instant::now() < deadline => {
                            log::debug!("Rank {}: {} not ready ({})", config.rank, address, err);
                            std::thread::sleep(RETRY_INTERVAL);
                        }
                        Err(err) => {
                            return Err(err).with_context(|| {
                                format!("Rank {}: could not reach {}", config.rank, address)
                            })
                        }
                    }
                };
                stream.set_nodelay(true)?;
                stream.write_all(&(config.rank as u32).to_le_bytes())?;
                vec![stream]
            };

            log::info!("Rank {}: collective initialized", config.rank);
            Ok(Self {
                rank: config.rank,
                world_size: config.world_size,
                peers,
            })
        }

        pub fn rank(&self) -> usize {
            self.rank
        }

        pub fn world_size(&self) -> usize {
            self.world_size
        }

        /// Sums `data` element-wise over all ranks, in place.
        pub fn all_reduce_sum(&mut self, data: &mut [f32]) -> Result<()> {
            let mut bytes = vec![0u8; data.len() * 4];
            if self.rank == 0 {
                for peer in &mut self.peers {
                    peer.read_exact(&mut bytes)?;
                    for (value, chunk) in data.iter_mut().zip(bytes.chunks_exact(4)) {
                        *value += f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    }
                }
                encode(data, &mut bytes);
                for peer in &mut self.peers {
                    peer.write_all(&bytes)?;
                }
            } else {
                encode(data, &mut bytes);
                let master = &mut self.peers[0];
                master.write_all(&bytes)?;
                master.read_exact(&mut bytes)?;
                for (value, chunk) in data.iter_mut().zip(bytes.chunks_exact(4)) {
                    *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
            Ok(())
        }

        pub fn all_reduce_mean(&mut self, data: &mut [f32]) -> Result<()> {
            self.all_reduce_sum(data)?;
            let scale = 1.0 / self.world_size as f32;
            data.iter_mut().for_each(|v| *v *= scale);
            Ok(())
        }

        pub fn barrier(&mut self) -> Result<()> {
            self.all_reduce_sum(&mut [0.0])
        }
    }

    fn encode(data: &[f32], bytes: &mut [u8]) {
        for (value, chunk) in data.iter().zip(bytes.chunks_exact_mut(4)) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(feature = "distributed")]
pub use tcp::Collective;

/// Stand-in when the collective backend is not compiled in.
#[cfg(not(feature = "distributed"))]
pub struct Collective {
    rank: usize,
    world_size: usize,
}

#[cfg(not(feature = "distributed"))]
impl Collective {
    pub fn connect(_config: &CollectiveConfig) -> Result<Self> {
        anyhow::bail!("Multi-process training is not enabled. Build with --features distributed")
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn all_reduce_sum(&mut self, _data: &mut [f32]) -> Result<()> {
        Ok(())
    }

    pub fn all_reduce_mean(&mut self, _data: &mut [f32]) -> Result<()> {
        Ok(())
    }

    pub fn barrier(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Replaces every gradient in `vs` with its mean over all ranks. Variables
/// are visited in name order so every rank sends the same layout.
pub fn average_gradients(vs: &VarStore, collective: &mut Collective) -> Result<()> {
    let mut variables: Vec<(String, tch::Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, var) in variables {
        if !var.requires_grad() {
            continue;
        }
        let mut grad = var.grad();
        let local = grad.defined();
        // Ranks stay in lockstep even when a parameter saw no gradient here.
        let contribution = if local { grad.shallow_clone() } else { var.zeros_like() };
        let flat = contribution
            .flatten(0, -1)
            .to_kind(tch::Kind::Float)
            .to_device(tch::Device::Cpu);
        let mut data = Vec::<f32>::try_from(&flat)?;
        collective.all_reduce_mean(&mut data)?;

        if local {
            let averaged = tch::Tensor::from_slice(&data)
                .view(grad.size().as_slice())
                .to_kind(grad.kind())
                .to_device(grad.device());
            tch::no_grad(|| grad.copy_(&averaged));
        } else {
            log::debug!("No local gradient for {}", name);
        }
    }
    Ok(())
}

#[cfg(all(test, feature = "distributed"))]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn all_reduce_mean_agrees_on_every_rank() {
        let port = free_port();
        let world_size = 3;
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                std::thread::spawn(move || {
                    let config = CollectiveConfig {
                        rank,
                        world_size,
                        master_addr: "127.0.0.1".to_string(),
                        master_port: port,
                    };
                    let mut collective = Collective::connect(&config).unwrap();
                    let mut data = vec![rank as f32, 10.0 * rank as f32];
                    collective.all_reduce_mean(&mut data).unwrap();
                    collective.barrier().unwrap();
                    data
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![1.0, 10.0]);
        }
    }

    #[test]
    fn rank_zero_gives_up_when_a_peer_never_joins() {
        let config = CollectiveConfig {
            rank: 0,
            world_size: 2,
            master_addr: "127.0.0.1".to_string(),
            master_port: free_port(),
        };
        let started = Instant::now();
        let err = match Collective::connect_within(&config, Duration::from_millis(300)) {
            Ok(_) => panic!("rank 0 connected without its peer"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("0 of 1 peers"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use tape_core::{collate, Batch, Example, TaskDataset};

/// This process's slice of a dataset shared by `world_size` processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub rank: usize,
    pub world_size: usize,
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub pad_id: i64,
    /// Threads used to read and tokenize examples.
    pub num_workers: usize,
    pub shard: Option<Shard>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            seed: 42,
            pad_id: 0,
            num_workers: 1,
            shard: None,
        }
    }
}

/// Per-step batch size of a single process when `batch_size` is the total
/// over all processes, devices and accumulation steps.
pub fn effective_batch_size(
    batch_size: usize,
    world_size: usize,
    n_gpu: usize,
    gradient_accumulation_steps: usize,
) -> usize {
    let divisor = world_size.max(1) * n_gpu.max(1) * gradient_accumulation_steps.max(1);
    (batch_size / divisor).max(1)
}

pub struct DataLoader {
    dataset: Box<dyn TaskDataset>,
    options: LoaderOptions,
    pool: ThreadPool,
    epoch: u64,
}

impl DataLoader {
    pub fn new(dataset: Box<dyn TaskDataset>, options: LoaderOptions) -> Result<Self> {
        if options.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if let Some(shard) = options.shard {
            if shard.world_size == 0 || shard.rank >= shard.world_size {
                bail!("invalid shard {} of {}", shard.rank, shard.world_size);
            }
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(options.num_workers.max(1))
            .thread_name(|i| format!("loader-{}", i))
            .build()?;
        Ok(Self {
            dataset,
            options,
            pool,
            epoch: 0,
        })
    }

    /// Reseeds the shuffle so every epoch sees a different order, identical
    /// across processes.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn dataset(&self) -> &dyn TaskDataset {
        self.dataset.as_ref()
    }

    /// Examples this process visits per epoch.
    pub fn num_examples(&self) -> usize {
        let total = self.dataset.len();
        match self.options.shard {
            Some(shard) => total.div_ceil(shard.world_size),
            None => total,
        }
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        self.num_examples().div_ceil(self.options.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(self.epoch));
            indices.shuffle(&mut rng);
        }

        match self.options.shard {
            Some(Shard { rank, world_size }) if !indices.is_empty() => {
                // Pad by wrapping around so every shard has the same length.
                let padded = indices.len().div_ceil(world_size) * world_size;
                let extra: Vec<usize> = indices
                    .iter()
                    .cycle()
                    .take(padded - indices.len())
                    .copied()
                    .collect();
                indices.extend(extra);
                indices.into_iter().skip(rank).step_by(world_size).collect()
            }
            _ => indices,
        }
    }

    fn load(&self, chunk: &[usize]) -> Result<Batch> {
        let dataset = self.dataset.as_ref();
        let examples: Vec<Example> = self.pool.install(|| {
            chunk
                .par_iter()
                .map(|&index| dataset.example(index))
                .collect::<Result<Vec<_>>>()
        })?;
        collate(examples, self.options.pad_id)
    }

    /// Batches of the current epoch. Example order within the epoch is kept;
    /// only the reading of each batch is spread over the worker threads.
    pub fn iter(&self) -> impl Iterator<Item = Result<Batch>> + '_ {
        let indices = self.indices();
        let batch_size = self.options.batch_size;
        let chunks: Vec<Vec<usize>> = indices.chunks(batch_size).map(<[usize]>::to_vec).collect();
        chunks.into_iter().map(move |chunk| self.load(&chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tape_core::Target;

    struct Numbers(usize);

    impl TaskDataset for Numbers {
        fn len(&self) -> usize {
            self.0
        }

        fn example(&self, index: usize) -> Result<Example> {
            Ok(Example {
                id: index.to_string(),
                input_ids: vec![2, index as i64 + 5, 3],
                target: Target::Label(index as i64),
            })
        }
    }

    fn ids(loader: &DataLoader) -> Vec<Vec<String>> {
        loader.iter().map(|b| b.unwrap().ids).collect()
    }

    #[test]
    fn unshuffled_batches_keep_dataset_order() {
        let options = LoaderOptions {
            batch_size: 2,
            num_workers: 3,
            ..Default::default()
        };
        let loader = DataLoader::new(Box::new(Numbers(5)), options).unwrap();
        assert_eq!(loader.len(), 3);
        assert_eq!(
            ids(&loader),
            vec![vec!["0", "1"], vec!["2", "3"], vec!["4"]]
        );
    }

    #[test]
    fn shuffle_depends_on_epoch_only() {
        let options = LoaderOptions {
            batch_size: 16,
            shuffle: true,
            ..Default::default()
        };
        let mut a = DataLoader::new(Box::new(Numbers(16)), options.clone()).unwrap();
        let b = DataLoader::new(Box::new(Numbers(16)), options).unwrap();
        assert_eq!(ids(&a), ids(&b));

        a.set_epoch(1);
        assert_ne!(ids(&a), ids(&b));
    }

    #[test]
    fn shards_are_disjoint_and_equal_length() {
        let shard = |rank| LoaderOptions {
            batch_size: 10,
            shard: Some(Shard {
                rank,
                world_size: 2,
            }),
            ..Default::default()
        };
        let first = DataLoader::new(Box::new(Numbers(5)), shard(0)).unwrap();
        let second = DataLoader::new(Box::new(Numbers(5)), shard(1)).unwrap();

        assert_eq!(first.num_examples(), 3);
        assert_eq!(ids(&first), vec![vec!["0", "2", "4"]]);
        assert_eq!(ids(&second), vec![vec!["1", "3", "0"]]);
    }

    #[test]
    fn effective_batch_size_never_drops_to_zero() {
        assert_eq!(effective_batch_size(1024, 2, 2, 4), 64);
        assert_eq!(effective_batch_size(4, 2, 1, 4), 1);
    }
}

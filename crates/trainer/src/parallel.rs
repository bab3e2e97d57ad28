use anyhow::{bail, Result};
use tch::{Device, Kind, Tensor};

use tape_core::{Batch, ModelFamily, ModelOutput, ModelSpec, TaskModel};

/// Copies every variable of `src` into the same-named variable of `dst`.
fn copy_weights(src: &dyn TaskModel, dst: &dyn TaskModel) -> Result<()> {
    let source = src.var_store().variables();
    for (name, mut var) in dst.var_store().variables() {
        match source.get(&name) {
            Some(value) => tch::no_grad(|| var.copy_(value)),
            None => bail!("replica has variable {} missing from the primary model", name),
        }
    }
    Ok(())
}

/// Inference-only replication of one model over several devices. Each batch is
/// split along the example dimension, the pieces run on their own replica, and
/// the outputs are gathered back on the first device in the original order.
pub struct DataParallel {
    replicas: Vec<Box<dyn TaskModel>>,
}

impl DataParallel {
    /// `primary` stays the source of truth; one copy is built per extra device.
    pub fn replicate(
        primary: Box<dyn TaskModel>,
        family: &dyn ModelFamily,
        spec: &ModelSpec,
        devices: &[Device],
    ) -> Result<Self> {
        let mut replicas = vec![primary];
        for &device in devices.iter().skip(1) {
            let replica_spec = ModelSpec {
                device,
                ..spec.clone()
            };
            let replica = family.build(&replica_spec)?;
            copy_weights(replicas[0].as_ref(), replica.as_ref())?;
            replicas.push(replica);
        }
        log::info!("Replicated model over {} devices", replicas.len());
        Ok(Self { replicas })
    }

    pub fn primary(&self) -> &dyn TaskModel {
        self.replicas[0].as_ref()
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Near-equal consecutive piece sizes, largest first, no empty pieces.
    fn piece_sizes(&self, batch_size: usize) -> Vec<usize> {
        let n = self.replicas.len().min(batch_size).max(1);
        (0..n)
            .map(|i| batch_size / n + usize::from(i < batch_size % n))
            .collect()
    }

    pub fn forward(&self, batch: &Batch, train: bool) -> Result<ModelOutput> {
        let sizes = self.piece_sizes(batch.len());
        let pieces = batch.split(&sizes)?;
        let home = self.primary().device();

        let mut predictions = Vec::with_capacity(pieces.len());
        let mut pooled = Vec::with_capacity(pieces.len());
        let mut losses = Vec::with_capacity(pieces.len());
        for (replica, piece) in self.replicas.iter().zip(pieces) {
            let piece = piece.to_device(replica.device(), true);
            let output = replica.forward(&piece, train)?;
            predictions.push(output.prediction.to_device(home));
            pooled.push(output.pooled.to_device(home));
            if let Some(loss) = output.loss {
                losses.push(loss.to_device(home));
            }
        }

        let loss = if losses.len() == predictions.len() {
            Some(Tensor::stack(&losses, 0).mean(Kind::Float))
        } else {
            None
        };
        Ok(ModelOutput {
            loss,
            prediction: Tensor::cat(&predictions, 0),
            pooled: Tensor::cat(&pooled, 0),
        })
    }
}

//! Training and evaluation loops
//!
//! Every step is replicated across [`Devices`]: the batch is split into one
//! shard per device, each device runs forward and backward on its own graph,
//! and the gradients and metrics are averaged before a single optimizer update.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    dataloader::{Batch, DataLoader, DataLoaderError, ImageDataset},
    loss::{accuracy, compute_metrics, cross_entropy_loss},
    metrics::{Metrics, MetricsAccumulator},
    nn::{Module, NNError, Sequential},
    optim::{Momentum, Optim, OptimError},
    parallel::{DeviceError, Devices},
    params::{Params, ParamsError},
    tensor::TensorError,
    values::Value,
};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Optim(#[from] OptimError),
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error("No examples to {0}")]
    NoExamples(&'static str),
}

/// Hyperparameters of a run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    /// Global batch size, split evenly across devices
    pub batch_size: usize,
    pub num_epochs: usize,
    pub num_devices: usize,
    pub seed: u64,
    pub eval_batch_size: usize,
}

impl TrainConfig {
    pub const BATCH_SIZE_PER_DEVICE: usize = 128;

    /// Defaults with a global batch of 128 per device
    pub fn with_devices(num_devices: usize) -> Self {
        Self {
            batch_size: Self::BATCH_SIZE_PER_DEVICE * num_devices,
            num_devices,
            ..Self::default()
        }
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.9,
            batch_size: Self::BATCH_SIZE_PER_DEVICE,
            num_epochs: 10,
            num_devices: 1,
            seed: 0,
            eval_batch_size: 500,
        }
    }
}

/// Parameters together with the optimizer updating them
#[derive(Debug, Clone)]
pub struct TrainState {
    pub params: Params,
    pub optimizer: Momentum,
}

impl TrainState {
    pub fn new(params: Params, learning_rate: f32, momentum: f32) -> Self {
        let optimizer = Momentum::new(&params, learning_rate, momentum);
        Self { params, optimizer }
    }
}

/// Train and eval metrics of one epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: Metrics,
    pub eval: Metrics,
}

/// Initialises the model for single images of `image_shape`
pub fn create_train_state(
    model: &Sequential,
    image_shape: [usize; 3],
    config: &TrainConfig,
    rng: &mut Pcg64Mcg,
) -> Result<TrainState, TrainError> {
    let [h, w, c] = image_shape;
    let (out_shape, params) = model.init(&[1, h, w, c], rng)?;
    log::info!(
        "Initialised {} parameter tensors ({} values), output shape {:?}",
        params.len(),
        params.num_elements(),
        out_shape
    );
    for (name, tensor) in params.iter() {
        log::debug!("{name}: {:?}", tensor.shape());
    }
    Ok(TrainState::new(params, config.learning_rate, config.momentum))
}

/// Forward and backward pass on one device shard, returns the gradients and metrics
pub fn train_step(
    model: &dyn Module,
    params: &Params,
    batch: Batch,
) -> Result<(Params, Metrics), TrainError> {
    let leaves = params.to_values();
    let logits = model.apply(&leaves, &Value::constant(batch.images))?;
    let loss = cross_entropy_loss(&logits, &batch.labels)?;
    loss.backward();

    let grads = params.from_grads(&leaves)?;
    let metrics = Metrics {
        loss: loss.data().item().unwrap_or(f32::NAN),
        accuracy: accuracy(&logits.data(), &batch.labels),
    };
    Ok((grads, metrics))
}

/// Runs [`train_step`] on every device, averages the results and updates the state once
pub fn parallel_train_step(
    model: &dyn Module,
    state: &mut TrainState,
    batch: Batch,
    devices: &Devices,
) -> Result<Metrics, TrainError> {
    let shards = batch.shard(devices.count())?;
    let params = &state.params;
    let replicas = devices
        .pmap(shards, |device, shard| {
            log::trace!("device {device}: {} examples", shard.len());
            train_step(model, params, shard)
        })?
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    let (grads, metrics): (Vec<Params>, Vec<Metrics>) = replicas.into_iter().unzip();
    let grads = Params::mean(&grads)?;
    let metrics = Metrics::mean(&metrics).ok_or(DeviceError::NoDevices)?;
    state.optimizer.apply_gradient(&mut state.params, &grads)?;
    Ok(metrics)
}

fn check_divisible(batch_size: usize, devices: &Devices) -> Result<(), DataLoaderError> {
    if batch_size % devices.count() != 0 {
        return Err(DataLoaderError::NotDivisible {
            batch_size,
            devices: devices.count(),
        });
    }
    Ok(())
}

/// One pass over the shuffled training set, returns the mean of the per-batch metrics
pub fn train_epoch<R: Rng + ?Sized>(
    model: &dyn Module,
    state: &mut TrainState,
    train_ds: &ImageDataset,
    batch_size: usize,
    devices: &Devices,
    epoch: usize,
    rng: &mut R,
) -> Result<Metrics, TrainError> {
    check_divisible(batch_size, devices)?;
    let loader = DataLoader::new(train_ds, batch_size)?;

    let mut batch_metrics = Vec::with_capacity(loader.steps_per_epoch());
    for (step, batch) in loader.iter(rng).enumerate() {
        let metrics = parallel_train_step(model, state, batch, devices)?;
        log::debug!("epoch {epoch} step {step}: {metrics}");
        batch_metrics.push(metrics);
    }

    let metrics = Metrics::mean(&batch_metrics).ok_or(TrainError::NoExamples("train on"))?;
    log::info!(
        "train epoch: {}, loss: {:.4}, accuracy: {:.2}",
        epoch,
        metrics.loss,
        metrics.accuracy * 100.0
    );
    Ok(metrics)
}

/// Metrics of one batch, no gradients are tracked
pub fn eval_step(model: &dyn Module, params: &Params, batch: Batch) -> Result<Metrics, TrainError> {
    let constants = params
        .tensors()
        .iter()
        .cloned()
        .map(Value::constant)
        .collect::<Vec<_>>();
    let logits = model.apply(&constants, &Value::constant(batch.images))?;
    Ok(compute_metrics(&logits, &batch.labels)?)
}

/// Metrics over the whole dataset, evaluated in chunks of `eval_batch_size`
pub fn eval_model(
    model: &dyn Module,
    params: &Params,
    test_ds: &ImageDataset,
    eval_batch_size: usize,
) -> Result<Metrics, TrainError> {
    let chunks = test_ds.chunks(eval_batch_size)?.collect::<Vec<_>>();
    let results = chunks
        .into_par_iter()
        .map(|batch| {
            let count = batch.len();
            eval_step(model, params, batch).map(|m| (m, count))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut acc = MetricsAccumulator::new();
    for (metrics, count) in results {
        acc.add(metrics, count);
    }
    acc.finish().ok_or(TrainError::NoExamples("evaluate"))
}

/// Trains `model` from scratch, returns the final state and the per-epoch history
pub fn train(
    model: &Sequential,
    train_ds: &ImageDataset,
    test_ds: &ImageDataset,
    config: &TrainConfig,
) -> Result<(TrainState, Vec<EpochSummary>), TrainError> {
    let devices = Devices::new(config.num_devices)?;
    check_divisible(config.batch_size, &devices)?;
    log::info!(
        "Training on {} device(s), global batch size {}",
        devices.count(),
        config.batch_size
    );

    let mut rng = Pcg64Mcg::seed_from_u64(config.seed);
    let mut init_rng = Pcg64Mcg::from_rng(&mut rng);
    let mut state = create_train_state(model, train_ds.image_shape(), config, &mut init_rng)?;

    let mut history = Vec::with_capacity(config.num_epochs);
    for epoch in 1..=config.num_epochs {
        let train = train_epoch(
            model,
            &mut state,
            train_ds,
            config.batch_size,
            &devices,
            epoch,
            &mut rng,
        )?;
        let eval = eval_model(model, &state.params, test_ds, config.eval_batch_size)?;
        log::info!(
            "eval epoch: {}, loss: {:.4}, accuracy: {:.2}",
            epoch,
            eval.loss,
            eval.accuracy * 100.0
        );
        history.push(EpochSummary { epoch, train, eval });
    }
    Ok((state, history))
}

//! Trains a small convolutional network on MNIST-style images
//! using the library provided by `cnn_rs`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run --release -- -h
//! cargo run --release -- --data-dir data/mnist
//! cargo run --release -- --dataset synthetic --num-epochs 2 --plot
//! ```
//!
//! IDX files (plain or `.gz`) are read from `--data-dir`, they are not downloaded.

use std::{error::Error, path::PathBuf};

use clap::Parser;
use cnn_rs::{
    datasets::{Dataset, get_datasets},
    model::cnn,
    plot::plot_history,
    train::{TrainConfig, train},
};

#[derive(Parser, Debug)]
#[command(about = "Train a CNN image classifier with momentum SGD")]
struct Args {
    #[clap(long, default_value_t = 0.1)]
    learning_rate: f32,
    #[clap(long, default_value_t = 0.9)]
    momentum: f32,
    /// Global batch size, defaults to 128 per device
    #[clap(long)]
    batch_size: Option<usize>,
    #[clap(long, default_value_t = 10)]
    num_epochs: usize,
    /// Number of replicas each step is split across
    #[clap(long, default_value_t = 1)]
    num_devices: usize,
    #[clap(short, long, value_enum, default_value_t = Dataset::Mnist)]
    dataset: Dataset,
    /// Directory holding the IDX files, defaults to `data/<dataset>`
    #[clap(long)]
    data_dir: Option<PathBuf>,
    #[clap(long, default_value_t = 0)]
    seed: u64,
    #[clap(long, default_value_t = 500)]
    eval_batch_size: usize,
    /// Write loss and accuracy curves to the output directory
    #[clap(long, default_value_t = false)]
    plot: bool,
    #[clap(short, long, default_value = "output")]
    output_dir: PathBuf,
}

impl Args {
    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            batch_size: self
                .batch_size
                .unwrap_or(TrainConfig::BATCH_SIZE_PER_DEVICE * self.num_devices),
            num_epochs: self.num_epochs,
            num_devices: self.num_devices,
            seed: self.seed,
            eval_batch_size: self.eval_batch_size,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.train_config();
    log::debug!("{config:?}");

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| args.dataset.default_dir());
    let (train_ds, test_ds) = get_datasets(args.dataset, &data_dir)?;

    let model = cnn(train_ds.num_classes());
    let (_, history) = train(&model, &train_ds, &test_ds, &config)?;

    if let Some(last) = history.last() {
        log::info!("final eval {}", last.eval);
    }
    if args.plot {
        plot_history(&history, &args.output_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::parse_from(["cnn-rs", "--num-devices", "2", "--dataset", "fashion-mnist"]);
        let config = args.train_config();
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.num_devices, 2);
        assert_eq!(args.dataset, Dataset::FashionMnist);

        let args = Args::parse_from(["cnn-rs", "--batch-size", "64", "--learning-rate", "0.05"]);
        let config = args.train_config();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.learning_rate, 0.05);
        assert_eq!(config, TrainConfig { batch_size: 64, learning_rate: 0.05, ..TrainConfig::default() });
    }
}

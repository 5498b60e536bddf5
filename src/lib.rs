//! A minimal library for training convolutional image classifiers
//! using a Flax-like declarative layer API.

pub mod backprop_fns;
pub mod dataloader;
pub mod datasets;
pub mod kernels;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod optim;
pub mod parallel;
pub mod params;
pub mod plot;
pub mod tensor;
pub mod train;
pub mod values;

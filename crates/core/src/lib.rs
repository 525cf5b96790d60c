#![deny(warnings)]

pub mod audio;
pub mod augment;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod embedding;
pub mod labels;
pub mod normalize;
pub mod pipeline;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

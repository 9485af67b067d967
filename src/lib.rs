pub mod autograd;
pub mod config;
pub mod data;
pub mod decoding;
pub mod error;
pub mod layers;
pub mod logging;
pub mod math;
pub mod models;
pub mod optim;
pub mod positional;
pub mod rng;
pub mod tensor;
pub mod trainer;
pub mod vocab;
pub mod weights;

pub use config::Options;
pub use error::{Error, Result};
pub use trainer::Seq2Seq;

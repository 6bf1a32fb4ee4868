pub mod cli;
pub mod distributions;
pub mod error;
pub mod flow;
pub mod kernel;
pub mod linalg;
pub mod model;
pub mod settings;
pub mod variational;

pub use error::{GpError, Result};

pub use candle_core;
pub use candle_nn;

pub mod checkpoints;
pub mod error;
pub mod fsutil;
pub mod icecast;
pub mod installer;
pub mod navigate;
pub mod service;
pub mod settings;
pub mod xmltree;

pub use error::{Error, Result};

//! Engine assembly: configuration in, running rollup engine out

pub mod builder;

pub use builder::{RollupEngine, RollupEngineBuilder};

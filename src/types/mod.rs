pub mod model;
pub mod training;
pub mod prediction;

pub use model::*;
pub use training::*;
pub use prediction::*;

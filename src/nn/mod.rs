//! Neural network components

pub mod layers;
pub mod losses;
pub mod models;

pub use layers::*;
pub use losses::*;
pub use models::*;

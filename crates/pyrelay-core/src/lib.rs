pub mod config;
pub mod hash;
pub mod machine;
pub mod types;
pub mod wire;

pub use types::*;

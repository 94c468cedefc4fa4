pub mod config;
pub mod fallback;

pub use config::*;
pub use fallback::*;

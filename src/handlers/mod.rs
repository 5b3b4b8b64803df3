pub mod config;
pub mod weather;

pub use self::config::*;
pub use self::weather::*;

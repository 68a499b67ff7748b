pub mod audio;
pub mod config;

pub use self::audio::*;
pub use self::config::*;

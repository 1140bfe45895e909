pub mod config;
pub mod sessions;
pub mod voice;

pub use config::*;
pub use sessions::*;
pub use voice::*;

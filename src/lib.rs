pub mod addon;
pub mod addressing;
pub mod app;
pub mod codec;
pub mod config;
pub mod device;
pub mod link;
pub mod packet;
pub mod rewrite;
pub mod session;
pub mod utils;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod plans;
pub mod quota;
pub mod server;
pub mod storage;
pub mod subscription;
pub mod usage;

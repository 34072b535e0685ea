pub mod analytics;
pub mod config;
pub mod storage;

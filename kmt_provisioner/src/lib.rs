pub mod cli;
pub mod config;
pub mod engine;
pub mod fabric;
pub mod managers;
pub mod provisioner;
pub mod recipe;
pub mod runner;
pub mod storage;
pub mod utils;
pub mod virtualization;

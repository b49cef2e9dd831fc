pub mod agent;
pub mod cli;
pub mod commands;
pub mod host;
pub mod platform;
pub mod policy;
pub mod state;
pub mod storage;

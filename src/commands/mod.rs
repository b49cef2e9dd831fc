pub mod agent;
pub mod utils;

pub use agent::{check_now, run, show_config, status, wake};

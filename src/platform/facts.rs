//! Point-in-time host facts reported in the device context `info` field

use chrono::Utc;
use serde_json::{Value, json};
use sysinfo::System;

/// Full facts, gathered on startup
pub fn full_facts() -> Value {
    let mut sys = System::new();
    sys.refresh_memory();

    json!({
        "hostname": super::identity::hostname(),
        "os": System::name(),
        "os_version": System::long_os_version(),
        "kernel": System::kernel_version(),
        "arch": std::env::consts::ARCH,
        "cpus": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        "total_memory": sys.total_memory(),
        "uptime": System::uptime(),
        "agent_version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now().to_rfc3339(),
    })
}

/// Brief facts, gathered on every other contact
pub fn brief_facts() -> Value {
    let mut sys = System::new();
    sys.refresh_memory();

    json!({
        "uptime": System::uptime(),
        "available_memory": sys.available_memory(),
        "time": Utc::now().to_rfc3339(),
    })
}

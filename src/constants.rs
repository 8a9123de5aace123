use std::time::Duration;

pub const USER_AGENT: &str = concat!("apt-pantry/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_ORIGIN_TIMEOUT: Duration = Duration::from_secs(60);

use std::env;
use std::net::IpAddr;

use tracing::warn;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_HUB_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    /// Bounded depth of the hub's inbound command queue.
    pub hub_queue_depth: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: parse_env("TANDEM_ROAD_BIND", defaults.bind, |_| true),
            port: parse_env("TANDEM_ROAD_PORT", defaults.port, |_| true),
            hub_queue_depth: parse_env("TANDEM_ROAD_HUB_QUEUE_DEPTH", defaults.hub_queue_depth, |depth| {
                *depth > 0
            }),
        }
    }

    pub fn listen_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind, self.port)
    }
}

/// Reads `var`, falling back to `default` with a warning when the value does
/// not parse or fails `valid`.
fn parse_env<T>(var: &str, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    let Ok(value) = env::var(var) else {
        return default;
    };
    match value.trim().parse::<T>() {
        Ok(parsed) if valid(&parsed) => parsed,
        Ok(_) => {
            warn!(variable = var, value = %value, "out-of-range value; using default");
            default
        }
        Err(err) => {
            warn!(variable = var, value = %value, error = %err, "invalid value; using default");
            default
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            hub_queue_depth: DEFAULT_HUB_QUEUE_DEPTH,
        }
    }
}

//! Scheduler daemon configuration.

use std::path::PathBuf;

use clap::Parser;

/// The gpushare scheduler grants a time-sliced GPU lock to client
/// processes on this node in first-come-first-served order.
#[derive(Parser, Debug)]
#[command(name = "gpushared", version)]
pub struct Config {
    /// Path to the socket the scheduler will listen on.
    #[clap(long, default_value_os_t = gpushare_proto::transport::default_socket_path())]
    pub socket_path: PathBuf,

    /// Initial time quantum in seconds. A client may hold the GPU lock
    /// for at most this long before being asked to release it.
    #[clap(long, default_value_t = 30, value_parser = parse_quantum)]
    pub time_quantum: u64,

    /// Whether anti-thrash scheduling starts enabled. When false, the
    /// scheduler starts permissive and every client may use the GPU
    /// concurrently.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub anti_thrash: bool,

    /// Skip the root privilege check. The default socket directory is
    /// under /var/run, which only root can populate.
    #[clap(long)]
    pub allow_unprivileged: bool,
}

fn parse_quantum(s: &str) -> Result<u64, String> {
    match s.parse::<i64>() {
        Ok(q) if q > 0 => Ok(q as u64),
        _ => Err("time quantum must be a positive integer".into()),
    }
}

/// Parse command line arguments.
pub fn get_config() -> Config {
    Config::parse()
}

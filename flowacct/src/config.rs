use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use flowacct_common::{V4_FLOW_MAP_SIZE, V6_FLOW_MAP_SIZE};

use crate::endpoints::EndpointDirectory;

/// Agent configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// cgroup v2 directory the programs are attached to.
    #[serde(default = "default_cgroup_path")]
    pub cgroup_path: String,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between two walks of the flow tables.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Print the text report to stdout on every poll.
    #[serde(default)]
    pub print_report: bool,

    /// Capacity of the IPv4 flow map. Fixed once the programs are loaded.
    #[serde(default = "default_v4_capacity")]
    pub v4_capacity: u32,

    /// Capacity of the IPv6 flow map. Fixed once the programs are loaded.
    #[serde(default = "default_v6_capacity")]
    pub v6_capacity: u32,

    /// bpffs directory to pin the flow maps in, for external readers.
    #[serde(default)]
    pub pin_dir: Option<String>,

    /// Unchanged polls after which a flow no longer counts as active.
    #[serde(default = "default_idle_polls")]
    pub idle_polls: u32,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Data retention in seconds (None = keep forever).
    #[serde(default)]
    pub data_retention_seconds: Option<u64>,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Address -> endpoint name (`namespace/name` for pods,
    /// `namespace/name/scope` for services).
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

fn default_cgroup_path() -> String {
    "/sys/fs/cgroup".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_poll_interval() -> u64 {
    5
}

fn default_v4_capacity() -> u32 {
    V4_FLOW_MAP_SIZE
}

fn default_v6_capacity() -> u32 {
    V6_FLOW_MAP_SIZE
}

fn default_idle_polls() -> u32 {
    3
}

fn default_db_path() -> String {
    "flows.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cgroup_path: default_cgroup_path(),
            port: default_port(),
            poll_interval_seconds: default_poll_interval(),
            print_report: false,
            v4_capacity: default_v4_capacity(),
            v6_capacity: default_v6_capacity(),
            pin_dir: None,
            idle_polls: default_idle_polls(),
            db_path: default_db_path(),
            data_retention_seconds: None,
            quiet: false,
            allowed_ips: Vec::new(),
            endpoints: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.cgroup != default_cgroup_path() {
            self.cgroup_path = cli.cgroup.clone();
        }
        if cli.port != default_port() {
            self.port = cli.port;
        }
        if cli.poll_interval != default_poll_interval() {
            self.poll_interval_seconds = cli.poll_interval;
        }
        if cli.print_report {
            self.print_report = true;
        }
        if cli.v4_capacity != default_v4_capacity() {
            self.v4_capacity = cli.v4_capacity;
        }
        if cli.v6_capacity != default_v6_capacity() {
            self.v6_capacity = cli.v6_capacity;
        }
        if cli.pin_dir.is_some() {
            self.pin_dir = cli.pin_dir.clone();
        }
        if cli.idle_polls != default_idle_polls() {
            self.idle_polls = cli.idle_polls;
        }
        if cli.db_path != default_db_path() {
            self.db_path = cli.db_path.clone();
        }
        if cli.data_retention.is_some() {
            self.data_retention_seconds = cli.data_retention;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
        for (addr, name) in &cli.endpoint {
            self.endpoints.insert(addr.clone(), name.clone());
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.v4_capacity > 0, "v4_capacity must be at least 1");
        anyhow::ensure!(self.v6_capacity > 0, "v6_capacity must be at least 1");
        anyhow::ensure!(
            self.poll_interval_seconds > 0,
            "poll_interval_seconds must be at least 1"
        );
        anyhow::ensure!(self.idle_polls > 0, "idle_polls must be at least 1");
        self.endpoint_directory()?;
        Ok(())
    }

    pub fn endpoint_directory(&self) -> anyhow::Result<EndpointDirectory> {
        EndpointDirectory::from_config(&self.endpoints)
    }
}

use clap::Parser;

/// flowacct: per-flow traffic accounting for a cgroup
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// cgroup v2 directory to attach the ingress/egress programs to.
    #[arg(short = 'g', long, default_value = "/sys/fs/cgroup")]
    pub cgroup: String,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Seconds between two walks of the flow tables.
    #[arg(long, default_value_t = 5)]
    pub poll_interval: u64,

    /// Print the text report to stdout on every poll.
    #[arg(long)]
    pub print_report: bool,

    /// Capacity of the IPv4 flow map.
    #[arg(long, default_value_t = V4_FLOW_MAP_SIZE)]
    pub v4_capacity: u32,

    /// Capacity of the IPv6 flow map.
    #[arg(long, default_value_t = V6_FLOW_MAP_SIZE)]
    pub v6_capacity: u32,

    /// bpffs directory to pin the flow maps in (e.g., /sys/fs/bpf/flowacct).
    #[arg(long)]
    pub pin_dir: Option<String>,

    /// Unchanged polls after which a flow is no longer active.
    #[arg(long, default_value_t = 3)]
    pub idle_polls: u32,

    /// SQLite database path.
    #[arg(long, default_value = "flows.db")]
    pub db_path: String,

    /// Data retention in seconds (delete samples older than this).
    #[arg(long)]
    pub data_retention: Option<u64>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,

    /// Name an endpoint as ADDR=NAME (e.g., 10.1.0.5=default/web). Repeat for multiple.
    #[arg(long, value_parser = parse_endpoint)]
    pub endpoint: Vec<(String, String)>,

    /// Print one report from maps pinned in this directory and exit.
    #[arg(long)]
    pub report_pinned: Option<String>,
}

fn parse_endpoint(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((addr, name)) if !addr.is_empty() && !name.is_empty() => {
            Ok((addr.to_string(), name.to_string()))
        }
        _ => Err(format!("expected ADDR=NAME, got {arg:?}")),
    }
}

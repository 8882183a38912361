//! Configuration parsing and validation for the router
//!
//! Every option can be given on the command line or through a
//! `SWITCHYARD_*` environment variable.
use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use switchyard::dispatch::DispatchConfig;
use switchyard::probe::ProbeConfig;
use switchyard::selector::PriorityOrder;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the router will listen.
    #[arg(short = 'p', long, env = "SWITCHYARD_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "SWITCHYARD_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "SWITCHYARD_METRICS", default_value_t = true)]
    pub metrics: bool,

    /// JSON file listing the inference nodes.
    #[arg(short = 'f', long, env = "SWITCHYARD_NODES")]
    pub nodes: PathBuf,

    /// Whether to register nodes added to the node file while running.
    #[arg(short = 'w', long, env = "SWITCHYARD_WATCH", default_value_t = true)]
    pub watch: bool,

    /// The prefix to use for metrics.
    #[arg(long, env = "SWITCHYARD_METRICS_PREFIX", default_value = "switchyard")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per node.
    #[arg(long, env = "SWITCHYARD_POOL_MAX_IDLE_PER_HOST", default_value_t = 32)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, env = "SWITCHYARD_POOL_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,

    /// Seconds between background health probe rounds.
    #[arg(long, env = "SWITCHYARD_PROBE_INTERVAL_SECS", default_value_t = 15)]
    pub probe_interval_secs: u64,

    /// Per-probe timeout in milliseconds.
    #[arg(long, env = "SWITCHYARD_PROBE_TIMEOUT_MS", default_value_t = 3000)]
    pub probe_timeout_ms: u64,

    /// Maximum liveness checks in flight at once.
    #[arg(long, env = "SWITCHYARD_PROBE_CONCURRENCY", default_value_t = 8)]
    pub probe_concurrency: usize,

    /// Probes slower than this (milliseconds) mark a node degraded.
    #[arg(long, env = "SWITCHYARD_DEGRADED_LATENCY_MS", default_value_t = 1000)]
    pub degraded_latency_ms: u64,

    /// Consecutive dispatch failures before a node is taken out of rotation.
    #[arg(long, env = "SWITCHYARD_FAILURE_THRESHOLD", default_value_t = 3)]
    pub failure_threshold: u32,

    /// Upper bound on one attempt against one node, in milliseconds.
    #[arg(long, env = "SWITCHYARD_ATTEMPT_TIMEOUT_MS", default_value_t = 60_000)]
    pub attempt_timeout_ms: u64,

    /// Deadline for requests that do not set one, in milliseconds.
    #[arg(long, env = "SWITCHYARD_DEFAULT_DEADLINE_MS", default_value_t = 120_000)]
    pub default_deadline_ms: u64,

    /// Cap on nodes tried per request. Unset tries every candidate.
    #[arg(long, env = "SWITCHYARD_MAX_ATTEMPTS")]
    pub max_attempts: Option<usize>,

    /// Whether lower or higher priority numbers are preferred.
    #[arg(long, env = "SWITCHYARD_PRIORITY_ORDER", value_enum, default_value_t = PriorityOrder::LowerFirst)]
    pub priority_order: PriorityOrder,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.nodes.exists() {
            return Err(anyhow!(
                "Node file '{}' does not exist",
                self.nodes.display()
            ));
        }
        let positive = [
            ("probe-interval-secs", self.probe_interval_secs),
            ("probe-timeout-ms", self.probe_timeout_ms),
            ("probe-concurrency", self.probe_concurrency as u64),
            ("failure-threshold", u64::from(self.failure_threshold)),
            ("attempt-timeout-ms", self.attempt_timeout_ms),
            ("default-deadline-ms", self.default_deadline_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(anyhow!("--{} must be greater than zero", name));
        }
        if self.max_attempts == Some(0) {
            return Err(anyhow!("--max-attempts must be greater than zero"));
        }
        Ok(self)
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            timeout: Duration::from_millis(self.probe_timeout_ms),
            degraded_latency: Duration::from_millis(self.degraded_latency_ms),
            concurrency: self.probe_concurrency,
            interval: Duration::from_secs(self.probe_interval_secs),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            default_deadline: Duration::from_millis(self.default_deadline_ms),
            failure_threshold: self.failure_threshold,
            max_attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec!["switchyard", "--nodes", "Cargo.toml"];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).validate().unwrap();
        let probe = config.probe_config();
        assert_eq!(probe.timeout, Duration::from_secs(3));
        assert_eq!(probe.degraded_latency, Duration::from_millis(1000));
        assert_eq!(probe.interval, Duration::from_secs(15));
        let dispatch = config.dispatch_config();
        assert_eq!(dispatch.failure_threshold, 3);
        assert_eq!(dispatch.max_attempts, None);
        assert_eq!(config.priority_order, PriorityOrder::LowerFirst);
    }

    #[test]
    fn test_priority_order_flag() {
        let config = parse(&["--priority-order", "higher-first"]);
        assert_eq!(config.priority_order, PriorityOrder::HigherFirst);
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        assert!(parse(&["--failure-threshold", "0"]).validate().is_err());
        assert!(parse(&["--max-attempts", "0"]).validate().is_err());
    }

    #[test]
    fn test_missing_node_file_is_rejected() {
        let config = Config::try_parse_from(["switchyard", "--nodes", "/nonexistent/nodes.json"]).unwrap();
        assert!(config.validate().is_err());
    }
}

//! Configuration for campaignd

use clap::Parser;
use std::path::PathBuf;

/// campaignd - Roadcast campaign and store-and-forward daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "campaignd")]
#[command(about = "Roadcast campaign management and store-and-forward daemon")]
pub struct Config {
    /// Root directory for persisted artifacts and stream storage
    #[arg(short, long, default_value = "./data/campaignd", env = "ROADCAST_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Maximum bytes of persisted cloud artifacts and payload files
    #[arg(long, default_value = "1048576")]
    pub max_persistence_size: u64,

    /// CAN interface IDs in channel order (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub can_interfaces: Vec<String>,

    /// Topic telemetry payloads are published to
    #[arg(long, default_value = "vehicle/signals")]
    pub telemetry_topic: String,

    /// Largest payload the sender accepts in one transfer
    #[arg(long, default_value = "131072")]
    pub max_send_size: usize,

    /// Forwarder sleep between work cycles, in milliseconds
    #[arg(long, default_value = "50")]
    pub idle_time_ms: u64,

    /// Upload rate limit in records per second
    #[arg(long, default_value = "100")]
    pub max_upload_rate: u32,

    /// Scheme activation/expiry check period, in milliseconds
    #[arg(long, default_value = "1000")]
    pub tick_interval_ms: u64,

    /// Starting transmit threshold as percent of the maximum payload size
    #[arg(long, default_value = "80")]
    pub transmit_threshold_start_percent: u32,

    /// Lower bound of the payload size corridor, percent of maximum
    #[arg(long, default_value = "70")]
    pub payload_size_limit_min_percent: u32,

    /// Upper bound of the payload size corridor, percent of maximum
    #[arg(long, default_value = "90")]
    pub payload_size_limit_max_percent: u32,

    /// Threshold adjustment step, percent
    #[arg(long, default_value = "10")]
    pub transmit_threshold_adapt_percent: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_persistence_size == 0 {
            anyhow::bail!("Persistence size cannot be zero");
        }
        if self.max_send_size == 0 {
            anyhow::bail!("Maximum send size cannot be zero");
        }
        if self.payload_size_limit_min_percent >= self.payload_size_limit_max_percent {
            anyhow::bail!("Payload size corridor is empty (min >= max)");
        }
        if self.transmit_threshold_start_percent == 0 {
            anyhow::bail!("Transmit threshold start percent cannot be zero");
        }
        if self.max_upload_rate == 0 {
            anyhow::bail!("Upload rate limit cannot be zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config::parse_from(["campaignd"])
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(default_config().validate().is_ok());
    }

    #[test]
    fn test_empty_corridor_rejected() {
        let mut config = default_config();
        config.payload_size_limit_min_percent = 90;
        config.payload_size_limit_max_percent = 70;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interface_list_parsing() {
        let config = Config::parse_from(["campaignd", "--can-interfaces", "can0,can1"]);
        assert_eq!(config.can_interfaces, vec!["can0", "can1"]);
    }
}

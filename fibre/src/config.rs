use serde_derive::{Deserialize, Serialize};
use std::path::Path;

use crate::status::RichResult;

/// How the connection reacts to an acknowledgement that lies ahead of the
/// bytes actually handed to the frame sink.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Log, resynchronize the affected output slots and keep going.
    Lenient,
    /// Treat the peer as malicious and drop the connection.
    Strict,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionConfig {
    pub ack_policy: AckPolicy,
    /// Capacity of the RX and TX fifos, in 4-byte blocks.
    pub fifo_blocks: u16,
    /// Per-transfer retransmit timeout in milliseconds.
    pub resend_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CanConfig {
    /// Heartbeat period in milliseconds while operational.
    pub heartbeat_interval_ms: u64,
    /// Delay between the two node-id acquisition probes in milliseconds.
    pub acquisition_delay_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub connection: ConnectionConfig,
    pub can: CanConfig,
    /// Optional logging section, in the shape consumed by sloggers.
    pub logging: Option<sloggers::LoggerConfig>,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            connection: ConnectionConfig {
                ack_policy: AckPolicy::Lenient,
                fifo_blocks: 64,
                resend_timeout_ms: 500,
            },
            can: CanConfig {
                heartbeat_interval_ms: 100,
                acquisition_delay_ms: 100,
            },
            logging: None,
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> RichResult<NodeConfig> {
        serdeconv::from_toml_file(path.as_ref())
            .map_err(|e| rich_err!("error loading node configuration: {}", e))
    }

    pub fn from_toml(toml: &str) -> RichResult<NodeConfig> {
        serdeconv::from_toml_str(toml).map_err(|e| rich_err!("invalid node configuration: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();

        assert_eq!(config.connection.ack_policy, AckPolicy::Lenient);
        assert_eq!(config.connection.resend_timeout_ms, 500);
        assert_eq!(config.can.heartbeat_interval_ms, 100);
    }

    #[test]
    fn test_from_toml() {
        let config = NodeConfig::from_toml(
            r#"
[connection]
ack_policy = "strict"
fifo_blocks = 128
resend_timeout_ms = 250

[can]
heartbeat_interval_ms = 50
acquisition_delay_ms = 100
"#,
        )
        .unwrap();

        assert_eq!(config.connection.ack_policy, AckPolicy::Strict);
        assert_eq!(config.connection.fifo_blocks, 128);
        assert_eq!(config.can.heartbeat_interval_ms, 50);
    }

    #[test]
    fn test_from_toml_rejects_unknown_policy() {
        let result = NodeConfig::from_toml(
            r#"
[connection]
ack_policy = "yolo"
fifo_blocks = 64
resend_timeout_ms = 500

[can]
heartbeat_interval_ms = 100
acquisition_delay_ms = 100
"#,
        );

        assert!(result.is_err());
    }
}

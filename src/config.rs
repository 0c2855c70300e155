//! Shared CLI configuration

use clap::Args;

/// Broker connection and topic-scope settings
#[derive(Args, Debug, Clone)]
pub struct BrokerConfig {
    /// MQTT broker host
    #[arg(long, env = "GEARLINK_MQTT_HOST", default_value = "localhost")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, env = "GEARLINK_MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Topic scope prefix (empty for none)
    #[arg(long, env = "GEARLINK_SCOPE", default_value = "")]
    pub scope: String,
}

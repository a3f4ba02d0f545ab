use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::time::Duration;

/// Per-session client options, deserializable from the hosting
/// application's configuration.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Round-trip window for any Get/Set/Query/EventAdd exchange.
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_config_from_json() {
        let config: ClientConfig = serde_json::from_str(r#"{"timeout": "250ms"}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
    }
}

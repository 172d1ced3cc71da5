use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use paintboard_core::config::EngineConfig;
use serde::Deserialize;

/// Contents of the optional `--config` TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub remote: RemoteConfig,
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub board_url: String,
    pub paint_url: String,
    pub websocket_url: String,
    /// Local addresses to send requests from, one client per address.
    pub egress: Vec<IpAddr>,
    pub request_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            board_url: "https://www.luogu.com.cn/paintBoard/board".into(),
            paint_url: "https://www.luogu.com.cn/paintBoard/paint".into(),
            websocket_url: "wss://ws.luogu.com.cn/ws".into(),
            egress: Vec::new(),
            request_timeout_ms: 10_000,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl DaemonConfig {
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        // Egress addresses define the routes.
        if !config.remote.egress.is_empty() {
            config.engine.throttle.routes = config.remote.egress.len();
        }
        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.remote.paint_url.ends_with("/paint"));
        assert!(config.listen.is_none());
    }

    #[test]
    fn nested_tables_override_fields() {
        let config = DaemonConfig::parse(
            r#"
            listen = "0.0.0.0:9000"

            [engine]
            cooldown_ms = 10000
            width = 800

            [engine.throttle]
            requests_per_second = 5.0

            [remote]
            egress = ["10.0.0.1", "10.0.0.2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.cooldown_ms, 10_000);
        assert_eq!(config.engine.width, 800);
        assert_eq!(config.engine.height, 600);
        assert_eq!(config.engine.throttle.requests_per_second, 5.0);
        assert_eq!(config.engine.throttle.routes, 2);
        assert_eq!(config.listen, Some("0.0.0.0:9000".parse().unwrap()));
    }

    #[test]
    fn unaddressable_canvas_is_rejected() {
        let err = DaemonConfig::parse("[engine]\nwidth = 70000\n").unwrap_err();
        assert!(err.to_string().contains("width"), "{err}");

        let err = DaemonConfig::parse("[engine]\nheight = 0\n").unwrap_err();
        assert!(err.to_string().contains("height"), "{err}");
    }
}

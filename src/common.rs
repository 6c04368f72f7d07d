use anyhow::Result;
use clap::Args;
use relay::RelayConfig;
use session::config::IceServer;
use session::SessionConfig;
use std::time::Duration;

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Relay broker URL (mqtt://host:port)
    #[arg(short = 'b', long, default_value = "mqtt://localhost:1883")]
    pub relay_broker: String,

    /// Relay username, Optional
    #[arg(long)]
    pub relay_username: Option<String>,

    /// Relay password, Optional
    #[arg(long)]
    pub relay_password: Option<String>,
}

impl RelayArgs {
    pub fn to_config(&self) -> Result<RelayConfig> {
        let url = self.relay_broker.trim();
        let without_proto = url
            .strip_prefix("mqtt://")
            .ok_or_else(|| anyhow::anyhow!("Broker URL must start with mqtt://"))?;

        let parts: Vec<&str> = without_proto.split(':').collect();
        let host = parts.first().ok_or_else(|| anyhow::anyhow!("Invalid broker URL"))?.to_string();
        let port = parts.get(1).map(|p| p.parse()).transpose()?.unwrap_or(1883);

        Ok(RelayConfig {
            broker_host: host,
            broker_port: port,
            username: self.relay_username.clone(),
            password: self.relay_password.clone(),
            keep_alive: 60,
            clean_session: true,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct RtcArgs {
    /// STUN server URLs (e.g., stun:stun.l.google.com:19302), can specify multiple
    #[arg(long, default_values_t = vec!["stun:stun.l.google.com:19302".to_string()])]
    pub rtc_stun: Vec<String>,

    /// TURN server URLs (e.g., turn:user:pass@host:port), can specify multiple
    #[arg(long)]
    pub rtc_turn: Vec<String>,

    /// Timeout for waiting the callee online (seconds)
    #[arg(long, default_value = "5")]
    pub online_timeout: u64,

    /// Timeout for an unanswered ringing call (seconds)
    #[arg(long, default_value = "30")]
    pub ring_timeout: u64,

    /// Timeout for WebRTC connection (seconds)
    #[arg(long, default_value = "5")]
    pub connect_timeout: u64,
}

impl RtcArgs {
    pub fn to_config(&self) -> SessionConfig {
        let mut ice_servers: Vec<IceServer> =
            self.rtc_stun.iter().map(|s| IceServer::stun(s)).collect();

        for turn_url in &self.rtc_turn {
            if let Some(server) = Self::parse_turn_url(turn_url) {
                ice_servers.push(server);
            }
        }

        SessionConfig {
            ice_servers,
            online_timeout: Duration::from_secs(self.online_timeout),
            ring_timeout: Duration::from_secs(self.ring_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
        }
    }

    /// Parse TURN URL: turn:user:pass@host:port or turn:host:port
    fn parse_turn_url(url: &str) -> Option<IceServer> {
        let url = url.strip_prefix("turn:").unwrap_or(url);

        if let Some((credentials, host)) = url.rsplit_once('@') {
            // turn:user:pass@host:port
            let parts: Vec<&str> = credentials.splitn(2, ':').collect();
            let (user, pass) = match parts.as_slice() {
                [u, p] => (*u, *p),
                [u] => (*u, ""),
                _ => return None,
            };
            Some(IceServer::turn(&format!("turn:{}", host), user, pass))
        } else {
            // turn:host:port (no credentials)
            Some(IceServer::turn(&format!("turn:{}", url), "", ""))
        }
    }
}

pub fn init_runtime() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,webrtc=off,webrtc_sctp=off,webrtc_ice=off".into()),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install CryptoProvider");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_url_parsing() {
        let args = RelayArgs {
            relay_broker: "mqtt://relay.example.net:2883".to_string(),
            relay_username: None,
            relay_password: None,
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.broker_host, "relay.example.net");
        assert_eq!(config.broker_port, 2883);

        let args = RelayArgs {
            relay_broker: "mqtt://localhost".to_string(),
            relay_username: None,
            relay_password: None,
        };
        assert_eq!(args.to_config().unwrap().broker_port, 1883);

        let args = RelayArgs {
            relay_broker: "tcp://nope".to_string(),
            relay_username: None,
            relay_password: None,
        };
        assert!(args.to_config().is_err());
    }

    #[test]
    fn test_turn_url_parsing() {
        let server = RtcArgs::parse_turn_url("turn:sam:secret@turn.example.net:3478").unwrap();
        assert_eq!(server.urls, vec!["turn:turn.example.net:3478".to_string()]);
        assert_eq!(server.username.as_deref(), Some("sam"));
        assert_eq!(server.credential.as_deref(), Some("secret"));

        let server = RtcArgs::parse_turn_url("turn:turn.example.net:3478").unwrap();
        assert_eq!(server.username.as_deref(), Some(""));
    }
}

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use client::{AgentConfig, TlsConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "tunnel-agent")]
#[command(
    author,
    version,
    about = "Tunnel agent: bridges a remote core server to a local HTTP service"
)]
pub struct Cli {
    /// Core server address as `host:port`
    #[arg(long = "server", default_value = "localhost:8443", env = "SERVER")]
    pub server: String,

    /// Connect over plain TCP instead of TLS
    #[arg(long = "no-tls", env = "NO_TLS")]
    pub no_tls: bool,

    /// Skip TLS certificate verification (development servers only)
    #[arg(long = "skip-verify", env = "SKIP_VERIFY")]
    pub skip_verify: bool,

    /// Additional CA certificate bundle (PEM) for the server connection
    #[arg(long = "tls-ca", value_name = "PATH")]
    pub tls_ca: Option<PathBuf>,

    /// Authentication token (required)
    #[arg(long = "token", env = "TOKEN")]
    pub token: Option<String>,

    /// Agent id; the server may assign one if omitted
    #[arg(long = "agent-id", env = "AGENT_ID")]
    pub agent_id: Option<String>,

    /// Base URL of the local HTTP service
    #[arg(long = "local", default_value = "http://localhost:3003", env = "LOCAL")]
    pub local_url: String,

    /// Extra `subdomain=url` service mappings, checked before the default URL
    #[arg(long = "service", value_name = "SUB=URL")]
    pub services: Vec<String>,

    /// Heartbeat interval in seconds
    #[arg(long = "heartbeat", default_value_t = 10, env = "HEARTBEAT")]
    pub heartbeat_secs: u64,

    /// Transport read timeout in seconds
    #[arg(long = "read-timeout", default_value_t = 30, env = "READ_TIMEOUT")]
    pub read_timeout_secs: u64,

    /// Per-request timeout for the local service in seconds
    #[arg(long = "request-timeout", default_value_t = 30, env = "REQUEST_TIMEOUT")]
    pub request_timeout_secs: u64,

    /// Give up after this many consecutive connection failures (-1 = retry forever)
    #[arg(
        long = "max-retries",
        default_value_t = -1,
        allow_negative_numbers = true,
        env = "MAX_RETRIES"
    )]
    pub max_retries: i32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Emit JSON logs
    #[arg(long = "log-json", env = "LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    /// Turn the CLI surface into an [`AgentConfig`], or a human-readable
    /// reason the agent cannot start.
    pub fn into_config(self) -> Result<AgentConfig, String> {
        let token = match self.token {
            Some(token) if !token.is_empty() => token,
            _ => {
                return Err(
                    "authentication token is required (use --token or the TOKEN environment variable)"
                        .to_string(),
                )
            }
        };

        let mut config = AgentConfig::new(self.server, token, self.local_url);
        config.agent_id = self.agent_id;
        config.version = env!("CARGO_PKG_VERSION").to_string();
        config.heartbeat_interval = Duration::from_secs(self.heartbeat_secs);
        config.read_timeout = Duration::from_secs(self.read_timeout_secs);
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);
        config.max_retries = self.max_retries;

        if !self.no_tls {
            config.tls = Some(TlsConfig {
                skip_verify: self.skip_verify,
                ca_cert: self.tls_ca,
                server_name: None,
            });
        }

        for mapping in self.services {
            let Some((subdomain, url)) = mapping.split_once('=') else {
                return Err(format!(
                    "invalid service mapping {mapping:?}, expected SUB=URL"
                ));
            };
            if subdomain.is_empty() || url.is_empty() {
                return Err(format!(
                    "invalid service mapping {mapping:?}, expected SUB=URL"
                ));
            }
            config
                .services
                .insert(subdomain.to_string(), url.to_string());
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tunnel-agent").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn defaults() {
        let cli = parse(&["--token", "t"]);
        assert_eq!(cli.server, "localhost:8443");
        assert_eq!(cli.local_url, "http://localhost:3003");
        assert_eq!(cli.heartbeat_secs, 10);
        assert_eq!(cli.read_timeout_secs, 30);
        assert_eq!(cli.max_retries, -1);
        assert!(!cli.no_tls);
        assert!(!cli.skip_verify);
    }

    #[test]
    fn missing_token_is_a_startup_error() {
        let cli = parse(&[]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn tls_is_on_by_default() {
        let cli = parse(&["--token", "t"]);
        let config = cli.into_config().expect("config");
        assert!(config.tls.is_some());
    }

    #[test]
    fn no_tls_disables_tls() {
        let cli = parse(&["--token", "t", "--no-tls"]);
        let config = cli.into_config().expect("config");
        assert!(config.tls.is_none());
    }

    #[test]
    fn skip_verify_propagates() {
        let cli = parse(&["--token", "t", "--skip-verify"]);
        let config = cli.into_config().expect("config");
        assert!(config.tls.expect("tls").skip_verify);
    }

    #[test]
    fn service_mappings_parse() {
        let cli = parse(&[
            "--token",
            "t",
            "--service",
            "api=http://127.0.0.1:4000",
            "--service",
            "web=http://127.0.0.1:5000",
        ]);
        let config = cli.into_config().expect("config");
        assert_eq!(
            config.services.get("api").map(String::as_str),
            Some("http://127.0.0.1:4000")
        );
        assert_eq!(
            config.services.get("web").map(String::as_str),
            Some("http://127.0.0.1:5000")
        );
    }

    #[test]
    fn malformed_service_mapping_is_rejected() {
        let cli = parse(&["--token", "t", "--service", "no-equals-sign"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn negative_max_retries_parses() {
        let cli = parse(&["--token", "t", "--max-retries", "-1"]);
        assert_eq!(cli.max_retries, -1);
        let cli = parse(&["--token", "t", "--max-retries", "5"]);
        assert_eq!(cli.max_retries, 5);
    }
}

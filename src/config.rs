//! Runtime configuration from command line arguments

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use clap::Parser;
use url::Url;

use crate::error::{CarouselError, Result};
use crate::models::BackendClass;

/// Relay endpoint assumed when none are given on the command line
const DEFAULT_RELAY: &str = "127.0.0.1:9050";

#[derive(Debug, Parser)]
#[command(
    name = "carousel",
    about = "Intercepting forward proxy with rotating egress backends",
    version
)]
pub struct Cli {
    /// Backend class resolutions start from
    #[arg(short = 't', long = "type", value_enum, default_value_t = BackendClass::Dynamic)]
    pub backend: BackendClass,

    /// Client-facing listen address
    #[arg(long, default_value = "127.0.0.1:9999")]
    pub addr: String,

    /// SOCKS5 relay endpoint as host:port, repeatable
    #[arg(long = "tor")]
    pub relays: Vec<String>,

    /// Proxy list file with one host:port:user:password entry per line
    #[arg(long, default_value = "proxies.txt")]
    pub proxies: PathBuf,

    /// Enable debug logging
    #[arg(short = 'D', long)]
    pub debug: bool,

    /// Environment name carried in log context
    #[arg(short = 'E', long, default_value = "dev")]
    pub env: String,

    /// Plain upgrade listener address
    #[arg(long, default_value = "127.0.0.1:1080")]
    pub plain_upgrade_addr: SocketAddr,

    /// TLS upgrade listener address
    #[arg(long, default_value = "127.0.0.1:10443")]
    pub tls_upgrade_addr: SocketAddr,

    /// Certificate for the TLS upgrade listener
    #[arg(long, default_value = "cert.pem")]
    pub cert: PathBuf,

    /// Private key for the TLS upgrade listener
    #[arg(long, default_value = "key.pem")]
    pub key: PathBuf,

    /// Directory for response artifacts
    #[arg(long, default_value = "log")]
    pub audit_dir: PathBuf,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend class resolutions start from
    pub backend: BackendClass,
    /// Client-facing listen address
    pub listen_addr: String,
    /// Upgrade listener settings
    pub upgrade: UpgradeConfig,
    /// Relay endpoints (host:port)
    pub relays: Vec<String>,
    /// Proxy endpoints (user:password@host:port)
    pub proxies: Vec<String>,
    /// Directory for response artifacts
    pub audit_dir: PathBuf,
    /// Environment name carried in log context
    pub env: String,
    /// Debug logging enabled
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    pub plain_addr: SocketAddr,
    pub tls_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Config {
    /// Validate the command line and load the endpoint pools it names
    ///
    /// Pools are only loaded for backend classes that can draw from them:
    /// a fixed `direct` backend never opens the proxy list, and a fixed
    /// `http` backend never needs relay endpoints.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        cli.addr.to_socket_addrs().map_err(|e| {
            CarouselError::InvalidConfig(format!("invalid listen address {}: {}", cli.addr, e))
        })?;

        let relays = if cli.backend.uses_relay_pool() {
            let raw = if cli.relays.is_empty() {
                vec![DEFAULT_RELAY.to_string()]
            } else {
                cli.relays
            };
            let mut relays: Vec<String> = Vec::new();
            for relay in raw {
                validate_endpoint(&relay)?;
                if !relays.contains(&relay) {
                    relays.push(relay);
                }
            }
            relays
        } else {
            Vec::new()
        };

        let proxies = if cli.backend.uses_proxy_pool() {
            let proxies = load_proxies(&cli.proxies)?;
            if proxies.is_empty() {
                return Err(CarouselError::InvalidConfig(format!(
                    "proxy list {} is empty",
                    cli.proxies.display()
                )));
            }
            for proxy in &proxies {
                validate_endpoint(proxy)?;
            }
            proxies
        } else {
            Vec::new()
        };

        Ok(Config {
            backend: cli.backend,
            listen_addr: cli.addr,
            upgrade: UpgradeConfig {
                plain_addr: cli.plain_upgrade_addr,
                tls_addr: cli.tls_upgrade_addr,
                cert_path: cli.cert,
                key_path: cli.key,
            },
            relays,
            proxies,
            audit_dir: cli.audit_dir,
            env: cli.env,
            debug: cli.debug,
        })
    }
}

/// Check that an endpoint carries a host and an explicit port
fn validate_endpoint(endpoint: &str) -> Result<()> {
    let url = Url::parse(&format!("http://{}", endpoint)).map_err(|e| {
        CarouselError::InvalidConfig(format!("invalid endpoint {}: {}", endpoint, e))
    })?;
    if url.host_str().is_none() || url.port().is_none() {
        return Err(CarouselError::InvalidConfig(format!(
            "endpoint {} must be host:port",
            endpoint
        )));
    }
    Ok(())
}

/// Load `host:port:user:password` lines into `user:password@host:port` entries
fn load_proxies(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CarouselError::InvalidConfig(format!(
            "failed to read proxy list {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut proxies = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(4, ':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), Some(user), Some(password)) => {
                proxies.push(format!("{}:{}@{}:{}", user, password, host, port));
            }
            _ => {
                return Err(CarouselError::InvalidConfig(format!(
                    "malformed proxy line: {}",
                    line
                )));
            }
        }
    }
    Ok(proxies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["carousel"]).unwrap();
        assert_eq!(cli.backend, BackendClass::Dynamic);
        assert_eq!(cli.addr, "127.0.0.1:9999");
        assert!(cli.relays.is_empty());
        assert_eq!(cli.proxies, PathBuf::from("proxies.txt"));
        assert!(!cli.debug);
        assert_eq!(cli.env, "dev");
        assert_eq!(
            cli.plain_upgrade_addr,
            "127.0.0.1:1080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            cli.tls_upgrade_addr,
            "127.0.0.1:10443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(cli.audit_dir, PathBuf::from("log"));
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "carousel",
            "-t",
            "tor",
            "--addr",
            "0.0.0.0:8080",
            "--tor",
            "10.0.0.1:9050",
            "--tor",
            "10.0.0.2:9050",
            "-D",
            "-E",
            "prod",
        ])
        .unwrap();
        assert_eq!(cli.backend, BackendClass::Tor);
        assert_eq!(cli.addr, "0.0.0.0:8080");
        assert_eq!(
            cli.relays,
            vec!["10.0.0.1:9050".to_string(), "10.0.0.2:9050".to_string()]
        );
        assert!(cli.debug);
        assert_eq!(cli.env, "prod");
    }

    #[test]
    fn test_cli_rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["carousel", "--type", "carrier"]).is_err());
    }

    #[test]
    fn test_config_relay_default_and_dedupe() {
        let cli = Cli::try_parse_from(["carousel", "-t", "tor"]).unwrap();
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.relays, vec![DEFAULT_RELAY.to_string()]);

        let cli = Cli::try_parse_from([
            "carousel",
            "-t",
            "tor",
            "--tor",
            "10.0.0.1:9050",
            "--tor",
            "10.0.0.1:9050",
            "--tor",
            "10.0.0.2:9050",
        ])
        .unwrap();
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(
            config.relays,
            vec!["10.0.0.1:9050".to_string(), "10.0.0.2:9050".to_string()]
        );
    }

    #[test]
    fn test_config_loads_proxy_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        std::fs::write(&path, "1.2.3.4:8080:alice:secret\n\n5.6.7.8:3128:bob:hunter2\n").unwrap();

        let cli = Cli::try_parse_from([
            "carousel",
            "-t",
            "http",
            "--proxies",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(
            config.proxies,
            vec![
                "alice:secret@1.2.3.4:8080".to_string(),
                "bob:hunter2@5.6.7.8:3128".to_string(),
            ]
        );
        // fixed http backend leaves the relay pool alone
        assert!(config.relays.is_empty());
    }

    #[test]
    fn test_config_rejects_malformed_proxy_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        std::fs::write(&path, "1.2.3.4:8080:alice\n").unwrap();

        let cli = Cli::try_parse_from([
            "carousel",
            "-t",
            "http",
            "--proxies",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, CarouselError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_empty_proxy_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        std::fs::write(&path, "\n\n").unwrap();

        let cli = Cli::try_parse_from([
            "carousel",
            "-t",
            "http",
            "--proxies",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, CarouselError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_requires_proxy_list_only_for_proxy_classes() {
        let cli = Cli::try_parse_from([
            "carousel",
            "-t",
            "direct",
            "--proxies",
            "/nonexistent/proxies.txt",
        ])
        .unwrap();
        assert!(Config::from_cli(cli).is_ok());

        let cli = Cli::try_parse_from([
            "carousel",
            "-t",
            "dynamic",
            "--proxies",
            "/nonexistent/proxies.txt",
        ])
        .unwrap();
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, CarouselError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_bad_listen_addr() {
        let cli = Cli::try_parse_from(["carousel", "-t", "direct", "--addr", "not-an-addr"])
            .unwrap();
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, CarouselError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_relay_without_port() {
        let cli =
            Cli::try_parse_from(["carousel", "-t", "tor", "--tor", "10.0.0.1"]).unwrap();
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, CarouselError::InvalidConfig(_)));
    }
}

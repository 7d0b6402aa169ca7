use crate::allocator::PortRange;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the portgate daemon
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// The two port ranges handed out to applications
    pub ranges: RangesConfig,

    /// Reverse-proxy integration
    pub proxy: ProxyConfig,

    /// Durable state
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API write operations.
    /// If not set, a random token is generated at startup and logged.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
        }
    }
}

/// The public and canvas port ranges; both closed intervals, must be disjoint
#[derive(Debug, Deserialize, Clone)]
pub struct RangesConfig {
    pub public: RangeConfig,
    pub canvas: RangeConfig,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RangeConfig {
    /// First port, inclusive
    pub start: u16,
    /// Last port, inclusive
    pub end: u16,
}

impl RangeConfig {
    pub fn to_range(self, name: &str) -> PortRange {
        PortRange::new(name, self.start, self.end)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path of the proxy's active configuration file, replaced wholesale on
    /// every successful apply
    pub config_path: String,

    /// Optional syntax check run against the staged file before activation,
    /// e.g. "nginx -t -c {}"
    pub check_cmd: Option<String>,

    /// Command that signals the running proxy to reload its configuration,
    /// e.g. "nginx -s reload" or "systemctl reload nginx"
    pub reload_cmd: String,

    /// Bound on the reload signal in seconds (default: 5)
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9920
}

fn default_reload_timeout() -> u64 {
    5
}

fn default_database_path() -> String {
    "./portgate.db".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ranges.public.start > self.ranges.public.end {
            errors.push(format!(
                "public range {}-{} is inverted",
                self.ranges.public.start, self.ranges.public.end
            ));
        }
        if self.ranges.canvas.start > self.ranges.canvas.end {
            errors.push(format!(
                "canvas range {}-{} is inverted",
                self.ranges.canvas.start, self.ranges.canvas.end
            ));
        }
        if errors.is_empty()
            && self
                .ranges
                .public
                .to_range("public")
                .overlaps(&self.ranges.canvas.to_range("canvas"))
        {
            errors.push(format!(
                "public range {}-{} overlaps canvas range {}-{}",
                self.ranges.public.start,
                self.ranges.public.end,
                self.ranges.canvas.start,
                self.ranges.canvas.end
            ));
        }

        if self.proxy.reload_cmd.trim().is_empty() {
            errors.push("proxy.reload_cmd must not be empty".to_string());
        }
        if self.proxy.config_path.trim().is_empty() {
            errors.push("proxy.config_path must not be empty".to_string());
        }
        if self.proxy.reload_timeout_secs == 0 {
            errors.push("proxy.reload_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_toml() -> &'static str {
        r#"
[server]
bind = "127.0.0.1"
admin_port = 9920
admin_token = "secret"

[ranges.public]
start = 30000
end = 30999

[ranges.canvas]
start = 40000
end = 40999

[proxy]
config_path = "/etc/nginx/conf.d/portgate.conf"
check_cmd = "nginx -t -c {}"
reload_cmd = "nginx -s reload"
reload_timeout_secs = 3

[database]
path = "/var/lib/portgate/state.db"
"#
    }

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(valid_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.admin_port, 9920);
        assert_eq!(config.ranges.public.start, 30000);
        assert_eq!(config.ranges.canvas.end, 40999);
        assert_eq!(config.proxy.reload_cmd, "nginx -s reload");
        assert_eq!(config.proxy.reload_timeout(), Duration::from_secs(3));
        assert_eq!(config.database.path, "/var/lib/portgate/state.db");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
[ranges.public]
start = 30000
end = 30002

[ranges.canvas]
start = 40000
end = 40002

[proxy]
config_path = "portgate.conf"
reload_cmd = "/bin/true"
"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.admin_port, 9920);
        assert!(config.server.admin_token.is_none());
        assert!(config.proxy.check_cmd.is_none());
        assert_eq!(config.proxy.reload_timeout(), Duration::from_secs(5));
        assert_eq!(config.database.path, "./portgate.db");
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config: Config = toml::from_str(valid_toml()).unwrap();
        config.ranges.public = RangeConfig {
            start: 31000,
            end: 30000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let mut config: Config = toml::from_str(valid_toml()).unwrap();
        config.ranges.canvas = RangeConfig {
            start: 30500,
            end: 31500,
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("overlaps"));
    }

    #[test]
    fn test_empty_reload_cmd_rejected() {
        let mut config: Config = toml::from_str(valid_toml()).unwrap();
        config.proxy.reload_cmd = "  ".to_string();
        assert!(config.validate().is_err());
    }
}

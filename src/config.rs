use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Container runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Idle and orphan culling
    #[serde(default)]
    pub cull: CullConfig,

    /// Where tenant home directories come from
    #[serde(default)]
    pub directory: DirectoryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for tenant traffic
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,

    /// Port for the loopback admin API (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Max time to wait for a backend response, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Auto-refresh interval of the wait page, in seconds
    #[serde(default = "default_wait_reload")]
    pub wait_reload_secs: u64,

    /// Optional HTML template replacing the built-in wait page
    pub wait_template: Option<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            debug: false,
            admin_port: default_admin_port(),
            admin_token: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            wait_reload_secs: default_wait_reload(),
            wait_template: None,
        }
    }
}

/// Image pull policy for tenant workloads
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before creating
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Docker host URL (default: DOCKER_HOST or a well-known socket)
    pub docker_host: Option<String>,

    /// Image every tenant workload runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Network tenant workloads join (default bridge when unset)
    pub network: Option<String>,

    /// Prefix of every tenant workload name; the rest is the identity
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Port the workload serves HTTP on
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Upper bound for a single runtime call, in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Grace period before a stopping workload is killed, in seconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            image: default_image(),
            network: None,
            name_prefix: default_name_prefix(),
            backend_port: default_backend_port(),
            pull_policy: PullPolicy::default(),
            call_timeout_secs: default_call_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CullConfig {
    /// Stop workloads that have been idle too long
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the idle pass runs, in seconds
    #[serde(default = "default_cull_interval")]
    pub interval_secs: u64,

    /// Idle time after which a tenant is culled, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the orphan pass runs, in seconds
    #[serde(default = "default_orphan_interval")]
    pub orphan_interval_secs: u64,
}

impl CullConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn orphan_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_interval_secs)
    }
}

impl Default for CullConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cull_interval(),
            idle_timeout_secs: default_idle_timeout(),
            orphan_interval_secs: default_orphan_interval(),
        }
    }
}

/// Directory backend used to find tenant home directories
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryBackend {
    /// Host account database via NSS (default)
    #[default]
    Local,
    /// LDAP directory service
    Ldap,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub backend: DirectoryBackend,

    /// Directory below the home directory that is served
    #[serde(default = "default_public_dir")]
    pub public_dir: String,

    /// Extra host directories mounted into every workload, `path` or `path::ro`
    #[serde(default)]
    pub extra_mounts: Vec<String>,

    /// Connection settings for the ldap backend
    pub ldap: Option<LdapConfig>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            backend: DirectoryBackend::default(),
            public_dir: default_public_dir(),
            extra_mounts: Vec::new(),
            ldap: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LdapConfig {
    /// e.g. ldaps://ldap.example.org
    pub url: String,

    /// Search base for accounts
    pub base_dn: String,

    #[serde(default = "default_uid_attribute")]
    pub uid_attribute: String,

    #[serde(default = "default_home_attribute")]
    pub home_attribute: String,

    /// Optional simple bind
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_wait_reload() -> u64 {
    5
}

fn default_image() -> String {
    "registry.gitlab.com/ocordes/userwebsite".to_string()
}

fn default_name_prefix() -> String {
    "homeproxy-".to_string()
}

fn default_backend_port() -> u16 {
    80
}

fn default_call_timeout() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_cull_interval() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}

fn default_orphan_interval() -> u64 {
    300
}

fn default_public_dir() -> String {
    "public_html".to_string()
}

fn default_uid_attribute() -> String {
    "uid".to_string()
}

fn default_home_attribute() -> String {
    "homeDirectory".to_string()
}

/// Docker container names must start with an alphanumeric and use `[a-zA-Z0-9_.-]`
fn is_valid_name_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.runtime.image.trim().is_empty() {
            errors.push("runtime: 'image' must not be empty".to_string());
        }
        if !is_valid_name_prefix(&self.runtime.name_prefix) {
            errors.push(format!(
                "runtime: 'name_prefix' {:?} is not a valid container name prefix",
                self.runtime.name_prefix
            ));
        }
        if self.runtime.backend_port == 0 {
            errors.push("runtime: 'backend_port' must be greater than 0".to_string());
        }
        if self.runtime.call_timeout_secs == 0 {
            errors.push("runtime: 'call_timeout_secs' must be greater than 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if self.cull.enabled {
            if self.cull.interval_secs == 0 {
                errors.push("cull: 'interval_secs' must be greater than 0".to_string());
            }
            if self.cull.idle_timeout_secs == 0 {
                errors.push("cull: 'idle_timeout_secs' must be greater than 0".to_string());
            }
            if self.cull.orphan_interval_secs == 0 {
                errors.push("cull: 'orphan_interval_secs' must be greater than 0".to_string());
            }
        }

        if self.directory.backend == DirectoryBackend::Ldap && self.directory.ldap.is_none() {
            errors.push("directory: ldap backend requires a [directory.ldap] section".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

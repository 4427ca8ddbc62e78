use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "OUTPOST_CONFIG";

/// Largest request or response body carried through a tunnel by default (100 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("outpost.toml"));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["outpost.toml", "outpost.yaml", "outpost.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no outpost.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/outpost/outpost.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "outpost", "outpost")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("outpost.toml"))
    }
}

/// Writes the default template to `path` unless a file already exists there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match config_format(path)? {
        Format::Toml => DEFAULT_CONFIG_TEMPLATE_TOML,
        Format::Yaml => DEFAULT_CONFIG_TEMPLATE_YAML,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

enum Format {
    Toml,
    Yaml,
}

fn config_format(path: &Path) -> anyhow::Result<Format> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(Format::Toml),
        "yaml" | "yml" => Ok(Format::Yaml),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_format(path)? {
        Format::Toml => {
            toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?
        }
        Format::Yaml => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub reload: ReloadConfig,
    pub relay: Option<RelayConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub tunnel_addr: String,
    pub base_domain: String,
    pub public_scheme: String,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub offline_page: Option<PathBuf>,
    pub require_api_key: bool,
    pub block_over_quota_responses: bool,
    pub max_body_bytes: usize,
    pub ping_interval: Duration,
    /// A tunnel that sends nothing (not even a pong) for this long is dropped.
    pub idle_timeout: Duration,
    pub organizations: Vec<OrganizationConfig>,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationConfig {
    pub id: String,
    pub api_keys: Vec<String>,
    /// Bytes per billing period; negative means unlimited.
    pub bandwidth_limit: i64,
    pub custom_domains: Vec<String>,
    /// Persisted tunnel record ids keyed by requested subdomain or custom domain.
    pub records: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// ClickHouse HTTP endpoint. Empty means events are only logged.
    pub endpoint: String,
    pub table: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub recent_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub local_host: String,
    pub local_port: u16,
    pub api_key: Option<String>,
    pub subdomain: Option<String>,
    pub custom_domain: Option<String>,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub local_timeout: Duration,
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    reload: Option<FileReload>,
    relay: Option<FileRelay>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileReload {
    #[serde(default)]
    enabled: bool,
    poll_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    listen_addr: Option<String>,
    tunnel_addr: Option<String>,
    base_domain: Option<String>,
    public_scheme: Option<String>,
    handshake_timeout_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
    offline_page: Option<String>,
    #[serde(default)]
    require_api_key: bool,
    block_over_quota_responses: Option<bool>,
    max_body_bytes: Option<i64>,
    ping_interval_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    #[serde(default)]
    organizations: Vec<FileOrganization>,
    events: Option<FileEvents>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOrganization {
    id: String,
    #[serde(default)]
    api_keys: Vec<String>,
    bandwidth_limit: Option<i64>,
    #[serde(default)]
    custom_domains: Vec<String>,
    #[serde(default)]
    records: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FileEvents {
    endpoint: Option<String>,
    table: Option<String>,
    batch_size: Option<i64>,
    flush_interval_ms: Option<i64>,
    recent_capacity: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_url: Option<String>,
    local_host: Option<String>,
    local_port: Option<u16>,
    api_key: Option<String>,
    subdomain: Option<String>,
    custom_domain: Option<String>,
    reconnect_delay_ms: Option<i64>,
    ping_interval_ms: Option<i64>,
    local_timeout_ms: Option<i64>,
    max_body_bytes: Option<i64>,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default),
    }
}

fn body_limit(v: Option<i64>) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => DEFAULT_MAX_BODY_BYTES,
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn trimmed_or(v: Option<String>, default: &str) -> String {
    non_empty(v).unwrap_or_else(|| default.to_string())
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(level) = non_empty(l.level) {
                logging.level = level;
            }
            if let Some(format) = non_empty(l.format) {
                logging.format = format;
            }
            if let Some(output) = non_empty(l.output) {
                logging.output = output;
            }
            logging.add_source = l.add_source;
        }

        let reload = ReloadConfig {
            enabled: fc.reload.as_ref().map(|r| r.enabled).unwrap_or(true),
            poll_interval: millis(fc.reload.as_ref().and_then(|r| r.poll_interval_ms), 1000),
        };

        let relay = fc.relay.map(RelayConfig::from_file).transpose()?;
        let client = fc.client.map(ClientConfig::from_file).transpose()?;

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            reload,
            relay,
            client,
        })
    }
}

impl RelayConfig {
    fn from_file(r: FileRelay) -> anyhow::Result<RelayConfig> {
        let base_domain = trimmed_or(r.base_domain, "localhost")
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if base_domain.is_empty() {
            anyhow::bail!("config: relay.base_domain must not be empty");
        }

        let public_scheme = trimmed_or(r.public_scheme, "http").to_ascii_lowercase();
        if public_scheme != "http" && public_scheme != "https" {
            anyhow::bail!(
                "config: relay.public_scheme must be http or https, got {:?}",
                public_scheme
            );
        }

        let mut organizations = Vec::with_capacity(r.organizations.len());
        let mut seen_ids = HashSet::new();
        let mut seen_keys = HashSet::new();
        for (i, o) in r.organizations.into_iter().enumerate() {
            let id = o.id.trim().to_string();
            if id.is_empty() {
                anyhow::bail!("config: relay.organizations[{}] missing id", i);
            }
            if !seen_ids.insert(id.clone()) {
                anyhow::bail!("config: relay.organizations[{}] duplicate id {:?}", i, id);
            }

            let api_keys: Vec<String> = o
                .api_keys
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            for k in &api_keys {
                if !seen_keys.insert(k.clone()) {
                    anyhow::bail!(
                        "config: relay.organizations[{}] reuses an api key of another organization",
                        i
                    );
                }
            }

            let custom_domains = o
                .custom_domains
                .into_iter()
                .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect();

            let records = o
                .records
                .into_iter()
                .map(|(name, record)| {
                    (
                        name.trim().trim_end_matches('.').to_ascii_lowercase(),
                        record.trim().to_string(),
                    )
                })
                .filter(|(name, record)| !name.is_empty() && !record.is_empty())
                .collect();

            organizations.push(OrganizationConfig {
                id,
                api_keys,
                bandwidth_limit: o.bandwidth_limit.unwrap_or(-1),
                custom_domains,
                records,
            });
        }

        let events = match r.events {
            Some(e) => EventsConfig {
                endpoint: e.endpoint.unwrap_or_default().trim().to_string(),
                table: trimmed_or(e.table, "tunnel_events"),
                batch_size: e.batch_size.filter(|n| *n > 0).unwrap_or(1000) as usize,
                flush_interval: millis(e.flush_interval_ms, 5000),
                recent_capacity: e.recent_capacity.filter(|n| *n >= 0).unwrap_or(200) as usize,
            },
            None => EventsConfig {
                endpoint: String::new(),
                table: "tunnel_events".into(),
                batch_size: 1000,
                flush_interval: Duration::from_millis(5000),
                recent_capacity: 200,
            },
        };

        let ping_interval = millis(r.ping_interval_ms, 30_000);
        let idle_timeout = millis(r.idle_timeout_ms, 3 * ping_interval.as_millis() as u64);
        if idle_timeout <= ping_interval {
            anyhow::bail!("config: relay.idle_timeout_ms must exceed relay.ping_interval_ms");
        }

        Ok(RelayConfig {
            listen_addr: trimmed_or(r.listen_addr, ":8080"),
            tunnel_addr: trimmed_or(r.tunnel_addr, ":7000"),
            base_domain,
            public_scheme,
            handshake_timeout: millis(r.handshake_timeout_ms, 5000),
            request_timeout: millis(r.request_timeout_ms, 30_000),
            offline_page: non_empty(r.offline_page).map(PathBuf::from),
            require_api_key: r.require_api_key,
            block_over_quota_responses: r.block_over_quota_responses.unwrap_or(true),
            max_body_bytes: body_limit(r.max_body_bytes),
            ping_interval,
            idle_timeout,
            organizations,
            events,
        })
    }
}

impl ClientConfig {
    fn from_file(c: FileClient) -> anyhow::Result<ClientConfig> {
        let server_url = trimmed_or(c.server_url, "ws://127.0.0.1:7000/");
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            anyhow::bail!(
                "config: client.server_url must be a ws:// or wss:// URL, got {:?}",
                server_url
            );
        }

        let local_port = c.local_port.unwrap_or(3000);
        if local_port == 0 {
            anyhow::bail!("config: client.local_port must not be 0");
        }

        Ok(ClientConfig {
            server_url,
            local_host: trimmed_or(c.local_host, "localhost"),
            local_port,
            api_key: non_empty(c.api_key),
            subdomain: non_empty(c.subdomain).map(|s| s.to_ascii_lowercase()),
            custom_domain: non_empty(c.custom_domain).map(|s| s.to_ascii_lowercase()),
            reconnect_delay: millis(c.reconnect_delay_ms, 2000),
            ping_interval: millis(c.ping_interval_ms, 30_000),
            local_timeout: millis(c.local_timeout_ms, 60_000),
            max_body_bytes: body_limit(c.max_body_bytes),
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Outpost configuration (auto-generated)
#
# This file was created because Outpost could not find a configuration file at the
# resolved config path. It runs a relay that accepts anonymous tunnel clients on
# :7000 and serves public traffic for *.localhost on :8080.
#
# To run a tunnel client instead (or as well), add a [client] section:
#
#   [client]
#   server_url = "ws://relay.example.com:7000/"
#   local_port = 3000
#   api_key = ""

admin_addr = ":9090"

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[reload]
enabled = true
poll_interval_ms = 1000

[relay]
listen_addr = ":8080"
tunnel_addr = ":7000"
base_domain = "localhost"
public_scheme = "http"
handshake_timeout_ms = 5000
request_timeout_ms = 30000
require_api_key = false
block_over_quota_responses = true
max_body_bytes = 104857600 # largest request/response body a tunnel carries
ping_interval_ms = 30000
idle_timeout_ms = 90000   # silent tunnels are dropped after this

# [[relay.organizations]]
# id = "org_demo"
# api_keys = ["demo-key"]
# bandwidth_limit = -1 # bytes per month, -1 = unlimited
# custom_domains = []
# records = { myapp = "tun_123" } # record ids reported in events

[relay.events]
endpoint = "" # ClickHouse HTTP URL; empty = log only
table = "tunnel_events"
batch_size = 1000
flush_interval_ms = 5000
recent_capacity = 200
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Outpost configuration (auto-generated)
#
# This file was created because Outpost could not find a configuration file at the
# resolved config path. It runs a relay that accepts anonymous tunnel clients on
# :7000 and serves public traffic for *.localhost on :8080.
#
# To run a tunnel client instead (or as well), add a client section:
#
#   client:
#     server_url: "ws://relay.example.com:7000/"
#     local_port: 3000
#     api_key: ""

admin_addr: ":9090"

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

reload:
  enabled: true
  poll_interval_ms: 1000

relay:
  listen_addr: ":8080"
  tunnel_addr: ":7000"
  base_domain: "localhost"
  public_scheme: "http"
  handshake_timeout_ms: 5000
  request_timeout_ms: 30000
  require_api_key: false
  block_over_quota_responses: true
  max_body_bytes: 104857600
  ping_interval_ms: 30000
  idle_timeout_ms: 90000
  organizations: []
  events:
    endpoint: "" # ClickHouse HTTP URL; empty = log only
    table: "tunnel_events"
    batch_size: 1000
    flush_interval_ms: 5000
    recent_capacity: 200
"#;

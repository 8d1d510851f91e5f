use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::gangway::tunnel::{
    client::{ClientOptions, LocalProxy},
    dispatch::ProxyKind,
    ports::{DEFAULT_MAX_PORT, DEFAULT_MIN_PORT},
    server::ServerOptions,
    transport::listen_addr,
};

const CONFIG_FILE_NAMES: [&str; 3] = ["gangway.toml", "gangway.yaml", "gangway.yml"];
const CONFIG_ENV: &str = "GANGWAY_CONFIG";
const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConfigPathSource::Flag => "flag",
            ConfigPathSource::Env => "env",
            ConfigPathSource::Cwd => "cwd",
            ConfigPathSource::Default => "default",
        })
    }
}

/// `--config` > `GANGWAY_CONFIG` > `gangway.*` in the working directory > OS default.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
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

    if p.is_dir() {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_FILE_NAMES[0])));
    }

    let mut out = p.to_path_buf();
    if !out.exists() && out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/gangway/gangway.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "gangway", "gangway")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join(CONFIG_FILE_NAMES[0]))
    }
}

/// Writes the default server template when `path` does not exist yet.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let template = match Format::from_path(path)? {
        Format::Toml => DEFAULT_CONFIG_TEMPLATE_TOML,
        Format::Yaml => DEFAULT_CONFIG_TEMPLATE_YAML,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(template.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

enum Format {
    Toml,
    Yaml,
}

impl Format {
    fn from_path(path: &Path) -> anyhow::Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Ok(Format::Toml),
            "yaml" | "yml" => Ok(Format::Yaml),
            _ => anyhow::bail!(
                "config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"
            ),
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let fc: FileConfig = match Format::from_path(path)? {
        Format::Toml => {
            toml::from_str(&data).with_context(|| format!("parse toml {}", path.display()))?
        }
        Format::Yaml => {
            serde_yaml::from_str(&data).with_context(|| format!("parse yaml {}", path.display()))?
        }
    };
    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub proxy_bind_ip: IpAddr,
    pub min_port: u16,
    pub max_port: u16,
    /// Zero disables the login timestamp check.
    pub auth_timeout: Duration,
    pub ping_timeout: Duration,
    pub work_conn_timeout: Duration,
    pub encrypt_control: bool,
    pub http_addr: String,
    pub https_addr: String,
    pub users: HashMap<String, String>,
}

impl ServerConfig {
    pub fn to_options(&self) -> ServerOptions {
        ServerOptions {
            bind_addr: listen_addr(&self.bind_addr),
            proxy_bind_ip: self.proxy_bind_ip,
            min_port: self.min_port,
            max_port: self.max_port,
            http_addr: listen_addr(&self.http_addr),
            https_addr: listen_addr(&self.https_addr),
            auth_timeout: self.auth_timeout,
            ping_timeout: self.ping_timeout,
            work_conn_timeout: self.work_conn_timeout,
            hello_timeout: CLIENT_HELLO_TIMEOUT,
            encrypt_control: self.encrypt_control,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub user: String,
    pub token: String,
    pub pool_count: u32,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub login_retry: Duration,
    pub dial_timeout: Duration,
    pub encrypt_control: bool,
    pub proxies: Vec<ProxyConfig>,
}

impl ClientConfig {
    pub fn to_options(&self) -> ClientOptions {
        ClientOptions {
            server_addr: self.server_addr.clone(),
            user: self.user.clone(),
            token: self.token.clone(),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            pool_count: self.pool_count,
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
            retry_delay: self.login_retry,
            dial_timeout: self.dial_timeout,
            encrypt_control: self.encrypt_control,
            proxies: self
                .proxies
                .iter()
                .map(|p| LocalProxy {
                    name: p.name.clone(),
                    kind: p.kind,
                    local_addr: p.local_addr.clone(),
                    remote_port: p.remote_port,
                    encrypt: p.encrypt,
                    domain: p.domain.clone(),
                    url_prefix: p.url_prefix.clone(),
                    host_rewrite: p.host_rewrite.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub name: String,
    pub kind: ProxyKind,
    pub local_addr: String,
    pub remote_port: u16,
    pub encrypt: bool,
    pub domain: String,
    pub url_prefix: String,
    pub host_rewrite: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    server: Option<FileServer>,
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
#[serde(deny_unknown_fields)]
struct FileServer {
    bind_addr: Option<String>,
    proxy_bind_ip: Option<String>,
    min_port: Option<u16>,
    max_port: Option<u16>,
    auth_timeout_ms: Option<u64>,
    ping_timeout_ms: Option<u64>,
    work_conn_timeout_ms: Option<u64>,
    encrypt_control: Option<bool>,
    #[serde(default)]
    http_addr: String,
    #[serde(default)]
    https_addr: String,
    #[serde(default)]
    users: HashMap<String, String>,
    user_token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: String,
    user: String,
    #[serde(default)]
    token: String,
    pool_count: Option<u32>,
    ping_interval_ms: Option<u64>,
    pong_timeout_ms: Option<u64>,
    login_retry_ms: Option<u64>,
    dial_timeout_ms: Option<u64>,
    encrypt_control: Option<bool>,
    #[serde(default)]
    proxies: Vec<FileProxy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProxy {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    local_addr: String,
    #[serde(default)]
    remote_port: u16,
    #[serde(default)]
    encrypt: bool,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    url_prefix: String,
    #[serde(default)]
    host_rewrite: String,
}

fn ms_or(v: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.unwrap_or(default_ms))
}

/// Like [`ms_or`] but zero also means "use the default".
fn nonzero_ms_or(v: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.filter(|ms| *ms > 0).unwrap_or(default_ms))
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.unwrap_or_else(|| "info".into()),
                format: l.format.unwrap_or_else(|| "json".into()),
                output: l.output.unwrap_or_else(|| "stderr".into()),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let server = fc
            .server
            .map(|s| ServerConfig::from_file(s, config_path))
            .transpose()?;
        let client = fc.client.map(ClientConfig::from_file).transpose()?;

        if server.is_none() && client.is_none() {
            anyhow::bail!("config: at least one of [server] or [client] is required");
        }

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            server,
            client,
        })
    }
}

impl ServerConfig {
    fn from_file(s: FileServer, config_path: &Path) -> anyhow::Result<Self> {
        let proxy_bind_ip = match s.proxy_bind_ip.as_deref().map(str::trim) {
            None | Some("") => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Some(ip) => ip
                .parse()
                .with_context(|| format!("config: invalid server.proxy_bind_ip {ip:?}"))?,
        };

        let mut users: HashMap<String, String> = HashMap::new();
        if let Some(file) = s.user_token_file.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            let path = resolve_relative(config_path, file);
            let data = fs::read_to_string(&path)
                .with_context(|| format!("config: read user_token_file {}", path.display()))?;
            let from_file: HashMap<String, String> = serde_json::from_str(&data)
                .with_context(|| format!("config: parse user_token_file {}", path.display()))?;
            users.extend(from_file);
        }
        // Inline entries win over the token file.
        users.extend(s.users);

        Ok(ServerConfig {
            bind_addr: s
                .bind_addr
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "0.0.0.0:7000".into()),
            proxy_bind_ip,
            min_port: s.min_port.unwrap_or(DEFAULT_MIN_PORT),
            max_port: s.max_port.unwrap_or(DEFAULT_MAX_PORT),
            auth_timeout: ms_or(s.auth_timeout_ms, 900_000),
            ping_timeout: nonzero_ms_or(s.ping_timeout_ms, 90_000),
            work_conn_timeout: nonzero_ms_or(s.work_conn_timeout_ms, 10_000),
            encrypt_control: s.encrypt_control.unwrap_or(true),
            http_addr: s.http_addr.trim().to_string(),
            https_addr: s.https_addr.trim().to_string(),
            users,
        })
    }
}

impl ClientConfig {
    fn from_file(fc: FileClient) -> anyhow::Result<Self> {
        if fc.server_addr.trim().is_empty() {
            anyhow::bail!("config: client.server_addr is required");
        }
        if fc.user.trim().is_empty() {
            anyhow::bail!("config: client.user is required");
        }

        let mut proxies = Vec::with_capacity(fc.proxies.len());
        for p in fc.proxies {
            let kind = ProxyKind::parse(&p.kind).with_context(|| {
                format!("config: proxy {:?} has unsupported type {:?}", p.name, p.kind)
            })?;
            if kind != ProxyKind::Tcp && p.domain.trim().is_empty() {
                anyhow::bail!("config: {kind} proxy {:?} requires a domain", p.name);
            }
            proxies.push(ProxyConfig {
                name: p.name.trim().to_string(),
                kind,
                local_addr: p.local_addr.trim().to_string(),
                remote_port: p.remote_port,
                encrypt: p.encrypt,
                domain: p.domain.trim().to_string(),
                url_prefix: p.url_prefix.trim().to_string(),
                host_rewrite: p.host_rewrite.trim().to_string(),
            });
        }

        let pool_count = fc.pool_count.unwrap_or(5);

        Ok(ClientConfig {
            server_addr: fc.server_addr.trim().to_string(),
            user: fc.user.trim().to_string(),
            token: fc.token,
            pool_count,
            ping_interval: nonzero_ms_or(fc.ping_interval_ms, 30_000),
            pong_timeout: nonzero_ms_or(fc.pong_timeout_ms, 90_000),
            login_retry: nonzero_ms_or(fc.login_retry_ms, 5_000),
            dial_timeout: nonzero_ms_or(fc.dial_timeout_ms, 5_000),
            encrypt_control: fc.encrypt_control.unwrap_or(true),
            proxies,
        })
    }
}

fn resolve_relative(config_path: &Path, file: &str) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    config_path
        .parent()
        .map(|dir| dir.join(p))
        .unwrap_or_else(|| p.to_path_buf())
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# gangway configuration.
# admin_addr = "127.0.0.1:7400"

[logging]
level = "info"
format = "json"
output = "stderr"

[server]
bind_addr = "0.0.0.0:7000"
proxy_bind_ip = "0.0.0.0"
min_port = 10000
max_port = 11000
auth_timeout_ms = 900000
ping_timeout_ms = 90000
work_conn_timeout_ms = 10000
encrypt_control = true
# http_addr = "0.0.0.0:80"
# https_addr = "0.0.0.0:443"
# user_token_file = "users.json"

[server.users]
# alice = "change-me"

# [client]
# server_addr = "tunnel.example.com:7000"
# user = "alice"
# token = "change-me"
# pool_count = 5
#
# [[client.proxies]]
# name = "ssh"
# type = "tcp"
# local_addr = "127.0.0.1:22"
# remote_port = 10022
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# gangway configuration.
# admin_addr: "127.0.0.1:7400"

logging:
  level: info
  format: json
  output: stderr

server:
  bind_addr: "0.0.0.0:7000"
  proxy_bind_ip: "0.0.0.0"
  min_port: 10000
  max_port: 11000
  auth_timeout_ms: 900000
  ping_timeout_ms: 90000
  work_conn_timeout_ms: 10000
  encrypt_control: true
  # http_addr: "0.0.0.0:80"
  # https_addr: "0.0.0.0:443"
  users: {}

# client:
#   server_addr: "tunnel.example.com:7000"
#   user: alice
#   token: change-me
#   proxies:
#     - name: ssh
#       type: tcp
#       local_addr: "127.0.0.1:22"
#       remote_port: 10022
"#;

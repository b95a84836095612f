//! CLI & config (L): config file resolution/loading, split client/server shapes matching the
//! original's `client.Config` / `server.Config` split rather than one merged schema. Loaded
//! once at startup; there is no reload loop, unlike the teacher crate this is grounded on — this
//! spec has no hot-reloadable routes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

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

const ENV_VAR: &str = "ELDATUN_CONFIG";

/// Precedence: explicit flag -> env var -> `./eldatun.{toml,yaml,yml}` in the cwd -> the OS
/// default config dir, resolved the way `directories::ProjectDirs` does.
pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
    filename_stem: &str,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath { path: p, source: ConfigPathSource::Flag });
    }

    if let Some(p) = std::env::var_os(ENV_VAR) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath { path: PathBuf::from(p), source: ConfigPathSource::Env });
        }
    }

    if let Ok(p) = discover_config_path(Path::new("."), filename_stem) {
        return Ok(ResolvedConfigPath { path: p, source: ConfigPathSource::Cwd });
    }

    Ok(ResolvedConfigPath { path: default_config_path(filename_stem)?, source: ConfigPathSource::Default })
}

fn discover_config_path(dir: &Path, stem: &str) -> anyhow::Result<PathBuf> {
    for ext in ["toml", "yaml", "yml"] {
        let p = dir.join(format!("{stem}.{ext}"));
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no {stem}.{{toml,yaml,yml}} found in {}", dir.display())
}

fn default_config_path(stem: &str) -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("dev", "eldatun", "eldatun").context("config: resolve user config dir")?;
    Ok(proj.config_dir().join(format!("{stem}.toml")))
}

fn parse_duration(field: &str, s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("config: invalid duration for {field}: {s:?}"))
}

fn read_and_dispatch<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "toml" => toml::from_str(&data).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => serde_yaml::from_str(&data).with_context(|| format!("parse yaml {}", path.display())),
        other => anyhow::bail!("config: unsupported extension {other:?} (expected .toml or .yaml/.yml)"),
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    pub connect_timeout: Duration,
    pub remote_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub max_connection_multiplex: u64,
    pub preconnect_pool_size: usize,
    pub direct_dial: Option<String>,
    pub tun_device: Option<String>,
    pub dns_override: String,
    pub log_level: String,
    pub admin_addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileClientConfig {
    address: Option<String>,
    #[serde(default)]
    connect_timeout: Option<String>,
    #[serde(default)]
    remote_timeout: Option<String>,
    #[serde(default)]
    keep_alive_timeout: Option<String>,
    #[serde(default)]
    max_connection_multiplex: Option<u64>,
    #[serde(default)]
    preconnect_pool_size: Option<usize>,
    #[serde(default)]
    direct_dial: Option<String>,
    #[serde(default)]
    tun_device: Option<String>,
    #[serde(default)]
    dns_override: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    admin_addr: Option<String>,
}

pub fn load_client_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let fc: FileClientConfig = read_and_dispatch(path)?;
    Ok(ClientConfig {
        address: fc.address.context("config: client.address is required")?,
        connect_timeout: match &fc.connect_timeout {
            Some(s) => parse_duration("connect_timeout", s)?,
            None => Duration::from_secs(10),
        },
        remote_timeout: match &fc.remote_timeout {
            Some(s) => parse_duration("remote_timeout", s)?,
            None => Duration::from_secs(10),
        },
        keep_alive_timeout: match &fc.keep_alive_timeout {
            Some(s) => parse_duration("keep_alive_timeout", s)?,
            None => Duration::from_secs(30),
        },
        max_connection_multiplex: fc.max_connection_multiplex.unwrap_or(0),
        preconnect_pool_size: fc.preconnect_pool_size.unwrap_or(0),
        direct_dial: fc.direct_dial,
        tun_device: fc.tun_device,
        dns_override: fc.dns_override.unwrap_or_else(|| "1.1.1.1:53".to_string()),
        log_level: fc.log_level.unwrap_or_else(|| "info".to_string()),
        admin_addr: fc.admin_addr,
    })
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub token: String,
    pub static_dir: PathBuf,
    pub domain: Option<String>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub redirector_addr: Option<String>,
    pub dial_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub log_level: String,
    pub admin_addr: Option<String>,
}

impl ServerConfig {
    pub fn is_https(&self) -> bool {
        self.cert_path.is_some()
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileServerConfig {
    listen_addr: Option<String>,
    token: Option<String>,
    #[serde(default)]
    static_dir: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    cert_path: Option<String>,
    #[serde(default)]
    key_path: Option<String>,
    #[serde(default)]
    redirector_addr: Option<String>,
    #[serde(default)]
    dial_timeout: Option<String>,
    #[serde(default)]
    keep_alive_timeout: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    admin_addr: Option<String>,
}

pub fn load_server_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let fc: FileServerConfig = read_and_dispatch(path)?;
    let cert_path = fc.cert_path.filter(|s| !s.is_empty()).map(PathBuf::from);
    if cert_path.is_none() {
        tracing::warn!("config: serving without https");
    }
    Ok(ServerConfig {
        listen_addr: fc.listen_addr.context("config: server.listen_addr is required")?,
        token: fc.token.context("config: server.token is required")?,
        static_dir: fc.static_dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./static")),
        domain: fc.domain.filter(|s| !s.is_empty()),
        cert_path,
        key_path: fc.key_path.filter(|s| !s.is_empty()).map(PathBuf::from),
        redirector_addr: fc.redirector_addr.filter(|s| !s.is_empty()),
        dial_timeout: match &fc.dial_timeout {
            Some(s) => parse_duration("dial_timeout", s)?,
            None => Duration::from_secs(10),
        },
        keep_alive_timeout: match &fc.keep_alive_timeout {
            Some(s) => parse_duration("keep_alive_timeout", s)?,
            None => Duration::from_secs(30),
        },
        log_level: fc.log_level.unwrap_or_else(|| "info".to_string()),
        admin_addr: fc.admin_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = std::env::temp_dir().join(format!("eldatun-cfg-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cfg.ini");
        fs::write(&path, "address = 1").unwrap();
        let err = load_client_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported extension"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn client_config_applies_defaults() {
        let dir = std::env::temp_dir().join(format!("eldatun-cfg-test2-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("client.toml");
        fs::write(&path, "address = \"https://tunnel.example.invalid/establish/tok\"\n").unwrap();
        let cfg = load_client_config(&path).unwrap();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.dns_override, "1.1.1.1:53");
        let _ = fs::remove_dir_all(&dir);
    }
}

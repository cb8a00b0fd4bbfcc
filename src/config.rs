use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ForgeError, Result};

const ENV_PREFIX: &str = "JOBFORGE_";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_AUTH_HEADER: &str = "X-Build-Token";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 64 << 20;
const DEFAULT_MAX_EXTRACTED_FILES: usize = 4096;
const DEFAULT_MAX_EXTRACTED_TOTAL_BYTES: u64 = 1024 << 20;
const DEFAULT_MAX_EXTRACTED_FILE_BYTES: u64 = 256 << 20;
const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 7200;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const DEFAULT_TOOL_BIN: &str = "forge-tool";

/// Server configuration, loaded once from `JOBFORGE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub base_dir: PathBuf,

    pub token: String,
    pub auth_header: String,
    pub allowlist: Vec<AllowRule>,

    pub max_upload_bytes: u64,
    pub max_extracted_files: usize,
    pub max_extracted_total_bytes: u64,
    pub max_extracted_file_bytes: u64,

    pub worker_timeout: Duration,
    pub preserve_work_dir: bool,
    pub use_fake_runner: bool,
    pub history_limit: usize,

    pub tool_bin: String,
}

impl Config {
    /// Baseline configuration rooted at `base_dir`. Everything else defaults.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            base_dir: base_dir.into(),
            token: String::new(),
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            allowlist: Vec::new(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_extracted_files: DEFAULT_MAX_EXTRACTED_FILES,
            max_extracted_total_bytes: DEFAULT_MAX_EXTRACTED_TOTAL_BYTES,
            max_extracted_file_bytes: DEFAULT_MAX_EXTRACTED_FILE_BYTES,
            worker_timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS),
            preserve_work_dir: false,
            use_fake_runner: false,
            history_limit: DEFAULT_HISTORY_LIMIT,
            tool_bin: DEFAULT_TOOL_BIN.to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let base_dir = env_string("BASE_DIR");
        if base_dir.is_empty() {
            return Err(ForgeError::Config(format!(
                "{ENV_PREFIX}BASE_DIR is required"
            )));
        }
        let mut cfg = Self::with_base_dir(base_dir);

        if let Some(v) = env_opt("LISTEN_ADDR") {
            cfg.listen_addr = v;
        }
        cfg.token = env_string("TOKEN");
        if let Some(v) = env_opt("AUTH_HEADER") {
            cfg.auth_header = v;
        }
        cfg.allowlist = parse_allowlist(&env_string("ALLOWLIST"))?;
        if let Some(v) = env_opt("TOOL_BIN") {
            cfg.tool_bin = v;
        }
        cfg.preserve_work_dir = env_bool("PRESERVE_WORK_DIR");
        cfg.use_fake_runner = env_bool("USE_FAKE_RUNNER");

        if let Some(n) = env_parse::<u64>("MAX_UPLOAD_BYTES")? {
            cfg.max_upload_bytes = n;
        }
        if let Some(n) = env_parse::<usize>("MAX_EXTRACTED_FILES")? {
            cfg.max_extracted_files = n;
        }
        if let Some(n) = env_parse::<u64>("MAX_EXTRACTED_TOTAL_BYTES")? {
            cfg.max_extracted_total_bytes = n;
        }
        if let Some(n) = env_parse::<u64>("MAX_EXTRACTED_FILE_BYTES")? {
            cfg.max_extracted_file_bytes = n;
        }
        if let Some(n) = env_parse::<u64>("WORKER_TIMEOUT_SECS")? {
            cfg.worker_timeout = Duration::from_secs(n);
        }
        if let Some(n) = env_parse::<usize>("HISTORY_LIMIT")? {
            cfg.history_limit = n;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(ForgeError::Config("base dir is required".into()));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(ForgeError::Config("listen addr is required".into()));
        }
        if self.auth_header.trim().is_empty() {
            return Err(ForgeError::Config("auth header is required".into()));
        }
        if self.max_upload_bytes == 0 {
            return Err(ForgeError::Config("max upload bytes must be > 0".into()));
        }
        if self.max_extracted_files == 0 {
            return Err(ForgeError::Config("max extracted files must be > 0".into()));
        }
        if self.max_extracted_total_bytes == 0 {
            return Err(ForgeError::Config(
                "max extracted total bytes must be > 0".into(),
            ));
        }
        if self.max_extracted_file_bytes == 0 {
            return Err(ForgeError::Config(
                "max extracted file bytes must be > 0".into(),
            ));
        }
        if self.worker_timeout.is_zero() {
            return Err(ForgeError::Config("worker timeout must be > 0".into()));
        }
        if self.history_limit == 0 {
            return Err(ForgeError::Config("history limit must be > 0".into()));
        }
        if self.tool_bin.trim().is_empty() {
            return Err(ForgeError::Config("tool bin is required".into()));
        }
        Ok(())
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.base_dir.join("jobs")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.base_dir.join("work")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.base_dir.join("artifacts")
    }

    pub fn history_path(&self) -> PathBuf {
        self.base_dir.join("history").join("recent.json")
    }

    pub fn allowlist_enabled(&self) -> bool {
        !self.allowlist.is_empty()
    }
}

/// One allowlist entry: a literal address or a CIDR block.
#[derive(Debug, Clone)]
pub enum AllowRule {
    Ip(IpAddr),
    Cidr { net: IpAddr, prefix: u8 },
}

impl AllowRule {
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ForgeError::Config("allowlist entry cannot be empty".into()));
        }
        if let Some((addr, prefix)) = entry.split_once('/') {
            let net: IpAddr = addr.parse().map_err(|_| {
                ForgeError::Config(format!("invalid allowlist cidr {entry:?}"))
            })?;
            let prefix: u8 = prefix.parse().map_err(|_| {
                ForgeError::Config(format!("invalid allowlist cidr {entry:?}"))
            })?;
            let max = match net {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(ForgeError::Config(format!(
                    "invalid allowlist cidr {entry:?}"
                )));
            }
            return Ok(Self::Cidr { net, prefix });
        }
        let ip: IpAddr = entry
            .parse()
            .map_err(|_| ForgeError::Config(format!("invalid allowlist ip {entry:?}")))?;
        Ok(Self::Ip(ip))
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Ip(allowed) => *allowed == ip,
            Self::Cidr { net, prefix } => match (net, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    prefix_matches(&net.octets(), &ip.octets(), *prefix)
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    prefix_matches(&net.octets(), &ip.octets(), *prefix)
                }
                _ => false,
            },
        }
    }
}

fn prefix_matches(net: &[u8], ip: &[u8], prefix: u8) -> bool {
    let full = usize::from(prefix / 8);
    let rem = prefix % 8;
    if net[..full] != ip[..full] {
        return false;
    }
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    net[full] & mask == ip[full] & mask
}

fn parse_allowlist(raw: &str) -> Result<Vec<AllowRule>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(AllowRule::parse)
        .collect()
}

fn env_string(key: &str) -> String {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn env_opt(key: &str) -> Option<String> {
    let v = env_string(key);
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn env_bool(key: &str) -> bool {
    matches!(
        env_string(key).to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_opt(key) {
        None => Ok(None),
        Some(v) => v.parse::<T>().map(Some).map_err(|_| {
            ForgeError::Config(format!("parse {ENV_PREFIX}{key}: invalid value {v:?}"))
        }),
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

pub const DEFAULT_CONFIG_FILE: &str = "kira-af.json";
pub const DEFAULT_API_BASE_URL: &str = "https://archive.example.org/api";
pub const DEFAULT_STALE_AFTER_HOURS: u64 = 72;

pub const CSRF_TOKEN_ENV: &str = "KIRA_AF_CSRF_TOKEN";
pub const SESSION_ENV: &str = "KIRA_AF_SESSION";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub state_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub stale_after_hours: Option<u64>,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub samtools: Option<PathBuf>,
    #[serde(default)]
    pub tabix: Option<PathBuf>,
    #[serde(default)]
    pub bgzip: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub csrf_token: Option<String>,
    pub session: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            csrf_token: read(CSRF_TOKEN_ENV),
            session: read(SESSION_ENV),
        }
    }
}

/// Paths to the external tools; `None` means not installed.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub samtools: Option<PathBuf>,
    pub tabix: Option<PathBuf>,
    pub bgzip: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub api_base_url: String,
    pub state_file: Utf8PathBuf,
    pub stale_after_hours: u64,
    pub tools: ToolPaths,
    pub credentials: Credentials,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content).map_err(|err| KiraError::ConfigParse(err.to_string()))?
        };

        Self::resolve_config(config, Credentials::from_env())
    }

    pub fn resolve_config(
        config: Config,
        credentials: Credentials,
    ) -> Result<ResolvedConfig, KiraError> {
        let state_file = match config.state_file {
            Some(path) => path,
            None => default_state_file()?,
        };
        let api_base_url = config
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let tools = ToolPaths {
            samtools: config.tools.samtools.or_else(|| find_in_path("samtools")),
            tabix: config.tools.tabix.or_else(|| find_in_path("tabix")),
            bgzip: config.tools.bgzip.or_else(|| find_in_path("bgzip")),
        };

        Ok(ResolvedConfig {
            api_base_url,
            state_file,
            stale_after_hours: config
                .stale_after_hours
                .unwrap_or(DEFAULT_STALE_AFTER_HOURS),
            tools,
            credentials,
        })
    }
}

pub fn default_state_file() -> Result<Utf8PathBuf, KiraError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(
                dirs.home_dir()
                    .join(".cache")
                    .join("kira-archive-fetch")
                    .join("restorations.json"),
            )
            .ok()
        })
        .ok_or_else(|| KiraError::Filesystem("unable to resolve state file location".to_string()))
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if is_file(&plain) {
            return Some(plain);
        }
    }
    None
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|meta| meta.is_file()).unwrap_or(false)
}

use std::{env, net::SocketAddr, str::FromStr};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub provider: ProviderKind,
    pub provider_url: String,
    pub provider_domain: String,
    pub provider_request_timeout_ms: u64,
    pub preview_port: u16,
    pub work_dir: String,
    pub default_runtime: String,
    pub run_lifetime_ms: u64,
    pub install_lifetime_ms: u64,
    pub runner_grace_ms: u64,
    pub max_output_bytes: usize,
    pub log_level: String,
}

/// Name of the environment variable holding the provider credential. It is
/// read on every provider call and never stored in the config.
pub const CREDENTIAL_VAR: &str = "SANDBOX_API_KEY";

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            provider: env_parse("SANDBOX_PROVIDER", ProviderKind::Remote),
            provider_url: env_string("SANDBOX_API_URL", "http://127.0.0.1:7070"),
            provider_domain: env_string("SANDBOX_DOMAIN", "sandbox.localhost"),
            provider_request_timeout_ms: env_parse("PROVIDER_REQUEST_TIMEOUT_MS", 30_000u64),
            preview_port: env_parse("PREVIEW_PORT", 3000u16),
            work_dir: env_string("WORK_DIR", "/home/user"),
            default_runtime: env_string("DEFAULT_RUNTIME", "base"),
            run_lifetime_ms: env_parse("RUN_LIFETIME_MS", 30_000u64),
            install_lifetime_ms: env_parse("INSTALL_LIFETIME_MS", 120_000u64),
            runner_grace_ms: env_parse("RUNNER_GRACE_MS", 5_000u64),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", 1024 * 1024usize),
            log_level: env_string("LOG_LEVEL", "info"),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            provider: ProviderKind::Remote,
            provider_url: "http://127.0.0.1:7070".to_string(),
            provider_domain: "sandbox.localhost".to_string(),
            provider_request_timeout_ms: 30_000,
            preview_port: 3000,
            work_dir: "/home/user".to_string(),
            default_runtime: "base".to_string(),
            run_lifetime_ms: 30_000,
            install_lifetime_ms: 120_000,
            runner_grace_ms: 5_000,
            max_output_bytes: 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProviderKind {
    #[default]
    Remote,
    Process,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remote" => Ok(Self::Remote),
            "process" | "local" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox provider: {s}")),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

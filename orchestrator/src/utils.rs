//! Utility functions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version information for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("VPSCTL_GIT_REV").unwrap_or("unknown").to_string(),
        build_time: option_env!("VPSCTL_BUILD_DATE").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Replace every occurrence of each secret in `text` with `********`.
///
/// Secrets shorter than 4 characters are ignored; they would mangle
/// unrelated output.
pub fn redact(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if secret.len() >= 4 {
            out = out.replace(secret, "********");
        }
    }
    out
}

/// Hex encoding utilities
pub mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(data: impl AsRef<[u8]>) -> String {
        let data = data.as_ref();
        let mut result = String::with_capacity(data.len() * 2);
        for byte in data {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}

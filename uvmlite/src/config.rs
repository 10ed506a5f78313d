//! Source factory configuration.

use serde::{Deserialize, Serialize};
use uvmlite_shared::constants::hvsocket;
use uvmlite_shared::errors::{UvmError, UvmResult};

use crate::osversion::OsVersion;

pub const ENV_LOG_FORWARDING: &str = "UVMLITE_LOG_FORWARDING";
pub const ENV_LOG_PORT: &str = "UVMLITE_LOG_PORT";
pub const ENV_HOST_BUILD: &str = "UVMLITE_HOST_BUILD";

/// Settings shared by every utility VM a source produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOptions {
    /// Listen for guest logs at create and forward them after start.
    pub log_forwarding: bool,
    /// Vsock port the guest writes its logs to.
    pub log_port: u32,
    /// Security descriptor for binding to guest sockets.
    pub hvsocket_sddl: String,
    /// Host build to assume instead of detecting it.
    pub host_build: Option<u32>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            log_forwarding: true,
            log_port: hvsocket::LINUX_LOG_VSOCK_PORT,
            hvsocket_sddl: hvsocket::DEFAULT_BIND_SDDL.to_string(),
            host_build: None,
        }
    }
}

impl SourceOptions {
    /// Defaults overlaid with `UVMLITE_*` environment variables.
    pub fn from_env() -> UvmResult<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values found through `lookup`.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> UvmResult<Self> {
        if let Some(raw) = lookup(ENV_LOG_FORWARDING) {
            self.log_forwarding = parse_bool(ENV_LOG_FORWARDING, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG_PORT) {
            self.log_port = parse_number(ENV_LOG_PORT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_HOST_BUILD) {
            self.host_build = Some(parse_number(ENV_HOST_BUILD, &raw)?);
        }
        Ok(self)
    }

    /// The configured host build, or the detected one.
    pub fn os_version(&self) -> OsVersion {
        match self.host_build {
            Some(build) => OsVersion::from_build(build),
            None => OsVersion::detect(),
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> UvmResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(UvmError::Config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

fn parse_number(key: &str, raw: &str) -> UvmResult<u32> {
    raw.trim()
        .parse()
        .map_err(|e| UvmError::Config(format!("{key}: invalid number '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let opts = SourceOptions::default();
        assert!(opts.log_forwarding);
        assert_eq!(opts.log_port, 109);
        assert_eq!(opts.hvsocket_sddl, "D:P(A;;FA;;;SY)(A;;FA;;;BA)");
        assert_eq!(opts.host_build, None);
    }

    #[test]
    fn test_overlay() {
        let opts = SourceOptions::default()
            .overlay(env(&[
                (ENV_LOG_FORWARDING, "off"),
                (ENV_LOG_PORT, "2000"),
                (ENV_HOST_BUILD, "19041"),
            ]))
            .unwrap();
        assert!(!opts.log_forwarding);
        assert_eq!(opts.log_port, 2000);
        assert_eq!(opts.os_version().build, 19041);
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let err = SourceOptions::default()
            .overlay(env(&[(ENV_LOG_PORT, "eighty")]))
            .unwrap_err();
        assert!(matches!(err, UvmError::Config(_)));
        assert!(err.to_string().contains(ENV_LOG_PORT));
    }

    #[test]
    fn test_deserialize_partial() {
        let opts: SourceOptions = serde_json::from_str(r#"{"log_forwarding": false}"#).unwrap();
        assert!(!opts.log_forwarding);
        assert_eq!(opts.log_port, 109);
    }
}

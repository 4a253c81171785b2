//! Configuration for the pipeline stages.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use imgsweep_reconcile::ExclusionList;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::endpoint::{
    parse_endpoint, parse_endpoint_with_fallback, Endpoint, EndpointError, TCP_SCHEME,
    UNIX_SCHEME,
};

pub const DEFAULT_SHARED_DIR: &str = "/run/imgsweep/shared-data";
pub const DEFAULT_EXCLUSION_DIR: &str = "/run/imgsweep/exclusions";
pub const DEFAULT_RUNTIME_TIMEOUT_SECS: u64 = 300;
/// Scheme assumed for a runtime address given as a bare path.
pub const DEFAULT_FALLBACK_SCHEME: &str = UNIX_SCHEME;

/// Container runtimes with a known default socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeName {
    #[default]
    Containerd,
    Dockershim,
    Crio,
}

impl RuntimeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeName::Containerd => "containerd",
            RuntimeName::Dockershim => "dockershim",
            RuntimeName::Crio => "crio",
        }
    }

    pub fn default_address(&self) -> &'static str {
        match self {
            RuntimeName::Containerd => "unix:///run/containerd/containerd.sock",
            RuntimeName::Dockershim => "unix:///run/dockershim.sock",
            RuntimeName::Crio => "unix:///run/crio/crio.sock",
        }
    }
}

impl fmt::Display for RuntimeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeName {
    type Err = RuntimeSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "containerd" => Ok(RuntimeName::Containerd),
            "dockershim" => Ok(RuntimeName::Dockershim),
            "crio" => Ok(RuntimeName::Crio),
            other => Err(RuntimeSpecError::UnknownRuntime(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeSpecError {
    #[error("unknown runtime {0:?} (expected containerd, dockershim or crio)")]
    UnknownRuntime(String),

    #[error("invalid runtime address")]
    Address(#[from] EndpointError),
}

/// Which runtime to talk to and where.
///
/// Deserialization validates the address, so a `RuntimeSpec` in hand always
/// carries a `unix://` or `tcp://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRuntimeSpec")]
pub struct RuntimeSpec {
    pub name: RuntimeName,
    pub address: String,
}

#[derive(Deserialize)]
struct RawRuntimeSpec {
    name: String,
    #[serde(default)]
    address: String,
}

impl TryFrom<RawRuntimeSpec> for RuntimeSpec {
    type Error = RuntimeSpecError;

    fn try_from(raw: RawRuntimeSpec) -> Result<Self, Self::Error> {
        let name = raw.name.parse()?;
        Self::new(name, &raw.address)
    }
}

impl RuntimeSpec {
    /// Build a spec, defaulting an empty address to the runtime's socket.
    pub fn new(name: RuntimeName, address: &str) -> Result<Self, RuntimeSpecError> {
        let address = if address.is_empty() {
            name.default_address()
        } else {
            address
        };
        parse_endpoint(address)?;
        Ok(Self {
            name,
            address: address.to_string(),
        })
    }

    /// Build a spec from a possibly scheme-less address.
    ///
    /// A legacy bare address is resolved as `fallback://address` and stored
    /// in full URL form.
    pub fn with_fallback(
        name: RuntimeName,
        address: &str,
        fallback: &str,
    ) -> Result<Self, RuntimeSpecError> {
        if address.is_empty() {
            return Ok(Self::for_runtime(name));
        }
        let endpoint = parse_endpoint_with_fallback(address, fallback)?;
        Ok(Self {
            name,
            address: endpoint.to_string(),
        })
    }

    pub fn for_runtime(name: RuntimeName) -> Self {
        Self {
            name,
            address: name.default_address().to_string(),
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint, EndpointError> {
        parse_endpoint(&self.address)
    }

    /// Like [`endpoint`](Self::endpoint), tolerating a scheme-less address.
    pub fn endpoint_with_fallback(&self, fallback: &str) -> Result<Endpoint, EndpointError> {
        parse_endpoint_with_fallback(&self.address, fallback)
    }
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self::for_runtime(RuntimeName::default())
    }
}

/// Pipeline stage configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Runtime to query and delete from.
    pub runtime: RuntimeSpec,

    /// Scheme for a runtime address given without one (`unix` or `tcp`).
    pub runtime_fallback_scheme: String,

    /// Per-RPC deadline for runtime calls.
    pub runtime_timeout: Duration,

    /// Directory holding the handoff pipes.
    pub shared_dir: PathBuf,

    /// Directory scanned for `exclude-*` documents.
    pub exclusion_dir: PathBuf,

    /// Explicit target list for the remover. Skips the pipe handshake.
    pub image_list: Option<PathBuf>,

    /// Whether a scanner sits between collector and remover.
    pub scanner_enabled: bool,

    /// Forward images the scanner could not scan for deletion.
    pub delete_scan_failed: bool,

    /// Patterns the scanner classifies as non-compliant.
    pub scan_deny: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeSpec::default(),
            runtime_fallback_scheme: DEFAULT_FALLBACK_SCHEME.to_string(),
            runtime_timeout: Duration::from_secs(DEFAULT_RUNTIME_TIMEOUT_SECS),
            shared_dir: PathBuf::from(DEFAULT_SHARED_DIR),
            exclusion_dir: PathBuf::from(DEFAULT_EXCLUSION_DIR),
            image_list: None,
            scanner_enabled: false,
            delete_scan_failed: true,
            scan_deny: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let runtime_fallback_scheme = match var("IMGSWEEP_RUNTIME_FALLBACK_SCHEME") {
            Some(scheme) => {
                let scheme = scheme.trim().to_ascii_lowercase();
                if scheme != UNIX_SCHEME && scheme != TCP_SCHEME {
                    anyhow::bail!(
                        "invalid IMGSWEEP_RUNTIME_FALLBACK_SCHEME: {scheme:?} (expected unix or tcp)"
                    );
                }
                scheme
            }
            None => defaults.runtime_fallback_scheme,
        };

        // A full JSON spec wins over the split name/address variables.
        let runtime = match var("IMGSWEEP_RUNTIME") {
            Some(json) => serde_json::from_str::<RuntimeSpec>(&json)
                .context("invalid IMGSWEEP_RUNTIME")?,
            None => {
                let name = match var("IMGSWEEP_RUNTIME_NAME") {
                    Some(name) => name
                        .parse::<RuntimeName>()
                        .context("invalid IMGSWEEP_RUNTIME_NAME")?,
                    None => RuntimeName::default(),
                };
                let address = var("IMGSWEEP_RUNTIME_ADDRESS").unwrap_or_default();
                RuntimeSpec::with_fallback(name, &address, &runtime_fallback_scheme)
                    .context("invalid IMGSWEEP_RUNTIME_ADDRESS")?
            }
        };

        let runtime_timeout = match var("IMGSWEEP_RUNTIME_TIMEOUT_SECS") {
            Some(secs) => Duration::from_secs(
                secs.parse::<u64>()
                    .context("IMGSWEEP_RUNTIME_TIMEOUT_SECS must be a whole number of seconds")?,
            ),
            None => defaults.runtime_timeout,
        };

        let shared_dir = var("IMGSWEEP_SHARED_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.shared_dir);

        let exclusion_dir = var("IMGSWEEP_EXCLUSION_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.exclusion_dir);

        let image_list = var("IMGSWEEP_IMAGE_LIST").map(PathBuf::from);

        let scanner_enabled = match var("IMGSWEEP_SCANNER_ENABLED") {
            Some(value) => parse_bool(&value).context("invalid IMGSWEEP_SCANNER_ENABLED")?,
            None => defaults.scanner_enabled,
        };

        let delete_scan_failed = match var("IMGSWEEP_DELETE_SCAN_FAILED") {
            Some(value) => parse_bool(&value).context("invalid IMGSWEEP_DELETE_SCAN_FAILED")?,
            None => defaults.delete_scan_failed,
        };

        let scan_deny = var("IMGSWEEP_SCAN_DENY")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|pattern| !pattern.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let log_level = var("IMGSWEEP_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            runtime,
            runtime_fallback_scheme,
            runtime_timeout,
            shared_dir,
            exclusion_dir,
            image_list,
            scanner_enabled,
            delete_scan_failed,
            scan_deny,
            log_level,
        })
    }
}

impl Config {
    /// Load exclusion documents from `exclusion_dir`.
    ///
    /// A missing directory means no exclusions are configured.
    pub fn load_exclusions(&self) -> Result<ExclusionList> {
        match ExclusionList::load_dir(&self.exclusion_dir) {
            Ok(list) => {
                if list.is_empty() {
                    info!("No images to exclude");
                } else {
                    info!(patterns = ?list.patterns().collect::<Vec<_>>(), "Loaded exclusion list");
                }
                Ok(list)
            }
            Err(err) if err.is_not_found() => {
                info!(dir = %self.exclusion_dir.display(), "Exclusion config does not exist");
                Ok(ExclusionList::default())
            }
            Err(err) => Err(err).context("failed to parse exclusion list"),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[rstest]
    #[case(RuntimeName::Containerd, "unix:///run/containerd/containerd.sock")]
    #[case(RuntimeName::Dockershim, "unix:///run/dockershim.sock")]
    #[case(RuntimeName::Crio, "unix:///run/crio/crio.sock")]
    fn test_runtime_defaults(#[case] name: RuntimeName, #[case] address: &str) {
        let spec = RuntimeSpec::new(name, "").unwrap();
        assert_eq!(spec.address, address);
        assert_eq!(spec, RuntimeSpec::for_runtime(name));
    }

    #[rstest]
    #[case(r#"{"name": "containerd", "address": "unix:///run/containerd/containerd.sock"}"#, RuntimeName::Containerd)]
    #[case(r#"{"name": "dockershim", "address": "unix:///run/dockershim.sock"}"#, RuntimeName::Dockershim)]
    #[case(r#"{"name": "crio", "address": "unix:///run/crio/crio.sock"}"#, RuntimeName::Crio)]
    #[case(r#"{"name": "crio"}"#, RuntimeName::Crio)]
    fn test_runtime_spec_deserialize(#[case] json: &str, #[case] name: RuntimeName) {
        let spec: RuntimeSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.name, name);
        assert_eq!(spec.address, name.default_address());
    }

    #[rstest]
    #[case(r#"{"name": "invalid", "address": "unix:///invalid"}"#)]
    #[case(r#"{"name": "containerd", "address": "http://invalid"}"#)]
    #[case(r#"{"name": "containerd", "address": "/run/containerd/containerd.sock"}"#)]
    fn test_runtime_spec_rejects(#[case] json: &str) {
        assert!(serde_json::from_str::<RuntimeSpec>(json).is_err());
    }

    #[test]
    fn test_tcp_address_is_accepted() {
        let spec = RuntimeSpec::new(RuntimeName::Containerd, "tcp://10.0.0.5:1234").unwrap();
        assert_eq!(spec.endpoint().unwrap(), Endpoint::Tcp("10.0.0.5:1234".into()));
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.runtime, RuntimeSpec::default());
        assert_eq!(config.runtime_fallback_scheme, "unix");
        assert_eq!(config.runtime_timeout, Duration::from_secs(300));
        assert_eq!(config.shared_dir, PathBuf::from(DEFAULT_SHARED_DIR));
        assert_eq!(config.exclusion_dir, PathBuf::from(DEFAULT_EXCLUSION_DIR));
        assert!(config.image_list.is_none());
        assert!(!config.scanner_enabled);
        assert!(config.delete_scan_failed);
        assert!(config.scan_deny.is_empty());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_runtime_json_wins() {
        let config = config_from(&[
            ("IMGSWEEP_RUNTIME", r#"{"name": "crio", "address": ""}"#),
            ("IMGSWEEP_RUNTIME_NAME", "dockershim"),
        ])
        .unwrap();
        assert_eq!(config.runtime, RuntimeSpec::for_runtime(RuntimeName::Crio));
    }

    #[test]
    fn test_runtime_name_and_address() {
        let config = config_from(&[
            ("IMGSWEEP_RUNTIME_NAME", "dockershim"),
            ("IMGSWEEP_RUNTIME_ADDRESS", "unix:///var/run/dockershim.sock"),
        ])
        .unwrap();
        assert_eq!(config.runtime.name, RuntimeName::Dockershim);
        assert_eq!(config.runtime.address, "unix:///var/run/dockershim.sock");
    }

    #[rstest]
    #[case("/run/containerd/containerd.sock", "unix:///run/containerd/containerd.sock")]
    #[case("unix:///run/crio/crio.sock", "unix:///run/crio/crio.sock")]
    #[case("tcp://10.0.0.5:1234", "tcp://10.0.0.5:1234")]
    fn test_bare_runtime_address_uses_fallback(#[case] address: &str, #[case] expected: &str) {
        let config = config_from(&[("IMGSWEEP_RUNTIME_ADDRESS", address)]).unwrap();
        assert_eq!(config.runtime.address, expected);
        assert!(config.runtime.endpoint().is_ok());
    }

    #[test]
    fn test_configured_fallback_scheme() {
        let config = config_from(&[
            ("IMGSWEEP_RUNTIME_ADDRESS", "10.0.0.5:1234"),
            ("IMGSWEEP_RUNTIME_FALLBACK_SCHEME", "TCP"),
        ])
        .unwrap();
        assert_eq!(config.runtime_fallback_scheme, "tcp");
        assert_eq!(
            config.runtime.endpoint().unwrap(),
            Endpoint::Tcp("10.0.0.5:1234".into())
        );
    }

    #[test]
    fn test_endpoint_with_fallback_accepts_bare_path() {
        let spec = RuntimeSpec {
            name: RuntimeName::Containerd,
            address: "/run/containerd/containerd.sock".to_string(),
        };
        assert!(matches!(spec.endpoint(), Err(EndpointError::Deprecated { .. })));
        assert_eq!(
            spec.endpoint_with_fallback(DEFAULT_FALLBACK_SCHEME).unwrap(),
            Endpoint::Unix("/run/containerd/containerd.sock".into())
        );
    }

    #[test]
    fn test_address_error_reports_cause_once() {
        let err = anyhow::Error::new(
            RuntimeSpec::new(RuntimeName::Containerd, "http://invalid").unwrap_err(),
        );
        assert_eq!(
            format!("{err:#}"),
            "invalid runtime address: \"http\": protocol not supported"
        );
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("IMGSWEEP_SHARED_DIR", "/tmp/shared"),
            ("IMGSWEEP_IMAGE_LIST", "/config/imagelist.json"),
            ("IMGSWEEP_SCANNER_ENABLED", "true"),
            ("IMGSWEEP_DELETE_SCAN_FAILED", "0"),
            ("IMGSWEEP_SCAN_DENY", " *:latest ,, docker.io/library/* "),
            ("IMGSWEEP_RUNTIME_TIMEOUT_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.shared_dir, PathBuf::from("/tmp/shared"));
        assert_eq!(config.image_list, Some(PathBuf::from("/config/imagelist.json")));
        assert!(config.scanner_enabled);
        assert!(!config.delete_scan_failed);
        assert_eq!(config.scan_deny, vec!["*:latest", "docker.io/library/*"]);
        assert_eq!(config.runtime_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_load_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("exclude-system.json"),
            r#"{"excluded": ["docker.io/library/*"]}"#,
        )
        .unwrap();

        let config = Config {
            exclusion_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let list = config.load_exclusions().unwrap();
        assert!(list.matches("docker.io/library/nginx:latest"));
    }

    #[test]
    fn test_missing_exclusion_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            exclusion_dir: dir.path().join("absent"),
            ..Config::default()
        };
        assert!(config.load_exclusions().unwrap().is_empty());
    }

    #[rstest]
    #[case("IMGSWEEP_RUNTIME_NAME", "docker")]
    #[case("IMGSWEEP_RUNTIME_ADDRESS", "https://runtime.example")]
    #[case("IMGSWEEP_RUNTIME", "{not json")]
    #[case("IMGSWEEP_SCANNER_ENABLED", "maybe")]
    #[case("IMGSWEEP_RUNTIME_TIMEOUT_SECS", "soon")]
    #[case("IMGSWEEP_RUNTIME_FALLBACK_SCHEME", "http")]
    fn test_invalid_values(#[case] key: &str, #[case] value: &str) {
        assert!(config_from(&[(key, value)]).is_err());
    }
}

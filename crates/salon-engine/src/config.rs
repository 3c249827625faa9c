use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::Error;
use crate::non_empty_env;

pub const DEFAULT_REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";
pub const DEFAULT_REPLICATE_MODEL: &str = "google/nano-banana";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Replicate,
    Dryrun,
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "replicate" => Ok(ProviderKind::Replicate),
            "dryrun" | "dry-run" => Ok(ProviderKind::Dryrun),
            other => Err(Error::Config(format!(
                "unknown provider '{other}' (expected replicate or dryrun)"
            ))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Replicate => "replicate",
            ProviderKind::Dryrun => "dryrun",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateSettings {
    pub api_base: String,
    pub api_token: Option<String>,
    pub model: String,
    pub poll_interval_s: f64,
    pub poll_timeout_s: f64,
}

impl Default for ReplicateSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_REPLICATE_API_BASE.to_string(),
            api_token: None,
            model: DEFAULT_REPLICATE_MODEL.to_string(),
            poll_interval_s: 1.0,
            poll_timeout_s: 120.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlobBackend {
    Local {
        dir: PathBuf,
        public_base: Option<String>,
    },
    Http {
        api_base: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub provider: ProviderKind,
    pub replicate: ReplicateSettings,
    pub blob: BlobBackend,
    pub dryrun_dir: PathBuf,
    pub receipts_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Defaults rooted at `out_dir`: local blobs under `blobs/`, receipts under
    /// `receipts/`, dry-run output under `dryrun/`.
    pub fn rooted_at(out_dir: &Path) -> Self {
        Self {
            provider: ProviderKind::Dryrun,
            replicate: ReplicateSettings::default(),
            blob: BlobBackend::Local {
                dir: out_dir.join("blobs"),
                public_base: None,
            },
            dryrun_dir: out_dir.join("dryrun"),
            receipts_dir: Some(out_dir.join("receipts")),
        }
    }

    pub fn from_env(out_dir: &Path) -> Result<Self, Error> {
        Self::from_lookup(out_dir, non_empty_env)
    }

    /// Build a config from any variable lookup.
    pub fn from_lookup(
        out_dir: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        let mut config = Self::rooted_at(out_dir);
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        config.replicate.api_token =
            get("REPLICATE_API_TOKEN").or_else(|| get("REPLICATE_API_KEY"));
        if let Some(base) = get("REPLICATE_API_BASE") {
            config.replicate.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("SALON_MODEL") {
            config.replicate.model = model;
        }
        if let Some(raw) = get("SALON_POLL_INTERVAL") {
            config.replicate.poll_interval_s = parse_seconds("SALON_POLL_INTERVAL", &raw)?
                .clamp(0.2, 5.0);
        }
        if let Some(raw) = get("SALON_POLL_TIMEOUT") {
            config.replicate.poll_timeout_s = parse_seconds("SALON_POLL_TIMEOUT", &raw)?
                .clamp(10.0, 600.0);
        }

        config.provider = match get("SALON_PROVIDER") {
            Some(raw) => raw.parse()?,
            None if config.replicate.api_token.is_some() => ProviderKind::Replicate,
            None => ProviderKind::Dryrun,
        };

        config.blob = match (get("SALON_BLOB_API"), get("SALON_BLOB_DIR")) {
            (Some(api_base), _) => BlobBackend::Http { api_base },
            (None, dir) => BlobBackend::Local {
                dir: dir.map(PathBuf::from).unwrap_or_else(|| out_dir.join("blobs")),
                public_base: get("SALON_BLOB_PUBLIC_BASE"),
            },
        };
        Ok(config)
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }
}

fn parse_seconds(key: &str, raw: &str) -> Result<f64, Error> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value > 0.0)
        .ok_or_else(|| Error::Config(format!("{key} must be a positive number of seconds, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_dryrun_without_token() -> anyhow::Result<()> {
        let config = EngineConfig::from_lookup(Path::new("/tmp/out"), lookup(&[]))?;
        assert_eq!(config.provider, ProviderKind::Dryrun);
        assert_eq!(config.replicate.model, DEFAULT_REPLICATE_MODEL);
        assert_eq!(
            config.blob,
            BlobBackend::Local {
                dir: PathBuf::from("/tmp/out/blobs"),
                public_base: None,
            }
        );
        assert_eq!(config.receipts_dir, Some(PathBuf::from("/tmp/out/receipts")));
        Ok(())
    }

    #[test]
    fn token_selects_replicate_and_env_overrides_apply() -> anyhow::Result<()> {
        let config = EngineConfig::from_lookup(
            Path::new("/tmp/out"),
            lookup(&[
                ("REPLICATE_API_KEY", " r8_token "),
                ("REPLICATE_API_BASE", "https://proxy.example/v1/"),
                ("SALON_POLL_INTERVAL", "30"),
                ("SALON_BLOB_DIR", "/var/blobs"),
                ("SALON_BLOB_PUBLIC_BASE", "https://cdn.example/blobs"),
            ]),
        )?;
        assert_eq!(config.provider, ProviderKind::Replicate);
        assert_eq!(config.replicate.api_token.as_deref(), Some("r8_token"));
        assert_eq!(config.replicate.api_base, "https://proxy.example/v1");
        assert!((config.replicate.poll_interval_s - 5.0).abs() < 1e-9);
        assert_eq!(
            config.blob,
            BlobBackend::Local {
                dir: PathBuf::from("/var/blobs"),
                public_base: Some("https://cdn.example/blobs".to_string()),
            }
        );
        Ok(())
    }

    #[test]
    fn explicit_provider_and_http_blob_api() -> anyhow::Result<()> {
        let config = EngineConfig::from_lookup(
            Path::new("/tmp/out"),
            lookup(&[
                ("REPLICATE_API_TOKEN", "r8_token"),
                ("SALON_PROVIDER", "dryrun"),
                ("SALON_BLOB_API", "https://blobs.example/api"),
            ]),
        )?;
        assert_eq!(config.provider, ProviderKind::Dryrun);
        assert_eq!(
            config.blob,
            BlobBackend::Http {
                api_base: "https://blobs.example/api".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = EngineConfig::from_lookup(
            Path::new("/tmp/out"),
            lookup(&[("SALON_PROVIDER", "midjourney")]),
        )
        .err();
        assert_eq!(err.map(|err| err.kind()), Some("config_error"));

        let err = EngineConfig::from_lookup(
            Path::new("/tmp/out"),
            lookup(&[("SALON_POLL_TIMEOUT", "soon")]),
        )
        .err();
        assert!(matches!(err, Some(Error::Config(_))));
    }
}

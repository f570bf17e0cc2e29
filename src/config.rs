//! Ambient configuration shape (`spec.md` §4.5/§4.6's configuration
//! options, out-of-scope "user-facing configuration loading" per §1).
//!
//! The crate itself never reads the filesystem or environment on its own
//! initiative; `GatewayConfig`/`ConfigArgs` are offered for embedders who
//! want to deserialize `BackendOptions`/`ControllerOptions`-shaped TOML the
//! way the teacher's `main.rs` wires up its own config, using the same
//! `basic-toml`/`clap` dependencies.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::backend::{BackendOptions, EnabledDefaults, Origin};
use crate::controller::ControllerOptions;

/// A TOML-deserializable view of [`BackendOptions`] missing the
/// function-valued fields (`remote_tail`), which an embedder sets up
/// programmatically after loading.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub origin: Option<String>,
    #[serde(default = "default_https_only")]
    pub https_only: bool,
    #[serde(default)]
    pub upload_pack_enabled_by_default: bool,
    #[serde(default)]
    pub receive_pack_enabled_by_default: bool,
    #[serde(default)]
    pub allow_empty_path: bool,
}

fn default_https_only() -> bool {
    true
}

impl BackendConfig {
    /// Resolves `origin` into an [`Origin`], treating anything with an
    /// `http://`/`https://` prefix as remote and everything else as a
    /// local path.
    #[must_use]
    pub fn into_options(self) -> BackendOptions {
        let origin = self.origin.map(|o| {
            if o.starts_with("http://") || o.starts_with("https://") {
                Origin::Remote(o)
            } else {
                Origin::Local(PathBuf::from(o))
            }
        });

        BackendOptions {
            origin,
            https_only: self.https_only,
            enabled_defaults: EnabledDefaults {
                upload_pack: self.upload_pack_enabled_by_default,
                receive_pack: self.receive_pack_enabled_by_default,
            },
            remote_tail: crate::backend::default_remote_tail(),
            allow_empty_path: self.allow_empty_path,
        }
    }
}

/// A TOML-deserializable view of [`ControllerOptions`]; override functions
/// aren't representable in TOML, so only `privacy_mode` round-trips —
/// overrides are still set programmatically.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub privacy_mode: bool,
}

impl ControllerConfig {
    #[must_use]
    pub fn into_options(self) -> ControllerOptions {
        ControllerOptions {
            privacy_mode: self.privacy_mode,
            ..ControllerOptions::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            origin: None,
            https_only: true,
            upload_pack_enabled_by_default: true,
            receive_pack_enabled_by_default: false,
            allow_empty_path: false,
        }
    }
}

/// CLI flags for locating the config file, mirroring the teacher's own
/// `clap::Parser` startup struct.
#[derive(Debug, Parser)]
#[command(name = "git-gateway", about = "Smart-HTTP Git gateway configuration")]
pub struct ConfigArgs {
    /// Path to a `GatewayConfig` TOML file.
    #[arg(long, env = "GIT_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,
}

impl GatewayConfig {
    /// Reads and parses the TOML file named by `path`.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(basic_toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            [backend]
            origin = "/srv/git"

            [controller]
            privacy_mode = true
        "#;
        let config: GatewayConfig = basic_toml::from_str(toml).unwrap();
        assert_eq!(config.backend.origin.as_deref(), Some("/srv/git"));
        assert!(config.controller.privacy_mode);
        assert!(config.backend.https_only);
    }

    #[test]
    fn local_origin_resolves_to_local_variant() {
        let cfg = BackendConfig {
            origin: Some("/srv/git".to_owned()),
            ..BackendConfig::default()
        };
        let opts = cfg.into_options();
        assert!(matches!(opts.origin, Some(Origin::Local(_))));
    }

    #[test]
    fn http_origin_resolves_to_remote_variant() {
        let cfg = BackendConfig {
            origin: Some("https://example.com/git".to_owned()),
            ..BackendConfig::default()
        };
        let opts = cfg.into_options();
        assert!(matches!(opts.origin, Some(Origin::Remote(_))));
    }
}

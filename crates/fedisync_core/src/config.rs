/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::collection_sync::origin_of;
use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::info;

/// Which requests may skip signature verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferSignatures {
    #[default]
    Never,
    /// Trusted or test deployments only.
    Always,
    /// GET and other reads skip verification; writes never do.
    ReadsOnly,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    /// `https://host[:port]`; local actors live at `{public_base_url}/users/{id}`.
    pub public_base_url: String,
    pub data_dir: Option<String>,
    /// Require signatures on GET as well.
    pub authorized_fetch: bool,
    pub defer_signatures: DeferSignatures,
    pub max_date_skew_secs: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub fetch_cache_ttl_secs: Option<u64>,
    pub sync_delay_secs: Option<u64>,
    pub max_body_bytes: Option<usize>,
    /// Object types accepted by Create/Update on top of the built-in set.
    pub extra_object_types: Vec<String>,
    /// Sign outbound collection fetches with the instance key.
    pub signed_fetch: bool,
    /// Shared secret local clients send in `X-Fedisync-Internal` to use the
    /// outbox. Unset disables the outbox.
    pub internal_token: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            public_base_url: String::new(),
            data_dir: None,
            authorized_fetch: false,
            defer_signatures: DeferSignatures::Never,
            max_date_skew_secs: None,
            http_timeout_secs: None,
            fetch_cache_ttl_secs: None,
            sync_delay_secs: None,
            max_body_bytes: None,
            extra_object_types: Vec::new(),
            signed_fetch: false,
            internal_token: None,
        }
    }
}

impl ServiceConfig {
    pub fn public_base_url(&self) -> &str {
        self.public_base_url.trim_end_matches('/')
    }

    /// `scheme://host[:port]` of this site.
    pub fn authority(&self) -> Result<String> {
        origin_of(self.public_base_url()).ok_or_else(|| anyhow!("public_base_url is not an absolute url"))
    }

    pub fn local_actor_uri(&self, local_actor_id: u64) -> String {
        format!("{}/users/{local_actor_id}", self.public_base_url())
    }

    pub fn max_date_skew(&self) -> Duration {
        Duration::from_secs(self.max_date_skew_secs.unwrap_or(3600))
    }

    pub fn fetch_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.fetch_cache_ttl_secs.unwrap_or(300))
    }

    /// Never longer than the cache window.
    pub fn http_timeout(&self) -> Duration {
        let secs = self.http_timeout_secs.unwrap_or(30).clamp(1, 300);
        Duration::from_secs(secs).min(self.fetch_cache_ttl().max(Duration::from_secs(1)))
    }

    pub fn sync_delay(&self) -> Duration {
        Duration::from_secs(self.sync_delay_secs.unwrap_or(60).max(60))
    }

    pub fn internal_token(&self) -> Option<&str> {
        self.internal_token.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// `data_dir` from the file, then `FEDISYNC_DATA_DIR`, then the platform
    /// data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let configured = self
            .data_dir
            .clone()
            .or_else(|| std::env::var("FEDISYNC_DATA_DIR").ok())
            .filter(|d| !d.trim().is_empty());
        match configured {
            Some(d) => Ok(PathBuf::from(d)),
            None => Ok(project_dirs()?.data_local_dir().to_path_buf()),
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes.unwrap_or(2 * 1024 * 1024)
    }

    pub fn validate(&self) -> Result<()> {
        if self.public_base_url.trim().is_empty() {
            return Err(anyhow!("public_base_url is required"));
        }
        self.authority()?;
        self.bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("invalid bind address: {}", self.bind))?;
        Ok(())
    }
}

pub fn load_config(text: &str) -> Result<ServiceConfig> {
    let cfg: ServiceConfig = serde_json::from_str(text).context("decode ServiceConfig")?;
    cfg.validate()?;
    Ok(cfg)
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("net", "fedisync", "FediSync").context("unable to determine platform dirs")
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}

/// The instance actor's RSA key. Only the private half is kept on disk; the
/// public PEM is derived on every load.
#[derive(Clone)]
pub struct InstanceIdentity {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl InstanceIdentity {
    const KEY_FILE: &'static str = "instance_key.pem";

    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        Self::load_or_create_with_bits(data_dir, 2048)
    }

    fn load_or_create_with_bits(data_dir: &Path, bits: usize) -> Result<Self> {
        let path = data_dir.join(Self::KEY_FILE);
        let private_key = match fs::read_to_string(&path) {
            Ok(pem) => RsaPrivateKey::from_pkcs8_pem(&pem).with_context(|| format!("parse {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(data_dir).with_context(|| format!("create {}", data_dir.display()))?;
                let key = RsaPrivateKey::new(&mut OsRng, bits).context("generate instance key")?;
                let pem = key.to_pkcs8_pem(LineEnding::LF).context("encode instance key")?;
                fs::write(&path, pem.as_bytes()).with_context(|| format!("write {}", path.display()))?;
                info!(path = %path.display(), "generated instance key");
                key
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        Ok(Self {
            private_key_pem: private_key
                .to_pkcs8_pem(LineEnding::LF)
                .context("encode instance key")?
                .to_string(),
            public_key_pem: RsaPublicKey::from(&private_key)
                .to_public_key_pem(LineEnding::LF)
                .context("encode instance public key")?,
        })
    }
}

/// `--config <path>`, then `FEDISYNC_CONFIG`, then the platform default.
pub fn parse_config_path(mut args: impl Iterator<Item = String>) -> Result<PathBuf> {
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("FEDISYNC_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

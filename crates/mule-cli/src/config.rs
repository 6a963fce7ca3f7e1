//! Operator configuration for the `mule` binary.
//!
//! A TOML file at `$XDG_CONFIG_HOME/mule/config.toml` holds the store
//! URL, the worker session secret, and the `[queue]` tuning section.
//! Each setting resolves through the same chain: CLI flag, then
//! environment, then the config file, then the built-in default. The
//! session secret has no default -- a coordinator that cannot verify
//! worker tokens must not start.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use mule_core::config::QueueConfig;
use mule_core::session::SessionConfig;
use mule_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file shape
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    /// Queue tuning; omitted sections fall back to the defaults in
    /// [`QueueConfig`].
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret for worker session tokens (32 bytes).
    pub token_secret: String,
}

// -----------------------------------------------------------------------
// Location
// -----------------------------------------------------------------------

/// The mule config directory under the XDG layout.
///
/// `dirs::config_dir()` is deliberately not used: it maps to
/// `~/Library/Application Support` on macOS, and the file should live
/// in the same place on every platform a worker fleet runs on.
pub fn config_dir() -> PathBuf {
    let base = match std::env::var("XDG_CONFIG_HOME") {
        Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config"),
    };
    base.join("mule")
}

/// Full path of the config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Parse the config file. Errors if it is absent or malformed.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write the config file atomically.
///
/// The content lands in a temp file first; on Unix its permissions are
/// tightened to 0600 *before* the rename into place, so the session
/// secret is never readable by other users, not even briefly.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let body = toml::to_string_pretty(config).context("failed to serialize config")?;
    let staged = dir.join("config.toml.tmp");
    std::fs::write(&staged, &body)
        .with_context(|| format!("failed to write {}", staged.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", staged.display()))?;
    }

    let path = config_path();
    std::fs::rename(&staged, &path)
        .with_context(|| format!("failed to move config into place at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Session secret generation
// -----------------------------------------------------------------------

/// A fresh session secret: 32 random bytes as 64 hex characters.
pub fn generate_token_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Everything the binary needs, fully resolved.
#[derive(Debug)]
pub struct MuleConfig {
    pub db_config: DbConfig,
    pub session_config: SessionConfig,
    pub queue: QueueConfig,
}

impl MuleConfig {
    /// Resolve every setting through the chain
    /// CLI flag > environment > config file > default.
    ///
    /// - store URL: `cli_db_url` > `MULE_DATABASE_URL` >
    ///   `[database].url` > [`DbConfig::DEFAULT_URL`]
    /// - session secret: `MULE_TOKEN_SECRET` > `[auth].token_secret`;
    ///   no default, missing is an error
    /// - queue tuning: `[queue]` section > [`QueueConfig`] defaults
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let db_config = DbConfig::new(resolve_db_url(cli_db_url, file.as_ref()));
        let session_config = resolve_session_secret(file.as_ref())?;
        let queue = file.map(|f| f.queue).unwrap_or_default();

        Ok(Self {
            db_config,
            session_config,
            queue,
        })
    }
}

fn resolve_db_url(cli: Option<&str>, file: Option<&ConfigFile>) -> String {
    if let Some(url) = cli {
        return url.to_owned();
    }
    if let Ok(url) = std::env::var("MULE_DATABASE_URL") {
        return url;
    }
    if let Some(file) = file {
        return file.database.url.clone();
    }
    DbConfig::DEFAULT_URL.to_owned()
}

fn resolve_session_secret(file: Option<&ConfigFile>) -> Result<SessionConfig> {
    let (hex_secret, origin) = if let Ok(env_secret) = std::env::var("MULE_TOKEN_SECRET") {
        (env_secret, "MULE_TOKEN_SECRET")
    } else if let Some(file) = file {
        (file.auth.token_secret.clone(), "config file token_secret")
    } else {
        bail!(
            "session token secret not found; set MULE_TOKEN_SECRET or run `mule init` to write a config file"
        );
    };

    let bytes =
        hex::decode(&hex_secret).with_context(|| format!("{origin} is not valid hex"))?;
    Ok(SessionConfig::new(bytes))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

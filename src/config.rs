//! TOML configuration.
//!
//! The configuration names the database location, search defaults, and the
//! accounts to synchronize. Accounts are grouped per backend:
//!
//! ```toml
//! [db]
//! path = "~/.local/share/chat-archive/database.sqlite3"
//!
//! [search]
//! context = 3
//!
//! [accounts.export.personal]
//! path = "~/chat-exports/personal"
//! ```
//!
//! The loaded [`Config`] is passed explicitly to every command; nothing in
//! the engines reads the environment on its own.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::backend::BACKENDS;
use crate::models::AccountRef;

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "CHAT_ARCHIVE_CONFIG";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CHAT_ARCHIVE_DIRECTORY";

/// Name of the SQLite database file inside the data directory.
pub const DATABASE_FILE: &str = "database.sqlite3";

/// Account name used when a selector or table omits one.
pub const DEFAULT_ACCOUNT_NAME: &str = "default";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    /// `accounts.<backend>.<account>` tables.
    #[serde(default)]
    pub accounts: BTreeMap<String, BTreeMap<String, AccountConfig>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DbConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Messages of context shown around each hit.
    #[serde(default = "default_context")]
    pub context: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            context: default_context(),
        }
    }
}

fn default_context() -> usize {
    3
}

/// Settings of one `backend:account` pair.
#[derive(Debug, Deserialize, Clone)]
pub struct AccountConfig {
    /// Root directory of an `export` account.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

impl Config {
    /// Location of the SQLite database.
    ///
    /// `[db] path` wins; otherwise the file lives in the data directory
    /// (`$CHAT_ARCHIVE_DIRECTORY`, falling back to
    /// `~/.local/share/chat-archive`).
    pub fn database_path(&self) -> PathBuf {
        match &self.db.path {
            Some(path) => expand_home(path),
            None => data_directory().join(DATABASE_FILE),
        }
    }

    /// Settings for one account, if it is configured.
    pub fn account(&self, account: &AccountRef) -> Option<&AccountConfig> {
        self.accounts
            .get(&account.backend)
            .and_then(|accounts| accounts.get(&account.account))
    }

    /// All configured accounts, ordered by backend and then account name.
    pub fn configured_accounts(&self) -> Vec<AccountRef> {
        self.accounts
            .iter()
            .flat_map(|(backend, accounts)| {
                accounts
                    .keys()
                    .map(move |account| AccountRef::new(backend, account))
            })
            .collect()
    }
}

/// Resolve the data directory from the environment.
pub fn data_directory() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => expand_home(Path::new(&dir)),
        _ => home_directory().join(".local/share/chat-archive"),
    }
}

fn home_directory() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~/` to the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_directory().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Load the configuration.
///
/// An explicit path must exist. Without one, `$CHAT_ARCHIVE_CONFIG` and then
/// `~/.config/chat-archive.toml` are tried; when neither exists the default
/// (empty) configuration is used.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let candidate = match path {
        Some(path) => Some(path.to_path_buf()),
        None => match std::env::var_os(CONFIG_ENV) {
            Some(env) if !env.is_empty() => Some(PathBuf::from(env)),
            _ => {
                let default = home_directory().join(".config/chat-archive.toml");
                default.exists().then_some(default)
            }
        },
    };

    let config = match candidate {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            parse_config(&content)?
        }
        None => Config::default(),
    };

    Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    for (backend, accounts) in &config.accounts {
        if !BACKENDS.contains(&backend.as_str()) {
            bail!(
                "Unknown backend in [accounts.{}]. Available: {}",
                backend,
                BACKENDS.join(", ")
            );
        }
        for (name, account) in accounts {
            if name.is_empty() || name.contains(':') {
                bail!("Invalid account name '{}' for backend '{}'", name, backend);
            }
            if backend == "export" && account.path.is_none() {
                bail!("accounts.export.{}.path must be set", name);
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.search.context, 3);
        assert!(config.accounts.is_empty());
        assert!(config.configured_accounts().is_empty());
    }

    #[test]
    fn accounts_are_listed_in_order() {
        let config = parse_config(
            r#"
            [accounts.export.work]
            path = "/tmp/work"

            [accounts.export.personal]
            path = "/tmp/personal"
            include_globs = ["*.json"]
            "#,
        )
        .unwrap();

        let accounts = config.configured_accounts();
        assert_eq!(
            accounts,
            vec![
                AccountRef::new("export", "personal"),
                AccountRef::new("export", "work")
            ]
        );
        let personal = config.account(&accounts[0]).unwrap();
        assert_eq!(personal.include_globs, vec!["*.json".to_string()]);
        let work = config.account(&accounts[1]).unwrap();
        assert_eq!(work.include_globs, vec!["**/*.json".to_string()]);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = parse_config("[accounts.irc.main]\npath = \"/tmp\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown backend"));
    }

    #[test]
    fn export_account_requires_path() {
        let err = parse_config("[accounts.export.main]\n").unwrap_err();
        assert!(err.to_string().contains("path must be set"));
    }

    #[test]
    fn explicit_database_path_wins() {
        let config = parse_config("[db]\npath = \"/var/lib/chat.sqlite3\"\n").unwrap();
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/chat.sqlite3")
        );
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/chat-archive.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

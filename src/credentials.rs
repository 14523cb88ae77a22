//! Credential lookup: logical session handle to VNC address and password.
//!
//! Secrets stay on the machine running the agent. Callers only ever pass a
//! handle such as `vnc-prod-01`.

use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::agent::AgentError;

pub const ENV_VNC_SERVER: &str = "VNC_SERVER";
pub const ENV_VNC_PASSWORD: &str = "VNC_PASSWORD";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub address: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials stored for {0:?}")]
    NotFound(String),
    #[error("credential file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid credential value: {0}")]
    Invalid(String),
    #[error("{0} store is read-only")]
    ReadOnly(&'static str),
    #[error("keyring: {0}")]
    Keyring(String),
}

impl From<CredentialError> for AgentError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::NotFound(handle) => AgentError::CredentialNotFound(handle),
            other => AgentError::Other(other.to_string()),
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_writable(&self) -> bool {
        true
    }

    async fn get(&self, handle: &str) -> Result<Option<Credentials>, CredentialError>;
    async fn set(&self, handle: &str, credentials: &Credentials) -> Result<(), CredentialError>;
    async fn delete(&self, handle: &str) -> Result<bool, CredentialError>;
    async fn list_hosts(&self) -> Result<Vec<String>, CredentialError>;
}

/// Resolve a handle or fail with `NotFound`.
pub async fn lookup(store: &dyn CredentialStore, handle: &str) -> Result<Credentials, CredentialError> {
    store
        .get(handle)
        .await?
        .ok_or_else(|| CredentialError::NotFound(handle.to_string()))
}

// ========================= netrc file =========================

/// `.netrc`-format file: `machine <handle>` / `login <address>` / `password <secret>`.
pub struct NetrcStore {
    path: PathBuf,
}

impl NetrcStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<(String, Credentials)>, CredentialError> {
        match async_fs::read_to_string(&self.path).await {
            Ok(text) => parse_netrc(&text).map_err(|message| CredentialError::Parse {
                path: self.path.clone(),
                message,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "credential file not found");
                Ok(Vec::new())
            }
            Err(source) => Err(CredentialError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn save(&self, entries: &[(String, Credentials)]) -> Result<(), CredentialError> {
        let io = |source| CredentialError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            async_fs::create_dir_all(parent).await.map_err(io)?;
        }
        // the secret never exists on disk with looser permissions
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "credentials".into());
        let tmp = self.path.with_file_name(format!(".{file_name}.{}.tmp", nanoid!(8)));
        let mut options = async_fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let written = async {
            let mut file = options.open(&tmp).await?;
            file.write_all(render_netrc(entries).as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            async_fs::rename(&tmp, &self.path).await
        }
        .await;
        if let Err(e) = written {
            let _ = async_fs::remove_file(&tmp).await;
            return Err(io(e));
        }
        Ok(())
    }
}

fn parse_netrc(text: &str) -> Result<Vec<(String, Credentials)>, String> {
    let mut entries: Vec<(String, Credentials)> = Vec::new();
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                let handle = tokens.next().ok_or("`machine` without a name")?;
                entries.push((
                    handle.to_string(),
                    Credentials {
                        address: handle.to_string(),
                        password: None,
                    },
                ));
            }
            "default" => entries.push((
                "default".to_string(),
                Credentials {
                    address: String::new(),
                    password: None,
                },
            )),
            "login" | "password" | "account" => {
                let value = tokens
                    .next()
                    .ok_or_else(|| format!("`{token}` without a value"))?;
                let (_, creds) = entries
                    .last_mut()
                    .ok_or_else(|| format!("`{token}` before any `machine`"))?;
                match token {
                    "login" => creds.address = value.to_string(),
                    "password" => creds.password = Some(value.to_string()),
                    _ => {}
                }
            }
            "macdef" => {
                // macro bodies run to the next blank line; nothing here uses them
                return Err("macdef entries are not supported".into());
            }
            other => return Err(format!("unexpected token {other:?}")),
        }
    }
    // a bare `default` entry without a login is useless
    entries.retain(|(handle, c)| handle != "default" || !c.address.is_empty());
    Ok(entries)
}

fn render_netrc(entries: &[(String, Credentials)]) -> String {
    let mut out = String::new();
    for (handle, creds) in entries {
        out.push_str(&format!("machine {handle}\n  login {}\n", creds.address));
        if let Some(pw) = &creds.password {
            out.push_str(&format!("  password {pw}\n"));
        }
        out.push('\n');
    }
    out
}

fn check_token(what: &str, value: &str) -> Result<(), CredentialError> {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(CredentialError::Invalid(format!(
            "{what} must be non-empty and contain no whitespace"
        )));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for NetrcStore {
    fn name(&self) -> &'static str {
        "netrc"
    }

    async fn get(&self, handle: &str) -> Result<Option<Credentials>, CredentialError> {
        let entries = self.load().await?;
        let found = entries
            .iter()
            .find(|(h, _)| h == handle)
            .or_else(|| entries.iter().find(|(h, _)| h == "default"))
            .map(|(_, c)| c.clone());
        Ok(found)
    }

    async fn set(&self, handle: &str, credentials: &Credentials) -> Result<(), CredentialError> {
        check_token("handle", handle)?;
        check_token("address", &credentials.address)?;
        if let Some(pw) = &credentials.password {
            check_token("password", pw)?;
        }
        let mut entries = self.load().await?;
        match entries.iter_mut().find(|(h, _)| h == handle) {
            Some((_, existing)) => *existing = credentials.clone(),
            None => entries.push((handle.to_string(), credentials.clone())),
        }
        self.save(&entries).await?;
        info!(handle, path = %self.path.display(), "stored credentials");
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<bool, CredentialError> {
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|(h, _)| h != handle);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries).await?;
        info!(handle, "deleted credentials");
        Ok(true)
    }

    async fn list_hosts(&self) -> Result<Vec<String>, CredentialError> {
        Ok(self.load().await?.into_iter().map(|(h, _)| h).collect())
    }
}

// ========================= environment =========================

/// Single-server fallback from `VNC_SERVER` / `VNC_PASSWORD`; ignores the handle.
#[derive(Clone, Default)]
pub struct EnvironmentStore {
    server: Option<String>,
    password: Option<String>,
}

impl EnvironmentStore {
    pub fn from_env() -> Self {
        Self {
            server: std::env::var(ENV_VNC_SERVER).ok().filter(|s| !s.is_empty()),
            password: std::env::var(ENV_VNC_PASSWORD).ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn new(server: Option<String>, password: Option<String>) -> Self {
        Self { server, password }
    }
}

#[async_trait]
impl CredentialStore for EnvironmentStore {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn is_writable(&self) -> bool {
        false
    }

    async fn get(&self, handle: &str) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.server.as_ref().map(|server| {
            debug!(handle, "using credentials from environment");
            Credentials {
                address: server.clone(),
                password: self.password.clone(),
            }
        }))
    }

    async fn set(&self, _handle: &str, _credentials: &Credentials) -> Result<(), CredentialError> {
        Err(CredentialError::ReadOnly(self.name()))
    }

    async fn delete(&self, _handle: &str) -> Result<bool, CredentialError> {
        Err(CredentialError::ReadOnly(self.name()))
    }

    async fn list_hosts(&self) -> Result<Vec<String>, CredentialError> {
        Ok(self.server.iter().cloned().collect())
    }
}

// ========================= OS keyring =========================

pub const KEYRING_SERVICE: &str = "vnc-use";

/// What one keyring entry holds: a small JSON object per handle.
#[derive(Serialize, Deserialize)]
struct KeyringEntry {
    server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

fn encode_entry(credentials: &Credentials) -> Result<String, CredentialError> {
    serde_json::to_string(&KeyringEntry {
        server: credentials.address.clone(),
        password: credentials.password.clone(),
    })
    .map_err(|e| CredentialError::Invalid(e.to_string()))
}

fn decode_entry(secret: &str) -> Result<Credentials, CredentialError> {
    let entry: KeyringEntry = serde_json::from_str(secret)
        .map_err(|e| CredentialError::Keyring(format!("unreadable entry: {e}")))?;
    Ok(Credentials {
        address: entry.server,
        password: entry.password,
    })
}

/// Entries in the platform credential store, one per handle, under
/// [`KEYRING_SERVICE`]. The keyring cannot be enumerated, so `list_hosts` is
/// always empty. An unavailable keyring reads as empty so a chain falls
/// through to the next store.
#[derive(Clone)]
pub struct KeyringStore {
    service: String,
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Keyring calls block; run them off the async workers.
    async fn with_entry<T, F>(&self, handle: &str, op: F) -> Result<T, CredentialError>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry) -> Result<T, keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let handle = handle.to_string();
        tokio::task::spawn_blocking(move || keyring::Entry::new(&service, &handle).and_then(op))
            .await
            .map_err(|e| CredentialError::Keyring(e.to_string()))?
            .map_err(|e| CredentialError::Keyring(e.to_string()))
    }
}

#[async_trait]
impl CredentialStore for KeyringStore {
    fn name(&self) -> &'static str {
        "keyring"
    }

    async fn get(&self, handle: &str) -> Result<Option<Credentials>, CredentialError> {
        let secret = self
            .with_entry(handle, |entry| match entry.get_password() {
                Ok(secret) => Ok(Some(secret)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(e),
            })
            .await;
        match secret {
            Ok(Some(secret)) => decode_entry(&secret).map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(handle, error = %e, "keyring unavailable");
                Ok(None)
            }
        }
    }

    async fn set(&self, handle: &str, credentials: &Credentials) -> Result<(), CredentialError> {
        let secret = encode_entry(credentials)?;
        self.with_entry(handle, move |entry| entry.set_password(&secret))
            .await?;
        info!(handle, "stored credentials in the OS keyring");
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<bool, CredentialError> {
        let deleted = self
            .with_entry(handle, |entry| match entry.delete_credential() {
                Ok(()) => Ok(true),
                Err(keyring::Error::NoEntry) => Ok(false),
                Err(e) => Err(e),
            })
            .await?;
        if deleted {
            info!(handle, "deleted credentials from the OS keyring");
        }
        Ok(deleted)
    }

    async fn list_hosts(&self) -> Result<Vec<String>, CredentialError> {
        Ok(Vec::new())
    }
}

// ========================= chain =========================

/// First hit wins for reads; writes go to the first writable store.
pub struct ChainedStore {
    stores: Vec<Arc<dyn CredentialStore>>,
}

impl ChainedStore {
    pub fn new(stores: Vec<Arc<dyn CredentialStore>>) -> Self {
        Self { stores }
    }

    fn writable(&self) -> Result<&Arc<dyn CredentialStore>, CredentialError> {
        self.stores
            .iter()
            .find(|s| s.is_writable())
            .ok_or(CredentialError::ReadOnly("chained"))
    }
}

#[async_trait]
impl CredentialStore for ChainedStore {
    fn name(&self) -> &'static str {
        "chained"
    }

    fn is_writable(&self) -> bool {
        self.stores.iter().any(|s| s.is_writable())
    }

    async fn get(&self, handle: &str) -> Result<Option<Credentials>, CredentialError> {
        for store in &self.stores {
            if let Some(found) = store.get(handle).await? {
                debug!(handle, store = store.name(), "credentials found");
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    async fn set(&self, handle: &str, credentials: &Credentials) -> Result<(), CredentialError> {
        self.writable()?.set(handle, credentials).await
    }

    async fn delete(&self, handle: &str) -> Result<bool, CredentialError> {
        let mut deleted = false;
        for store in self.stores.iter().filter(|s| s.is_writable()) {
            deleted |= store.delete(handle).await?;
        }
        Ok(deleted)
    }

    async fn list_hosts(&self) -> Result<Vec<String>, CredentialError> {
        let mut hosts = Vec::new();
        for store in &self.stores {
            hosts.extend(store.list_hosts().await?);
        }
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }
}

//! Credential storage and lookup.
//!
//! Reads/writes ~/.config/gridrelay/auth.json (0600 on Unix). The token is
//! looked up on every call, so a token refreshed on disk by another process
//! is picked up without restarting.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::client::ClientError;

/// Credentials stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthCredentials {
    /// OAuth bearer token for the spreadsheet API
    pub token: String,
    /// API base override (e.g. a proxy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Account the token belongs to (for display)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl AuthCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into(), api_base: None, account: None }
    }
}

/// Returns the path to the auth credentials file.
pub fn auth_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|c| c.join("gridrelay/auth.json"))
}

pub fn load_auth_from(path: &Path) -> Result<AuthCredentials, ClientError> {
    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ClientError::NotAuthenticated,
        _ => ClientError::Io(format!("Failed to read {}: {}", path.display(), e)),
    })?;
    let creds: AuthCredentials = serde_json::from_str(&contents)
        .map_err(|e| ClientError::Parse(format!("Invalid auth file {}: {}", path.display(), e)))?;
    if creds.token.trim().is_empty() {
        return Err(ClientError::NotAuthenticated);
    }
    Ok(creds)
}

/// Load saved credentials from the default location.
pub fn load_auth() -> Result<AuthCredentials, ClientError> {
    let path = auth_file_path().ok_or(ClientError::NotAuthenticated)?;
    load_auth_from(&path)
}

/// Save credentials, creating the parent directory. Sets 0600 on Unix.
pub fn save_auth_to(path: &Path, creds: &AuthCredentials) -> Result<(), ClientError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ClientError::Io(format!("Failed to create config directory: {}", e)))?;
    }

    let contents = serde_json::to_string_pretty(creds)
        .map_err(|e| ClientError::Parse(format!("Failed to serialize credentials: {}", e)))?;

    std::fs::write(path, &contents)
        .map_err(|e| ClientError::Io(format!("Failed to write auth file: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, permissions)
            .map_err(|e| ClientError::Io(format!("Failed to set file permissions: {}", e)))?;
    }

    Ok(())
}

pub fn save_auth(creds: &AuthCredentials) -> Result<(), ClientError> {
    let path = auth_file_path()
        .ok_or_else(|| ClientError::Io("Could not determine config directory".into()))?;
    save_auth_to(&path, creds)
}

/// Delete saved credentials. Missing file is fine.
pub fn delete_auth() -> Result<(), ClientError> {
    let Some(path) = auth_file_path() else {
        return Ok(());
    };
    if path.exists() {
        std::fs::remove_file(&path)
            .map_err(|e| ClientError::Io(format!("Failed to delete auth file: {}", e)))?;
    }
    Ok(())
}

// ── Providers ───────────────────────────────────────────────────────

/// Supplies the bearer token for each request.
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Result<String, ClientError>;
}

/// A fixed token, e.g. from an environment variable.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

impl CredentialProvider for StaticToken {
    fn token(&self) -> Result<String, ClientError> {
        if self.0.trim().is_empty() {
            return Err(ClientError::NotAuthenticated);
        }
        Ok(self.0.clone())
    }
}

/// Token read from an auth file on every request.
#[derive(Debug, Clone)]
pub struct SavedCredentials {
    path: PathBuf,
}

impl SavedCredentials {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// ~/.config/gridrelay/auth.json
    pub fn default_location() -> Result<Self, ClientError> {
        auth_file_path().map(Self::at).ok_or(ClientError::NotAuthenticated)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AuthCredentials, ClientError> {
        load_auth_from(&self.path)
    }
}

impl CredentialProvider for SavedCredentials {
    fn token(&self) -> Result<String, ClientError> {
        self.load().map(|c| c.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_credentials_missing_optional_fields() {
        let parsed: AuthCredentials = serde_json::from_str(r#"{"token":"tok"}"#).unwrap();
        assert_eq!(parsed.token, "tok");
        assert!(parsed.api_base.is_none());
        assert!(parsed.account.is_none());
        assert_eq!(serde_json::to_string(&parsed).unwrap(), r#"{"token":"tok"}"#);
    }

    #[test]
    fn test_auth_file_path_exists() {
        let path = auth_file_path().unwrap();
        assert!(path.to_string_lossy().contains("gridrelay"));
        assert!(path.to_string_lossy().ends_with("auth.json"));
    }

    #[test]
    fn test_save_and_load_auth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/auth.json");

        let mut creds = AuthCredentials::new("tok123");
        creds.account = Some("ops@example.com".into());
        save_auth_to(&path, &creds).unwrap();

        assert_eq!(load_auth_from(&path).unwrap(), creds);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_or_blank_is_not_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        assert!(matches!(load_auth_from(&path), Err(ClientError::NotAuthenticated)));

        std::fs::write(&path, r#"{"token":"  "}"#).unwrap();
        assert!(matches!(load_auth_from(&path), Err(ClientError::NotAuthenticated)));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_auth_from(&path), Err(ClientError::Parse(_))));
    }

    #[test]
    fn test_saved_credentials_reread_each_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let provider = SavedCredentials::at(&path);

        save_auth_to(&path, &AuthCredentials::new("first")).unwrap();
        assert_eq!(provider.token().unwrap(), "first");
        save_auth_to(&path, &AuthCredentials::new("second")).unwrap();
        assert_eq!(provider.token().unwrap(), "second");
    }

    #[test]
    fn test_static_token() {
        assert_eq!(StaticToken::new("abc").token().unwrap(), "abc");
        assert!(StaticToken::new("").token().is_err());
        assert_eq!(format!("{:?}", StaticToken::new("secret")), "StaticToken(..)");
    }
}

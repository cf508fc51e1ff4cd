//! Credential loading and file-based delivery.
//!
//! Secrets are read fresh for every launch from a `KEY=VALUE` file and only
//! keys on the allow-list are kept. They travel to the agent inside the input
//! document, or in a single `0600` file when the backend cannot be trusted to
//! pass stdin through intact. They never enter the daemon's environment.

use std::path::{Path, PathBuf};

use nestbox_core::protocol::Secrets;
use tracing::{debug, warn};

use super::RunnerError;

/// Keys forwarded to agents.
pub const ALLOWED_KEYS: &[&str] = &["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"];

/// Read allow-listed secrets from `path`. A missing file yields no secrets.
pub fn load_secrets(path: &Path) -> Result<Secrets, RunnerError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No secrets file");
            return Ok(Secrets::new());
        }
        Err(e) => return Err(e.into()),
    };
    Ok(parse_secrets(&contents))
}

/// Parse `KEY=VALUE` lines, keeping allow-listed keys only.
pub fn parse_secrets(contents: &str) -> Secrets {
    let mut secrets = Secrets::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            warn!(line = lineno + 1, "Ignoring secrets line without '='");
            continue;
        };
        let key = key.trim();
        if !ALLOWED_KEYS.contains(&key) {
            continue;
        }
        let value = unquote(value.trim());
        if !value.is_empty() {
            secrets.insert(key, value);
        }
    }
    secrets
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// A secrets document on disk, removed when dropped.
#[derive(Debug)]
pub struct SecretFile {
    path: PathBuf,
}

impl SecretFile {
    /// Write `secrets` as JSON to `path`, readable by the owner only.
    pub fn write(path: PathBuf, secrets: &Secrets) -> Result<Self, RunnerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(secrets)
            .map_err(|e| RunnerError::Protocol(nestbox_core::Error::Json(e)))?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        std::io::Write::write_all(&mut file, &bytes)?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove secrets file");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn only_allowed_keys_are_kept() {
        let secrets = parse_secrets(
            "# comment\nANTHROPIC_API_KEY=sk-123\nAWS_SECRET=nope\n\nexport CLAUDE_CODE_OAUTH_TOKEN=\"tok\"\n",
        );
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets.get("ANTHROPIC_API_KEY"), Some("sk-123"));
        assert_eq!(secrets.get("CLAUDE_CODE_OAUTH_TOKEN"), Some("tok"));
        assert_eq!(secrets.get("AWS_SECRET"), None);
    }

    #[test]
    fn empty_values_and_garbage_are_skipped() {
        let secrets = parse_secrets("ANTHROPIC_API_KEY=\nthis is not a pair\n");
        assert!(secrets.is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let secrets = load_secrets(&dir.path().join("absent.env")).unwrap();
        assert!(secrets.is_empty());
    }

    #[test]
    fn secret_file_is_private_and_removed_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run").join("secrets.json");
        let secrets: Secrets = [("ANTHROPIC_API_KEY".to_string(), "sk".to_string())]
            .into_iter()
            .collect();

        let file = SecretFile::write(path.clone(), &secrets).unwrap();
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(file.path()).unwrap()).unwrap();
        assert_eq!(written["ANTHROPIC_API_KEY"], "sk");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(file);
        assert!(!path.exists());
    }
}

use std::path::{Path, PathBuf};

pub const DEFAULT_API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Where to look for an API key after the explicit setting.
///
/// Lookup order: explicit value, environment variable, then a `KEY=value`
/// file. The first non-empty value wins.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    env_var: String,
    file: Option<PathBuf>,
}

impl CredentialSource {
    pub fn new(env_var: impl Into<String>, file: Option<PathBuf>) -> Self {
        Self {
            env_var: env_var.into(),
            file,
        }
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    pub fn resolve(&self, explicit: Option<&str>) -> Option<String> {
        self.resolve_with(explicit, |name| std::env::var(name).ok())
    }

    fn resolve_with<F>(&self, explicit: Option<&str>, env: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = non_empty(explicit) {
            return Some(key);
        }

        if let Some(key) = non_empty(env(&self.env_var).as_deref()) {
            tracing::debug!("Using API key from ${}", self.env_var);
            return Some(key);
        }

        let file = self.file.as_deref()?;
        let key = read_key_file(file, &self.env_var);
        if key.is_some() {
            tracing::debug!("Using API key from {:?}", file);
        }
        key
    }
}

impl Default for CredentialSource {
    fn default() -> Self {
        Self::new(DEFAULT_API_KEY_VAR, None)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn read_key_file(path: &Path, name: &str) -> Option<String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::debug!("Credentials file {:?} not readable: {}", path, e);
            return None;
        }
    };

    contents.lines().find_map(|line| {
        let line = line.trim();
        if line.starts_with('#') {
            return None;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=')?;
        if key.trim() != name {
            return None;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        non_empty(Some(value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn key_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_explicit_wins() {
        let file = key_file("TEST_KEY=from-file\n");
        let source = CredentialSource::new("TEST_KEY", Some(file.path().to_path_buf()));

        let key = source.resolve_with(Some("explicit"), |_| Some("from-env".into()));
        assert_eq!(key.as_deref(), Some("explicit"));
    }

    #[test]
    fn test_env_before_file() {
        let file = key_file("TEST_KEY=from-file\n");
        let source = CredentialSource::new("TEST_KEY", Some(file.path().to_path_buf()));

        let key = source.resolve_with(Some("  "), |name| {
            (name == "TEST_KEY").then(|| "from-env".to_string())
        });
        assert_eq!(key.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_file_fallback() {
        let file = key_file("# comment\nOTHER=nope\nexport TEST_KEY=\"from-file\"\n");
        let source = CredentialSource::new("TEST_KEY", Some(file.path().to_path_buf()));

        assert_eq!(
            source.resolve_with(None, no_env).as_deref(),
            Some("from-file")
        );
    }

    #[test]
    fn test_nothing_resolves() {
        let empty = key_file("TEST_KEY=\n");
        let with_empty = CredentialSource::new("TEST_KEY", Some(empty.path().to_path_buf()));
        assert_eq!(with_empty.resolve_with(None, |_| Some(String::new())), None);

        let missing = CredentialSource::new("TEST_KEY", Some(PathBuf::from("/nonexistent/keys")));
        assert_eq!(missing.resolve_with(None, no_env), None);
    }
}

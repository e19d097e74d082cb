//! Minimal `.env` reading and in-place key replacement.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Variables loaded from a `.env` file, consulted after the process
/// environment.
#[derive(Debug, Default)]
pub struct EnvFile {
    path: PathBuf,
    vars: BTreeMap<String, String>,
}

impl EnvFile {
    /// Loads `path`. A missing file yields no variables.
    pub fn load(path: &Path) -> Result<Self> {
        let vars = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse(&content)
        } else {
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), vars })
    }

    /// Looks `name` up in the process environment, then in the file.
    pub fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().or_else(|| self.vars.get(name).cloned())
    }

    /// Replaces or appends `name=value` in the file on disk.
    pub fn write_var(&self, name: &str, value: &str) -> Result<()> {
        if !self.path.exists() {
            bail!("{} not found", self.path.display());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        fs::write(&self.path, set_var(&content, name, value))
            .with_context(|| format!("unable to update {}", self.path.display()))
    }
}

/// Parses `KEY=VALUE` lines, skipping blanks and `#` comments.
pub fn parse(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (name, value) = line.split_once('=')?;
            Some((name.trim().to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    value
}

/// Returns `content` with every `name=` line replaced by `name=value`, or
/// with that line appended if none exists.
pub fn set_var(content: &str, name: &str, value: &str) -> String {
    let prefix = format!("{name}=");
    let mut replaced = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.starts_with(&prefix) {
                replaced = true;
                format!("{prefix}{value}")
            } else {
                line.to_string()
            }
        })
        .collect();

    if !replaced {
        lines.push(format!("{prefix}{value}"));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let vars = parse(
            "# comment\nAPP_NAME=demo\n\nexport DB_ENCRYPT_KEY=\"abc=\"\nDB_ENCRYPT_LOG_LEVEL = 2\n",
        );
        assert_eq!(vars.get("APP_NAME").map(String::as_str), Some("demo"));
        assert_eq!(vars.get("DB_ENCRYPT_KEY").map(String::as_str), Some("abc="));
        assert_eq!(vars.get("DB_ENCRYPT_LOG_LEVEL").map(String::as_str), Some("2"));
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn test_set_var_replaces() {
        let out = set_var("A=1\nDB_ENCRYPT_KEY=old\nB=2\n", "DB_ENCRYPT_KEY", "new");
        assert_eq!(out, "A=1\nDB_ENCRYPT_KEY=new\nB=2\n");
    }

    #[test]
    fn test_set_var_appends() {
        let out = set_var("A=1", "DB_ENCRYPT_KEY", "new");
        assert_eq!(out, "A=1\nDB_ENCRYPT_KEY=new\n");
    }

    #[test]
    fn test_write_var_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "APP=1\n").unwrap();

        let env = EnvFile::load(&path).unwrap();
        env.write_var("DB_ENCRYPT_TEST_ONLY_KEY", "k1").unwrap();

        let reloaded = EnvFile::load(&path).unwrap();
        assert_eq!(reloaded.lookup("DB_ENCRYPT_TEST_ONLY_KEY").as_deref(), Some("k1"));
    }

    #[test]
    fn test_write_var_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let env = EnvFile::load(&dir.path().join(".env")).unwrap();
        assert!(env.write_var("DB_ENCRYPT_KEY", "k").is_err());
    }
}

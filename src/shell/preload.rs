//! `preload.conf`: language aliases and per-language preload scripts.
//!
//! ```text
//! # calc is the default everywhere
//! Preload.alias.math=calc
//! Preload.directory.calc=scripts/calc
//! Preload.script.calc=init.calc
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const CONF_FILE: &str = "preload.conf";
const ALIAS: &str = "Preload.alias.";
const DIRECTORY: &str = "Preload.directory.";
const SCRIPT: &str = "Preload.script.";

/// Parsed preload configuration
#[derive(Debug, Clone, Default)]
pub struct Preload {
    dir: PathBuf,
    aliases: HashMap<String, String>,
    directories: HashMap<String, PathBuf>,
    scripts: HashMap<String, String>,
}

impl Preload {
    /// Empty configuration rooted at `dir`
    pub fn empty(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Load `preload.conf` from `dir`; a missing file means no preloads
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(CONF_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(dir, &content),
            Err(_) => {
                debug!("No {} in {}", CONF_FILE, dir.display());
                Self::empty(dir)
            }
        }
    }

    pub fn parse(dir: &Path, content: &str) -> Self {
        let mut preload = Self::empty(dir);
        for (number, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once(['=', ':']) else {
                warn!("{}:{}: expected key=value", CONF_FILE, number + 1);
                continue;
            };
            let (key, value) = (key.trim(), value.trim().to_string());

            if let Some(lang) = key.strip_prefix(ALIAS) {
                preload.aliases.insert(lang.to_lowercase(), value);
            } else if let Some(lang) = key.strip_prefix(DIRECTORY) {
                preload.directories.insert(lang.to_lowercase(), PathBuf::from(value));
            } else if let Some(lang) = key.strip_prefix(SCRIPT) {
                preload.scripts.insert(lang.to_lowercase(), value);
            } else {
                debug!("{}:{}: ignoring unknown key '{}'", CONF_FILE, number + 1, key);
            }
        }
        preload
    }

    /// Follow alias chains; stops at the first repeated name
    pub fn resolve_alias(&self, language: &str) -> String {
        let mut current = language.to_string();
        let mut seen = HashSet::new();
        while seen.insert(current.to_lowercase()) {
            match self.aliases.get(&current.to_lowercase()) {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        current
    }

    /// Preload script for an already resolved language
    pub fn script_for(&self, language: &str) -> Option<PathBuf> {
        let key = language.to_lowercase();
        let file = PathBuf::from(self.scripts.get(&key)?);
        if file.is_absolute() {
            return Some(file);
        }
        let base = match self.directories.get(&key) {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.dir.join(dir),
            None => self.dir.clone(),
        };
        Some(base.join(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = "
        # comment
        ! also a comment
        Preload.alias.math = calc
        Preload.alias.maths=math
        Preload.alias.loop1=loop2
        Preload.alias.loop2=loop1
        Preload.directory.calc=scripts
        Preload.script.calc=init.calc
        Preload.script.other=/abs/boot.x
        Preload.unknown.key=1
        garbage line
    ";

    #[test]
    fn test_alias_chain() {
        let preload = Preload::parse(Path::new("/cfg"), CONF);
        assert_eq!(preload.resolve_alias("maths"), "calc");
        assert_eq!(preload.resolve_alias("MATH"), "calc");
        assert_eq!(preload.resolve_alias("calc"), "calc");
        assert_eq!(preload.resolve_alias("python"), "python");
    }

    #[test]
    fn test_alias_cycle_terminates() {
        let preload = Preload::parse(Path::new("/cfg"), CONF);
        let resolved = preload.resolve_alias("loop1");
        assert!(resolved == "loop1" || resolved == "loop2");
    }

    #[test]
    fn test_script_paths() {
        let preload = Preload::parse(Path::new("/cfg"), CONF);
        assert_eq!(
            preload.script_for("calc"),
            Some(PathBuf::from("/cfg/scripts/init.calc"))
        );
        assert_eq!(preload.script_for("other"), Some(PathBuf::from("/abs/boot.x")));
        assert_eq!(preload.script_for("none"), None);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let preload = Preload::load(dir.path());
        assert_eq!(preload.resolve_alias("x"), "x");
        assert!(preload.script_for("calc").is_none());
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONF_FILE), "Preload.script.calc=boot.calc\n").unwrap();
        let preload = Preload::load(dir.path());
        assert_eq!(preload.script_for("calc"), Some(dir.path().join("boot.calc")));
    }
}

//! Executable lookup for CLI agent backends.
//!
//! Agent CLIs (`claude`, `gemini`, `codex`) are usually installed by npm or
//! a user-level package manager, so the search path is the process PATH
//! extended with the usual per-user install directories.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static SEARCH_PATH: OnceLock<Vec<PathBuf>> = OnceLock::new();

#[cfg(windows)]
const PATH_SEP: char = ';';
#[cfg(not(windows))]
const PATH_SEP: char = ':';

/// Directories searched for agent binaries. Cached after the first call.
pub fn search_path() -> &'static [PathBuf] {
    SEARCH_PATH.get_or_init(|| {
        let current = std::env::var("PATH").unwrap_or_default();
        let home = dirs::home_dir().unwrap_or_default();
        let dirs = merge_search_path(&current, &home);
        tracing::debug!("[shell_env] Search path has {} entries", dirs.len());
        dirs
    })
}

/// Current PATH entries first, then existing well-known install dirs, deduplicated.
fn merge_search_path(current: &str, home: &Path) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    let mut dirs = Vec::new();

    for entry in current.split(PATH_SEP).filter(|p| !p.is_empty()) {
        let dir = PathBuf::from(entry);
        if seen.insert(dir.clone()) {
            dirs.push(dir);
        }
    }
    for dir in well_known_dirs(home) {
        if dir.is_dir() && seen.insert(dir.clone()) {
            dirs.push(dir);
        }
    }
    dirs
}

fn well_known_dirs(home: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![
        home.join(".local").join("bin"),
        home.join(".npm-global").join("bin"),
        home.join(".bun").join("bin"),
        home.join(".cargo").join("bin"),
        home.join("bin"),
    ];

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
        dirs.push(PathBuf::from("/usr/local/bin"));
    }

    #[cfg(target_os = "linux")]
    {
        dirs.push(PathBuf::from("/usr/local/bin"));
        dirs.push(PathBuf::from("/snap/bin"));
        dirs.push(PathBuf::from("/home/linuxbrew/.linuxbrew/bin"));
    }

    #[cfg(windows)]
    if let Ok(app_data) = std::env::var("APPDATA") {
        dirs.push(PathBuf::from(app_data).join("npm"));
    }

    dirs
}

/// Locate `cmd` on the search path.
///
/// A command containing a path separator is checked as-is.
pub fn which(cmd: &str) -> Option<PathBuf> {
    which_in(cmd, search_path())
}

pub fn which_in(cmd: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let direct = Path::new(cmd);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }

    for dir in dirs {
        let candidate = dir.join(cmd);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        for ext in ["exe", "cmd", "bat"] {
            let with_ext = candidate.with_extension(ext);
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_dedupes_entries() {
        let home = tempfile::tempdir().unwrap();
        let merged = merge_search_path("/usr/bin:/bin:/usr/bin", home.path());
        assert_eq!(merged[0], PathBuf::from("/usr/bin"));
        assert_eq!(merged.iter().filter(|d| d.as_path() == Path::new("/usr/bin")).count(), 1);
    }

    #[test]
    fn test_which_in_finds_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fake-agent"), "#!/bin/sh\n").unwrap();
        let dirs = vec![dir.path().to_path_buf()];

        assert_eq!(which_in("fake-agent", &dirs), Some(dir.path().join("fake-agent")));
        assert_eq!(which_in("missing-agent", &dirs), None);
    }

    #[test]
    fn test_which_accepts_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("agent");
        std::fs::write(&bin, "").unwrap();
        assert_eq!(which_in(bin.to_str().unwrap(), &[]), Some(bin.clone()));
        assert_eq!(which_in(dir.path().join("nope").to_str().unwrap(), &[]), None);
    }
}

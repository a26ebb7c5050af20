//! Binary Resolver (§4.1): explicit override -> PATH lookup -> fixed
//! fallback list -> actionable failure.
//!
//! The PATH lookup must see the user's login environment since the server
//! is often started non-interactively; we read `PATH` as inherited rather
//! than re-deriving a shell's view of it. A misconfigured explicit override
//! is a hard failure, never a silent fall-through to the next strategy.

use std::path::{Path, PathBuf};
use tether_core::error::{Result, TetherError};

/// Resolve the path to the target CLI binary.
///
/// `name` is the bare binary name (e.g. `"claude"`). The override
/// environment variable is `{NAME}_PATH`, upper-cased.
pub fn resolve_binary(name: &str) -> Result<PathBuf> {
    let override_var = format!("{}_PATH", name.to_uppercase());
    if let Ok(path) = std::env::var(&override_var) {
        let path = PathBuf::from(path);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(TetherError::Spawn(format!(
                "{} points at {:?}, which does not exist",
                override_var, path
            )))
        };
    }

    if let Some(found) = lookup_in_path(name) {
        return Ok(found);
    }

    for candidate in fallback_candidates(name) {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(TetherError::Spawn(format!(
        "could not locate '{name}' on PATH or in any known install location; \
         set {override_var} to its absolute path"
    )))
}

fn lookup_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn fallback_candidates(name: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".local/bin").join(name));
    }
    candidates.push(PathBuf::from("/usr/local/bin").join(name));
    candidates.push(PathBuf::from("/opt/homebrew/bin").join(name));
    candidates.push(PathBuf::from("/usr/bin").join(name));
    candidates
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\necho hi").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata().unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    #[test]
    fn explicit_override_missing_file_fails_loudly() {
        let var = "NOSUCHCLI_PATH";
        std::env::set_var(var, "/does/not/exist/nosuchcli");
        let result = resolve_binary("nosuchcli");
        std::env::remove_var(var);
        assert!(result.is_err());
    }

    #[test]
    fn explicit_override_present_wins() {
        let dir = TempDir::new().unwrap();
        let bin = make_executable(dir.path(), "mycli");
        std::env::set_var("MYCLI_PATH", &bin);
        let resolved = resolve_binary("mycli").unwrap();
        std::env::remove_var("MYCLI_PATH");
        assert_eq!(resolved, bin);
    }

    #[test]
    fn path_lookup_finds_binary() {
        let dir = TempDir::new().unwrap();
        make_executable(dir.path(), "findme");
        let old_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", dir.path());
        let resolved = resolve_binary("findme");
        std::env::set_var("PATH", old_path);
        assert!(resolved.is_ok());
    }

    #[test]
    fn unresolvable_binary_is_an_error() {
        let old_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", "");
        let result = resolve_binary("definitely-not-a-real-binary-xyz");
        std::env::set_var("PATH", old_path);
        assert!(result.is_err());
    }
}

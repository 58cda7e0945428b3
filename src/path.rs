// Copyright 2022 The Agentd Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Path helpers used during bootstrap to locate the agentd binary.

use nix::unistd::{access, AccessFlags};
use thiserror::Error;

use std::path::{Path, PathBuf};

/// The fallback executable search path.
pub const DEFAULT_PATH: &str = "/bin:/usr/bin:/usr/local/bin:/opt/veloagent/bin";

/// Errors raised by path resolution.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("`{0}` not found in search path")]
    NotFound(String),
    #[error("cannot canonicalize `{path}`: {source}")]
    Canonicalize {
        path: String,
        source: std::io::Error,
    },
}

/// Appends the default path to `path`, or returns the default path when
/// `path` is empty.
pub fn append_default(path: &str) -> String {
    if path.is_empty() {
        DEFAULT_PATH.to_owned()
    } else {
        format!("{}:{}", path, DEFAULT_PATH)
    }
}

/// Resolves `name` against a colon-separated search path.
///
/// A name containing a slash is canonicalized (absolute names as given,
/// relative names against the working directory) and checked directly.
/// Otherwise each directory of `search_path` is probed in order and the
/// first hit that is an executable regular file wins.
pub fn resolve(name: &str, search_path: &str) -> Result<PathBuf, PathError> {
    if name.contains('/') {
        let canonical = canonicalize(Path::new(name))?;
        if is_executable_file(&canonical) {
            return Ok(canonical);
        }
        return Err(PathError::NotFound(name.to_owned()));
    }

    for dir in search_path.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = Path::new(dir).join(name);
        if !is_executable_file(&candidate) {
            continue;
        }
        return canonicalize(&candidate);
    }
    Err(PathError::NotFound(name.to_owned()))
}

/// Returns the longest prefix of `path` up to but not including the final
/// slash. An empty path or a path without slashes yields `.`.
pub fn dirname(path: &str) -> String {
    match path.rfind('/') {
        None => ".".to_owned(),
        Some(0) => "/".to_owned(),
        Some(index) => path[..index].to_owned(),
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf, PathError> {
    std::fs::canonicalize(path).map_err(|source| PathError::Canonicalize {
        path: path.display().to_string(),
        source,
    })
}

fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => access(path, AccessFlags::X_OK).is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn append_default_empty() {
        assert_eq!(append_default(""), DEFAULT_PATH);
    }

    #[test]
    fn append_default_nonempty() {
        assert_eq!(
            append_default("/usr/games"),
            format!("/usr/games:{}", DEFAULT_PATH)
        );
    }

    #[test]
    fn dirname_cases() {
        assert_eq!(dirname(""), ".");
        assert_eq!(dirname("agentd"), ".");
        assert_eq!(dirname("/usr/bin/agentd"), "/usr/bin");
        assert_eq!(dirname("/agentd"), "/");
        assert_eq!(dirname("rel/agentd"), "rel");
    }

    #[test]
    fn resolves_from_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("toolx");
        fs::write(&exe, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let search = format!("/nonexistent:{}", dir.path().display());
        let resolved = resolve("toolx", &search).unwrap();
        assert_eq!(resolved, fs::canonicalize(&exe).unwrap());
    }

    #[test]
    fn skips_non_executables() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plainfile");
        fs::write(&plain, b"data").unwrap();
        fs::set_permissions(&plain, fs::Permissions::from_mode(0o644)).unwrap();

        let search = dir.path().display().to_string();
        assert!(resolve("plainfile", &search).is_err());
    }

    #[test]
    fn resolves_absolute_name_directly() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tooly");
        fs::write(&exe, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let resolved = resolve(exe.to_str().unwrap(), "").unwrap();
        assert_eq!(resolved, fs::canonicalize(&exe).unwrap());
    }
}

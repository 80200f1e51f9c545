//! Version resolution for built artifacts.
//!
//! The first `<major>.<minor>.<patch>` token in the file name wins, scanning
//! left to right. A `-` suffix is kept as a pre-release only when its first
//! identifier is a pre-release tag (`-rc.1`, `-beta2`). Distro revisions
//! (`-1`, `-0.x86_64`, `-ubuntu1`) and platform words (`-linux-amd64`) are
//! dropped. Architecture, platform and extension identifiers end a suffix.
//!
//! Without a token in the file name, the job's declared version is used
//! with its leading non-digit prefix (`v`, `release-`) removed.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::{RepoError, RepoResult};

static FILE_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"v?(\d+\.\d+\.\d+)(?:-([0-9A-Za-z]+(?:\.[0-9A-Za-z]+)*))?(?:\+([0-9A-Za-z]+(?:\.[0-9A-Za-z]+)*))?",
    )
    .unwrap()
});

static DECLARED_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)*(?:[-+~][0-9A-Za-z.+~-]+)?$").unwrap());

static STOP_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:deb|rpm|x86|x86_64|amd64|arm64|aarch64|armhf|armel|i386|i686|noarch|all|src|ppc64le|s390x|el\d+|fc\d+|linux|darwin|macos|windows|freebsd|ubuntu\d*|debian\d*|deb\d+|bpo\d*)$",
    )
    .unwrap()
});

static PRERELEASE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:alpha|beta|rc|pre|preview|dev|snapshot|nightly|canary)\d*$").unwrap()
});

/// Where a resolved version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VersionSource {
    FileName,
    Declared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedVersion {
    pub version: String,
    pub source: VersionSource,
}

/// Resolve the version of `file_name`, falling back to `declared`.
pub fn resolve_version(file_name: &str, declared: Option<&str>) -> RepoResult<ResolvedVersion> {
    if let Some(version) = version_from_file_name(file_name) {
        return Ok(ResolvedVersion {
            version,
            source: VersionSource::FileName,
        });
    }

    if let Some(version) = declared.and_then(normalize_declared) {
        return Ok(ResolvedVersion {
            version,
            source: VersionSource::Declared,
        });
    }

    Err(RepoError::VersionResolution {
        file: file_name.to_string(),
        declared: declared.map(str::to_string),
    })
}

fn version_from_file_name(file_name: &str) -> Option<String> {
    for caps in FILE_VERSION.captures_iter(file_name) {
        let whole = caps.get(0)?;
        // A token glued to a preceding digit or dot is the tail of a
        // longer number, not a version start.
        let preceding = file_name[..whole.start()].chars().next_back();
        if matches!(preceding, Some(c) if c.is_ascii_digit() || c == '.') {
            continue;
        }

        let mut version = caps[1].to_string();
        if let Some(pre) = caps.get(2).and_then(|m| suffix(m.as_str(), true)) {
            version.push('-');
            version.push_str(&pre);
        }
        if let Some(build) = caps.get(3).and_then(|m| suffix(m.as_str(), false)) {
            version.push('+');
            version.push_str(&build);
        }
        return Some(version);
    }
    None
}

/// Keep the leading identifiers of a suffix up to the first
/// architecture, platform or extension identifier.
fn suffix(raw: &str, prerelease: bool) -> Option<String> {
    let first = raw.split('.').next().unwrap_or(raw);
    if prerelease && !PRERELEASE_TAG.is_match(first) {
        return None;
    }
    let kept: Vec<&str> = raw
        .split('.')
        .take_while(|id| !STOP_IDENTIFIER.is_match(id))
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("."))
    }
}

fn normalize_declared(declared: &str) -> Option<String> {
    let stripped = declared
        .trim()
        .trim_start_matches(|c: char| !c.is_ascii_digit());
    DECLARED_VERSION
        .is_match(stripped)
        .then(|| stripped.to_string())
}

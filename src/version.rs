use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[cfg(target_os = "windows")]
use pelite::pe64::{Pe, PeFile};
#[cfg(target_os = "windows")]
use pelite::FileMap;

use crate::error::{InteropError, Result};

/// A Unity runtime version, ordered component by component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnityVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl UnityVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        UnityVersion { major, minor, patch }
    }

    /// Parse a version string like "2021.3.14f1" or "2021.3.14"
    pub fn parse(version_str: &str) -> Option<Self> {
        // Drop release suffixes like "f1", "p1", "b3"
        let cleaned = version_str
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect::<String>();

        let parts: Vec<&str> = cleaned.split('.').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [major, minor, patch, ..] => Some(UnityVersion::new(
                major.parse().ok()?,
                minor.parse().ok()?,
                patch.parse().ok()?,
            )),
            [major, minor] => Some(UnityVersion::new(major.parse().ok()?, minor.parse().ok()?, 0)),
            _ => None,
        }
    }

    /// Like [`UnityVersion::parse`] but reports the offending string
    pub fn parse_strict(version_str: &str) -> Result<Self> {
        Self::parse(version_str).ok_or_else(|| InteropError::InvalidVersion(version_str.to_string()))
    }
}

impl fmt::Display for UnityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Read the Unity version from the host executable's version resource
#[cfg(target_os = "windows")]
pub fn unity_version_from_exe(exe_path: &Path) -> Option<UnityVersion> {
    use pelite::resources::version_info::Language;

    let file_map = match FileMap::open(exe_path) {
        Ok(fm) => fm,
        Err(e) => {
            warn!("failed to open PE file {:?}: {:?}", exe_path, e);
            return None;
        }
    };

    let pe = match PeFile::from_bytes(file_map.as_ref()) {
        Ok(p) => p,
        Err(e) => {
            warn!("failed to parse PE file {:?}: {:?}", exe_path, e);
            return None;
        }
    };

    let version_info = pe.resources().ok()?.version_info().ok()?;
    let fixed = version_info.fixed()?;
    let file_version = fixed.dwFileVersion;

    // The string table carries the full "2021.3.14f1" form; the fixed block
    // only has numbers
    let mut found_version: Option<UnityVersion> = None;
    version_info.strings(Language::default(), |key, value| {
        if found_version.is_none() && (key.contains("FileVersion") || key.contains("ProductVersion")) {
            debug!("PE {}: {}", key, value);
            found_version = UnityVersion::parse(value);
        }
    });

    found_version.or_else(|| {
        Some(UnityVersion::new(
            file_version.Major as u32,
            file_version.Minor as u32,
            file_version.Build as u32,
        ))
    })
}

#[cfg(not(target_os = "windows"))]
pub fn unity_version_from_exe(exe_path: &Path) -> Option<UnityVersion> {
    // Non-Windows players ship the version next to the data folder instead
    let data_dir = exe_path.parent()?;
    for entry in std::fs::read_dir(data_dir).ok()?.flatten() {
        let path = entry.path();
        if !path.is_dir() || !path.to_string_lossy().ends_with("_Data") {
            continue;
        }
        if let Some(version) = unity_version_from_globalgamemanagers(&path.join("globalgamemanagers")) {
            return Some(version);
        }
    }
    None
}

/// Scan a serialized asset header for the engine version string
#[cfg(not(target_os = "windows"))]
fn unity_version_from_globalgamemanagers(path: &Path) -> Option<UnityVersion> {
    let bytes = std::fs::read(path).ok()?;
    // The version is the first NUL-terminated "YYYY.x.yfz" string in the header
    let header = &bytes[..bytes.len().min(0x100)];
    header
        .split(|b| *b == 0)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .find(|s| s.len() >= 6 && s.starts_with("20") && s.contains('.'))
        .and_then(UnityVersion::parse)
}

/// Detect the Unity version of the process we are loaded into
pub fn detect_unity_version() -> Option<UnityVersion> {
    let exe = std::env::current_exe().ok()?;
    debug!("detecting unity version from {:?}", exe);
    unity_version_from_exe(&exe)
}

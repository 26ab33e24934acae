//! Host platform detection and engine version normalization
//!
//! # Examples
//!
//! ```
//! use ugcmount::{detect_platform, parse_engine_version};
//!
//! let platform = detect_platform();
//! println!("Platform: {}", platform); // "Win64", "Linux", or "Mac"
//!
//! let version = parse_engine_version("5.3").unwrap();
//! assert_eq!(version.to_string(), "5.3.0");
//! ```

use std::env;

/// Detect the current platform
///
/// Returns a platform tag compatible with Unreal Engine cook targets:
/// - "Win64" for Windows
/// - "Linux" for Linux, WSL included
/// - "Mac" for macOS (both Intel and Apple Silicon)
///
/// Hosts whose content was cooked for another target (a Windows build under
/// WSL, say) set `validation.platform` instead.
pub fn detect_platform() -> String {
    let os = env::consts::OS;
    let arch = env::consts::ARCH;

    match (os, arch) {
        ("windows", "x86_64") => "Win64".to_string(),
        ("linux", "x86_64") | ("linux", "aarch64") => "Linux".to_string(),
        ("macos", "x86_64") | ("macos", "aarch64") => "Mac".to_string(),
        _ => format!("{}-{}", os, arch),
    }
}

/// Parse an engine version string into a semver version
///
/// Engine versions are usually written as `major.minor` ("5.3") or with a
/// changelist suffix ("5.3.2-29314046+++UE5+Release-5.3"). Missing
/// components are filled with zero and anything after the numeric triple
/// is dropped.
pub fn parse_engine_version(version: &str) -> Result<semver::Version, semver::Error> {
    let numeric: String = version
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut parts: Vec<&str> = numeric.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        // Let semver report the malformed input
        return semver::Version::parse(version.trim());
    }
    parts.truncate(3);
    while parts.len() < 3 {
        parts.push("0");
    }

    semver::Version::parse(&parts.join("."))
}

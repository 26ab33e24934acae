//! Structural validation of downloaded UGC archives
//!
//! A UGC archive is a gzip-compressed tarball carrying a `ugc.json` manifest
//! at its root next to the cooked content. Validation never extracts
//! anything: it checks the header magic, walks the whole tar stream to catch
//! truncation, parses the manifest and checks it against the host's
//! [`ValidationPolicy`]. It is side-effect free and may run concurrently on
//! different archives.
//!
//! # Examples
//!
//! ```no_run
//! use ugcmount::{validate, PackageSource, ValidationPolicy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = PackageSource::new("mod-42", "downloads/mod-42.ugc").with_declared_version(3);
//! let validated = validate(&source, &ValidationPolicy::default())?;
//! println!("{} assets", validated.assets.len());
//! # Ok(())
//! # }
//! ```

use crate::config::ValidationConfig;
use crate::index::AssetId;
use crate::namespace::ContentId;
use crate::platform::parse_engine_version;
use crate::{Error, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tar::Archive;

/// Name of the manifest entry at the archive root
pub const MANIFEST_ENTRY: &str = "ugc.json";

/// Format tag every manifest must carry
pub const FORMAT_TAG: &str = "ugcpak";

/// Newest manifest format this build understands
pub const CURRENT_FORMAT_VERSION: u32 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

/// Manifest stored as `ugc.json` inside every archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Format tag, always [`FORMAT_TAG`]
    pub format: String,

    /// Manifest format version
    pub format_version: u32,

    /// Identifier the package was published under, if the producer knew it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<ContentId>,

    /// Package version as assigned by the content service
    pub version: u64,

    /// Engine version the content was cooked with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,

    /// Platforms the content was cooked for; empty means any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Asset identifiers contributed by this package, in declaration order
    #[serde(default)]
    pub assets: Vec<AssetId>,
}

/// A downloaded archive handed over by the content-service client
#[derive(Debug, Clone, PartialEq)]
pub struct PackageSource {
    pub content_id: ContentId,
    pub archive_path: PathBuf,

    /// Version the service says it delivered
    pub declared_version: Option<u64>,

    /// Asset list the service says the archive contains; empty means unknown
    pub asset_manifest: Vec<AssetId>,

    /// SHA256 of the archive, hex encoded, optionally prefixed with `sha256:`
    pub checksum: Option<String>,
}

impl PackageSource {
    pub fn new(content_id: impl Into<ContentId>, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            content_id: content_id.into(),
            archive_path: archive_path.into(),
            declared_version: None,
            asset_manifest: Vec::new(),
            checksum: None,
        }
    }

    pub fn with_declared_version(mut self, version: u64) -> Self {
        self.declared_version = Some(version);
        self
    }

    pub fn with_asset_manifest<I, A>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AssetId>,
    {
        self.asset_manifest = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// What the host accepts
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub format_versions: RangeInclusive<u32>,

    /// Engine versions the host can load, checked against the manifest's `engine_version`
    pub engine_requirement: Option<semver::VersionReq>,

    /// Host platform tag; `None` skips the platform check
    pub platform: Option<String>,

    pub verify_checksums: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            format_versions: 1..=CURRENT_FORMAT_VERSION,
            engine_requirement: None,
            platform: None,
            verify_checksums: true,
        }
    }
}

impl ValidationPolicy {
    pub fn from_config(config: &ValidationConfig) -> Result<Self> {
        let engine_requirement = match config.engine_requirement.as_deref() {
            Some(req) if !req.trim().is_empty() => Some(semver::VersionReq::parse(req)?),
            _ => None,
        };

        Ok(Self {
            format_versions: config.min_format_version..=config.max_format_version,
            engine_requirement,
            platform: Some(config.platform.clone()).filter(|p| !p.is_empty()),
            verify_checksums: config.verify_checksums,
        })
    }
}

/// Result of a successful validation
#[derive(Debug, Clone)]
pub struct ValidatedArchive {
    pub path: PathBuf,
    pub manifest: ArchiveManifest,

    /// Asset identifiers in declaration order, free of duplicates
    pub assets: Vec<AssetId>,

    /// SHA256 of the archive file
    pub checksum: String,
}

impl ValidatedArchive {
    pub fn version(&self) -> u64 {
        self.manifest.version
    }
}

/// Validate `source` against `policy`
///
/// Errors:
/// - [`Error::CorruptArchive`] on any structural failure, checksum mismatch
///   or disagreement with what the service declared
/// - [`Error::UnsupportedVersion`] when the format version, engine version
///   or platform is outside what the host accepts
/// - [`Error::EmptyPackage`] when the manifest lists no assets
pub fn validate(source: &PackageSource, policy: &ValidationPolicy) -> Result<ValidatedArchive> {
    let path = source.archive_path.as_path();

    if !path.is_file() {
        return Err(Error::corrupt(path, "archive file not found"));
    }

    let checksum = compute_checksum(path).map_err(|e| Error::corrupt(path, e.to_string()))?;
    if policy.verify_checksums {
        if let Some(expected) = source.checksum.as_deref() {
            let expected = expected.strip_prefix("sha256:").unwrap_or(expected);
            if !checksum.eq_ignore_ascii_case(expected) {
                return Err(Error::corrupt(
                    path,
                    format!(
                        "checksum mismatch (expected {}, computed {})",
                        expected, checksum
                    ),
                ));
            }
        }
    }

    let manifest = read_manifest(path)?;

    if !policy.format_versions.contains(&manifest.format_version) {
        return Err(Error::unsupported(
            path,
            format!(
                "format version {} is outside the accepted range {}..={}",
                manifest.format_version,
                policy.format_versions.start(),
                policy.format_versions.end()
            ),
        ));
    }

    check_engine_version(path, &manifest, policy)?;
    check_platform(path, &manifest, policy)?;

    if manifest.assets.is_empty() {
        return Err(Error::EmptyPackage(path.to_path_buf()));
    }

    let mut seen = HashSet::with_capacity(manifest.assets.len());
    for asset in &manifest.assets {
        if asset.as_str().trim().is_empty() {
            return Err(Error::corrupt(path, "manifest contains a blank asset identifier"));
        }
        if !seen.insert(asset) {
            return Err(Error::corrupt(
                path,
                format!("manifest lists asset '{}' more than once", asset),
            ));
        }
    }

    if let Some(declared) = source.declared_version {
        if declared != manifest.version {
            return Err(Error::corrupt(
                path,
                format!(
                    "service declared version {} but archive carries version {}",
                    declared, manifest.version
                ),
            ));
        }
    }

    if let Some(archive_id) = &manifest.content_id {
        if archive_id != &source.content_id {
            return Err(Error::corrupt(
                path,
                format!(
                    "archive belongs to '{}', not '{}'",
                    archive_id, source.content_id
                ),
            ));
        }
    }

    if !source.asset_manifest.is_empty() {
        let declared: HashSet<&AssetId> = source.asset_manifest.iter().collect();
        if declared != seen {
            return Err(Error::corrupt(
                path,
                "asset list differs from the manifest declared by the content service",
            ));
        }
    }

    Ok(ValidatedArchive {
        path: path.to_path_buf(),
        assets: manifest.assets.clone(),
        manifest,
        checksum,
    })
}

/// Read and structurally check the manifest of an archive
///
/// Walks every tar entry so a truncated stream is reported here rather than
/// at mount time.
pub fn read_manifest<P: AsRef<Path>>(archive_path: P) -> Result<ArchiveManifest> {
    let path = archive_path.as_ref();
    let corrupt = |reason: String| Error::corrupt(path, reason);

    let mut file = BufReader::new(File::open(path).map_err(|e| corrupt(e.to_string()))?);

    let mut magic = [0u8; 2];
    file.read_exact(&mut magic)
        .map_err(|_| corrupt("file is too short to be an archive".to_string()))?;
    if magic != GZIP_MAGIC {
        return Err(corrupt(format!(
            "bad header magic {:02x}{:02x}",
            magic[0], magic[1]
        )));
    }

    let stream = (&magic[..]).chain(file);
    let mut archive = Archive::new(GzDecoder::new(stream));

    let mut manifest_json: Option<String> = None;
    let mut entry_count = 0usize;

    for entry in archive.entries().map_err(|e| corrupt(e.to_string()))? {
        let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
        entry_count += 1;

        let entry_path = entry.path().map_err(|e| corrupt(e.to_string()))?;
        let normalized = entry_path.to_string_lossy();
        let normalized = normalized.trim_start_matches("./");

        if normalized.starts_with('/') || normalized.split('/').any(|s| s == "..") {
            return Err(corrupt(format!("entry '{}' escapes the archive root", normalized)));
        }

        if normalized == MANIFEST_ENTRY {
            if manifest_json.is_some() {
                return Err(corrupt("archive contains more than one manifest".to_string()));
            }
            if entry.header().size().unwrap_or(u64::MAX) > MAX_MANIFEST_BYTES {
                return Err(corrupt("manifest is unreasonably large".to_string()));
            }

            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| corrupt(format!("unreadable manifest: {}", e)))?;
            manifest_json = Some(content);
        }
    }

    if entry_count == 0 {
        return Err(corrupt("archive has no entries".to_string()));
    }

    let manifest_json =
        manifest_json.ok_or_else(|| corrupt(format!("missing {} manifest", MANIFEST_ENTRY)))?;

    let manifest: ArchiveManifest = serde_json::from_str(&manifest_json)
        .map_err(|e| corrupt(format!("malformed manifest: {}", e)))?;

    if manifest.format != FORMAT_TAG {
        return Err(corrupt(format!(
            "unknown format tag '{}' (expected '{}')",
            manifest.format, FORMAT_TAG
        )));
    }

    Ok(manifest)
}

fn check_engine_version(
    path: &Path,
    manifest: &ArchiveManifest,
    policy: &ValidationPolicy,
) -> Result<()> {
    let (Some(requirement), Some(engine_version)) =
        (&policy.engine_requirement, manifest.engine_version.as_deref())
    else {
        return Ok(());
    };

    let parsed = parse_engine_version(engine_version).map_err(|e| {
        Error::unsupported(
            path,
            format!("engine version '{}' is not parseable: {}", engine_version, e),
        )
    })?;

    if !requirement.matches(&parsed) {
        return Err(Error::unsupported(
            path,
            format!(
                "cooked for engine {} but the host requires {}",
                engine_version, requirement
            ),
        ));
    }

    Ok(())
}

fn check_platform(path: &Path, manifest: &ArchiveManifest, policy: &ValidationPolicy) -> Result<()> {
    let Some(platform) = policy.platform.as_deref() else {
        return Ok(());
    };

    if manifest.platforms.is_empty()
        || manifest
            .platforms
            .iter()
            .any(|p| p.eq_ignore_ascii_case(platform))
    {
        return Ok(());
    }

    Err(Error::unsupported(
        path,
        format!(
            "cooked for {} but the host platform is {}",
            manifest.platforms.join(", "),
            platform
        ),
    ))
}

/// Compute the SHA256 of a file as a lowercase hex string
pub fn compute_checksum<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Archive size in bytes, for reporting
pub fn archive_size<P: AsRef<Path>>(path: P) -> Result<u64> {
    Ok(fs::metadata(path.as_ref())?.len())
}

//! Bulk upload of entity files.
//!
//! Loads JSON or YAML entity files, validates each one and sorts it into new,
//! unchanged and changed against the registry. New entities are created in one
//! batch. A changed entity is never overwritten: it is skipped, or, when a
//! version bump is requested, re-identified under a new version and created.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

use crate::auth::Credentials;
use crate::document::{DocumentError, EntityDocument};
use crate::error::RegistryError;
use crate::registry::Registry;
use crate::uri::{self, EntityUri};

/// Upload failures.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("File format '{format}' is not supported.")]
    UnsupportedFormat { path: PathBuf, format: String },

    #[error("Unknown entity file format '{0}' (expected json or yaml)")]
    UnknownFormat(String),

    #[error("No files found with the given options.")]
    NoFiles,

    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{} is not valid YAML: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{} is not a valid entity: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: DocumentError,
    },

    #[error("{} repeats entity {uri} from an earlier file", path.display())]
    Duplicate { path: PathBuf, uri: EntityUri },

    #[error("New version ({version}) is not a valid entity version.")]
    InvalidVersion { version: String },

    #[error("New version ({version}) is the same as the existing version ({existing}).")]
    SameVersion { version: String, existing: String },

    #[error("Cannot bump to {uri}: it already exists in the database.")]
    VersionTaken { uri: EntityUri },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// File formats entities can be uploaded from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityFormat {
    /// `.json` files.
    #[default]
    Json,
    /// `.yaml` and `.yml` files.
    Yaml,
}

impl EntityFormat {
    /// The format's name as given on the command line.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }

    /// File extensions of this format, lowercase.
    #[must_use]
    pub const fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Json => &["json"],
            Self::Yaml => &["yaml", "yml"],
        }
    }

    /// The format a file extension belongs to, ignoring case.
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        let extension = extension.to_ascii_lowercase();
        [Self::Json, Self::Yaml]
            .into_iter()
            .find(|format| format.extensions().contains(&extension.as_str()))
    }

    /// The format of `path`, judged by its extension.
    #[must_use]
    pub fn of_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    fn parse(self, path: &Path, raw: &[u8]) -> Result<serde_json::Value, UploadError> {
        match self {
            Self::Json => serde_json::from_slice(raw).map_err(|source| UploadError::Json {
                path: path.to_path_buf(),
                source,
            }),
            Self::Yaml => serde_yaml::from_slice(raw).map_err(|source| UploadError::Yaml {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl fmt::Display for EntityFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntityFormat {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim()).ok_or_else(|| UploadError::UnknownFormat(s.to_string()))
    }
}

/// How to upload an entity that exists with different content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionBump {
    /// Raise the patch level: `0.1` becomes `0.1.1`, `0.1.1` becomes `0.1.2`.
    Patch,
    /// Use this version.
    To(String),
}

impl VersionBump {
    /// The version an entity at `current` is re-identified under.
    ///
    /// # Errors
    /// `InvalidVersion` if the new version is malformed, `SameVersion` if it
    /// equals `current`.
    pub fn next_version(&self, current: &str) -> Result<String, UploadError> {
        let version = match self {
            Self::Patch => bump_patch(current),
            Self::To(version) => version.trim().to_string(),
        };

        if !uri::is_valid_version(&version) {
            return Err(UploadError::InvalidVersion { version });
        }
        if version == current {
            return Err(UploadError::SameVersion {
                version,
                existing: current.to_string(),
            });
        }
        Ok(version)
    }
}

fn bump_patch(current: &str) -> String {
    let mut groups: Vec<&str> = current.split('.').collect();
    let patch = groups
        .get(2)
        .and_then(|group| group.parse::<u64>().ok())
        .map_or(1, |patch| patch.saturating_add(1));
    groups.resize(2, "0");
    format!("{}.{}.{patch}", groups[0], groups[1])
}

/// Upload behaviour switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Stop at the first file that cannot be uploaded.
    pub fail_fast: bool,
    /// Only files of this format are uploaded.
    pub format: EntityFormat,
    /// Upload entities that differ from the stored ones under a new version.
    pub bump_version: Option<VersionBump>,
}

/// What an upload did.
#[derive(Debug, Default)]
pub struct UploadReport {
    /// Newly created entities, bumped ones included.
    pub created: Vec<EntityUri>,
    /// Entities created under a new version: `(stored, created)`.
    pub bumped: Vec<(EntityUri, EntityUri)>,
    /// Entities already stored exactly as in their file.
    pub unchanged: Vec<EntityUri>,
    /// Files whose entity is stored with different content and left alone.
    pub conflicting: Vec<(PathBuf, EntityUri)>,
    /// Files of a supported format other than the one selected.
    pub skipped: Vec<(PathBuf, EntityFormat)>,
    /// Files of an unsupported format.
    pub unsupported: Vec<PathBuf>,
    /// Files that could not be uploaded.
    pub failures: Vec<UploadError>,
}

impl UploadReport {
    /// Number of entities written.
    #[must_use]
    pub fn uploaded(&self) -> usize {
        self.created.len()
    }

    /// The formats of the skipped files, each once.
    #[must_use]
    pub fn skipped_formats(&self) -> BTreeSet<EntityFormat> {
        self.skipped.iter().map(|(_, format)| *format).collect()
    }
}

/// Expands `files` and `dirs` into the files to upload.
///
/// Files are taken as given. Directories are scanned one level deep for files
/// of `format`, sorted within each directory so uploads are reproducible.
///
/// # Errors
/// - `Read` if a directory cannot be listed
/// - `NoFiles` if nothing is left to upload
pub fn collect_paths(
    files: &[PathBuf],
    dirs: &[PathBuf],
    format: EntityFormat,
) -> Result<Vec<PathBuf>, UploadError> {
    let mut paths = files.to_vec();
    for dir in dirs {
        let read_err = |source| UploadError::Read {
            path: dir.clone(),
            source,
        };
        let mut found = Vec::new();
        for entry in fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.is_file() && EntityFormat::of_path(&path) == Some(format) {
                found.push(path);
            }
        }
        found.sort();
        paths.extend(found);
    }

    if paths.is_empty() {
        return Err(UploadError::NoFiles);
    }
    Ok(paths)
}

/// Loads and validates one entity file of any supported format.
///
/// # Errors
/// `UnsupportedFormat`, `Read`, `Json`, `Yaml` or `Invalid`.
pub fn load_entity(path: &Path) -> Result<(EntityUri, EntityDocument), UploadError> {
    let format = EntityFormat::of_path(path).ok_or_else(|| UploadError::UnsupportedFormat {
        path: path.to_path_buf(),
        format: path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_string(),
    })?;

    let raw = fs::read(path).map_err(|source| UploadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value = format.parse(path, &raw)?;

    let invalid = |source| UploadError::Invalid {
        path: path.to_path_buf(),
        source,
    };
    let document = EntityDocument::from_value(value).map_err(invalid)?;
    let uri = document.validate().map_err(invalid)?;
    Ok((uri, document))
}

fn bump_entity(
    registry: &Registry,
    bump: &VersionBump,
    path: &Path,
    uri: &EntityUri,
    document: &EntityDocument,
) -> Result<(EntityUri, EntityDocument), UploadError> {
    let version = bump.next_version(uri.version())?;
    let (bumped, document) =
        document
            .with_version(&version)
            .map_err(|source| UploadError::Invalid {
                path: path.to_path_buf(),
                source,
            })?;

    if registry.store().contains(&bumped).map_err(RegistryError::from)? {
        return Err(UploadError::VersionTaken { uri: bumped });
    }
    Ok((bumped, document))
}

/// Uploads the entities in `paths`.
///
/// # Errors
/// - the first per-file error when `fail_fast` is set
/// - `Registry` if a registry call fails
pub fn upload(
    registry: &Registry,
    credentials: &Credentials,
    paths: &[PathBuf],
    options: &UploadOptions,
) -> Result<UploadReport, UploadError> {
    let mut report = UploadReport::default();
    let mut seen = HashSet::new();
    let mut fresh = Vec::new();

    for path in paths {
        match EntityFormat::of_path(path) {
            Some(format) if format == options.format => {}
            Some(format) => {
                info!(path = %path.display(), %format, "skipping file of another format");
                report.skipped.push((path.clone(), format));
                continue;
            }
            None => {
                warn!(path = %path.display(), "skipping unsupported file format");
                report.unsupported.push(path.clone());
                continue;
            }
        }

        let claim = |seen: &mut HashSet<EntityUri>, uri: EntityUri| {
            if seen.insert(uri.clone()) {
                Ok(uri)
            } else {
                Err(UploadError::Duplicate {
                    path: path.clone(),
                    uri,
                })
            }
        };

        let outcome = load_entity(path)
            .and_then(|(uri, document)| Ok((claim(&mut seen, uri)?, document)))
            .and_then(|(uri, document)| {
                match registry.store().read(&uri).map_err(RegistryError::from)? {
                    None => {
                        fresh.push((uri, document));
                    }
                    Some(stored) if stored.fingerprint() == document.fingerprint() => {
                        info!(%uri, "entity already exists");
                        report.unchanged.push(uri);
                    }
                    Some(_) => match &options.bump_version {
                        None => {
                            warn!(%uri, "entity already exists with different content; skipping");
                            report.conflicting.push((path.clone(), uri));
                        }
                        Some(bump) => {
                            let (bumped, document) =
                                bump_entity(registry, bump, path, &uri, &document)?;
                            let bumped = claim(&mut seen, bumped)?;
                            info!(%uri, %bumped, "uploading changed entity under a new version");
                            report.bumped.push((uri, bumped.clone()));
                            fresh.push((bumped, document));
                        }
                    },
                }
                Ok(())
            });

        match outcome {
            Ok(()) => {}
            Err(err @ UploadError::Registry(_)) => return Err(err),
            Err(err) if options.fail_fast => return Err(err),
            Err(err) => {
                warn!(error = %err, "skipping entity file");
                report.failures.push(err);
            }
        }
    }

    if !fresh.is_empty() {
        let (uris, documents): (Vec<_>, Vec<_>) = fresh.into_iter().unzip();
        registry.create(credentials, documents)?;
        report.created = uris;
    }

    info!(
        created = report.created.len(),
        bumped = report.bumped.len(),
        unchanged = report.unchanged.len(),
        conflicting = report.conflicting.len(),
        failures = report.failures.len(),
        "upload finished"
    );
    Ok(report)
}

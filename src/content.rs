//! Fingerprints of dependency targets and the file access abstraction they are
//! observed through.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::time::UNIX_EPOCH;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Hash32, Value};

/// Fingerprint of one dependency target.
///
/// The presence classes (`Present`, `NotPresent`, `IsFile`, `IsDirectory`,
/// `DontCare`) only capture a coarse classification of the target. When one of
/// them is reported, the engine records the classification it observes at that
/// moment, with the granularity the reported class asks for, and the dependency
/// is invalidated only when that classification changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ContentDescriptor {
    Present,
    NotPresent,
    IsFile,
    IsDirectory,
    DontCare,
    /// Size and modification time in nanoseconds since the epoch.
    Attributes { size: u64, modified: u64 },
    /// Digest of the file content.
    Hash(Hash32),
    /// Pluggable descriptor, checked by the codec registered under `tag`.
    Custom { tag: String, state: Value },
}

impl ContentDescriptor {
    pub fn is_presence_class(&self) -> bool {
        matches!(
            self,
            ContentDescriptor::Present
                | ContentDescriptor::NotPresent
                | ContentDescriptor::IsFile
                | ContentDescriptor::IsDirectory
                | ContentDescriptor::DontCare
        )
    }

    /// Classifies `state` with the granularity of this descriptor. Descriptors
    /// which are not presence classes are returned unchanged.
    pub fn observe(&self, state: &FileState) -> ContentDescriptor {
        match self {
            ContentDescriptor::Present | ContentDescriptor::NotPresent => match state.kind {
                FileKind::Missing => ContentDescriptor::NotPresent,
                _ => ContentDescriptor::Present,
            },
            ContentDescriptor::IsFile | ContentDescriptor::IsDirectory => match state.kind {
                FileKind::Missing => ContentDescriptor::NotPresent,
                FileKind::File => ContentDescriptor::IsFile,
                FileKind::Directory => ContentDescriptor::IsDirectory,
            },
            other => other.clone(),
        }
    }

    /// Fingerprint of `state` with attribute granularity.
    pub fn attributes_of(state: &FileState) -> ContentDescriptor {
        match state.kind {
            FileKind::Missing => ContentDescriptor::NotPresent,
            FileKind::Directory => ContentDescriptor::IsDirectory,
            FileKind::File => ContentDescriptor::Attributes {
                size: state.size,
                modified: state.modified,
            },
        }
    }
}

/// How the engine fingerprints files when a task asks it to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintPolicy {
    #[default]
    Hash,
    Attributes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Missing,
    File,
    Directory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileState {
    pub kind: FileKind,
    pub size: u64,
    pub modified: u64,
}

impl FileState {
    pub fn missing() -> Self {
        FileState {
            kind: FileKind::Missing,
            size: 0,
            modified: 0,
        }
    }
}

/// Access to the files tasks depend on. Paths are interpreted relative to the
/// provider's root unless they are absolute.
pub trait ContentProvider: Send + Sync {
    fn state(&self, path: &Utf8Path) -> io::Result<FileState>;

    /// Content digest, `None` when the path is not a regular file.
    fn digest(&self, path: &Utf8Path) -> io::Result<Option<Hash32>>;

    fn read(&self, path: &Utf8Path) -> io::Result<Option<Vec<u8>>>;

    fn write(&self, path: &Utf8Path, bytes: &[u8]) -> io::Result<()>;

    fn delete(&self, path: &Utf8Path) -> io::Result<()>;

    /// All files matching a wildcard pattern, as paths in the same form the
    /// pattern was given in.
    fn collect(&self, pattern: &str) -> io::Result<BTreeSet<Utf8PathBuf>>;

    /// A single spelling of `path`, so that two paths naming the same target
    /// compare equal and prefixes can be checked component-wise.
    fn normalize(&self, path: &Utf8Path) -> Utf8PathBuf {
        normalize_lexically(path)
    }

    /// Fingerprints a file with the given policy.
    fn fingerprint(&self, path: &Utf8Path, policy: FingerprintPolicy) -> io::Result<ContentDescriptor> {
        let state = self.state(path)?;
        match (policy, state.kind) {
            (_, FileKind::Missing) => Ok(ContentDescriptor::NotPresent),
            (_, FileKind::Directory) => Ok(ContentDescriptor::IsDirectory),
            (FingerprintPolicy::Attributes, FileKind::File) => Ok(ContentDescriptor::attributes_of(&state)),
            (FingerprintPolicy::Hash, FileKind::File) => Ok(match self.digest(path)? {
                Some(hash) => ContentDescriptor::Hash(hash),
                None => ContentDescriptor::NotPresent,
            }),
        }
    }
}

/// Drops `.` components and folds `..` into the preceding component, without
/// touching the file system. Leading `..` of a relative path are kept.
pub fn normalize_lexically(path: &Utf8Path) -> Utf8PathBuf {
    let mut normalized = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if normalized.file_name().is_some() {
                    normalized.pop();
                } else if !normalized.has_root() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_str()),
        }
    }
    normalized
}

/// Files on the local disk, rooted at a base directory.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: Utf8PathBuf,
}

impl LocalFiles {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.root.join(path)
        }
    }
}

impl ContentProvider for LocalFiles {
    fn state(&self, path: &Utf8Path) -> io::Result<FileState> {
        let meta = match fs::metadata(self.resolve(path)) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileState::missing()),
            Err(e) => return Err(e),
        };

        let kind = if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };

        let modified = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_nanos() as u64)
            .unwrap_or_default();

        Ok(FileState {
            kind,
            size: meta.len(),
            modified,
        })
    }

    fn digest(&self, path: &Utf8Path) -> io::Result<Option<Hash32>> {
        let path = self.resolve(path);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(Hash32::hash_file(path)?))
    }

    fn read(&self, path: &Utf8Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)
    }

    fn delete(&self, path: &Utf8Path) -> io::Result<()> {
        let path = self.resolve(path);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn normalize(&self, path: &Utf8Path) -> Utf8PathBuf {
        normalize_lexically(&self.resolve(path))
    }

    fn collect(&self, pattern: &str) -> io::Result<BTreeSet<Utf8PathBuf>> {
        let absolute = Utf8Path::new(pattern).is_absolute();
        let full = self.resolve(Utf8Path::new(pattern));

        let paths = glob::glob(full.as_str()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut found = BTreeSet::new();
        for entry in paths {
            let path = entry.map_err(glob::GlobError::into_error)?;
            let path = Utf8PathBuf::try_from(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let path = match absolute {
                true => path,
                false => path
                    .strip_prefix(&self.root)
                    .map(Utf8Path::to_owned)
                    .unwrap_or(path),
            };
            found.insert(path);
        }
        Ok(found)
    }
}

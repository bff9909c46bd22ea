//! Gallery Store: the source of truth for enrolled reference photos.
//!
//! On disk the gallery is one flat directory. Each file name encodes its
//! identity label: the first photo is `<label>.<ext>`, later ones
//! `<label>__<n>.<ext>`. Only `jpg`, `jpeg` and `png` files are considered.

use image::ImageFormat;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const MAX_LABEL_LEN: usize = 128;
const INDEX_SEPARATOR: &str = "__";
const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid identity label {label:?}: {reason}")]
    InvalidIdentity { label: String, reason: &'static str },
    #[error("unknown identity {0:?}")]
    UnknownIdentity(String),
    #[error("unknown reference photo {0:?}")]
    UnknownReference(String),
    #[error("unsupported image format (expected JPEG or PNG)")]
    UnsupportedFormat,
    #[error("gallery storage error at {path}: {source}")]
    Storage { path: PathBuf, source: io::Error },
}

/// One stored reference photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    /// Store-assigned name (the file name for [`DirectoryStore`]).
    pub source: String,
    pub bytes: Vec<u8>,
}

/// Persistent repository of reference photos keyed by identity label.
pub trait GalleryStore: Send + Sync {
    /// Enrolled labels, earliest enrolled first.
    fn list_identities(&self) -> Result<Vec<String>, StoreError>;

    /// Photos of `identity` in the order they were added. Unknown labels
    /// have no photos.
    fn load_reference_images(&self, identity: &str) -> Result<Vec<ReferenceImage>, StoreError>;

    /// Persist one more JPEG or PNG photo, creating the identity if needed.
    /// Returns the assigned source name.
    fn add_reference_image(&self, identity: &str, image: &[u8]) -> Result<String, StoreError>;

    fn remove_reference_image(&self, identity: &str, source: &str) -> Result<(), StoreError>;

    /// Delete every photo of `identity` and return how many there were.
    fn remove_identity(&self, identity: &str) -> Result<usize, StoreError>;

    /// Opaque token that changes whenever the stored photos change, including
    /// changes made by another process. `None` when the store cannot be
    /// modified from outside this gallery.
    fn revision(&self) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
}

impl<T: GalleryStore + ?Sized> GalleryStore for Box<T> {
    fn list_identities(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_identities()
    }

    fn load_reference_images(&self, identity: &str) -> Result<Vec<ReferenceImage>, StoreError> {
        (**self).load_reference_images(identity)
    }

    fn add_reference_image(&self, identity: &str, image: &[u8]) -> Result<String, StoreError> {
        (**self).add_reference_image(identity, image)
    }

    fn remove_reference_image(&self, identity: &str, source: &str) -> Result<(), StoreError> {
        (**self).remove_reference_image(identity, source)
    }

    fn remove_identity(&self, identity: &str) -> Result<usize, StoreError> {
        (**self).remove_identity(identity)
    }

    fn revision(&self) -> Result<Option<String>, StoreError> {
        (**self).revision()
    }
}

/// Reject labels that cannot be encoded as a gallery file stem.
pub fn validate_label(label: &str) -> Result<(), StoreError> {
    let reason = if label.is_empty() {
        "label is empty"
    } else if label.len() > MAX_LABEL_LEN {
        "label is longer than 128 bytes"
    } else if label.starts_with('.') {
        "label starts with '.'"
    } else if label.contains(['/', '\\', '\0']) {
        "label contains a path separator or NUL"
    } else if label.contains(INDEX_SEPARATOR) {
        "label contains '__'"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidIdentity {
        label: label.to_string(),
        reason,
    })
}

/// File extension for an encoded photo, by content.
pub fn stored_extension(image: &[u8]) -> Result<&'static str, StoreError> {
    match image::guess_format(image) {
        Ok(ImageFormat::Jpeg) => Ok("jpg"),
        Ok(ImageFormat::Png) => Ok("png"),
        _ => Err(StoreError::UnsupportedFormat),
    }
}

fn file_name(label: &str, index: u32, ext: &str) -> String {
    if index == 0 {
        format!("{label}.{ext}")
    } else {
        format!("{label}{INDEX_SEPARATOR}{index}.{ext}")
    }
}

/// Split a gallery file name into `(label, index)`. `None` for anything
/// that is not a well-formed gallery photo name.
pub fn parse_file_name(name: &str) -> Option<(String, u32)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if !EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)) {
        return None;
    }
    let (label, index) = match stem.rsplit_once(INDEX_SEPARATOR) {
        Some((label, n)) => {
            if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let index: u32 = n.parse().ok()?;
            if index == 0 {
                return None;
            }
            (label, index)
        }
        None => (stem, 0),
    };
    validate_label(label).ok()?;
    Some((label.to_string(), index))
}

#[derive(Debug)]
struct GalleryFile {
    name: String,
    path: PathBuf,
    label: String,
    index: u32,
    len: u64,
    modified: SystemTime,
}

/// Flat-directory gallery, compatible with an existing `known_faces/` folder.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// A store over `root`; the directory is created on the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Like [`DirectoryStore::new`] but creates the directory up front.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root).map_err(|e| store.io_error(&store.root, e))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io_error(&self, path: &Path, source: io::Error) -> StoreError {
        StoreError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Every well-formed photo, sorted by label then index.
    fn scan(&self) -> Result<Vec<GalleryFile>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(&self.root, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io_error(&self.root, e))?;
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some((label, index)) = parse_file_name(&name) else {
                if !name.starts_with('.') {
                    tracing::debug!(file = %name, "ignoring non-gallery file");
                }
                continue;
            };
            let meta = entry.metadata().map_err(|e| self.io_error(&path, e))?;
            if !meta.is_file() {
                continue;
            }
            files.push(GalleryFile {
                name,
                path,
                label,
                index,
                len: meta.len(),
                modified: meta.modified().unwrap_or(UNIX_EPOCH),
            });
        }

        files.sort_by(|a, b| {
            (a.label.as_str(), a.index, a.name.as_str()).cmp(&(b.label.as_str(), b.index, b.name.as_str()))
        });
        Ok(files)
    }

    fn files_of(&self, identity: &str) -> Result<Vec<GalleryFile>, StoreError> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|f| f.label == identity)
            .collect())
    }
}

impl GalleryStore for DirectoryStore {
    fn list_identities(&self) -> Result<Vec<String>, StoreError> {
        let mut first_seen: HashMap<String, SystemTime> = HashMap::new();
        for file in self.scan()? {
            first_seen
                .entry(file.label)
                .and_modify(|t| *t = (*t).min(file.modified))
                .or_insert(file.modified);
        }
        let mut labels: Vec<(String, SystemTime)> = first_seen.into_iter().collect();
        labels.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        Ok(labels.into_iter().map(|(label, _)| label).collect())
    }

    fn load_reference_images(&self, identity: &str) -> Result<Vec<ReferenceImage>, StoreError> {
        self.files_of(identity)?
            .into_iter()
            .map(|f| {
                let bytes = fs::read(&f.path).map_err(|e| self.io_error(&f.path, e))?;
                Ok(ReferenceImage {
                    source: f.name,
                    bytes,
                })
            })
            .collect()
    }

    fn add_reference_image(&self, identity: &str, image: &[u8]) -> Result<String, StoreError> {
        validate_label(identity)?;
        let ext = stored_extension(image)?;
        fs::create_dir_all(&self.root).map_err(|e| self.io_error(&self.root, e))?;

        let index = self
            .files_of(identity)?
            .iter()
            .map(|f| f.index + 1)
            .max()
            .unwrap_or(0);
        let name = file_name(identity, index, ext);
        let path = self.root.join(&name);

        // Dot-prefixed temp files are never listed, so a crash mid-write
        // cannot leave a truncated photo in the gallery.
        let tmp = self.root.join(format!(".{name}.tmp"));
        fs::write(&tmp, image).map_err(|e| self.io_error(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(self.io_error(&path, e));
        }

        tracing::debug!(identity, file = %name, "stored reference photo");
        Ok(name)
    }

    fn remove_reference_image(&self, identity: &str, source: &str) -> Result<(), StoreError> {
        match parse_file_name(source) {
            Some((label, _)) if label == identity => {}
            _ => return Err(StoreError::UnknownReference(source.to_string())),
        }
        let path = self.root.join(source);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::UnknownReference(source.to_string()))
            }
            Err(e) => Err(self.io_error(&path, e)),
        }
    }

    fn remove_identity(&self, identity: &str) -> Result<usize, StoreError> {
        validate_label(identity)?;
        let files = self.files_of(identity)?;
        if files.is_empty() {
            return Err(StoreError::UnknownIdentity(identity.to_string()));
        }
        // Keep going past failures so one stuck file does not strand the rest.
        let mut removed = 0;
        let mut first_error = None;
        for file in &files {
            match fs::remove_file(&file.path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(identity, file = %file.name, error = %e, "failed to delete reference photo");
                    first_error.get_or_insert(self.io_error(&file.path, e));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        tracing::info!(identity, photos = removed, "removed identity from gallery directory");
        Ok(removed)
    }

    /// Digest of every photo's name, size and mtime.
    fn revision(&self) -> Result<Option<String>, StoreError> {
        let mut hasher = Sha256::new();
        for file in self.scan()? {
            let modified = file
                .modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            hasher.update(file.name.as_bytes());
            hasher.update([0]);
            hasher.update(file.len.to_le_bytes());
            hasher.update(modified.to_le_bytes());
        }
        Ok(Some(format!("{:x}", hasher.finalize())))
    }
}

#[derive(Debug)]
struct MemoryIdentity {
    label: String,
    images: Vec<ReferenceImage>,
    next_index: u32,
}

/// In-process gallery with the same naming and ordering rules as
/// [`DirectoryStore`]; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: Mutex<Vec<MemoryIdentity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GalleryStore for MemoryStore {
    fn list_identities(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .identities
            .lock()
            .iter()
            .map(|i| i.label.clone())
            .collect())
    }

    fn load_reference_images(&self, identity: &str) -> Result<Vec<ReferenceImage>, StoreError> {
        Ok(self
            .identities
            .lock()
            .iter()
            .find(|i| i.label == identity)
            .map(|i| i.images.clone())
            .unwrap_or_default())
    }

    fn add_reference_image(&self, identity: &str, image: &[u8]) -> Result<String, StoreError> {
        validate_label(identity)?;
        let ext = stored_extension(image)?;

        let mut identities = self.identities.lock();
        let pos = match identities.iter().position(|i| i.label == identity) {
            Some(pos) => pos,
            None => {
                identities.push(MemoryIdentity {
                    label: identity.to_string(),
                    images: Vec::new(),
                    next_index: 0,
                });
                identities.len() - 1
            }
        };
        let slot = &mut identities[pos];
        let source = file_name(identity, slot.next_index, ext);
        slot.next_index += 1;
        slot.images.push(ReferenceImage {
            source: source.clone(),
            bytes: image.to_vec(),
        });
        Ok(source)
    }

    fn remove_reference_image(&self, identity: &str, source: &str) -> Result<(), StoreError> {
        let mut identities = self.identities.lock();
        let pos = identities
            .iter()
            .position(|i| i.label == identity)
            .ok_or_else(|| StoreError::UnknownReference(source.to_string()))?;
        let images = &mut identities[pos].images;
        let before = images.len();
        images.retain(|img| img.source != source);
        if images.len() == before {
            return Err(StoreError::UnknownReference(source.to_string()));
        }
        if images.is_empty() {
            identities.remove(pos);
        }
        Ok(())
    }

    fn remove_identity(&self, identity: &str) -> Result<usize, StoreError> {
        let mut identities = self.identities.lock();
        let pos = identities
            .iter()
            .position(|i| i.label == identity)
            .ok_or_else(|| StoreError::UnknownIdentity(identity.to_string()))?;
        Ok(identities.remove(pos).images.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::testing::gray_png;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, bytes: &[u8], age_secs: u64) {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[test]
    fn test_validate_label() {
        assert!(validate_label("S001").is_ok());
        assert!(validate_label("Ada Lovelace").is_ok());
        for bad in ["", ".hidden", "a/b", "a\\b", "nul\0", "a__b"] {
            assert!(
                matches!(validate_label(bad), Err(StoreError::InvalidIdentity { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_label(&"x".repeat(MAX_LABEL_LEN)).is_ok());
        assert!(validate_label(&"x".repeat(MAX_LABEL_LEN + 1)).is_err());
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("S001.jpg"), Some(("S001".into(), 0)));
        assert_eq!(parse_file_name("S001.JPEG"), Some(("S001".into(), 0)));
        assert_eq!(parse_file_name("S001__3.png"), Some(("S001".into(), 3)));
        assert_eq!(parse_file_name("S001.gif"), None);
        assert_eq!(parse_file_name("S001__0.jpg"), None);
        assert_eq!(parse_file_name("S001__x.jpg"), None);
        assert_eq!(parse_file_name("S001__+1.jpg"), None);
        assert_eq!(parse_file_name(".S001.jpg.tmp"), None);
        assert_eq!(parse_file_name("noext"), None);
    }

    #[test]
    fn test_directory_add_assigns_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("known_faces"));

        assert_eq!(store.add_reference_image("S001", &gray_png(100)).unwrap(), "S001.png");
        assert_eq!(store.add_reference_image("S001", &gray_png(110)).unwrap(), "S001__1.png");
        assert_eq!(store.add_reference_image("S002", &gray_png(120)).unwrap(), "S002.png");

        let photos = store.load_reference_images("S001").unwrap();
        let names: Vec<&str> = photos.iter().map(|p| p.source.as_str()).collect();
        assert_eq!(names, ["S001.png", "S001__1.png"]);
        assert_eq!(photos[1].bytes, gray_png(110));
        assert!(store.load_reference_images("S404").unwrap().is_empty());
    }

    #[test]
    fn test_directory_rejects_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        assert!(matches!(
            store.add_reference_image("S001", b"GIF89a...."),
            Err(StoreError::UnsupportedFormat)
        ));
        assert!(store.list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_directory_lists_by_first_photo_time() {
        let dir = tempfile::tempdir().unwrap();
        let png = gray_png(100);
        touch(dir.path(), "zed.jpg", &png, 300);
        touch(dir.path(), "amy.png", &png, 100);
        touch(dir.path(), "amy__1.png", &png, 10);
        touch(dir.path(), "bob.jpeg", &png, 100);
        touch(dir.path(), "notes.txt", b"hello", 500);
        touch(dir.path(), ".amy.png.tmp", &png, 900);

        let store = DirectoryStore::new(dir.path());
        assert_eq!(store.list_identities().unwrap(), ["zed", "amy", "bob"]);
    }

    #[test]
    fn test_directory_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("absent"));
        assert!(store.list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_directory_remove_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.add_reference_image("S001", &gray_png(100)).unwrap();
        store.add_reference_image("S001", &gray_png(101)).unwrap();
        store.add_reference_image("S0011", &gray_png(102)).unwrap();

        assert_eq!(store.remove_identity("S001").unwrap(), 2);
        assert_eq!(store.list_identities().unwrap(), ["S0011"]);
        assert!(matches!(
            store.remove_identity("S001"),
            Err(StoreError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn test_directory_revision_tracks_outside_edits() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        let empty = store.revision().unwrap();
        assert!(empty.is_some());

        store.add_reference_image("S001", &gray_png(100)).unwrap();
        let enrolled = store.revision().unwrap();
        assert_ne!(enrolled, empty);
        assert_eq!(store.revision().unwrap(), enrolled);

        // Non-gallery files do not count.
        touch(dir.path(), "notes.txt", b"hello", 0);
        assert_eq!(store.revision().unwrap(), enrolled);

        // Another handle on the same directory sees the same changes.
        let other = DirectoryStore::new(dir.path());
        assert_eq!(other.revision().unwrap(), enrolled);
        other.remove_identity("S001").unwrap();
        assert_ne!(store.revision().unwrap(), enrolled);

        assert_eq!(MemoryStore::new().revision().unwrap(), None);
    }

    #[test]
    fn test_directory_index_continues_after_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        store.add_reference_image("S001", &gray_png(100)).unwrap();
        let second = store.add_reference_image("S001", &gray_png(101)).unwrap();
        store.remove_reference_image("S001", "S001.png").unwrap();

        assert_eq!(second, "S001__1.png");
        assert_eq!(store.add_reference_image("S001", &gray_png(102)).unwrap(), "S001__2.png");
        assert!(matches!(
            store.remove_reference_image("S002", "S001__1.png"),
            Err(StoreError::UnknownReference(_))
        ));
    }

    #[test]
    fn test_memory_store_mirrors_directory_rules() {
        let store = MemoryStore::new();
        assert_eq!(store.add_reference_image("b", &gray_png(1)).unwrap(), "b.png");
        assert_eq!(store.add_reference_image("a", &gray_png(2)).unwrap(), "a.png");
        assert_eq!(store.add_reference_image("b", &gray_png(3)).unwrap(), "b__1.png");
        assert_eq!(store.list_identities().unwrap(), ["b", "a"]);
        assert!(store.add_reference_image("", &gray_png(1)).is_err());

        store.remove_reference_image("a", "a.png").unwrap();
        assert_eq!(store.list_identities().unwrap(), ["b"]);
        assert_eq!(store.remove_identity("b").unwrap(), 2);
        assert!(matches!(store.remove_identity("b"), Err(StoreError::UnknownIdentity(_))));
    }
}

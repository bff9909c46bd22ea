//! Gallery Maintenance: the only write path into the Decision Cache.
//!
//! Matching reads the cache under a shared lock; enrollment, pruning and
//! refresh serialize on a maintenance mutex and publish their result under
//! the exclusive lock, so a decision never mixes two gallery states.
//!
//! Stores that can change underneath the process report a revision. Every
//! frame compares it with the revision the cache was built from and rescans
//! on a mismatch, so edits made by the admin CLI are seen by the next match.

use crate::cache::{fingerprint, CacheError, DecisionCache};
use crate::store::{stored_extension, validate_label, GalleryStore, StoreError};
use image::ImageFormat;
use parking_lot::{Mutex, RwLock};
use rollcall_core::{
    Embedding, FacePipeline, GalleryEntry, MatchDecision, Matcher, NoMatchReason, ProbeError,
    ReferenceEmbedding,
};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("unknown identity {0:?}")]
    UnknownIdentity(String),
}

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("no face found in photo {index}")]
    NoFaceInPhoto { index: usize },
    #[error("identity {0:?} is already enrolled")]
    DuplicateLabel(String),
    #[error("{0}")]
    InvalidIdentity(StoreError),
    #[error("photo {index} is not usable for recognition: {reason}")]
    LowQualityPhoto { index: usize, reason: String },
    #[error("photo {index} could not be decoded")]
    UndecodablePhoto { index: usize },
    #[error("photo embedding has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no photos submitted")]
    NoPhotos,
    #[error("gallery storage failed: {0}")]
    Storage(StoreError),
}

impl EnrollmentError {
    /// Stable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            EnrollmentError::NoFaceInPhoto { .. } => "no_face_in_photo",
            EnrollmentError::DuplicateLabel(_) => "duplicate_label_conflict",
            EnrollmentError::InvalidIdentity(_) => "invalid_identity",
            EnrollmentError::LowQualityPhoto { .. } => "low_quality_photo",
            EnrollmentError::UndecodablePhoto { .. } => "undecodable_photo",
            EnrollmentError::DimensionMismatch { .. } => "dimension_mismatch",
            EnrollmentError::NoPhotos => "no_photos",
            EnrollmentError::Storage(_) => "storage",
        }
    }

    fn from_probe(index: usize, err: ProbeError) -> Self {
        match err {
            ProbeError::Undecodable(_) => EnrollmentError::UndecodablePhoto { index },
            ProbeError::NoFace => EnrollmentError::NoFaceInPhoto { index },
            ProbeError::DimensionMismatch { expected, actual } => {
                EnrollmentError::DimensionMismatch { expected, actual }
            }
            other @ (ProbeError::LowQuality(_) | ProbeError::Locator(_)) => EnrollmentError::LowQualityPhoto {
                index,
                reason: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for EnrollmentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidIdentity { .. } => EnrollmentError::InvalidIdentity(err),
            other => EnrollmentError::Storage(other),
        }
    }
}

impl From<CacheError> for EnrollmentError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::DimensionMismatch { expected, actual } => {
                EnrollmentError::DimensionMismatch { expected, actual }
            }
        }
    }
}

/// What to do when the label is already enrolled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnrollPolicy {
    /// Fail with `duplicate_label_conflict`.
    #[default]
    CreateNew,
    /// Add the photos as further references.
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollReport {
    pub identity: String,
    /// The identity did not exist before this request.
    pub created: bool,
    /// Source names of the newly stored photos.
    pub stored: Vec<String>,
    /// Photos skipped because identical content is already enrolled.
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPhoto {
    pub identity: String,
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub identities: usize,
    pub references: usize,
    /// Photos run through the embedder during this load.
    pub embedded: usize,
    /// Photos whose cached embedding was kept (fingerprint unchanged).
    pub reused: usize,
    pub skipped: Vec<SkippedPhoto>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub identity: String,
    pub references: usize,
}

/// A photo that passed validation, ready to be written.
struct PreparedPhoto<'a> {
    bytes: Cow<'a, [u8]>,
    fingerprint: String,
    embedding: Embedding,
}

/// Re-encode anything the store cannot hold as PNG.
fn storable(bytes: &[u8]) -> Result<Cow<'_, [u8]>, image::ImageError> {
    if stored_extension(bytes).is_ok() {
        return Ok(Cow::Borrowed(bytes));
    }
    let img = image::load_from_memory(bytes)?;
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(Cow::Owned(buf.into_inner()))
}

/// Enrolled gallery plus the matching policy applied to it.
pub struct Gallery<S> {
    store: S,
    matcher: Box<dyn Matcher + Send + Sync>,
    cache: RwLock<DecisionCache>,
    maintenance: Mutex<()>,
    /// Store revision the cache was last built from.
    synced: Mutex<Option<String>>,
}

impl<S: GalleryStore> Gallery<S> {
    /// A gallery with an empty cache. Call [`Gallery::refresh`] to load the store.
    pub fn new(store: S, matcher: impl Matcher + Send + Sync + 'static) -> Self {
        Self {
            store,
            matcher: Box::new(matcher),
            cache: RwLock::new(DecisionCache::new()),
            maintenance: Mutex::new(()),
            synced: Mutex::new(None),
        }
    }

    /// Build the gallery and embed every stored photo.
    pub fn load(
        store: S,
        matcher: impl Matcher + Send + Sync + 'static,
        pipeline: &mut FacePipeline,
    ) -> Result<(Self, LoadReport), GalleryError> {
        let gallery = Self::new(store, matcher);
        let report = gallery.refresh(pipeline)?;
        Ok((gallery, report))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rescan the store and swap in the result. Unchanged photos keep their
    /// cached embedding; photos without a usable face are skipped.
    pub fn refresh(&self, pipeline: &mut FacePipeline) -> Result<LoadReport, GalleryError> {
        let _maintenance = self.maintenance.lock();
        // Read before scanning: a change made mid-scan leaves a stale
        // revision behind and is picked up by the next sync.
        let revision = self.store.revision()?;

        let (known, previous_order): (HashMap<(String, String), Embedding>, HashMap<String, usize>) = {
            let cache = self.cache.read();
            let known = cache
                .entries()
                .iter()
                .flat_map(|e| {
                    e.references
                        .iter()
                        .map(|r| ((e.identity.clone(), r.fingerprint.clone()), r.embedding.clone()))
                })
                .collect();
            let order = cache
                .entries()
                .iter()
                .enumerate()
                .map(|(i, e)| (e.identity.clone(), i))
                .collect();
            (known, order)
        };

        let mut report = LoadReport::default();
        let mut entries = Vec::new();
        for label in self.store.list_identities()? {
            let mut entry = GalleryEntry::new(label.clone());
            for image in self.store.load_reference_images(&label)? {
                let fp = fingerprint(&image.bytes);
                if entry.has_fingerprint(&fp) {
                    continue;
                }
                let embedding = match known.get(&(label.clone(), fp.clone())) {
                    Some(embedding) => {
                        report.reused += 1;
                        embedding.clone()
                    }
                    None => match pipeline.probe(&image.bytes) {
                        Ok(probe) => {
                            report.embedded += 1;
                            probe.embedding
                        }
                        Err(e) => {
                            tracing::warn!(
                                identity = %label,
                                source = %image.source,
                                error = %e,
                                "skipping unusable gallery photo"
                            );
                            report.skipped.push(SkippedPhoto {
                                identity: label.clone(),
                                source: image.source,
                                reason: e.to_string(),
                            });
                            continue;
                        }
                    },
                };
                entry.references.push(ReferenceEmbedding {
                    source: image.source,
                    fingerprint: fp,
                    embedding,
                });
            }
            if !entry.references.is_empty() {
                report.references += entry.references.len();
                entries.push(entry);
            }
        }

        // Identities already cached keep their enrollment position.
        entries.sort_by_key(|e| previous_order.get(&e.identity).copied().unwrap_or(usize::MAX));
        report.identities = entries.len();

        self.cache.write().replace(entries)?;
        *self.synced.lock() = revision;
        tracing::info!(
            identities = report.identities,
            references = report.references,
            embedded = report.embedded,
            reused = report.reused,
            skipped = report.skipped.len(),
            "gallery loaded"
        );
        Ok(report)
    }

    /// Enroll photos for `label`.
    ///
    /// Every photo is validated before anything is written; the first
    /// failure rejects the whole request and leaves the gallery unchanged.
    pub fn enroll(
        &self,
        pipeline: &mut FacePipeline,
        label: &str,
        images: &[Vec<u8>],
        policy: EnrollPolicy,
    ) -> Result<EnrollReport, EnrollmentError> {
        validate_label(label)?;
        if images.is_empty() {
            return Err(EnrollmentError::NoPhotos);
        }

        let mut prepared: Vec<PreparedPhoto<'_>> = Vec::with_capacity(images.len());
        for (index, bytes) in images.iter().enumerate() {
            let probe = pipeline
                .probe(bytes)
                .map_err(|e| EnrollmentError::from_probe(index, e))?;
            let bytes = storable(bytes).map_err(|_| EnrollmentError::UndecodablePhoto { index })?;
            prepared.push(PreparedPhoto {
                fingerprint: fingerprint(&bytes),
                bytes,
                embedding: probe.embedding,
            });
        }

        let _maintenance = self.maintenance.lock();

        let existing_fingerprints: Vec<String> = {
            let cache = self.cache.read();
            if let Some(photo) = prepared.first() {
                cache.check_dimension(&photo.embedding)?;
            }
            cache
                .get(label)
                .map(|e| e.references.iter().map(|r| r.fingerprint.clone()).collect())
                .unwrap_or_default()
        };
        let exists = !existing_fingerprints.is_empty()
            || self.store.list_identities()?.iter().any(|l| l == label);
        if exists && policy == EnrollPolicy::CreateNew {
            return Err(EnrollmentError::DuplicateLabel(label.to_string()));
        }

        let mut seen = existing_fingerprints;
        let mut duplicates = 0;
        let mut references = Vec::new();
        for photo in prepared {
            if seen.contains(&photo.fingerprint) {
                duplicates += 1;
                continue;
            }
            seen.push(photo.fingerprint.clone());

            *self.synced.lock() = None;
            let source = match self.store.add_reference_image(label, &photo.bytes) {
                Ok(source) => source,
                Err(e) => {
                    self.rollback(label, &references);
                    return Err(e.into());
                }
            };
            references.push(ReferenceEmbedding {
                source,
                fingerprint: photo.fingerprint,
                embedding: photo.embedding,
            });
        }

        let stored: Vec<String> = references.iter().map(|r| r.source.clone()).collect();
        if !references.is_empty() {
            if let Err(e) = self.cache.write().insert(label, references.clone()) {
                self.rollback(label, &references);
                return Err(e.into());
            }
        }

        tracing::info!(
            identity = label,
            created = !exists,
            stored = stored.len(),
            duplicates,
            "enrolled"
        );
        Ok(EnrollReport {
            identity: label.to_string(),
            created: !exists,
            stored,
            duplicates,
        })
    }

    /// Remove photos this request already wrote.
    fn rollback(&self, label: &str, written: &[ReferenceEmbedding]) {
        for reference in written {
            if let Err(e) = self.store.remove_reference_image(label, &reference.source) {
                tracing::warn!(
                    identity = label,
                    source = %reference.source,
                    error = %e,
                    "failed to roll back enrollment photo"
                );
            }
        }
    }

    /// Prune `label` from the cache and the store. Once this returns, no
    /// decision can name `label`.
    pub fn remove_identity(&self, label: &str) -> Result<usize, GalleryError> {
        validate_label(label)?;
        let _maintenance = self.maintenance.lock();

        let (position, evicted) = {
            let mut cache = self.cache.write();
            (cache.position(label), cache.evict(label))
        };
        let result = self.store.remove_identity(label);
        *self.synced.lock() = None;
        let removed = match result {
            Ok(n) => n,
            Err(StoreError::UnknownIdentity(_)) if evicted.is_some() => 0,
            Err(StoreError::UnknownIdentity(_)) => {
                return Err(GalleryError::UnknownIdentity(label.to_string()))
            }
            Err(e) => {
                if let (Some(position), Some(entry)) = (position, evicted) {
                    self.restore_survivors(position, entry);
                }
                return Err(e.into());
            }
        };

        tracing::info!(identity = label, photos = removed, "identity removed");
        Ok(removed)
    }

    /// After a failed removal, put back the references whose photos are still
    /// in the store so cache and store agree again.
    fn restore_survivors(&self, position: usize, mut entry: GalleryEntry) {
        let remaining = match self.store.load_reference_images(&entry.identity) {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!(identity = %entry.identity, error = %e, "cannot read back photos after failed removal");
                return;
            }
        };
        entry
            .references
            .retain(|r| remaining.iter().any(|img| img.source == r.source));
        tracing::warn!(
            identity = %entry.identity,
            references = entry.references.len(),
            "removal incomplete, keeping remaining photos enrolled"
        );
        self.cache.write().restore(position, entry);
    }

    /// Rescan if the store changed since the cache was built, e.g. because
    /// another process edited the gallery directory. Returns the load report
    /// when a rescan happened.
    pub fn sync(&self, pipeline: &mut FacePipeline) -> Result<Option<LoadReport>, GalleryError> {
        let Some(current) = self.store.revision()? else {
            return Ok(None);
        };
        if self.synced.lock().as_deref() == Some(current.as_str()) {
            return Ok(None);
        }
        tracing::info!("gallery store changed, rescanning");
        self.refresh(pipeline).map(Some)
    }

    /// Match a probe embedding against the current gallery.
    pub fn identify(&self, probe: &Embedding) -> MatchDecision {
        let cache = self.cache.read();
        self.matcher.decide(probe, cache.entries())
    }

    /// Decode, locate, embed and match one uploaded image. Every failure
    /// becomes a `NoMatch` decision.
    pub fn process_frame(&self, pipeline: &mut FacePipeline, image: &[u8]) -> MatchDecision {
        if let Err(e) = self.sync(pipeline) {
            tracing::error!(error = %e, "gallery rescan failed");
            return MatchDecision::no_match(NoMatchReason::Unavailable);
        }
        let decision = match pipeline.probe(image) {
            Ok(probe) => self.identify(&probe.embedding),
            Err(e) => {
                tracing::debug!(error = %e, "no usable probe");
                MatchDecision::no_match(e.reason())
            }
        };
        tracing::debug!(?decision, "frame processed");
        decision
    }

    /// Enrolled identities in enrollment order.
    pub fn identities(&self) -> Vec<IdentitySummary> {
        self.cache
            .read()
            .entries()
            .iter()
            .map(|e| IdentitySummary {
                identity: e.identity.clone(),
                references: e.references.len(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Bumped on every cache mutation.
    pub fn generation(&self) -> u64 {
        self.cache.read().generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DirectoryStore, MemoryStore, ReferenceImage};
    use rollcall_core::testing::{fake_pipeline, gray_png, TableEmbedder};
    use rollcall_core::testing::FACELESS;
    use rollcall_core::{DistanceMetric, MarginMatcher};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    // Gray levels mapped to fixed 2-d embeddings.
    const ALICE: u8 = 100;
    const ALICE_ALT: u8 = 101;
    const BOB: u8 = 150;
    const CAROL: u8 = 200;
    const BLACK: u8 = 0;
    const SMUDGE: u8 = 90;

    fn embedder() -> TableEmbedder {
        TableEmbedder::new(2)
            .with(ALICE, vec![1.0, 0.0])
            .with(ALICE_ALT, vec![0.99, 0.05])
            .with(BOB, vec![0.0, 1.0])
            .with(CAROL, vec![-1.0, 0.0])
    }

    fn matcher() -> MarginMatcher {
        MarginMatcher::new(DistanceMetric::Euclidean, 0.4, 0.1)
    }

    fn gallery<S: GalleryStore>(store: S) -> (Gallery<S>, FacePipeline, TableEmbedder) {
        let embedder = embedder();
        let mut pipeline = fake_pipeline(embedder.clone());
        let (gallery, _) = Gallery::load(store, matcher(), &mut pipeline).unwrap();
        (gallery, pipeline, embedder)
    }

    fn matched(decision: &MatchDecision) -> Option<&str> {
        decision.identity()
    }

    #[test]
    fn test_empty_gallery_rejects_any_probe() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        let decision = gallery.process_frame(&mut pipeline, &gray_png(ALICE));
        assert_eq!(decision.reason(), Some(NoMatchReason::DistanceAboveThreshold));
    }

    #[test]
    fn test_enroll_then_match() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        let report = gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap();
        assert!(report.created);
        assert_eq!(report.stored, ["S001.png"]);

        let decision = gallery.process_frame(&mut pipeline, &gray_png(ALICE));
        assert_eq!(matched(&decision), Some("S001"));
        assert_eq!(gallery.identities()[0].references, 1);
    }

    #[test]
    fn test_enroll_photo_without_face_leaves_gallery_unchanged() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        let generation = gallery.generation();

        let err = gallery
            .enroll(
                &mut pipeline,
                "S001",
                &[gray_png(ALICE), gray_png(BLACK)],
                EnrollPolicy::CreateNew,
            )
            .unwrap_err();

        assert!(matches!(err, EnrollmentError::NoFaceInPhoto { index: 1 }));
        assert_eq!(err.code(), "no_face_in_photo");
        assert!(gallery.is_empty());
        assert_eq!(gallery.generation(), generation);
        assert!(gallery.store().list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_enroll_photo_with_nothing_located_is_rejected() {
        let (gallery, mut pipeline, embedder) = gallery(MemoryStore::new());
        let before = embedder.calls().load(Ordering::SeqCst);

        let err = gallery
            .enroll(
                &mut pipeline,
                "S001",
                &[gray_png(ALICE), gray_png(FACELESS)],
                EnrollPolicy::CreateNew,
            )
            .unwrap_err();

        assert!(matches!(err, EnrollmentError::NoFaceInPhoto { index: 1 }));
        assert!(gallery.is_empty());
        assert!(gallery.store().list_identities().unwrap().is_empty());
        // Only the first photo reached the embedder.
        assert_eq!(embedder.calls().load(Ordering::SeqCst) - before, 1);
    }

    #[test]
    fn test_enroll_error_codes() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        let cases: Vec<(Vec<Vec<u8>>, &str)> = vec![
            (vec![], "no_photos"),
            (vec![b"not an image".to_vec()], "undecodable_photo"),
            (vec![gray_png(SMUDGE)], "low_quality_photo"),
        ];
        for (images, code) in cases {
            let err = gallery
                .enroll(&mut pipeline, "S001", &images, EnrollPolicy::CreateNew)
                .unwrap_err();
            assert_eq!(err.code(), code);
        }
        let err = gallery
            .enroll(&mut pipeline, "../etc", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_identity");
    }

    #[test]
    fn test_duplicate_label_policy() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap();

        let err = gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE_ALT)], EnrollPolicy::CreateNew)
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::DuplicateLabel(_)));
        assert_eq!(err.code(), "duplicate_label_conflict");

        let report = gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE_ALT)], EnrollPolicy::Append)
            .unwrap();
        assert!(!report.created);
        assert_eq!(report.stored, ["S001__1.png"]);
        assert_eq!(gallery.identities()[0].references, 2);
    }

    #[test]
    fn test_reenrolling_same_photo_is_idempotent() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap();
        gallery
            .enroll(&mut pipeline, "S002", &[gray_png(BOB)], EnrollPolicy::CreateNew)
            .unwrap();
        let before = gallery.process_frame(&mut pipeline, &gray_png(ALICE));

        let report = gallery
            .enroll(
                &mut pipeline,
                "S001",
                &[gray_png(ALICE), gray_png(ALICE)],
                EnrollPolicy::Append,
            )
            .unwrap();

        assert_eq!(report.duplicates, 2);
        assert!(report.stored.is_empty());
        assert_eq!(gallery.store().load_reference_images("S001").unwrap().len(), 1);
        assert_eq!(gallery.process_frame(&mut pipeline, &gray_png(ALICE)), before);
    }

    #[test]
    fn test_ambiguous_between_close_identities() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap();
        gallery
            .enroll(&mut pipeline, "S002", &[gray_png(ALICE_ALT)], EnrollPolicy::CreateNew)
            .unwrap();

        let decision = gallery.process_frame(&mut pipeline, &gray_png(ALICE));
        assert_eq!(decision.reason(), Some(NoMatchReason::AmbiguousMargin));
    }

    #[test]
    fn test_process_frame_never_faults() {
        let (gallery, mut pipeline, embedder) = gallery(MemoryStore::new());
        gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap();
        let calls = embedder.calls();
        let before = calls.load(Ordering::SeqCst);

        let cases = [
            (b"garbage".to_vec(), NoMatchReason::NoFaceDetected),
            (Vec::new(), NoMatchReason::NoFaceDetected),
            (gray_png(BLACK), NoMatchReason::NoFaceDetected),
            (gray_png(SMUDGE), NoMatchReason::LowQualityEmbedding),
            (gray_png(CAROL), NoMatchReason::DistanceAboveThreshold),
        ];
        for (bytes, reason) in cases {
            assert_eq!(gallery.process_frame(&mut pipeline, &bytes).reason(), Some(reason));
        }
        // Only the smudged and the unknown face reached the embedder.
        assert_eq!(calls.load(Ordering::SeqCst) - before, 2);
    }

    #[test]
    fn test_remove_identity() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap();

        assert_eq!(gallery.remove_identity("S001").unwrap(), 1);
        assert!(gallery.is_empty());
        assert_eq!(
            gallery.process_frame(&mut pipeline, &gray_png(ALICE)).reason(),
            Some(NoMatchReason::DistanceAboveThreshold)
        );
        assert!(matches!(
            gallery.remove_identity("S001"),
            Err(GalleryError::UnknownIdentity(_))
        ));
        assert!(matches!(
            gallery.remove_identity("../S001"),
            Err(GalleryError::Store(StoreError::InvalidIdentity { .. }))
        ));
    }

    #[test]
    fn test_no_match_after_remove_returns() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        gallery
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap();
        gallery
            .enroll(&mut pipeline, "S002", &[gray_png(BOB)], EnrollPolicy::CreateNew)
            .unwrap();

        let gallery = Arc::new(gallery);
        let removed = Arc::new(AtomicBool::new(false));
        let probe = Embedding::new(vec![1.0, 0.0]);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let gallery = Arc::clone(&gallery);
                let removed = Arc::clone(&removed);
                let probe = probe.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let was_removed = removed.load(Ordering::SeqCst);
                        let decision = gallery.identify(&probe);
                        if was_removed {
                            assert_ne!(decision.identity(), Some("S001"));
                        }
                    }
                })
            })
            .collect();

        gallery.remove_identity("S001").unwrap();
        removed.store(true, Ordering::SeqCst);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_ne!(gallery.identify(&probe).identity(), Some("S001"));
    }

    #[test]
    fn test_enrolled_identity_visible_to_next_match() {
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        for (label, level) in [("S001", ALICE), ("S002", BOB), ("S003", CAROL)] {
            gallery
                .enroll(&mut pipeline, label, &[gray_png(level)], EnrollPolicy::CreateNew)
                .unwrap();
            assert_eq!(matched(&gallery.process_frame(&mut pipeline, &gray_png(level))), Some(label));
        }
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.add_reference_image("S001", &gray_png(ALICE)).unwrap();
        store.add_reference_image("S001", &gray_png(ALICE_ALT)).unwrap();
        store.add_reference_image("S002", &gray_png(BOB)).unwrap();
        store.add_reference_image("S003", &gray_png(BLACK)).unwrap();

        let embedder = embedder();
        let mut pipeline = fake_pipeline(embedder.clone());
        let (gallery, report) = Gallery::load(store, matcher(), &mut pipeline).unwrap();

        assert_eq!(report.identities, 2);
        assert_eq!(report.references, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].identity, "S003");
        assert_eq!(matched(&gallery.process_frame(&mut pipeline, &gray_png(BOB))), Some("S002"));
    }

    #[test]
    fn test_refresh_reembeds_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.add_reference_image("S001", &gray_png(ALICE)).unwrap();
        store.add_reference_image("S002", &gray_png(BOB)).unwrap();
        let (gallery, mut pipeline, embedder) = gallery(store);
        let calls = embedder.calls();
        let before = calls.load(Ordering::SeqCst);

        // Another process edits the directory.
        std::fs::write(dir.path().join("S002.png"), gray_png(CAROL)).unwrap();
        std::fs::write(dir.path().join("S004.png"), gray_png(ALICE_ALT)).unwrap();

        let report = gallery.refresh(&mut pipeline).unwrap();
        assert_eq!(report.reused, 1);
        assert_eq!(report.embedded, 2);
        assert_eq!(calls.load(Ordering::SeqCst) - before, 2);

        let order: Vec<String> = gallery.identities().into_iter().map(|s| s.identity).collect();
        assert_eq!(order, ["S001", "S002", "S004"]);
        assert_eq!(matched(&gallery.process_frame(&mut pipeline, &gray_png(CAROL))), Some("S002"));

        std::fs::remove_file(dir.path().join("S004.png")).unwrap();
        gallery.refresh(&mut pipeline).unwrap();
        assert_eq!(gallery.len(), 2);
    }

    /// Store whose writes start failing after a number of successes, and
    /// whose identity removal optionally gives up after the first photo.
    struct FlakyStore {
        inner: MemoryStore,
        writes_left: Mutex<usize>,
        partial_removal: bool,
    }

    fn disk_error(msg: &str) -> StoreError {
        StoreError::Storage {
            path: "flaky".into(),
            source: std::io::Error::other(msg.to_string()),
        }
    }

    impl GalleryStore for FlakyStore {
        fn list_identities(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_identities()
        }

        fn load_reference_images(&self, identity: &str) -> Result<Vec<ReferenceImage>, StoreError> {
            self.inner.load_reference_images(identity)
        }

        fn add_reference_image(&self, identity: &str, image: &[u8]) -> Result<String, StoreError> {
            let mut left = self.writes_left.lock();
            if *left == 0 {
                return Err(disk_error("disk full"));
            }
            *left -= 1;
            self.inner.add_reference_image(identity, image)
        }

        fn remove_reference_image(&self, identity: &str, source: &str) -> Result<(), StoreError> {
            self.inner.remove_reference_image(identity, source)
        }

        fn remove_identity(&self, identity: &str) -> Result<usize, StoreError> {
            if !self.partial_removal {
                return self.inner.remove_identity(identity);
            }
            let images = self.inner.load_reference_images(identity)?;
            if let Some(first) = images.first() {
                self.inner.remove_reference_image(identity, &first.source)?;
            }
            Err(disk_error("permission denied"))
        }
    }

    #[test]
    fn test_failed_write_rolls_back_request() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            writes_left: Mutex::new(1),
            partial_removal: false,
        };
        let (gallery, mut pipeline, _) = gallery(store);

        let err = gallery
            .enroll(
                &mut pipeline,
                "S001",
                &[gray_png(ALICE), gray_png(ALICE_ALT)],
                EnrollPolicy::CreateNew,
            )
            .unwrap_err();

        assert_eq!(err.code(), "storage");
        assert!(gallery.is_empty());
        assert!(gallery.store().list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_partial_removal_keeps_cache_in_step_with_store() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            writes_left: Mutex::new(usize::MAX),
            partial_removal: true,
        };
        let (gallery, mut pipeline, embedder) = gallery(store);
        gallery
            .enroll(
                &mut pipeline,
                "S001",
                &[gray_png(ALICE), gray_png(ALICE_ALT)],
                EnrollPolicy::CreateNew,
            )
            .unwrap();
        gallery
            .enroll(&mut pipeline, "S002", &[gray_png(BOB)], EnrollPolicy::CreateNew)
            .unwrap();

        let err = gallery.remove_identity("S001").unwrap_err();
        assert!(matches!(err, GalleryError::Store(StoreError::Storage { .. })));

        // The photo left behind is still enrolled, in its original slot.
        let summary = gallery.identities();
        assert_eq!(summary[0].identity, "S001");
        assert_eq!(summary[0].references, 1);
        assert_eq!(summary[1].identity, "S002");
        let remaining = gallery.store().load_reference_images("S001").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].source, "S001__1.png");
        assert_eq!(matched(&gallery.process_frame(&mut pipeline, &gray_png(ALICE))), Some("S001"));

        // A rescan finds exactly what the cache already holds.
        let calls = embedder.calls().load(Ordering::SeqCst);
        let report = gallery.refresh(&mut pipeline).unwrap();
        assert_eq!(report.reused, 2);
        assert_eq!(report.embedded, 0);
        assert_eq!(embedder.calls().load(Ordering::SeqCst), calls);
        assert_eq!(gallery.identities(), summary);
    }

    #[test]
    fn test_changes_from_another_gallery_handle_reach_next_match() {
        let dir = tempfile::tempdir().unwrap();
        let (daemon, mut pipeline, embedder) = gallery(DirectoryStore::open(dir.path()).unwrap());
        daemon
            .enroll(&mut pipeline, "S001", &[gray_png(ALICE)], EnrollPolicy::CreateNew)
            .unwrap();
        assert_eq!(matched(&daemon.process_frame(&mut pipeline, &gray_png(ALICE))), Some("S001"));

        // A separate handle on the same directory, as the admin CLI opens it.
        let admin = Gallery::new(DirectoryStore::new(dir.path()), matcher());
        assert_eq!(admin.remove_identity("S001").unwrap(), 1);
        assert_eq!(
            daemon.process_frame(&mut pipeline, &gray_png(ALICE)).reason(),
            Some(NoMatchReason::DistanceAboveThreshold)
        );
        assert!(daemon.is_empty());

        let mut admin_pipeline = fake_pipeline(embedder.clone());
        admin
            .enroll(&mut admin_pipeline, "S002", &[gray_png(BOB)], EnrollPolicy::CreateNew)
            .unwrap();
        assert_eq!(matched(&daemon.process_frame(&mut pipeline, &gray_png(BOB))), Some("S002"));
    }

    #[test]
    fn test_unchanged_directory_is_not_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.add_reference_image("S001", &gray_png(ALICE)).unwrap();
        let (gallery, mut pipeline, embedder) = gallery(store);
        let generation = gallery.generation();
        let before = embedder.calls().load(Ordering::SeqCst);

        for _ in 0..3 {
            assert_eq!(matched(&gallery.process_frame(&mut pipeline, &gray_png(ALICE))), Some("S001"));
        }
        assert!(gallery.sync(&mut pipeline).unwrap().is_none());
        // One embedding per frame, none for gallery photos.
        assert_eq!(embedder.calls().load(Ordering::SeqCst) - before, 3);
        assert_eq!(gallery.generation(), generation);
    }

    #[test]
    fn test_non_png_input_stored_as_png() {
        let bmp = {
            let img = image::GrayImage::from_pixel(8, 8, image::Luma([ALICE]));
            let mut buf = Cursor::new(Vec::new());
            img.write_to(&mut buf, ImageFormat::Bmp).unwrap();
            buf.into_inner()
        };
        let (gallery, mut pipeline, _) = gallery(MemoryStore::new());
        let report = gallery
            .enroll(&mut pipeline, "S001", &[bmp], EnrollPolicy::CreateNew)
            .unwrap();
        assert_eq!(report.stored, ["S001.png"]);
    }
}

//! rollcall-gallery: enrolled reference photos and the in-memory view the
//! matcher runs against.
//!
//! [`GalleryStore`] is the source of truth (a directory of labelled photos
//! by default), [`DecisionCache`] holds their embeddings, and [`Gallery`]
//! keeps the two consistent through enrollment, pruning and refresh.

pub mod cache;
pub mod gallery;
pub mod store;

pub use cache::{fingerprint, CacheError, DecisionCache};
pub use gallery::{
    EnrollPolicy, EnrollReport, EnrollmentError, Gallery, GalleryError, IdentitySummary, LoadReport,
    SkippedPhoto,
};
pub use store::{validate_label, DirectoryStore, GalleryStore, MemoryStore, ReferenceImage, StoreError};

//! Decision Cache: gallery embeddings held in memory so a probe never
//! triggers re-embedding of the gallery.

use rollcall_core::{Embedding, GalleryEntry, ReferenceEmbedding};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("embedding has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Hex SHA-256 of a reference photo's stored bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Identity → reference embeddings, in enrollment order.
///
/// Every reference shares one dimension. Each mutation bumps `generation`.
#[derive(Debug, Clone, Default)]
pub struct DecisionCache {
    entries: Vec<GalleryEntry>,
    generation: u64,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn get(&self, identity: &str) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.get(identity).is_some()
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reference_count(&self) -> usize {
        self.entries.iter().map(|e| e.references.len()).sum()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Dimension shared by every cached embedding; `None` while empty.
    pub fn dimension(&self) -> Option<usize> {
        self.entries
            .iter()
            .flat_map(|e| e.references.iter())
            .map(|r| r.embedding.dimension())
            .next()
    }

    pub fn check_dimension(&self, embedding: &Embedding) -> Result<(), CacheError> {
        match self.dimension() {
            Some(expected) if expected != embedding.dimension() => Err(CacheError::DimensionMismatch {
                expected,
                actual: embedding.dimension(),
            }),
            _ => Ok(()),
        }
    }

    /// Add references to `identity`, appending the identity if it is new.
    /// References whose fingerprint the identity already holds are skipped.
    /// Returns how many were added; nothing changes on error.
    pub fn insert(&mut self, identity: &str, references: Vec<ReferenceEmbedding>) -> Result<usize, CacheError> {
        let expected = self
            .dimension()
            .or_else(|| references.first().map(|r| r.embedding.dimension()));
        if let Some(expected) = expected {
            if let Some(bad) = references.iter().find(|r| r.embedding.dimension() != expected) {
                return Err(CacheError::DimensionMismatch {
                    expected,
                    actual: bad.embedding.dimension(),
                });
            }
        }

        let pos = match self.entries.iter().position(|e| e.identity == identity) {
            Some(pos) => pos,
            None => {
                self.entries.push(GalleryEntry::new(identity));
                self.entries.len() - 1
            }
        };
        let entry = &mut self.entries[pos];
        let mut added = 0;
        for reference in references {
            if entry.has_fingerprint(&reference.fingerprint) {
                continue;
            }
            entry.references.push(reference);
            added += 1;
        }
        if entry.references.is_empty() {
            self.entries.remove(pos);
        }
        if added > 0 {
            self.generation += 1;
        }
        Ok(added)
    }

    /// Drop `identity` and all of its embeddings.
    pub fn evict(&mut self, identity: &str) -> Option<GalleryEntry> {
        let pos = self.entries.iter().position(|e| e.identity == identity)?;
        self.generation += 1;
        Some(self.entries.remove(pos))
    }

    /// Position of `identity` in enrollment order.
    pub fn position(&self, identity: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.identity == identity)
    }

    /// Put a previously evicted entry back at `position`, or at the end when
    /// the mapping has since shrunk. Empty entries are dropped.
    pub fn restore(&mut self, position: usize, entry: GalleryEntry) {
        if entry.references.is_empty() || self.position(&entry.identity).is_some() {
            return;
        }
        let position = position.min(self.entries.len());
        self.entries.insert(position, entry);
        self.generation += 1;
    }

    /// Swap in a freshly built mapping in one step.
    pub fn replace(&mut self, entries: Vec<GalleryEntry>) -> Result<(), CacheError> {
        let mut dims = entries
            .iter()
            .flat_map(|e| e.references.iter())
            .map(|r| r.embedding.dimension());
        if let Some(expected) = dims.next() {
            if let Some(actual) = dims.find(|&d| d != expected) {
                return Err(CacheError::DimensionMismatch { expected, actual });
            }
        }

        self.entries = entries
            .into_iter()
            .filter(|e| !e.references.is_empty())
            .collect();
        self.generation += 1;
        Ok(())
    }
}

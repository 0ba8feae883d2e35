//! Blob descriptors and the digest-keyed blob table.
//!
//! A blob is an opaque byte sequence identified by its SHA-1 message digest.
//! Blobs are single-instanced: every stream of every inode that carries the
//! same content references the same descriptor.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use sha1::{Digest, Sha1};

use crate::error::Error;
use crate::inode::Inode;
use crate::Result;

pub const SHA1_HASH_SIZE: usize = 20;

pub type BlobRef = Rc<RefCell<BlobDescriptor>>;

/// A SHA-1 message digest. The all-zero digest stands for "no data".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Sha1Hash(pub [u8; SHA1_HASH_SIZE]);

impl Sha1Hash {
    pub const ZERO: Sha1Hash = Sha1Hash([0; SHA1_HASH_SIZE]);

    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({self})")
    }
}

/// Where a blob's data currently lives.
#[derive(Debug, Clone, Default)]
pub enum BlobLocation {
    /// The data does not exist yet (scratch metadata, pipe placeholders).
    #[default]
    NoData,
    /// A byte range inside an archive's resource area. The core cannot read
    /// this on its own; the outer container owns that I/O.
    InArchive { offset: u64, size: u64 },
    InFileOnDisk(PathBuf),
    InAttachedBuffer(Vec<u8>),
    InStagingFile(PathBuf),
    InHostFile(PathBuf),
}

/// Back-pointer from an unhashed blob to the single stream that references
/// it. Unhashed blobs can only be joined with duplicates once digested.
pub struct UnhashedProvenance {
    pub back_inode: Weak<RefCell<Inode>>,
    pub back_stream_id: u32,
}

pub struct BlobDescriptor {
    hash: Sha1Hash,
    /// Set iff the digest has not been computed yet. `hash` is meaningless
    /// and `provenance` identifies the one referencing stream.
    pub unhashed: bool,
    pub provenance: Option<UnhashedProvenance>,
    pub size: u64,
    pub location: BlobLocation,
    /// Hard-link-weighted number of stream references across all loaded
    /// images sharing the owning blob table.
    pub refcnt: u32,
    /// Planner- or export-scoped reference count. Always reset to 0 on
    /// operation boundaries.
    pub out_refcnt: u32,
    pub is_metadata: bool,
    pub corrupted: bool,
    pub was_exported: bool,
    /// Planner-scoped extraction targets, one per (inode, stream) the blob
    /// will be materialized into. Cleared when the operation ends.
    pub extraction_targets: Vec<BlobExtractionTarget>,
}

/// One stream, and the inode it belongs to, that a blob is extracted to.
#[derive(Clone)]
pub struct BlobExtractionTarget {
    pub inode: Rc<RefCell<Inode>>,
    pub stream_id: u32,
}

impl BlobDescriptor {
    pub fn new(hash: Sha1Hash) -> Self {
        Self {
            hash,
            unhashed: false,
            provenance: None,
            size: 0,
            location: BlobLocation::NoData,
            refcnt: 0,
            out_refcnt: 0,
            is_metadata: false,
            corrupted: false,
            was_exported: false,
            extraction_targets: Vec::new(),
        }
    }

    pub fn new_unhashed(back_inode: Weak<RefCell<Inode>>, back_stream_id: u32) -> Self {
        let mut blob = Self::new(Sha1Hash::ZERO);
        blob.unhashed = true;
        blob.provenance = Some(UnhashedProvenance {
            back_inode,
            back_stream_id,
        });
        blob
    }

    pub fn hash(&self) -> Sha1Hash {
        debug_assert!(!self.unhashed);
        self.hash
    }

    /// Record a freshly computed digest, making the blob joinable with
    /// duplicates.
    pub fn set_hashed(&mut self, hash: Sha1Hash) {
        self.hash = hash;
        self.unhashed = false;
        self.provenance = None;
    }

    /// Read the blob's full contents. Only locations the core can reach by
    /// itself are supported; `InArchive` data is the container's business.
    pub fn read_data(&self) -> Result<Vec<u8>> {
        match &self.location {
            BlobLocation::InAttachedBuffer(buf) => Ok(buf.clone()),
            BlobLocation::InFileOnDisk(path)
            | BlobLocation::InStagingFile(path)
            | BlobLocation::InHostFile(path) => {
                std::fs::read(path).map_err(|_| Error::Read(path.display().to_string()))
            }
            BlobLocation::NoData | BlobLocation::InArchive { .. } => {
                Err(Error::BlobNotFound(self.hash))
            }
        }
    }

    /// Forget where the data came from (e.g. when the backing archive range
    /// is about to be rewritten). The descriptor becomes scratch.
    pub fn release_location(&mut self) {
        self.location = BlobLocation::NoData;
    }

    pub fn clone_for_export(&self) -> Self {
        Self {
            hash: self.hash,
            unhashed: self.unhashed,
            provenance: None,
            size: self.size,
            location: self.location.clone(),
            refcnt: 0,
            out_refcnt: 0,
            is_metadata: self.is_metadata,
            corrupted: self.corrupted,
            was_exported: true,
            extraction_targets: Vec::new(),
        }
    }
}

impl fmt::Debug for BlobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobDescriptor")
            .field("hash", &self.hash)
            .field("unhashed", &self.unhashed)
            .field("size", &self.size)
            .field("refcnt", &self.refcnt)
            .finish()
    }
}

/// The set of known (hashed) blob descriptors of one archive, keyed by
/// digest. Hashed blobs are unique by digest.
#[derive(Default)]
pub struct BlobTable {
    map: HashMap<Sha1Hash, BlobRef>,
}

impl BlobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn lookup(&self, hash: &Sha1Hash) -> Option<BlobRef> {
        self.map.get(hash).cloned()
    }

    /// Insert a hashed descriptor. The caller must ensure no descriptor with
    /// the same digest is present.
    pub fn insert(&mut self, blob: BlobRef) {
        let hash = blob.borrow().hash();
        debug_assert!(!self.map.contains_key(&hash));
        self.map.insert(hash, blob);
    }

    pub fn remove(&mut self, hash: &Sha1Hash) -> Option<BlobRef> {
        self.map.remove(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlobRef> {
        self.map.values()
    }

    /// Find the blob for `data`, or add a new descriptor carrying the data
    /// in an attached buffer. Returns the descriptor; the caller adjusts
    /// reference counts.
    pub fn blob_from_data(&mut self, data: &[u8]) -> BlobRef {
        let hash = Sha1Hash::of(data);
        match self.map.entry(hash) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let mut blob = BlobDescriptor::new(hash);
                blob.size = data.len() as u64;
                blob.location = BlobLocation::InAttachedBuffer(data.to_vec());
                entry.insert(Rc::new(RefCell::new(blob))).clone()
            }
        }
    }

    /// Drop one reference. A blob whose refcnt reaches zero is removed from
    /// the table and freed.
    pub fn decrement_refcnt(&mut self, blob: &BlobRef) {
        let (hash, gone) = {
            let mut b = blob.borrow_mut();
            if b.refcnt == 0 {
                log::warn!("Reference count of blob {} already zero", b.hash);
                return;
            }
            b.refcnt -= 1;
            (b.hash, b.refcnt == 0 && !b.unhashed)
        };
        if gone {
            self.map.remove(&hash);
        }
    }
}

pub fn new_blob_ref(hash: Sha1Hash) -> BlobRef {
    Rc::new(RefCell::new(BlobDescriptor::new(hash)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_of_known_vector() {
        // SHA-1("abc")
        let hash = Sha1Hash::of(b"abc");
        assert_eq!(
            hash.to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert!(!hash.is_zero());
        assert!(Sha1Hash::ZERO.is_zero());
    }

    #[test]
    fn table_dedups_by_digest() {
        let mut table = BlobTable::new();
        let a = table.blob_from_data(b"world");
        let b = table.blob_from_data(b"world");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        assert_eq!(a.borrow().size, 5);
    }

    #[test]
    fn refcnt_zero_removes_blob() {
        let mut table = BlobTable::new();
        let blob = table.blob_from_data(b"data");
        blob.borrow_mut().refcnt = 2;
        table.decrement_refcnt(&blob);
        assert_eq!(table.len(), 1);
        table.decrement_refcnt(&blob);
        assert_eq!(table.len(), 0);
    }
}

//! The inode: a file object carrying attributes, timestamps, streams and the
//! list of dentries that alias it. WIM files have no on-disk inode; the
//! dentry record replicates this data per hard link and the codec folds the
//! copies back together after load.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use binrw::prelude::*;
use modular_bitfield::prelude::*;

use crate::binrw_util::prelude::FileTime;
use crate::blob::{new_blob_ref, BlobRef, BlobTable, Sha1Hash};
use crate::dentry::{ChildKey, Dentry, DentryRef};
use crate::error::Error;
use crate::reparse::{REPARSE_TAG_MOUNT_POINT, REPARSE_TAG_SYMLINK};
use crate::tagged_items::TaggedItems;
use crate::Result;

pub type InodeRef = Rc<RefCell<Inode>>;

/// Windows file attribute flags, as retrieved by GetFileAttributes().
#[bitfield]
#[derive(BinWrite, BinRead, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[bw(map = |&x| Self::into_bytes(x))]
pub struct FileAttributes {
    pub readonly: bool,
    pub hidden: bool,
    pub system: bool,
    #[skip]
    __: bool,

    pub directory: bool,
    pub archive: bool,
    pub device: bool,
    pub normal: bool,

    pub temporary: bool,
    pub sparse_file: bool,
    pub reparse_point: bool,
    pub compressed: bool,

    pub offline: bool,
    pub not_content_indexed: bool,
    pub encrypted: bool,
    pub integrity_stream: bool,

    pub virtual_file: bool,
    #[skip]
    __: B15,
}

/// The stream's role. The on-disk format has no type field; types are
/// inferred after parsing, see [`Inode::assign_stream_types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Data stream, may be unnamed (usual case) or named.
    Data,
    /// The reparse data, minus the 8-byte header that is reconstructed from
    /// the dentry record on extraction.
    ReparsePoint,
    /// Encrypted data in the EFSRPC raw data format, subsuming all of the
    /// file's data streams.
    EfsrpcRawData,
    /// Type could not be determined.
    Unknown,
}

enum StreamSource {
    Unresolved(Sha1Hash),
    Resolved(Option<BlobRef>),
}

/// A (type, name, content) tuple attached to an inode.
pub struct Stream {
    name: Vec<u16>,
    pub kind: StreamKind,
    stream_id: u32,
    source: StreamSource,
}

impl Stream {
    pub fn name(&self) -> &[u16] {
        &self.name
    }

    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.source, StreamSource::Resolved(_))
    }

    /// The stream's content digest: the stored hash when unresolved, the
    /// referenced blob's digest (or zero for an empty stream) when resolved.
    pub fn hash(&self) -> Sha1Hash {
        match &self.source {
            StreamSource::Unresolved(hash) => *hash,
            StreamSource::Resolved(Some(blob)) => blob.borrow().hash(),
            StreamSource::Resolved(None) => Sha1Hash::ZERO,
        }
    }

    /// The blob this stream references. Must only be called once the stream
    /// has been resolved; an empty stream resolves to `None`.
    pub fn blob_resolved(&self) -> Option<BlobRef> {
        match &self.source {
            StreamSource::Resolved(blob) => blob.clone(),
            StreamSource::Unresolved(_) => {
                debug_assert!(false, "stream is not resolved");
                None
            }
        }
    }

    pub fn set_hash(&mut self, hash: Sha1Hash) {
        self.source = StreamSource::Unresolved(hash);
    }

    pub fn set_blob(&mut self, blob: Option<BlobRef>) {
        self.source = StreamSource::Resolved(blob);
    }

    pub fn is_unnamed_data_stream(&self) -> bool {
        self.kind == StreamKind::Data && !self.is_named()
    }

    pub fn is_named_data_stream(&self) -> bool {
        self.kind == StreamKind::Data && self.is_named()
    }
}

pub struct Inode {
    pub attributes: FileAttributes,
    pub creation_time: FileTime,
    pub last_access_time: FileTime,
    pub last_write_time: FileTime,
    /// Index into the image's security descriptor table, or -1.
    pub security_id: i32,
    /// Preserved verbatim across a round trip; probably just padding.
    pub unknown_0x54: u32,
    /// The reserved block following subdir_offset, preserved verbatim.
    pub unused: [u64; 2],
    pub reparse_tag: u32,
    pub rp_reserved: u16,
    pub rp_flags: u16,
    /// Hard link group id. Not representable on disk for reparse points.
    pub ino: u64,
    streams: Vec<Stream>,
    next_stream_id: u32,
    /// Tagged metadata items read from the dentry record's trailing bytes.
    pub extra: Option<TaggedItems>,
    /// Child index of this directory, keyed by the two-level collation.
    pub(crate) children: BTreeMap<ChildKey, DentryRef>,
    aliases: Vec<Weak<RefCell<Dentry>>>,
    /// Must be reset to false after any operation that sets it.
    pub(crate) visited: bool,
    /// Aliases taking part in the current extraction. Planner-scoped.
    pub(crate) extraction_aliases: Vec<DentryRef>,
}

/// Flag in `rp_flags` meaning the absolute link target was stored verbatim,
/// without being made relative to the captured tree.
pub const WIM_RP_FLAG_NOT_FIXED: u16 = 0x0001;

impl Inode {
    pub fn new(set_timestamps: bool) -> Self {
        let now = if set_timestamps {
            FileTime::now()
        } else {
            FileTime::default()
        };
        Self {
            attributes: FileAttributes::new(),
            creation_time: now,
            last_access_time: now,
            last_write_time: now,
            security_id: -1,
            unknown_0x54: 0,
            unused: [0; 2],
            reparse_tag: 0,
            rp_reserved: 0,
            rp_flags: 0,
            ino: 0,
            streams: Vec::new(),
            next_stream_id: 0,
            extra: None,
            children: BTreeMap::new(),
            aliases: Vec::new(),
            visited: false,
            extraction_aliases: Vec::new(),
        }
    }

    /// A directory proper; reparse points are never treated as directories
    /// even when the DIRECTORY attribute is set.
    pub fn is_directory(&self) -> bool {
        self.attributes.directory() && !self.attributes.reparse_point()
    }

    pub fn is_symlink(&self) -> bool {
        self.attributes.reparse_point()
            && (self.reparse_tag == REPARSE_TAG_SYMLINK
                || self.reparse_tag == REPARSE_TAG_MOUNT_POINT)
    }

    pub fn is_encrypted(&self) -> bool {
        self.attributes.encrypted()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn has_security_descriptor(&self) -> bool {
        self.security_id >= 0
    }

    pub fn nlink(&self) -> u32 {
        self.aliases.len() as u32
    }

    pub fn aliases(&self) -> impl Iterator<Item = DentryRef> + '_ {
        self.aliases.iter().filter_map(|weak| weak.upgrade())
    }

    /// The aliases taking part in the current extraction, for backends that
    /// create one file and hard-link the rest. Only meaningful while an
    /// extraction is running.
    pub fn extraction_aliases(&self) -> &[DentryRef] {
        &self.extraction_aliases
    }

    pub(crate) fn add_alias(&mut self, dentry: &DentryRef) {
        self.aliases.push(Rc::downgrade(dentry));
    }

    pub(crate) fn remove_alias(&mut self, dentry: &DentryRef) {
        self.aliases
            .retain(|weak| !weak.ptr_eq(&Rc::downgrade(dentry)));
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [Stream] {
        &mut self.streams
    }

    pub fn stream_by_id(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.iter().find(|s| s.stream_id == stream_id)
    }

    /// Find the stream of the given type whose name matches `name`
    /// case-insensitively.
    pub fn get_stream(&self, kind: StreamKind, name: &[u16]) -> Option<&Stream> {
        self.streams.iter().find(|s| {
            s.kind == kind
                && crate::encoding::cmp_utf16le(&s.name, name, true) == std::cmp::Ordering::Equal
        })
    }

    pub fn get_unnamed_stream(&self, kind: StreamKind) -> Option<&Stream> {
        self.streams.iter().find(|s| s.kind == kind && !s.is_named())
    }

    pub fn unnamed_data_stream(&self) -> Option<&Stream> {
        self.get_unnamed_stream(StreamKind::Data)
    }

    pub fn has_named_data_stream(&self) -> bool {
        self.streams.iter().any(|s| s.is_named_data_stream())
    }

    /// Append a stream with an already-resolved blob reference. The blob's
    /// refcnt is the caller's business (see [`Inode::add_stream_with_data`]
    /// for the common case).
    pub fn add_stream(
        &mut self,
        kind: StreamKind,
        name: &[u16],
        blob: Option<BlobRef>,
    ) -> u32 {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.push(Stream {
            name: name.to_vec(),
            kind,
            stream_id,
            source: StreamSource::Resolved(blob),
        });
        stream_id
    }

    pub(crate) fn add_stream_unresolved(
        &mut self,
        kind: StreamKind,
        name: Vec<u16>,
        hash: Sha1Hash,
    ) -> u32 {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.push(Stream {
            name,
            kind,
            stream_id,
            source: StreamSource::Unresolved(hash),
        });
        stream_id
    }

    /// Append a stream whose content is `data`, entering the blob into the
    /// table (or reusing a duplicate) and taking one reference per alias.
    pub fn add_stream_with_data(
        &mut self,
        kind: StreamKind,
        name: &[u16],
        data: &[u8],
        table: &mut BlobTable,
    ) -> u32 {
        let blob = if data.is_empty() {
            None
        } else {
            let blob = table.blob_from_data(data);
            blob.borrow_mut().refcnt += self.nlink().max(1);
            Some(blob)
        };
        self.add_stream(kind, name, blob)
    }

    /// Remove a stream, releasing its blob references.
    pub fn remove_stream(&mut self, stream_id: u32, table: &mut BlobTable) {
        let Some(pos) = self.streams.iter().position(|s| s.stream_id == stream_id) else {
            return;
        };
        let stream = self.streams.remove(pos);
        if let StreamSource::Resolved(Some(blob)) = stream.source {
            for _ in 0..self.nlink().max(1) {
                table.decrement_refcnt(&blob);
            }
        }
    }

    /// Convert each stream's stored hash into a direct blob reference.
    ///
    /// With `force` set (pipe mode, where the blob table is not populated in
    /// advance), missing blobs are synthesized as empty descriptors keyed by
    /// the requested hash and inserted into the table.
    pub fn resolve_streams(&mut self, table: &mut BlobTable, force: bool) -> Result<()> {
        for stream in &mut self.streams {
            if stream.is_resolved() {
                continue;
            }
            let hash = stream.hash();
            let blob = if hash.is_zero() {
                None
            } else {
                match table.lookup(&hash) {
                    Some(blob) => Some(blob),
                    None if force => {
                        let blob = new_blob_ref(hash);
                        table.insert(blob.clone());
                        Some(blob)
                    }
                    None => return Err(Error::BlobNotFound(hash)),
                }
            };
            stream.set_blob(blob);
        }
        Ok(())
    }

    /// Take one reference to each resolved stream blob; used when a new
    /// alias is linked to this inode.
    pub fn ref_blobs(&self) {
        for stream in &self.streams {
            if let StreamSource::Resolved(Some(blob)) = &stream.source {
                blob.borrow_mut().refcnt += 1;
            }
        }
    }

    /// Drop one reference to each stream blob; used when an alias goes away.
    pub fn unref_blobs(&self, table: &mut BlobTable) {
        for stream in &self.streams {
            let blob = match &stream.source {
                StreamSource::Resolved(blob) => blob.clone(),
                StreamSource::Unresolved(hash) if !hash.is_zero() => table.lookup(hash),
                StreamSource::Unresolved(_) => None,
            };
            if let Some(blob) = blob {
                table.decrement_refcnt(&blob);
            }
        }
    }

    /// Assign a type to each stream after parsing a dentry record. The
    /// on-disk format carries no type field, so the types follow from the
    /// attributes and the stream layout.
    pub fn assign_stream_types(&mut self) {
        if self.attributes.encrypted() {
            for stream in &mut self.streams {
                if !stream.is_named() && !stream.hash().is_zero() {
                    stream.kind = StreamKind::EfsrpcRawData;
                    return;
                }
            }
            return;
        }

        let mut found_reparse_stream = false;
        let mut found_unnamed_data_stream = false;
        let reparse_point = self.attributes.reparse_point();
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if stream.is_named() {
                stream.kind = StreamKind::Data;
            } else if i != 0 || !stream.hash().is_zero() {
                // Unnamed extra stream entry, or a nonzero main_hash.
                if reparse_point && !found_reparse_stream {
                    found_reparse_stream = true;
                    stream.kind = StreamKind::ReparsePoint;
                } else if !found_unnamed_data_stream {
                    found_unnamed_data_stream = true;
                    stream.kind = StreamKind::Data;
                }
            }
        }

        if !found_reparse_stream && !found_unnamed_data_stream {
            // The synthetic first stream from main_hash gets typed even with
            // a zero hash, unless it was claimed above.
            if let Some(first) = self.streams.first_mut() {
                if first.kind == StreamKind::Unknown && !first.is_named() {
                    first.kind = if reparse_point {
                        StreamKind::ReparsePoint
                    } else {
                        StreamKind::Data
                    };
                }
            }
        }
    }

    pub(crate) fn clear_extraction_state(&mut self) {
        self.visited = false;
        self.extraction_aliases.clear();
    }
}

pub fn new_inode_ref(set_timestamps: bool) -> InodeRef {
    Rc::new(RefCell::new(Inode::new(set_timestamps)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_utf16;

    fn data_attrs() -> FileAttributes {
        FileAttributes::new().with_normal(true)
    }

    #[test]
    fn attributes_round_trip_bits() {
        let attrs = FileAttributes::new()
            .with_directory(true)
            .with_readonly(true);
        let bytes = FileAttributes::into_bytes(attrs);
        assert_eq!(u32::from_le_bytes(bytes), 0x11);
        assert_eq!(FileAttributes::from_bytes(bytes), attrs);
    }

    #[test]
    fn stream_ids_are_stable() {
        let mut inode = Inode::new(false);
        inode.attributes = data_attrs();
        let a = inode.add_stream(StreamKind::Data, &[], None);
        let b = inode.add_stream(StreamKind::Data, &encode_utf16("ads"), None);
        inode.remove_stream(a, &mut BlobTable::new());
        assert_eq!(inode.stream_by_id(b).map(|s| s.stream_id()), Some(b));
        let c = inode.add_stream(StreamKind::Data, &encode_utf16("other"), None);
        assert_ne!(b, c);
    }

    #[test]
    fn unencrypted_type_inference_prefers_reparse() {
        let mut inode = Inode::new(false);
        inode.attributes = FileAttributes::new().with_reparse_point(true);
        // main_hash slot with nonzero hash, plus one unnamed extra stream
        inode.add_stream_unresolved(StreamKind::Unknown, Vec::new(), Sha1Hash::of(b"rp"));
        inode.add_stream_unresolved(StreamKind::Unknown, Vec::new(), Sha1Hash::of(b"data"));
        inode.assign_stream_types();
        let kinds: Vec<_> = inode.streams().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StreamKind::ReparsePoint, StreamKind::Data]);
    }

    #[test]
    fn zero_main_hash_is_ignored_when_unnamed_extra_exists() {
        // Compatibility quirk: a zero main_hash stays untyped when at least
        // one unnamed extra stream carries the data.
        let mut inode = Inode::new(false);
        inode.attributes = data_attrs();
        inode.add_stream_unresolved(StreamKind::Unknown, Vec::new(), Sha1Hash::ZERO);
        inode.add_stream_unresolved(StreamKind::Unknown, Vec::new(), Sha1Hash::of(b"x"));
        inode.assign_stream_types();
        assert_eq!(inode.streams()[0].kind, StreamKind::Unknown);
        assert_eq!(inode.streams()[1].kind, StreamKind::Data);
    }

    #[test]
    fn lone_zero_main_hash_becomes_the_data_stream() {
        let mut inode = Inode::new(false);
        inode.attributes = data_attrs();
        inode.add_stream_unresolved(StreamKind::Unknown, Vec::new(), Sha1Hash::ZERO);
        inode.assign_stream_types();
        assert_eq!(inode.streams()[0].kind, StreamKind::Data);
    }

    #[test]
    fn encrypted_selects_first_unnamed_nonzero_stream() {
        let mut inode = Inode::new(false);
        inode.attributes = FileAttributes::new().with_encrypted(true);
        inode.add_stream_unresolved(StreamKind::Unknown, Vec::new(), Sha1Hash::ZERO);
        inode.add_stream_unresolved(StreamKind::Unknown, Vec::new(), Sha1Hash::of(b"efs"));
        inode.assign_stream_types();
        assert_eq!(inode.streams()[0].kind, StreamKind::Unknown);
        assert_eq!(inode.streams()[1].kind, StreamKind::EfsrpcRawData);
    }

    #[test]
    fn resolve_streams_force_synthesizes_descriptors() {
        let mut table = BlobTable::new();
        let mut inode = Inode::new(false);
        inode.attributes = data_attrs();
        let hash = Sha1Hash::of(b"pipe data");
        inode.add_stream_unresolved(StreamKind::Data, Vec::new(), hash);

        assert!(matches!(
            inode.resolve_streams(&mut table, false),
            Err(Error::BlobNotFound(_))
        ));
        inode.resolve_streams(&mut table, true).unwrap();
        assert!(table.lookup(&hash).is_some());
        assert_eq!(inode.streams()[0].hash(), hash);
    }
}

//! In-memory WIM (Windows Imaging) image trees: dentries, inodes and their
//! streams, the metadata resource codec, journaled image updates, and the
//! extraction planner.
//!
//! The archive container around the metadata resources (compression, the
//! on-disk blob table, XML document, integrity tables) is a separate
//! concern; this crate only consumes and produces the uncompressed metadata
//! resource byte ranges and plans extractions against a pluggable backend.

pub mod binrw_util;
pub mod blob;
pub mod dentry;
pub mod encoding;
pub mod error;
pub mod extract;
pub mod image;
pub mod inode;
pub mod journal;
pub mod metadata;
pub mod pattern;
pub mod reparse;
pub mod tagged_items;

pub use blob::{BlobDescriptor, BlobLocation, BlobRef, BlobTable, Sha1Hash};
pub use dentry::{Dentry, DentryRef};
pub use error::Error;
pub use extract::{ExtractBackend, ExtractFlags, SupportedFeatures};
pub use image::{ImageMetadata, Wim};
pub use inode::{FileAttributes, Inode, InodeRef, Stream, StreamKind};
pub use journal::UpdateCommand;
pub use metadata::SecurityData;

pub type Result<T> = std::result::Result<T, crate::Error>;

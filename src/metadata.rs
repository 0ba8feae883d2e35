//! The metadata resource: the uncompressed byte buffer holding an image's
//! security data and dentry tree.

pub mod codec;
pub mod security;

pub use codec::{prepare_metadata_resource, read_metadata_resource, DecodedMetadata};
pub use security::SecurityData;

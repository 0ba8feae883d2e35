use thiserror::Error;

use crate::blob::Sha1Hash;

/// Error type for all fallible operations on a WIM image tree.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid metadata resource: {0}")]
    InvalidMetadataResource(&'static str),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("Image {0} does not exist in the archive")]
    InvalidImage(usize),
    #[error("The archive already contains the maximum number of images")]
    ImageCountOverflow,
    #[error("Path \"{0}\" does not exist in the image")]
    PathDoesNotExist(String),
    #[error("\"{0}\" is not a directory")]
    NotADirectory(String),
    #[error("\"{0}\" is a directory")]
    IsADirectory(String),
    #[error("A file named \"{0}\" already exists")]
    NameCollision(String),
    #[error("Directory \"{0}\" is not empty")]
    NotEmpty(String),
    #[error("Moving \"{0}\" would create a loop in the directory tree")]
    Busy(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("No blob with hash {0} is present in the blob table")]
    BlobNotFound(Sha1Hash),
    #[error("Invalid reparse data: {0}")]
    InvalidReparseData(&'static str),
    #[error("Invalid extended attribute entry")]
    InvalidXattr,
    #[error("Failed to set security descriptor on \"{0}\"")]
    SetSecurity(String),
    #[error("Failed to set reparse data on \"{0}\"")]
    SetReparseData(String),
    #[error("Failed to set attributes on \"{0}\"")]
    SetAttributes(String),
    #[error("Failed to set short name on \"{0}\"")]
    SetShortName(String),
    #[error("Failed to set extended attributes on \"{0}\"")]
    SetXattr(String),
    #[error("Failed to open directory \"{0}\"")]
    OpenDir(String),
    #[error("Failed to create hard link \"{0}\"")]
    Link(String),
    #[error("Failed to create directory \"{0}\"")]
    Mkdir(String),
    #[error("Failed to open \"{0}\"")]
    Open(String),
    #[error("Failed to read \"{0}\"")]
    Read(String),
    #[error("Failed to write \"{0}\"")]
    Write(String),
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Binrw Error: {0}")]
    BinRWError(#[from] binrw::Error),
}

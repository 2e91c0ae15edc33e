use thiserror::Error;

/// The primary error type for the `bp` crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The bundle protocol version byte is unsupported.
    #[error("Unsupported bundle protocol version {0}")]
    InvalidVersion(u8),

    /// A block carries a body length that disagrees with its contents.
    #[error("Block length mismatch: declared {declared}, found {found}")]
    LengthMismatch { declared: u64, found: u64 },

    /// A bundle is missing the required payload block.
    #[error("Bundle has no payload block")]
    MissingPayload,

    /// The final block of a bundle does not carry the last-block flag.
    #[error("Final block of bundle is not flagged as the last block")]
    LastBlockNotLast,

    /// More than one block carries the last-block flag.
    #[error("Bundle has multiple blocks flagged as the last block")]
    DuplicateLastBlock,

    /// A dictionary offset points outside the dictionary.
    #[error("Dictionary offset {0} out of range")]
    BadDictionaryOffset(u64),

    /// The dictionary contains a byte sequence that is not a valid string.
    #[error("Dictionary entry is not valid UTF-8")]
    BadDictionaryEntry,

    /// Data was presented after the bundle was already complete.
    #[error("Data past the end of a complete bundle")]
    TrailingData,

    /// The fragment fields are inconsistent.
    #[error("Invalid fragment information: offset {0}, total length {1}")]
    InvalidFragmentInfo(u64, u64),

    /// A bundle has more than one block with the same block number (BPv7).
    #[error("Bundle has more than one block with block number {0}")]
    DuplicateBlockNumber(u64),

    /// A BPv7 block has an invalid block number for its type.
    #[error("Block type {1} cannot be block number {0}")]
    InvalidBlockNumber(u64, u8),

    /// A block CRC did not verify (BPv7).
    #[error("Block CRC check failed")]
    BadCrc,

    /// An unknown CRC type code (BPv7).
    #[error("Invalid CRC type {0}")]
    InvalidCrcType(u64),

    /// An error in an SDNV-encoded field.
    #[error(transparent)]
    InvalidSdnv(#[from] sdnv::SdnvError),

    /// An error in an endpoint identifier.
    #[error(transparent)]
    InvalidEid(#[from] eid::EidError),

    /// An error in CBOR-encoded data.
    #[error(transparent)]
    InvalidCbor(#[from] aloft_cbor::decode::Error),

    /// A generic error for when parsing a specific field fails.
    #[error("Failed to parse {field}: {source}")]
    InvalidField {
        field: &'static str,
        source: Box<dyn core::error::Error + Send + Sync>,
    },
}

use crate::sdnv;
use crate::eid;

/// Extension trait that maps an error into [`Error::InvalidField`] with the
/// name of the field being parsed.
pub trait CaptureFieldErr<T> {
    fn map_field_err(self, field: &'static str) -> Result<T, Error>;
}

impl<T, E> CaptureFieldErr<T> for Result<T, E>
where
    E: Into<Box<dyn core::error::Error + Send + Sync>>,
{
    fn map_field_err(self, field: &'static str) -> Result<T, Error> {
        self.map_err(|e| Error::InvalidField {
            field,
            source: e.into(),
        })
    }
}

use thiserror::Error;

/// Decoding and encoding failures.
///
/// `UnsupportedValue` and `UnsupportedMandatory` are recoverable at the
/// packet level: the former skips a single unknown TLV, the latter discards
/// the enclosing TLV while the rest of the packet is still processed. All
/// other variants abort the packet.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid packet magic")]
    InvalidMagic,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("buffer is too short")]
    TooShort,
    #[error("trailing bytes inside a declared length")]
    TooLong,
    #[error("invalid router-id")]
    InvalidRouterId,
    #[error("invalid address")]
    InvalidAddress,
    #[error("nonzero omitted octets without a current default prefix")]
    MissingDefaultPrefix,
    #[error("unsupported value type {0}")]
    UnsupportedValue(u8),
    #[error("unsupported but mandatory sub-TLV type {0}")]
    UnsupportedMandatory(u8),
    #[error("value type {0} is not allowed in the packet trailer")]
    InvalidValueForTrailer(u8),
}

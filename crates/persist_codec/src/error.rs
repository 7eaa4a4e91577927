//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while freezing or thawing a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value cannot be frozen.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// What went wrong.
        message: String,
    },

    /// A serde type could not be rebuilt from a value.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// What went wrong.
        message: String,
    },

    /// Floats have no canonical form here and are refused.
    #[error("float values are forbidden")]
    FloatForbidden,

    /// Indefinite-length items are refused.
    #[error("indefinite-length items are forbidden")]
    IndefiniteLengthForbidden,

    /// A text string was not UTF-8.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// The input ended inside an item.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Bytes were left over after the top-level item.
    #[error("{count} trailing bytes after value")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// The input is well-formed CBOR but not in canonical form, or is malformed.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// What was wrong.
        message: String,
    },

    /// A CBOR construct outside the supported value model.
    #[error("unsupported CBOR type: {type_name}")]
    UnsupportedType {
        /// Description of the construct.
        type_name: String,
    },

    /// An integer does not fit in `i64`.
    #[error("integer overflow")]
    IntegerOverflow,

    /// A length claim larger than the decoder will allocate for.
    #[error("size limit exceeded: claimed {claimed}, max {max_allowed}")]
    SizeLimitExceeded {
        /// Claimed length.
        claimed: u64,
        /// Largest accepted length.
        max_allowed: u64,
    },

    /// Containers nested deeper than the decoder allows.
    #[error("nesting deeper than {max_depth} levels")]
    NestingTooDeep {
        /// Largest accepted depth.
        max_depth: usize,
    },
}

impl CodecError {
    /// Creates an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Creates an unsupported type error.
    pub fn unsupported_type(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }
}

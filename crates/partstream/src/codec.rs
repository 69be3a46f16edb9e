use crate::{Error, Result};
use bytes::Bytes;
use core::fmt;

/// zstd level used for computation payloads. Payloads are built once per job
/// and sent to every partition, so ratio matters more than speed here.
const ZSTD_LEVEL: i32 = 3;

/// Compression applied to the serialized computation payload.
///
/// The tag travels with the payload in every init handshake so the receiver
/// knows how to reconstruct the descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Codec {
    #[default]
    None,
    Zstd,
}

impl Codec {
    /// Wire tag.
    pub const fn tag(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
        }
    }

    pub const fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Zstd),
            _ => None,
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the underlying compressor fails.
    pub fn compress(self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(input.to_vec()),
            Self::Zstd => zstd::encode_all(input, ZSTD_LEVEL).map_err(|e| Error::Codec {
                context: format!("zstd compress: {e}"),
            }),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Codec`] if `input` is not a valid frame for this
    /// codec.
    pub fn decompress(self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(input.to_vec()),
            Self::Zstd => zstd::decode_all(input).map_err(|e| Error::Codec {
                context: format!("zstd decompress: {e}"),
            }),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Zstd => f.write_str("zstd"),
        }
    }
}

/// The serialized computation payload plus the codec that produced it.
///
/// Built once per job, then shared (cheaply, via [`Bytes`]) by every init
/// handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    bytes: Bytes,
    codec: Codec,
}

impl Payload {
    /// Compresses `raw` with `codec`, falling back to the uncompressed bytes
    /// and [`Codec::None`] if compression fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyPayload`] if `raw` is empty.
    pub fn prepare(raw: Vec<u8>, codec: Codec) -> Result<Self> {
        Self::prepare_with(raw, codec, |raw| codec.compress(raw))
    }

    fn prepare_with(
        raw: Vec<u8>,
        codec: Codec,
        compress: impl FnOnce(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if codec == Codec::None {
            return Ok(Self::raw(raw));
        }
        match compress(&raw) {
            Ok(compressed) => Ok(Self {
                bytes: compressed.into(),
                codec,
            }),
            Err(e) => {
                tracing::warn!(%codec, "payload compression failed, sending raw: {e}");
                Ok(Self::raw(raw))
            }
        }
    }

    fn raw(raw: Vec<u8>) -> Self {
        Self {
            bytes: raw.into(),
            codec: Codec::None,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub const fn codec(&self) -> Codec {
        self.codec
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reverses [`Payload::prepare`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the bytes do not decode with the recorded
    /// codec.
    pub fn decode(&self) -> Result<Vec<u8>> {
        self.codec.decompress(&self.bytes)
    }
}

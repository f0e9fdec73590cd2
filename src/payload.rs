//! Payload factory and size sweep.
//!
//! Every request carries a single opaque byte-string field filled with a
//! repeated byte. The envelope is serialized once per size class with bincode;
//! the encoded buffer is what travels over the transport, and its length is
//! the serialized size used for throughput accounting.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::defaults::FILL_BYTE;

/// Payload sizes exercised by a full run, in bytes.
pub const STANDARD_SIZES: [u32; 15] = [
    256, 512, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000,
    1_000_000, 2_000_000, 4_000_000,
];

/// Message envelope published on every benchmark channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytesMessage {
    pub data: Vec<u8>,
}

impl BytesMessage {
    /// Create a message whose data field holds `size` copies of the fill byte
    pub fn filled(size: u32) -> Self {
        Self {
            data: vec![FILL_BYTE; size as usize],
        }
    }

    /// Serialize the message to bytes
    pub fn encode(&self) -> bincode::Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Deserialize bytes to a message
    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

/// Requested and on-the-wire size of one size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PayloadSpec {
    pub requested_size: u32,
    pub serialized_size: u64,
}

impl PayloadSpec {
    /// Compute the spec for a requested payload size
    pub fn new(requested_size: u32) -> bincode::Result<Self> {
        let serialized_size = bincode::serialized_size(&BytesMessage::filled(requested_size))?;
        Ok(Self {
            requested_size,
            serialized_size,
        })
    }
}

/// Build the encoded payload for a size class.
///
/// Returns the encoded buffer together with its spec; the spec's
/// serialized size always equals the buffer length.
pub fn build(requested_size: u32) -> bincode::Result<(Bytes, PayloadSpec)> {
    let encoded = BytesMessage::filled(requested_size).encode()?;
    let spec = PayloadSpec {
        requested_size,
        serialized_size: encoded.len() as u64,
    };
    Ok((encoded, spec))
}

/// Ordered set of size classes, strictly ascending and without duplicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeSweep {
    specs: Vec<PayloadSpec>,
}

impl SizeSweep {
    /// The full sweep from 256 bytes to 4 MB
    pub fn standard() -> bincode::Result<Self> {
        Self::from_sizes(STANDARD_SIZES)
    }

    /// Build a sweep from arbitrary sizes; sorts and removes duplicates.
    pub fn from_sizes<I>(sizes: I) -> bincode::Result<Self>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut sizes: Vec<u32> = sizes.into_iter().collect();
        sizes.sort_unstable();
        sizes.dedup();
        let specs = sizes
            .into_iter()
            .map(PayloadSpec::new)
            .collect::<bincode::Result<Vec<_>>>()?;
        Ok(Self { specs })
    }

    /// Keep only the size classes not larger than `max_size`
    pub fn truncated(&self, max_size: u32) -> Self {
        Self {
            specs: self
                .specs
                .iter()
                .copied()
                .filter(|spec| spec.requested_size <= max_size)
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PayloadSpec> {
        self.specs.iter()
    }

    pub fn sizes(&self) -> impl Iterator<Item = u32> + '_ {
        self.specs.iter().map(|spec| spec.requested_size)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Look up a size class by its requested size
    pub fn get(&self, requested_size: u32) -> Option<&PayloadSpec> {
        self.specs
            .binary_search_by_key(&requested_size, |spec| spec.requested_size)
            .ok()
            .and_then(|idx| self.specs.get(idx))
    }
}

impl<'a> IntoIterator for &'a SizeSweep {
    type Item = &'a PayloadSpec;
    type IntoIter = std::slice::Iter<'a, PayloadSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.specs.iter()
    }
}

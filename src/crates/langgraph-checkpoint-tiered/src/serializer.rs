//! Serialization protocol for checkpoints
//!
//! Every encoded payload carries a format tag next to its bytes
//! ([`TypedBytes`]). Readers dispatch on the tag, so records written under an
//! older default format stay readable after the default changes. A tag the
//! reader does not know is an error, never a guess.

use crate::error::{CheckpointError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Known encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    /// `serde_json` bytes; handles every application value
    Json,
    /// `bincode` bytes; compact, but only for types that do not need
    /// self-describing input (no `serde_json::Value`, no `flatten`)
    Bincode,
}

impl Format {
    /// Tag stored alongside the bytes
    pub fn tag(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Bincode => "bincode",
        }
    }

    /// Parse a stored tag
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "json" => Ok(Format::Json),
            "bincode" => Ok(Format::Bincode),
            other => Err(CheckpointError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Encoded bytes plus the tag of the format that produced them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedBytes {
    pub format: String,
    pub data: Vec<u8>,
}

impl TypedBytes {
    pub fn new(format: Format, data: Vec<u8>) -> Self {
        Self {
            format: format.tag().to_string(),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Protocol for serializing and deserializing checkpoint data
///
/// Implementations can provide custom serialization strategies
/// (JSON, bincode, ...). The tag returned by `dumps_typed` must be accepted
/// by `loads_typed` of the same implementation.
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to tagged bytes
    fn dumps_typed<T: Serialize>(&self, value: &T) -> Result<TypedBytes>;

    /// Deserialize tagged bytes, failing with `UnsupportedFormat` for tags
    /// this serializer cannot read
    fn loads_typed<T: DeserializeOwned>(&self, data: &TypedBytes) -> Result<T>;
}

fn encode<T: Serialize>(format: Format, value: &T) -> Result<TypedBytes> {
    let data = match format {
        Format::Json => serde_json::to_vec(value)?,
        Format::Bincode => bincode::serialize(value)?,
    };
    Ok(TypedBytes::new(format, data))
}

fn decode<T: DeserializeOwned>(format: Format, data: &[u8]) -> Result<T> {
    match format {
        Format::Json => Ok(serde_json::from_slice(data)?),
        Format::Bincode => Ok(bincode::deserialize(data)?),
    }
}

/// JSON-based serializer (default for application state)
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps_typed<T: Serialize>(&self, value: &T) -> Result<TypedBytes> {
        encode(Format::Json, value)
    }

    fn loads_typed<T: DeserializeOwned>(&self, data: &TypedBytes) -> Result<T> {
        match Format::from_tag(&data.format)? {
            Format::Json => decode(Format::Json, &data.data),
            Format::Bincode => Err(CheckpointError::UnsupportedFormat(data.format.clone())),
        }
    }
}

/// Binary serializer using bincode; used for the index record envelope
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps_typed<T: Serialize>(&self, value: &T) -> Result<TypedBytes> {
        encode(Format::Bincode, value)
    }

    fn loads_typed<T: DeserializeOwned>(&self, data: &TypedBytes) -> Result<T> {
        match Format::from_tag(&data.format)? {
            Format::Bincode => decode(Format::Bincode, &data.data),
            Format::Json => Err(CheckpointError::UnsupportedFormat(data.format.clone())),
        }
    }
}

/// Writes with one format, reads every known format
///
/// Use this when migrating a store from one encoding to another: old records
/// keep decoding while new ones are written with `write_format`.
#[derive(Debug, Clone)]
pub struct VersionedSerializer {
    write_format: Format,
}

impl VersionedSerializer {
    pub fn new(write_format: Format) -> Self {
        Self { write_format }
    }

    pub fn write_format(&self) -> Format {
        self.write_format
    }
}

impl Default for VersionedSerializer {
    fn default() -> Self {
        Self::new(Format::Json)
    }
}

impl SerializerProtocol for VersionedSerializer {
    fn dumps_typed<T: Serialize>(&self, value: &T) -> Result<TypedBytes> {
        encode(self.write_format, value)
    }

    fn loads_typed<T: DeserializeOwned>(&self, data: &TypedBytes) -> Result<T> {
        decode(Format::from_tag(&data.format)?, &data.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    fn sample() -> TestData {
        TestData {
            name: "test".to_string(),
            value: 42,
        }
    }

    #[test]
    fn test_json_serializer() {
        let serializer = JsonSerializer::new();
        let bytes = serializer.dumps_typed(&sample()).unwrap();
        assert_eq!(bytes.format, "json");

        let restored: TestData = serializer.loads_typed(&bytes).unwrap();
        assert_eq!(sample(), restored);
    }

    #[test]
    fn test_bincode_serializer() {
        let serializer = BincodeSerializer::new();
        let bytes = serializer.dumps_typed(&sample()).unwrap();
        assert_eq!(bytes.format, "bincode");

        let restored: TestData = serializer.loads_typed(&bytes).unwrap();
        assert_eq!(sample(), restored);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let serializer = VersionedSerializer::default();
        let bytes = TypedBytes {
            format: "msgpack".to_string(),
            data: vec![0x80],
        };

        let err = serializer.loads_typed::<TestData>(&bytes).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedFormat(tag) if tag == "msgpack"));
    }

    #[test]
    fn test_single_format_serializer_rejects_other_known_tag() {
        let bincode_bytes = BincodeSerializer::new().dumps_typed(&sample()).unwrap();
        let err = JsonSerializer::new()
            .loads_typed::<TestData>(&bincode_bytes)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_versioned_serializer_reads_old_format_after_switch() {
        let old = VersionedSerializer::new(Format::Json)
            .dumps_typed(&sample())
            .unwrap();
        let upgraded = VersionedSerializer::new(Format::Bincode);

        let restored: TestData = upgraded.loads_typed(&old).unwrap();
        assert_eq!(restored, sample());
        assert_eq!(upgraded.dumps_typed(&sample()).unwrap().format, "bincode");
    }
}

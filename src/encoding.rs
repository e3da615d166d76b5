//! Bincode is used to encode values, both in the key/value storage backing
//! the log and in messages handed to the transport. It is a Rust-specific
//! encoding that depends on the data structures being stable, which is
//! sufficient here since all cluster nodes run the same build.
//!
//! This module wraps the bincode crate to change the default options, in
//! particular to use variable-length rather than fixed-length integers.
//! Confusingly, upstream bincode::(de)serialize uses different options
//! (fixed) than DefaultOptions (variable) -- this module always uses
//! DefaultOptions.

use crate::error::Result;

use bincode::Options as _;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Serializes a value using Bincode.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode().serialize(value)?)
}

/// Adds automatic Bincode encode/decode methods to value types.
pub trait Value: serde::Serialize + serde::de::DeserializeOwned {
    fn encode(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let value = (42u64, Some("vote".to_string()));
        let bytes = serialize(&value).unwrap();
        assert_eq!(deserialize::<(u64, Option<String>)>(&bytes).unwrap(), value);
    }

    #[test]
    fn varint() {
        // Small integers should use a single byte, not eight.
        assert_eq!(serialize(&1u64).unwrap().len(), 1);
    }
}

use std::collections::BTreeMap;
use thiserror::Error;
pub mod decoder;
pub mod encoder;

/**
 * Represents a Bencode value, the core data structure for the Bencode encoding format.
 * Bencode is commonly used in the BitTorrent protocol for encoding metadata.
 *
 * The enum contains four variants that represent all possible Bencode data types:
 *
 * 1. String(Vec<u8>):
 *    - Represents a byte string in Bencode
 *    - Stored as raw bytes (Vec<u8>) rather than UTF-8 strings
 *    - Example: "4:spam" in Bencode becomes String(b"spam")
 *
 * 2. Integer(i64):
 *    - Represents a 64-bit signed integer
 *    - Bencode integers are prefixed with 'i' and suffixed with 'e'
 *    - Example: "i42e" in Bencode becomes Integer(42)
 *
 * 3. List(Vec<BencodeValue>):
 *    - Represents an ordered sequence of Bencode values
 *    - Lists are prefixed with 'l' and suffixed with 'e'
 *    - Example: "l4:spami42ee" becomes List([String(b"spam"), Integer(42)])
 *
 * 4. Dict(BTreeMap<Vec<u8>, BencodeValue>):
 *    - Represents a key-value mapping where keys are byte strings
 *    - Dictionaries are prefixed with 'd' and suffixed with 'e'
 *    - Backed by a BTreeMap rather than a HashMap so that iteration order is
 *      always the dictionary's sorted key order, matching the wire format's
 *      requirement that keys appear sorted - the encoder relies on this to
 *      avoid a separate sort pass.
 *    - Example: "d3:foo3:bare" becomes Dict({b"foo" => String(b"bar")})
 */
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Converts this value into a [`serde_json::Value`] for the `decode` CLI subcommand.
    ///
    /// Byte strings are rendered as UTF-8 where possible and lossily otherwise,
    /// since bencoded torrent metadata is expected to be mostly textual; dict
    /// keys go through the same conversion.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BencodeValue::Integer(i) => serde_json::Value::from(*i),
            BencodeValue::String(s) => serde_json::Value::String(String::from_utf8_lossy(s).into_owned()),
            BencodeValue::List(items) => {
                serde_json::Value::Array(items.iter().map(BencodeValue::to_json).collect())
            }
            BencodeValue::Dict(dict) => {
                let map = dict
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.to_json()))
                    .collect();
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Custom error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid string length")]
    InvalidStringLength,

    #[error("Unexpected end of input")]
    UnexpectedEOI,

    #[error("Cannot encode type")]
    CannotEncodeType(&'static str),

    #[error("Dictionary keys must be strings")]
    DictKeyNotString,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

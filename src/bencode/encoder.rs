use super::BencodeResult;
use super::BencodeValue;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// `BTreeMap` already iterates in sorted key order, so unlike the teacher's
/// `HashMap`-backed encoder this needs no separate sort pass to satisfy the
/// bencode spec's requirement that dictionary keys appear sorted.
#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &BTreeMap<Vec<u8>, BencodeValue>) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes `value` into `writer`, in its Bencode wire format.
#[instrument(skip(writer), level = "debug")]
pub fn encode_to_writer<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Encodes `value` into a freshly allocated buffer.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_to_writer(&mut buf, value).expect("encoding into an in-memory Vec<u8> cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder::decode;

    #[test]
    fn encodes_string() {
        assert_eq!(encode(&BencodeValue::String(b"hello".to_vec())), b"5:hello");
    }

    #[test]
    fn encodes_integer() {
        assert_eq!(encode(&BencodeValue::Integer(-42)), b"i-42e");
    }

    #[test]
    fn round_trips_dict_in_sorted_order() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zebra".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"apple".to_vec(), BencodeValue::Integer(2));
        let encoded = encode(&BencodeValue::Dict(dict));
        assert_eq!(encoded, b"d5:applei2e5:zebrai1ee");
        assert_eq!(decode(&encoded).unwrap(), decode(b"d5:applei2e5:zebrai1ee").unwrap());
    }
}

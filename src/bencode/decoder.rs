use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::BTreeMap;
use std::ops::Range;
use tracing::instrument;

/// Cursor over an in-memory bencode buffer.
///
/// The teacher's original decoder walked a `Peekable<io::Bytes<R>>` over any
/// `Read`, one byte at a time. Every real caller here (metainfo files,
/// tracker responses, the `decode` CLI command) already holds the full
/// payload in memory, and computing the torrent info-hash requires slicing
/// the *exact* source bytes of the `info` dictionary rather than re-encoding
/// a decoded copy. Tracking byte offsets is straightforward over a slice and
/// awkward over a byte iterator, so the decoder is rebuilt around a cursor
/// into `&[u8]`.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.data.get(self.pos).copied().ok_or(BencodeError::UnexpectedEOI)
    }

    fn advance(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BencodeError::UnexpectedEOI)?;
        let slice = self.data.get(self.pos..end).ok_or(BencodeError::UnexpectedEOI)?;
        self.pos = end;
        Ok(slice)
    }

    fn expect(&mut self, byte: u8) -> BencodeResult<()> {
        if self.peek()? != byte {
            return Err(BencodeError::InvalidFormat(format!(
                "expected '{}' at position {}",
                byte as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a str> {
        let start = self.pos;
        loop {
            let byte = self.peek()?;
            if byte == delimiter {
                let slice = &self.data[start..self.pos];
                self.pos += 1;
                return std::str::from_utf8(slice).map_err(|e| {
                    BencodeError::InvalidFormat(format!("non-UTF8 length/integer prefix: {}", e))
                });
            }
            self.pos += 1;
        }
    }
}

/// Decodes a single bencoded value from `data`, ignoring any trailing bytes.
///
/// Matches the teacher's and the reference implementation's behavior of
/// decoding exactly one top-level value starting at offset 0; callers that
/// need the rest of the buffer (e.g. length-prefixed wire messages) slice
/// it themselves before calling this.
#[instrument(skip(data), level = "trace")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cursor = Cursor::new(data);
    decode_value(&mut cursor)
}

/// Decodes a top-level bencoded dictionary and returns, alongside the value,
/// the exact byte range within `data` that the value under `key` occupied.
///
/// This is the mechanism that lets info-hash computation hash the *original*
/// bytes of the `info` sub-dictionary instead of a re-encoded copy of a
/// decoded structure - re-encoding can silently diverge from the source (key
/// order quirks, alternate integer representations) and produce the wrong
/// hash. Only top-level keys are tracked since `info` always lives at the
/// root of a metainfo document.
#[instrument(skip(data), level = "trace")]
pub fn decode_top_level_with_span(
    data: &[u8],
    key: &[u8],
) -> BencodeResult<(BencodeValue, Option<Range<usize>>)> {
    let mut cursor = Cursor::new(data);
    cursor.expect(b'd')?;

    let mut dict = BTreeMap::new();
    let mut span = None;

    while cursor.peek()? != b'e' {
        let dict_key = decode_string(&mut cursor)?;
        let value_start = cursor.pos;
        let value = decode_value(&mut cursor)?;
        if dict_key == key {
            span = Some(value_start..cursor.pos);
        }
        dict.insert(dict_key, value);
    }
    cursor.pos += 1;

    Ok((BencodeValue::Dict(dict), span))
}

fn decode_value(cursor: &mut Cursor) -> BencodeResult<BencodeValue> {
    match cursor.peek()? {
        b'0'..=b'9' => decode_string(cursor).map(BencodeValue::String),
        b'i' => decode_integer(cursor).map(BencodeValue::Integer),
        b'l' => decode_list(cursor).map(BencodeValue::List),
        b'd' => decode_dict(cursor).map(BencodeValue::Dict),
        other => Err(BencodeError::InvalidFormat(format!(
            "unexpected character: {}",
            other as char
        ))),
    }
}

fn decode_string(cursor: &mut Cursor) -> BencodeResult<Vec<u8>> {
    let length_str = cursor.read_until(b':')?;
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    Ok(cursor.advance(length)?.to_vec())
}

fn decode_integer(cursor: &mut Cursor) -> BencodeResult<i64> {
    cursor.expect(b'i')?;
    let num_str = cursor.read_until(b'e')?;

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str.len() > 1 && num_str.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str.len() > 2 && num_str.starts_with("-0") {
        return Err(BencodeError::InvalidInteger);
    }

    num_str.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)
}

fn decode_list(cursor: &mut Cursor) -> BencodeResult<Vec<BencodeValue>> {
    cursor.expect(b'l')?;
    let mut list = Vec::new();
    while cursor.peek()? != b'e' {
        list.push(decode_value(cursor)?);
    }
    cursor.pos += 1;
    Ok(list)
}

fn decode_dict(cursor: &mut Cursor) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
    cursor.expect(b'd')?;
    let mut dict = BTreeMap::new();
    while cursor.peek()? != b'e' {
        let key = decode_string(cursor)?;
        let value = decode_value(cursor)?;
        dict.insert(key, value);
    }
    cursor.pos += 1;
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_strings() {
        assert_eq!(
            decode(b"5:hello").unwrap(),
            BencodeValue::String(b"hello".to_vec())
        );
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn rejects_malformed_integers() {
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"ie").is_err());
    }

    #[test]
    fn decodes_lists() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            BencodeValue::List(vec![
                BencodeValue::String(b"spam".to_vec()),
                BencodeValue::Integer(42),
            ])
        );
    }

    #[test]
    fn decodes_dicts_sorted() {
        let value = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
        match value {
            BencodeValue::Dict(dict) => {
                let keys: Vec<&Vec<u8>> = dict.keys().collect();
                assert_eq!(keys, vec![&b"bar".to_vec(), &b"foo".to_vec()]);
            }
            _ => panic!("expected dict"),
        }
    }

    #[test]
    fn captures_span_of_requested_key() {
        let data = b"d4:infod4:name3:foxee";
        let (_value, span) = decode_top_level_with_span(data, b"info").unwrap();
        let span = span.unwrap();
        assert_eq!(&data[span], &b"d4:name3:foxe"[..]);
    }

    #[test]
    fn missing_span_key_returns_none() {
        let data = b"d3:fooi1ee";
        let (_value, span) = decode_top_level_with_span(data, b"info").unwrap();
        assert!(span.is_none());
    }

    #[test]
    fn unexpected_eof_is_an_error() {
        assert!(decode(b"5:hi").is_err());
        assert!(decode(b"d3:foo").is_err());
    }
}

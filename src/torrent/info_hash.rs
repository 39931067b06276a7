use crate::bencode::decoder;
use crate::torrent::TorrentError;
use sha1::Digest;
use sha1::Sha1;
use tracing::instrument;

/// Calculates the SHA-1 hash of a torrent's `info` dictionary.
///
/// The naive approach - decode the metainfo document into a typed structure
/// and re-encode just the `info` field - can produce a hash that does not
/// match what other clients and trackers compute, because the decoded
/// structure is free to normalize things the original bytes didn't (key
/// order is one example BTreeMap incidentally gets right, but there is no
/// general guarantee a round-trip is byte-identical). The protocol requires
/// hashing the *exact* bytes of the `info` value as they appeared in the
/// source file, so this slices `raw` at the byte span the decoder recorded
/// for the "info" key instead of re-encoding anything.
///
/// # Arguments
/// * `raw` - The full bencoded metainfo document, exactly as read from disk.
///
/// # Returns
/// The 20-byte SHA-1 digest of the `info` dictionary's source bytes.
#[instrument(skip(raw), level = "debug")]
pub fn calculate_info_hash(raw: &[u8]) -> Result<[u8; 20], TorrentError> {
    let (_, span) = decoder::decode_top_level_with_span(raw, b"info")?;
    let span = span.ok_or_else(|| TorrentError::MissingField("info".to_string()))?;

    let mut hasher = Sha1::new();
    hasher.update(&raw[span]);
    let result = hasher.finalize();

    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);
    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_depends_only_on_info_bytes() {
        let a = b"d8:announce3:foo4:infod6:lengthi10e4:name3:fooee";
        let b = b"d8:announce3:bar4:infod6:lengthi10e4:name3:fooee";
        assert_eq!(
            calculate_info_hash(a).unwrap(),
            calculate_info_hash(b).unwrap(),
            "changing fields outside of info must not change the hash"
        );
    }

    #[test]
    fn hash_changes_when_info_changes() {
        let a = b"d4:infod6:lengthi10eee";
        let b = b"d4:infod6:lengthi11eee";
        assert_ne!(calculate_info_hash(a).unwrap(), calculate_info_hash(b).unwrap());
    }

    #[test]
    fn missing_info_key_is_an_error() {
        assert!(calculate_info_hash(b"d3:fooi1ee").is_err());
    }
}

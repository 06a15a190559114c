//! Encodes a record's `map<name, bytes>` value (spec §3 "Record file
//! entry") into the single opaque byte blob the low-level record file
//! stores per key. The collection layer stores the document itself under
//! region `"$"` and each secondary index's per-doc bookkeeping under a
//! sibling region, so a document's value rewrite and its index-region
//! updates land in one record write.

use std::collections::BTreeMap;

use record::header::{read_varint, write_varint};

/// An ordered set of named byte regions, encoded/decoded as one blob.
pub type Regions = BTreeMap<String, Vec<u8>>;

/// Encodes `regions` as: varint count, then for each region (in key
/// order): varint name length, name bytes, varint value length, value
/// bytes.
pub fn encode(regions: &Regions) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, regions.len() as u64);
    for (name, value) in regions {
        write_varint(&mut out, name.len() as u64);
        out.extend_from_slice(name.as_bytes());
        write_varint(&mut out, value.len() as u64);
        out.extend_from_slice(value);
    }
    out
}

/// Decodes a blob produced by `encode`.
pub fn decode(data: &[u8]) -> Regions {
    let mut regions = Regions::new();
    let mut pos = 0;
    let (count, n) = read_varint(&data[pos..]);
    pos += n;
    for _ in 0..count {
        let (name_len, n) = read_varint(&data[pos..]);
        pos += n;
        let name = String::from_utf8_lossy(&data[pos..pos + name_len as usize]).into_owned();
        pos += name_len as usize;
        let (value_len, n) = read_varint(&data[pos..]);
        pos += n;
        let value = data[pos..pos + value_len as usize].to_vec();
        pos += value_len as usize;
        regions.insert(name, value);
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_empty_and_populated() {
        let empty: Regions = Regions::new();
        assert_eq!(decode(&encode(&empty)), empty);

        let mut regions = Regions::new();
        regions.insert("$".to_owned(), b"doc-bytes".to_vec());
        regions.insert("iname".to_owned(), b"idx-bytes".to_vec());
        let encoded = encode(&regions);
        assert_eq!(decode(&encoded), regions);
    }
}

//! Flat binary persistence for forests.
//!
//! The stream is a fixed magic followed by a length-prefixed sequence of
//! `(id, parent, child_count, child_ids)` records, little-endian, in
//! arbitrary order. Restore runs two passes over the records (allocate,
//! then wire links), so chains of any depth round-trip without recursion.
//! Child ids that reference no record are dropped silently; every other
//! inconsistency is treated as stream corruption.

use crate::error::{ForestError, Result};
use crate::forest::{Forest, Node, NodeId};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Identifies a phylogenetic-forest stream.
pub const FOREST_MAGIC: [u8; 8] = *b"PHYFRST1";

/// Wire sentinel for "no parent".
const NO_PARENT: i64 = 0;

/// Writes `forest` to `out`.
///
/// Fails with `UnencodableParentId` when any node's parent id is zero or
/// negative; such an id cannot be told apart from the no-parent sentinel on
/// restore.
pub fn serialize<W: Write>(forest: &Forest, out: &mut W) -> Result<()> {
    out.write_all(&FOREST_MAGIC)?;
    out.write_all(&(forest.len() as u64).to_le_bytes())?;

    for node in forest.iter() {
        let parent = match node.parent() {
            None => NO_PARENT,
            Some(id) if id > 0 => id,
            Some(id) => return Err(ForestError::UnencodableParentId(id)),
        };
        out.write_all(&node.id().to_le_bytes())?;
        out.write_all(&parent.to_le_bytes())?;
        out.write_all(&(node.children().len() as u32).to_le_bytes())?;
        for &child in node.children() {
            out.write_all(&child.to_le_bytes())?;
        }
    }

    out.flush()?;
    Ok(())
}

/// Reads a forest back from `input`.
///
/// The restored forest carries no cached ancestor and its genesis sequence
/// is sorted by id (the wire format does not preserve root order).
pub fn deserialize<R: Read>(input: &mut R) -> Result<Forest> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if magic != FOREST_MAGIC {
        return Err(ForestError::CorruptStream("bad magic".into()));
    }

    let count = read_u64(input)?;
    let mut records = Vec::new();
    for _ in 0..count {
        let id = read_i64(input)?;
        let parent = read_i64(input)?;
        let child_count = read_u32(input)?;
        // Sized by what the stream actually yields, not by the untrusted count.
        let mut children = Vec::new();
        for _ in 0..child_count {
            children.push(read_i64(input)?);
        }
        records.push((id, parent, children));
    }

    // Pass 1: allocate every node.
    let mut nodes: HashMap<NodeId, Node> = HashMap::with_capacity(records.len());
    for &(id, parent, _) in &records {
        let parent = if parent == NO_PARENT { None } else { Some(parent) };
        if nodes.insert(id, Node::new(id, parent)).is_some() {
            return Err(ForestError::CorruptStream(format!("duplicate id {id}")));
        }
    }

    // Pass 2: wire links, dropping child ids with no record of their own.
    for (id, parent, children) in records {
        if parent != NO_PARENT {
            if !nodes.contains_key(&parent) {
                return Err(ForestError::CorruptStream(format!(
                    "node {id} references missing parent {parent}"
                )));
            }
            if id <= parent {
                return Err(ForestError::CorruptStream(format!(
                    "child id {id} does not exceed parent id {parent}"
                )));
            }
        }
        let kept: Vec<NodeId> =
            children.into_iter().filter(|child| nodes.contains_key(child)).collect();
        if let Some(node) = nodes.get_mut(&id) {
            node.children = kept;
        }
    }

    let mut genesis: Vec<NodeId> =
        nodes.values().filter(|n| n.parent().is_none()).map(|n| n.id()).collect();
    genesis.sort_unstable();
    let leaves: HashSet<NodeId> =
        nodes.values().filter(|n| n.children().is_empty()).map(|n| n.id()).collect();

    let forest = Forest::from_parts(nodes, genesis, leaves);
    if !forest.is_valid() {
        return Err(ForestError::CorruptStream("inconsistent links".into()));
    }

    log::debug!("restored forest with {} nodes, {} roots", forest.len(), forest.genesis().len());
    Ok(forest)
}

/// Writes `forest` to a file, gzip-compressed when the path ends in `.gz`.
pub fn serialize_to_path<P: AsRef<Path>>(forest: &Forest, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)?;

    if is_gz(path) {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serialize(forest, &mut encoder)?;
        encoder.finish()?.flush()?;
    } else {
        serialize(forest, &mut BufWriter::new(file))?;
    }
    Ok(())
}

/// Reads a forest from a file, gzip-decompressed when the path ends in `.gz`.
pub fn deserialize_from_path<P: AsRef<Path>>(path: P) -> Result<Forest> {
    let path = path.as_ref();
    let file = File::open(path)?;

    if is_gz(path) {
        deserialize(&mut BufReader::new(GzDecoder::new(file)))
    } else {
        deserialize(&mut BufReader::new(file))
    }
}

fn is_gz(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".gz")
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(input: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(forest: &Forest) -> Forest {
        let mut buf = Vec::new();
        serialize(forest, &mut buf).unwrap();
        deserialize(&mut buf.as_slice()).unwrap()
    }

    fn put_record(buf: &mut Vec<u8>, id: i64, parent: i64, children: &[i64]) {
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&parent.to_le_bytes());
        buf.extend_from_slice(&(children.len() as u32).to_le_bytes());
        for &child in children {
            buf.extend_from_slice(&child.to_le_bytes());
        }
    }

    fn stream(records: &[(i64, i64, &[i64])]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&FOREST_MAGIC);
        buf.extend_from_slice(&(records.len() as u64).to_le_bytes());
        for &(id, parent, children) in records {
            put_record(&mut buf, id, parent, children);
        }
        buf
    }

    #[test]
    fn small_forest_round_trips() {
        let mut forest = Forest::new([1, 2]).unwrap();
        forest.add_child(1, 3).unwrap();
        forest.add_child(1, 4).unwrap();
        forest.add_child(3, 5).unwrap();

        let restored = round_trip(&forest);
        assert_eq!(restored, forest);
        assert!(restored.is_valid());
        assert!(restored.mrca().is_none());
    }

    #[test]
    fn genesis_order_round_trips_as_a_set() {
        let forest = Forest::new([9, 4, 7]).unwrap();
        let restored = round_trip(&forest);
        assert_eq!(restored.genesis(), &[4, 7, 9]);
        assert_eq!(restored, forest);
    }

    #[test]
    fn deep_chain_round_trips_without_recursion() {
        let depth: NodeId = 100_000;
        let mut forest = Forest::new([1]).unwrap();
        for id in 2..=depth {
            forest.add_child(id - 1, id).unwrap();
        }

        let restored = round_trip(&forest);
        assert_eq!(restored.len(), depth as usize);
        assert_eq!(restored, forest);
    }

    #[test]
    fn child_order_is_preserved() {
        let mut forest = Forest::new([1]).unwrap();
        forest.add_child(1, 5).unwrap();
        forest.add_child(1, 3).unwrap();
        forest.add_child(1, 4).unwrap();

        let restored = round_trip(&forest);
        assert_eq!(restored.children_of(1), Some(&[5, 3, 4][..]));
    }

    #[test]
    fn orphan_children_are_dropped() {
        // Node 3 is referenced as a child but has no record of its own.
        let buf = stream(&[(1, 0, &[2, 3]), (2, 1, &[])]);
        let forest = deserialize(&mut buf.as_slice()).unwrap();

        assert_eq!(forest.len(), 2);
        assert_eq!(forest.children_of(1), Some(&[2][..]));
        assert!(forest.is_valid());
    }

    #[test]
    fn node_losing_all_children_becomes_a_leaf() {
        let buf = stream(&[(1, 0, &[2]), (2, 1, &[9, 10])]);
        let forest = deserialize(&mut buf.as_slice()).unwrap();
        assert!(forest.is_leaf(2));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = stream(&[(1, 0, &[])]);
        buf[0] ^= 0xff;
        let err = deserialize(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ForestError::CorruptStream(_)));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let buf = stream(&[(1, 0, &[2]), (2, 1, &[])]);
        let err = deserialize(&mut buf[..buf.len() - 3].as_ref()).unwrap_err();
        assert!(err_is_fatal(&err));
    }

    fn err_is_fatal(err: &ForestError) -> bool {
        matches!(err, ForestError::Io(_) | ForestError::CorruptStream(_))
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let buf = stream(&[(1, 0, &[]), (1, 0, &[])]);
        let err = deserialize(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ForestError::CorruptStream(_)));
    }

    #[test]
    fn dangling_parent_is_rejected() {
        let buf = stream(&[(5, 4, &[])]);
        let err = deserialize(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ForestError::CorruptStream(_)));
    }

    #[test]
    fn inverted_ids_are_rejected() {
        let buf = stream(&[(5, 0, &[3]), (3, 5, &[])]);
        let err = deserialize(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ForestError::CorruptStream(_)));
    }

    #[test]
    fn mismatched_links_are_rejected() {
        // 3 claims parent 2, but only 1 lists it as a child.
        let buf = stream(&[(1, 0, &[3]), (2, 1, &[]), (3, 2, &[])]);
        let err = deserialize(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ForestError::CorruptStream(_)));
    }

    #[test]
    fn non_positive_parent_id_cannot_encode() {
        let mut forest = Forest::new([0]).unwrap();
        forest.add_child(0, 1).unwrap();

        let mut buf = Vec::new();
        let err = serialize(&forest, &mut buf).unwrap_err();
        assert!(matches!(err, ForestError::UnencodableParentId(0)));
    }

    #[test]
    fn childless_non_positive_ids_round_trip() {
        let forest = Forest::new([-5, 0, 3]).unwrap();
        let restored = round_trip(&forest);
        assert_eq!(restored, forest);
    }

    #[test]
    fn gz_path_round_trips() {
        let mut forest = Forest::new([1]).unwrap();
        forest.add_child(1, 2).unwrap();
        forest.add_child(2, 3).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forest.bin.gz");
        serialize_to_path(&forest, &path).unwrap();
        let restored = deserialize_from_path(&path).unwrap();
        assert_eq!(restored, forest);

        // The stream on disk is gzip, not the raw format.
        let raw = std::fs::read(&path).unwrap();
        assert_ne!(&raw[..2], &FOREST_MAGIC[..2]);
    }

    #[test]
    fn plain_path_round_trips() {
        let mut forest = Forest::new([1]).unwrap();
        forest.add_child(1, 2).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forest.bin");
        serialize_to_path(&forest, &path).unwrap();
        assert_eq!(deserialize_from_path(&path).unwrap(), forest);
    }
}

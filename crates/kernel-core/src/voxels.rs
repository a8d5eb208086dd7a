//! Observation voxel slab: run-length and delta encodings.
//!
//! RLE payloads are hex strings of little-endian `(block: u16, run: u16)` pairs.
//! Runs longer than `u16::MAX` are split.

use std::fmt;

use contracts::{VoxelDeltaOp, VoxelsObs};

use crate::spatial::Vec3i;

pub const ENCODING_RLE: &str = "RLE";
pub const ENCODING_DELTA: &str = "DELTA";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RleError {
    Hex(String),
    Truncated(usize),
}

impl fmt::Display for RleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hex(err) => write!(f, "invalid hex payload: {err}"),
            Self::Truncated(len) => write!(f, "payload length {len} is not a multiple of 4"),
        }
    }
}

impl std::error::Error for RleError {}

pub fn encode_rle(blocks: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(16);
    let mut iter = blocks.iter().copied().peekable();
    while let Some(block) = iter.next() {
        let mut run: u16 = 1;
        while run < u16::MAX && iter.peek() == Some(&block) {
            iter.next();
            run += 1;
        }
        bytes.extend_from_slice(&block.to_le_bytes());
        bytes.extend_from_slice(&run.to_le_bytes());
    }
    hex::encode(bytes)
}

pub fn decode_rle(data: &str) -> Result<Vec<u16>, RleError> {
    let bytes = hex::decode(data).map_err(|err| RleError::Hex(err.to_string()))?;
    if bytes.len() % 4 != 0 {
        return Err(RleError::Truncated(bytes.len()));
    }
    let mut out = Vec::new();
    for pair in bytes.chunks_exact(4) {
        let block = u16::from_le_bytes([pair[0], pair[1]]);
        let run = u16::from_le_bytes([pair[2], pair[3]]);
        out.extend(std::iter::repeat(block).take(usize::from(run)));
    }
    Ok(out)
}

/// Cells that differ between two equally sized slabs, as offsets from the centre.
pub fn delta_ops(previous: &[u16], current: &[u16], radius: i32) -> Vec<VoxelDeltaOp> {
    let dim = 2 * radius + 1;
    current
        .iter()
        .zip(previous)
        .enumerate()
        .filter(|(_, (now, before))| now != before)
        .map(|(index, (now, _))| {
            let index = index as i32;
            VoxelDeltaOp {
                d: [index % dim - radius, 0, index / dim - radius],
                b: *now,
            }
        })
        .collect()
}

/// Reads the (2r+1)² slab around `center`, row-major by z then x.
pub fn read_slab(center: Vec3i, radius: i32, get_block: impl Fn(Vec3i) -> u16) -> Vec<u16> {
    let dim = (2 * radius + 1) as usize;
    let mut slab = Vec::with_capacity(dim * dim);
    for dz in -radius..=radius {
        for dx in -radius..=radius {
            slab.push(get_block(Vec3i::new(center.x + dx, 0, center.z + dz)));
        }
    }
    slab
}

/// Encodes a slab, preferring sparse ops when the client has the previous slab
/// cached and the change set is under half the slab.
pub fn encode_slab(
    center: Vec3i,
    radius: i32,
    current: &[u16],
    previous: Option<&[u16]>,
    delta_enabled: bool,
) -> VoxelsObs {
    let mut voxels = VoxelsObs {
        center: center.to_array(),
        radius,
        encoding: ENCODING_RLE.to_string(),
        data: String::new(),
        ops: Vec::new(),
    };
    if let Some(previous) = previous.filter(|prev| delta_enabled && prev.len() == current.len()) {
        let ops = delta_ops(previous, current, radius);
        if !ops.is_empty() && ops.len() < current.len() / 2 {
            voxels.encoding = ENCODING_DELTA.to_string();
            voxels.ops = ops;
            return voxels;
        }
    }
    voxels.data = encode_rle(current);
    voxels
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn rle_decode_inverts_encode(blocks in prop::collection::vec(0u16..6, 0..400)) {
            let encoded = encode_rle(&blocks);
            prop_assert_eq!(decode_rle(&encoded).expect("decode"), blocks);
        }
    }

    #[test]
    fn long_runs_are_split() {
        let blocks = vec![3u16; usize::from(u16::MAX) + 10];
        let encoded = encode_rle(&blocks);
        assert_eq!(encoded.len(), 16);
        assert_eq!(decode_rle(&encoded).expect("decode"), blocks);
    }

    #[test]
    fn malformed_payloads_error() {
        assert!(matches!(decode_rle("zz"), Err(RleError::Hex(_))));
        assert_eq!(decode_rle("0100"), Err(RleError::Truncated(2)));
    }

    #[test]
    fn small_change_yields_delta_ops() {
        let previous = vec![0u16; 9];
        let mut current = previous.clone();
        current[5] = 4;
        let voxels = encode_slab(Vec3i::new(10, 0, 10), 1, &current, Some(&previous), true);
        assert_eq!(voxels.encoding, ENCODING_DELTA);
        assert_eq!(voxels.ops, vec![VoxelDeltaOp { d: [1, 0, 0], b: 4 }]);
        assert!(voxels.data.is_empty());
    }

    #[test]
    fn unchanged_or_uncached_slabs_use_rle() {
        let slab = vec![1u16; 9];
        let same = encode_slab(Vec3i::default(), 1, &slab, Some(&slab), true);
        assert_eq!(same.encoding, ENCODING_RLE);
        let uncached = encode_slab(Vec3i::default(), 1, &slab, None, true);
        assert_eq!(uncached.encoding, ENCODING_RLE);
        let disabled = encode_slab(Vec3i::default(), 1, &slab, Some(&[0u16; 9]), false);
        assert_eq!(disabled.encoding, ENCODING_RLE);
    }
}

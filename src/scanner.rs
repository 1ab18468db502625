//! Block-level hashing utilities

use crate::protocol::{BlockHash, BlockInfo};
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Hash `path` into an ordered list of blocks of `block_size` bytes, the
/// last one possibly shorter. An empty file yields an empty list.
pub fn hash_file(path: &Path, block_size: u64) -> Result<Vec<BlockInfo>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut blocks = Vec::with_capacity(size.div_ceil(block_size) as usize);
    let mut buf = vec![0u8; block_size as usize];
    let mut offset = 0u64;

    while offset < size {
        let want = block_size.min(size - offset) as usize;
        reader.read_exact(&mut buf[..want])?;
        blocks.push(BlockInfo {
            offset,
            size: want as u32,
            hash: *blake3::hash(&buf[..want]).as_bytes(),
        });
        offset += want as u64;
    }

    Ok(blocks)
}

/// Verify `reader` against `expected`, block by block and in order. Extra
/// data past the final block is a mismatch too.
pub fn verify(reader: &mut dyn Read, block_size: u64, expected: &[BlockInfo]) -> Result<()> {
    let mut buf = vec![0u8; block_size as usize];

    for (i, block) in expected.iter().enumerate() {
        let want = block.size as usize;
        if want > buf.len() {
            bail!("block {} larger than block size", i);
        }
        reader.read_exact(&mut buf[..want])?;
        let hash: BlockHash = *blake3::hash(&buf[..want]).as_bytes();
        if hash != block.hash {
            bail!("hash mismatch on block {} of {}", i, expected.len());
        }
    }

    if reader.read(&mut buf[..1])? != 0 {
        bail!("file continues past final block");
    }
    Ok(())
}

/// The blocks from `want` whose content hashes also occur somewhere in
/// `have`. Offsets and sizes are taken from `want`.
pub fn block_diff(have: &[BlockInfo], want: &[BlockInfo]) -> Vec<BlockInfo> {
    let present: HashSet<&BlockHash> = have.iter().map(|b| &b.hash).collect();
    want.iter()
        .filter(|b| present.contains(&b.hash))
        .cloned()
        .collect()
}

/// Fill in block offsets by prefix-summing sizes. Block lists arrive from
/// the wire without offsets.
pub fn populate_offsets(blocks: &mut [BlockInfo]) {
    let mut offset = 0u64;
    for block in blocks {
        block.offset = offset;
        offset += u64::from(block.size);
    }
}

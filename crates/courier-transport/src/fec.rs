//! # Block-XOR Forward Error Correction
//!
//! Each block of up to `k` data chunks is protected by `r` parity chunks.
//! Every parity chunk is the XOR of all data chunks in its block, padded to
//! the block's longest member — so any single missing data chunk recovers
//! from the other `k - 1` data chunks plus any one surviving parity chunk.
//! Losing more than one data chunk in the same block is unrecoverable here;
//! the sender's retransmission path covers that case (Non-goal: no FEC
//! retry/rateless schemes).

use bytes::Bytes;
use std::collections::HashMap;

/// Encodes one block's data chunks into `r` parity chunks.
///
/// Parity chunks are identical by construction (each is the full-block XOR);
/// emitting `r` of them is pure redundancy against datagram loss of the
/// parity traffic itself, not a systematically stronger code.
pub struct BlockEncoder {
    r: usize,
}

impl BlockEncoder {
    pub fn new(r: usize) -> Self {
        BlockEncoder { r }
    }

    /// Compute the `r` parity payloads for a block's data chunks.
    pub fn encode(&self, data_chunks: &[Bytes]) -> Vec<Bytes> {
        if data_chunks.is_empty() || self.r == 0 {
            return Vec::new();
        }
        let max_len = data_chunks.iter().map(|c| c.len()).max().unwrap_or(0);
        let mut parity = vec![0u8; max_len];
        for chunk in data_chunks {
            for (i, &byte) in chunk.iter().enumerate() {
                parity[i] ^= byte;
            }
        }
        let parity = Bytes::from(parity);
        std::iter::repeat(parity).take(self.r).collect()
    }
}

/// Accumulates chunks for one FEC block and attempts single-erasure recovery.
struct BlockState {
    /// Data chunks received so far, keyed by their position within the block
    /// (`chunk_id - block_start`).
    data: HashMap<u32, Bytes>,
    /// Expected number of data chunks in this block.
    k: u32,
    /// At least one parity payload received (they're all identical, so we
    /// only need to remember one).
    parity: Option<Bytes>,
}

/// Per-bundle FEC decoder, tracking one [`BlockState`] per block id.
pub struct BlockDecoder {
    blocks: HashMap<u32, BlockState>,
}

impl BlockDecoder {
    pub fn new() -> Self {
        BlockDecoder {
            blocks: HashMap::new(),
        }
    }

    /// Record a data chunk belonging to `block_id` at position `index_in_block`.
    pub fn add_data_chunk(&mut self, block_id: u32, index_in_block: u32, k: u32, payload: Bytes) {
        let block = self.blocks.entry(block_id).or_insert_with(|| BlockState {
            data: HashMap::new(),
            k,
            parity: None,
        });
        block.data.insert(index_in_block, payload);
    }

    /// Record a parity chunk belonging to `block_id`.
    pub fn add_parity_chunk(&mut self, block_id: u32, k: u32, payload: Bytes) {
        let block = self.blocks.entry(block_id).or_insert_with(|| BlockState {
            data: HashMap::new(),
            k,
            parity: None,
        });
        block.parity.get_or_insert(payload);
    }

    /// Whether all `k` data chunks for a block have been received directly
    /// (no recovery needed).
    pub fn is_complete(&self, block_id: u32) -> bool {
        self.blocks
            .get(&block_id)
            .map(|b| b.data.len() as u32 >= b.k)
            .unwrap_or(false)
    }

    /// Attempt to recover a single missing data chunk in the block.
    ///
    /// Returns `Some((index_in_block, payload))` when exactly one data chunk
    /// is missing and a parity chunk is available; `None` otherwise.
    pub fn try_recover(&mut self, block_id: u32) -> Option<(u32, Bytes)> {
        let block = self.blocks.get(&block_id)?;
        if block.data.len() as u32 + 1 != block.k {
            return None; // zero missing (complete) or >1 missing (unrecoverable here)
        }
        let parity = block.parity.as_ref()?;
        let missing_index = (0..block.k).find(|i| !block.data.contains_key(i))?;

        let mut recovered = parity.to_vec();
        for payload in block.data.values() {
            for (i, &byte) in payload.iter().enumerate() {
                if i < recovered.len() {
                    recovered[i] ^= byte;
                }
            }
        }
        Some((missing_index, Bytes::from(recovered)))
    }

    /// Drop a block's state once it's been fully resolved (complete, or
    /// recovered and consumed).
    pub fn remove_block(&mut self, block_id: u32) {
        self.blocks.remove(&block_id);
    }

    pub fn tracked_block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for BlockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_r_identical_parity_chunks() {
        let enc = BlockEncoder::new(2);
        let data = vec![
            Bytes::from_static(b"aaaa"),
            Bytes::from_static(b"bbbb"),
            Bytes::from_static(b"cccc"),
        ];
        let parity = enc.encode(&data);
        assert_eq!(parity.len(), 2);
        assert_eq!(parity[0], parity[1]);
    }

    #[test]
    fn encode_empty_block_yields_no_parity() {
        let enc = BlockEncoder::new(2);
        assert!(enc.encode(&[]).is_empty());
    }

    #[test]
    fn single_missing_data_chunk_recovers() {
        let enc = BlockEncoder::new(1);
        let data = vec![
            Bytes::from_static(b"0123"),
            Bytes::from_static(b"4567"),
            Bytes::from_static(b"89ab"),
            Bytes::from_static(b"cdef"),
        ];
        let parity = enc.encode(&data);

        let mut dec = BlockDecoder::new();
        for (i, chunk) in data.iter().enumerate() {
            if i == 2 {
                continue; // simulate loss of index 2
            }
            dec.add_data_chunk(0, i as u32, 4, chunk.clone());
        }
        dec.add_parity_chunk(0, 4, parity[0].clone());

        assert!(!dec.is_complete(0));
        let (idx, recovered) = dec.try_recover(0).expect("should recover");
        assert_eq!(idx, 2);
        assert_eq!(recovered, data[2]);
    }

    #[test]
    fn complete_block_needs_no_recovery() {
        let mut dec = BlockDecoder::new();
        for i in 0..4u32 {
            dec.add_data_chunk(0, i, 4, Bytes::from(vec![i as u8; 4]));
        }
        assert!(dec.is_complete(0));
        assert!(dec.try_recover(0).is_none());
    }

    #[test]
    fn two_missing_chunks_cannot_recover() {
        let mut dec = BlockDecoder::new();
        dec.add_data_chunk(0, 0, 4, Bytes::from_static(b"aaaa"));
        dec.add_data_chunk(0, 3, 4, Bytes::from_static(b"dddd"));
        dec.add_parity_chunk(0, 4, Bytes::from_static(b"xxxx"));
        assert!(dec.try_recover(0).is_none());
    }

    #[test]
    fn missing_parity_blocks_recovery() {
        let mut dec = BlockDecoder::new();
        dec.add_data_chunk(0, 0, 2, Bytes::from_static(b"aa"));
        // index 1 missing, no parity received
        assert!(dec.try_recover(0).is_none());
    }

    #[test]
    fn handles_variable_length_final_chunk() {
        let enc = BlockEncoder::new(1);
        let data = vec![Bytes::from_static(b"aaaa"), Bytes::from_static(b"bb")];
        let parity = enc.encode(&data);
        assert_eq!(parity[0].len(), 4);

        let mut dec = BlockDecoder::new();
        dec.add_data_chunk(0, 0, 2, data[0].clone());
        dec.add_parity_chunk(0, 2, parity[0].clone());
        let (idx, recovered) = dec.try_recover(0).unwrap();
        assert_eq!(idx, 1);
        // XOR recovery yields the padded length; caller truncates using the
        // chunk's recorded length before assembly.
        assert_eq!(&recovered[..2], &data[1][..]);
    }

    #[test]
    fn remove_block_clears_state() {
        let mut dec = BlockDecoder::new();
        dec.add_data_chunk(5, 0, 1, Bytes::from_static(b"x"));
        assert_eq!(dec.tracked_block_count(), 1);
        dec.remove_block(5);
        assert_eq!(dec.tracked_block_count(), 0);
    }
}

//! Write history for verify-after-write
//!
//! Each verified write is logged as an [`IoPiece`]. Once the write phase is
//! done, pieces are handed back one at a time so they can be re-read and
//! verified. Random workloads replay in offset order (ordered map);
//! sequential workloads replay in issue order (FIFO).

use std::collections::{BTreeMap, VecDeque};

/// A completed write that can later be read back and verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPiece {
    pub offset: u64,
    pub len: usize,
    /// Write sequence number the piece was stamped with
    pub sequence: u32,
}

impl IoPiece {
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

#[derive(Debug)]
enum Store {
    Ordered(BTreeMap<u64, IoPiece>),
    Fifo(VecDeque<IoPiece>),
}

/// Log of tracked writes
#[derive(Debug)]
pub struct IoHistory {
    store: Store,
}

impl IoHistory {
    /// History replayed in issue order
    pub fn fifo() -> Self {
        Self { store: Store::Fifo(VecDeque::new()) }
    }

    /// History replayed in offset order; a rewrite of the same offset
    /// replaces the earlier piece
    pub fn ordered() -> Self {
        Self { store: Store::Ordered(BTreeMap::new()) }
    }

    pub fn record(&mut self, piece: IoPiece) {
        match &mut self.store {
            Store::Ordered(map) => {
                map.insert(piece.offset, piece);
            }
            Store::Fifo(list) => list.push_back(piece),
        }
    }

    /// Find the tracked piece that covers `[offset, offset + len)`
    pub fn lookup(&self, offset: u64, len: usize) -> Option<IoPiece> {
        let end = offset + len as u64;
        match &self.store {
            Store::Ordered(map) => map
                .range(..=offset)
                .next_back()
                .map(|(_, p)| *p)
                .filter(|p| p.end() >= end),
            Store::Fifo(list) => list
                .iter()
                .rev()
                .find(|p| p.offset <= offset && p.end() >= end)
                .copied(),
        }
    }

    /// Take the next piece to verify
    pub fn next_verify(&mut self) -> Option<IoPiece> {
        match &mut self.store {
            Store::Ordered(map) => map.pop_first().map(|(_, p)| p),
            Store::Fifo(list) => list.pop_front(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.store {
            Store::Ordered(map) => map.len(),
            Store::Fifo(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

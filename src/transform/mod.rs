// src/transform/mod.rs
// ---------------------------------------------------------------------------
// Transformation engines: sort, split, join, filter, the three taggers, the
// unannotator, and the validator. Every engine follows the same contract
// (open source + companion index, plan from the record array, stream PGN
// bytes, write a temp output + fresh index, atomic rename) — shared here so
// each engine module only has to supply its own planning/selection logic.
// ---------------------------------------------------------------------------

pub mod filter;
pub mod join;
pub mod sort;
pub mod split;
pub mod tag_eco;
pub mod tag_elegance;
pub mod tag_elo;
pub mod unannotate;
pub mod validate;

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Error, GameError, Result};
use crate::index::{self, GameRecord, IndexReader};
use crate::indexer;
use crate::progress::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct TransformReport {
    pub games_processed: u64,
    pub games_kept: u64,
    pub errors: Vec<GameError>,
}

/// Opens `pgn_path`'s companion `.pbi`, building it first if it's missing.
pub fn open_or_build_index(pgn_path: &Path, cancel: &CancellationToken) -> Result<(IndexReader, PathBuf)> {
    let index_path = index::companion_path(pgn_path);
    if !index_path.exists() {
        indexer::build_index(pgn_path, &index_path, cancel, |_| {})?;
    }
    let reader = IndexReader::open(&index_path)?;
    Ok((reader, index_path))
}

/// Memory-maps `pgn_path` for random-access byte slicing by `GameRecord`.
pub fn map_pgn(pgn_path: &Path) -> Result<Mmap> {
    let file = File::open(pgn_path).map_err(|e| Error::io(pgn_path, e))?;
    unsafe { Mmap::map(&file).map_err(|e| Error::io(pgn_path, e)) }
}

/// Slices the raw bytes of one game out of a mapped PGN file.
pub fn game_bytes<'a>(mmap: &'a Mmap, record: &GameRecord, index: usize) -> Result<&'a [u8]> {
    let start = record.file_offset as usize;
    let end = start + record.length as usize;
    mmap.get(start..end).ok_or_else(|| Error::IndexCorrupt { reason: format!("record {index} out of bounds") })
}

/// Writes `text` to `dest` atomically, then rebuilds `dest`'s companion
/// index from the freshly written bytes — the shared "step 4/5" every
/// transform ends with.
pub fn finish_with_index(dest: &Path, text: &str, cancel: &CancellationToken) -> Result<()> {
    index::write_atomic(dest, text.as_bytes())?;
    let dest_index = index::companion_path(dest);
    indexer::build_index(dest, &dest_index, cancel, |_| {})?;
    Ok(())
}

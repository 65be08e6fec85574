// src/index.rs
// ---------------------------------------------------------------------------
// On-disk `.pbi` layout: fixed header, packed 32-byte GameRecord array,
// string heap (offset table + blob). Writers build to a sibling temp file,
// fsync, then atomically rename into place; readers memory-map the result
// for O(1) random access. All integers are little-endian.
// ---------------------------------------------------------------------------

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::config;
use crate::error::{Error, Result};
use crate::heap::{HeapBuilder, HeapView};

pub const RECORD_LEN: usize = 32;
pub const HEADER_LEN: usize = 96;

// ---------------------------------------------------------------------------
// GameRecord
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameRecord {
    pub file_offset: u64,
    pub length: u32,
    pub white_name_id: u32,
    pub black_name_id: u32,
    pub white_elo: u16,
    pub black_elo: u16,
    pub result: u8,
    pub eco_category: u8,
    pub eco_number: u8,
    pub flags: u8,
    pub date_compact: u32,
}

pub mod flags {
    pub const HAS_ANNOTATIONS: u8 = 1 << 0;
    pub const HAS_VARIATIONS: u8 = 1 << 1;
    pub const HAS_EVAL: u8 = 1 << 2;
    pub const NORMALISED: u8 = 1 << 3;
    pub const ELEGANT: u8 = 1 << 4;
    pub const CHECKMATE: u8 = 1 << 5;
    pub const PLY_COUNT_PRESENT: u8 = 1 << 6;
    #[allow(dead_code)]
    pub const RESERVED: u8 = 1 << 7;
}

impl GameRecord {
    pub fn has_flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    pub fn set_flag(&mut self, bit: u8, on: bool) {
        if on {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut b = [0u8; RECORD_LEN];
        b[0..8].copy_from_slice(&self.file_offset.to_le_bytes());
        b[8..12].copy_from_slice(&self.length.to_le_bytes());
        b[12..16].copy_from_slice(&self.white_name_id.to_le_bytes());
        b[16..20].copy_from_slice(&self.black_name_id.to_le_bytes());
        b[20..22].copy_from_slice(&self.white_elo.to_le_bytes());
        b[22..24].copy_from_slice(&self.black_elo.to_le_bytes());
        b[24] = self.result;
        b[25] = self.eco_category;
        b[26] = self.eco_number;
        b[27] = self.flags;
        b[28..32].copy_from_slice(&self.date_compact.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        debug_assert!(b.len() >= RECORD_LEN);
        Self {
            file_offset: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            length: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            white_name_id: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            black_name_id: u32::from_le_bytes(b[16..20].try_into().unwrap()),
            white_elo: u16::from_le_bytes(b[20..22].try_into().unwrap()),
            black_elo: u16::from_le_bytes(b[22..24].try_into().unwrap()),
            result: b[24],
            eco_category: b[25],
            eco_number: b[26],
            flags: b[27],
            date_compact: u32::from_le_bytes(b[28..32].try_into().unwrap()),
        }
    }
}

/// Packs `YYYY.MM.DD` into `YYYYMMDD`, treating missing components as the
/// digit `0` so ordinal comparison behaves as "earliest possible value".
pub fn pack_date(year: u32, month: u32, day: u32) -> u32 {
    year * 10_000 + month * 100 + day
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregates {
    pub white_wins: u64,
    pub black_wins: u64,
    pub draws: u64,
    pub rated_game_count: u64,
    pub sum_white_elo: u64,
    pub sum_black_elo: u64,
    pub earliest_date: u32,
    pub latest_date: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexHeader {
    pub version: u32,
    pub game_count: u64,
    pub aggregates: Aggregates,
    pub heap_offset: u64,
    pub heap_len: u64,
    pub checksum: u32,
}

impl IndexHeader {
    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0..8].copy_from_slice(config::INDEX_MAGIC);
        b[8..12].copy_from_slice(&self.version.to_le_bytes());
        b[12..20].copy_from_slice(&self.game_count.to_le_bytes());
        b[20..28].copy_from_slice(&self.aggregates.white_wins.to_le_bytes());
        b[28..36].copy_from_slice(&self.aggregates.black_wins.to_le_bytes());
        b[36..44].copy_from_slice(&self.aggregates.draws.to_le_bytes());
        b[44..52].copy_from_slice(&self.aggregates.rated_game_count.to_le_bytes());
        b[52..60].copy_from_slice(&self.aggregates.sum_white_elo.to_le_bytes());
        b[60..68].copy_from_slice(&self.aggregates.sum_black_elo.to_le_bytes());
        b[68..72].copy_from_slice(&self.aggregates.earliest_date.to_le_bytes());
        b[72..76].copy_from_slice(&self.aggregates.latest_date.to_le_bytes());
        b[76..84].copy_from_slice(&self.heap_offset.to_le_bytes());
        b[84..92].copy_from_slice(&self.heap_len.to_le_bytes());
        b[92..96].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_LEN {
            return Err(Error::IndexCorrupt { reason: "file shorter than header".into() });
        }
        if &b[0..8] != config::INDEX_MAGIC {
            return Err(Error::IndexCorrupt { reason: "bad magic".into() });
        }
        let version = u32::from_le_bytes(b[8..12].try_into().unwrap());
        if version > config::INDEX_VERSION {
            return Err(Error::IndexVersionTooNew { found: version, supported: config::INDEX_VERSION });
        }
        Ok(Self {
            version,
            game_count: u64::from_le_bytes(b[12..20].try_into().unwrap()),
            aggregates: Aggregates {
                white_wins: u64::from_le_bytes(b[20..28].try_into().unwrap()),
                black_wins: u64::from_le_bytes(b[28..36].try_into().unwrap()),
                draws: u64::from_le_bytes(b[36..44].try_into().unwrap()),
                rated_game_count: u64::from_le_bytes(b[44..52].try_into().unwrap()),
                sum_white_elo: u64::from_le_bytes(b[52..60].try_into().unwrap()),
                sum_black_elo: u64::from_le_bytes(b[60..68].try_into().unwrap()),
                earliest_date: u32::from_le_bytes(b[68..72].try_into().unwrap()),
                latest_date: u32::from_le_bytes(b[72..76].try_into().unwrap()),
            },
            heap_offset: u64::from_le_bytes(b[76..84].try_into().unwrap()),
            heap_len: u64::from_le_bytes(b[84..92].try_into().unwrap()),
            checksum: u32::from_le_bytes(b[92..96].try_into().unwrap()),
        })
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------
pub struct IndexWriter;

impl IndexWriter {
    /// Builds a complete `.pbi` in memory, fsyncs it to a sibling temp file,
    /// then atomically renames it into place at `dest`.
    pub fn write(
        dest: &Path,
        records: &[GameRecord],
        heap: &HeapBuilder,
        aggregates: Aggregates,
    ) -> Result<()> {
        let (heap_blob, heap_offsets) = heap.finalise();

        let mut heap_region = Vec::with_capacity(4 + heap_offsets.len() * 8 + heap_blob.len());
        heap_region.extend_from_slice(&(heap_offsets.len() as u32).to_le_bytes());
        for (off, len) in &heap_offsets {
            heap_region.extend_from_slice(&off.to_le_bytes());
            heap_region.extend_from_slice(&len.to_le_bytes());
        }
        heap_region.extend_from_slice(&heap_blob);

        let mut body = Vec::with_capacity(records.len() * RECORD_LEN + heap_region.len());
        for r in records {
            body.extend_from_slice(&r.to_bytes());
        }
        let heap_offset_in_file = (HEADER_LEN + body.len()) as u64;
        body.extend_from_slice(&heap_region);

        let checksum = crc32fast::hash(&body);

        let header = IndexHeader {
            version: config::INDEX_VERSION,
            game_count: records.len() as u64,
            aggregates,
            heap_offset: heap_offset_in_file,
            heap_len: heap_region.len() as u64,
            checksum,
        };

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);

        write_atomic(dest, &out)
    }
}

/// Writes `bytes` to a `.{dest_file}.{uuid}.tmp` sibling, fsyncs, then
/// atomically renames over `dest`. Retries on `TargetLocked` with backoff.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = sibling_temp_path(dest);
    {
        let mut f = File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;
        f.write_all(bytes).map_err(|e| Error::io(&tmp_path, e))?;
        f.sync_all().map_err(|e| Error::io(&tmp_path, e))?;
    }

    let mut attempts = 0;
    loop {
        match std::fs::rename(&tmp_path, dest) {
            Ok(()) => return Ok(()),
            Err(e) if attempts < config::TARGET_LOCKED_MAX_ATTEMPTS => {
                attempts += 1;
                log::warn!("rename to {} failed ({e}), retrying ({attempts})", dest.display());
                std::thread::sleep(std::time::Duration::from_millis(config::TARGET_LOCKED_BACKOFF_MS * attempts as u64));
            }
            Err(_) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(Error::TargetLocked { path: dest.to_path_buf(), attempts });
            }
        }
    }
}

pub fn sibling_temp_path(dest: &Path) -> PathBuf {
    let file_name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp_name = format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4());
    dest.with_file_name(tmp_name)
}

/// Derives the companion `.pbi` path for a PGN file.
pub fn companion_path(pgn_path: &Path) -> PathBuf {
    let mut s = pgn_path.as_os_str().to_os_string();
    s.push(".");
    s.push(config::INDEX_SUFFIX);
    PathBuf::from(s)
}

/// Flips one flag bit of one record in place, then recomputes and rewrites
/// the header checksum. Per spec.md §3.5 / §9, in-place mutation is allowed
/// only for this narrow single-writer annotation-flag flow — the `.pbi` is
/// otherwise read-only by convention, and every other transform produces a
/// fresh index alongside its fresh PGN. Callers must guarantee exclusive
/// access to `path` for the duration of the call.
pub fn reflag_in_place(path: &Path, game_index: usize, bit: u8, on: bool) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| Error::io(path, e))?;
    let mut mmap = unsafe { memmap2::MmapMut::map_mut(&file).map_err(|e| Error::io(path, e))? };

    {
        let header = IndexHeader::from_bytes(&mmap)?;
        if game_index >= header.game_count as usize {
            return Err(Error::InvalidInput { reason: format!("game index {game_index} out of range") });
        }
    }

    let record_start = HEADER_LEN + game_index * RECORD_LEN;
    let flags_byte = record_start + 27;
    if on {
        mmap[flags_byte] |= bit;
    } else {
        mmap[flags_byte] &= !bit;
    }

    let checksum = crc32fast::hash(&mmap[HEADER_LEN..]);
    mmap[92..96].copy_from_slice(&checksum.to_le_bytes());
    mmap.flush().map_err(|e| Error::io(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------
pub struct IndexReader {
    mmap: Mmap,
    header: IndexHeader,
    heap_count: u32,
    heap_blob_offset: usize,
    heap_offsets: Vec<(u32, u32)>,
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path).map_err(|e| Error::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(path, e))? };
        let header = IndexHeader::from_bytes(&mmap)?;

        let heap_start = header.heap_offset as usize;
        let heap_count_bytes = mmap
            .get(heap_start..heap_start + 4)
            .ok_or_else(|| Error::IndexCorrupt { reason: "heap region truncated".into() })?;
        let heap_count = u32::from_le_bytes(heap_count_bytes.try_into().unwrap());
        let heap_table_offset = heap_start + 4;
        let heap_blob_offset = heap_table_offset + heap_count as usize * 8;

        let table_bytes = mmap
            .get(heap_table_offset..heap_blob_offset)
            .ok_or_else(|| Error::IndexCorrupt { reason: "heap offset table truncated".into() })?;
        let heap_offsets: Vec<(u32, u32)> = table_bytes
            .chunks_exact(8)
            .map(|c| (u32::from_le_bytes(c[0..4].try_into().unwrap()), u32::from_le_bytes(c[4..8].try_into().unwrap())))
            .collect();

        let reader = Self { mmap, header, heap_count, heap_blob_offset, heap_offsets };
        Ok(reader)
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn record_count(&self) -> usize {
        self.header.game_count as usize
    }

    pub fn record(&self, i: usize) -> Option<GameRecord> {
        let start = HEADER_LEN + i * RECORD_LEN;
        let bytes = self.mmap.get(start..start + RECORD_LEN)?;
        Some(GameRecord::from_bytes(bytes))
    }

    pub fn records(&self) -> impl Iterator<Item = GameRecord> + '_ {
        (0..self.record_count()).map(move |i| self.record(i).unwrap())
    }

    pub fn heap_string(&self, id: u32) -> Option<&str> {
        let blob_len = self.header.heap_len as usize - 4 - self.heap_count as usize * 8;
        let blob = &self.mmap[self.heap_blob_offset..self.heap_blob_offset + blob_len];
        HeapView::new(blob, &self.heap_offsets).lookup(id)
    }

    pub fn verify_checksum(&self) -> bool {
        let body_start = HEADER_LEN;
        let body = &self.mmap[body_start..];
        crc32fast::hash(body) == self.header.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<GameRecord> {
        vec![
            GameRecord {
                file_offset: 0,
                length: 100,
                white_name_id: 1,
                black_name_id: 2,
                white_elo: 2800,
                black_elo: 2750,
                result: 1,
                eco_category: b'C',
                eco_number: 65,
                flags: flags::HAS_VARIATIONS,
                date_compact: pack_date(2023, 5, 15),
            },
            GameRecord {
                file_offset: 100,
                length: 120,
                white_name_id: 2,
                black_name_id: 1,
                white_elo: 2750,
                black_elo: 2800,
                result: 3,
                eco_category: 0,
                eco_number: 0xFF,
                flags: 0,
                date_compact: pack_date(2023, 0, 0),
            },
        ]
    }

    #[test]
    fn record_round_trips_through_bytes() {
        for r in sample_records() {
            let b = r.to_bytes();
            assert_eq!(GameRecord::from_bytes(&b), r);
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pbi");

        let mut heap = HeapBuilder::new();
        let id1 = heap.intern("Carlsen, Magnus");
        let id2 = heap.intern("Nakamura, Hikaru");
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);

        let records = sample_records();
        let aggregates = Aggregates {
            white_wins: 1,
            black_wins: 0,
            draws: 1,
            rated_game_count: 2,
            sum_white_elo: 2800 + 2750,
            sum_black_elo: 2750 + 2800,
            earliest_date: pack_date(2023, 0, 0),
            latest_date: pack_date(2023, 5, 15),
        };

        IndexWriter::write(&path, &records, &heap, aggregates).unwrap();

        let reader = IndexReader::open(&path).unwrap();
        assert!(reader.verify_checksum());
        assert_eq!(reader.record_count(), 2);
        assert_eq!(reader.header().aggregates.white_wins, 1);
        assert_eq!(reader.record(0).unwrap(), records[0]);
        assert_eq!(reader.record(1).unwrap(), records[1]);
        assert_eq!(reader.heap_string(1), Some("Carlsen, Magnus"));
        assert_eq!(reader.heap_string(2), Some("Nakamura, Hikaru"));
        assert_eq!(reader.heap_string(0), None);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.pbi");
        std::fs::write(&path, b"not an index at all, too short or wrong").unwrap();
        assert!(IndexReader::open(&path).is_err());
    }

    #[test]
    fn reflag_in_place_updates_bit_and_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flags.pbi");
        let heap = HeapBuilder::new();
        let records = sample_records();
        IndexWriter::write(&path, &records, &heap, Aggregates::default()).unwrap();

        reflag_in_place(&path, 1, flags::CHECKMATE, true).unwrap();

        let reader = IndexReader::open(&path).unwrap();
        assert!(reader.verify_checksum());
        assert!(reader.record(1).unwrap().has_flag(flags::CHECKMATE));
        assert!(!reader.record(0).unwrap().has_flag(flags::CHECKMATE));
    }
}

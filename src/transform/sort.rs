// src/transform/sort.rs
// ---------------------------------------------------------------------------
// Stable, two-key sort over an indexed PGN. Three key-extraction strategies
// per §4.5.1: pure-index (GameRecord fields), heap-aware (player names,
// resolved once), and hybrid-parse (Round/Event via a bounded header scan,
// PlyCount via a bounded movetext scan). The sorted PGN is written fresh and
// its companion index rebuilt from scratch — see DESIGN.md for why this
// engine doesn't special-case preserving the source heap.
// ---------------------------------------------------------------------------

use std::cmp::Ordering;
use std::path::Path;

use memmap2::Mmap;

use crate::config;
use crate::error::Result;
use crate::index::{GameRecord, IndexReader};
use crate::pgn::{self, GameSplitter, PgnTokenizer, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform::{self, TransformReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Date,
    WhiteElo,
    BlackElo,
    Result,
    Eco,
    WhiteName,
    BlackName,
    Round,
    Event,
    PlyCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct SortOptions {
    pub primary: SortKey,
    pub primary_dir: SortDirection,
    pub secondary: Option<SortKey>,
    pub secondary_dir: SortDirection,
    /// Unstable sort is opt-in; the default preserves source order among ties.
    pub stable: bool,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            primary: SortKey::Date,
            primary_dir: SortDirection::Ascending,
            secondary: None,
            secondary_dir: SortDirection::Ascending,
            stable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum KeyValue {
    Missing,
    Int(u64),
    Text(String),
}

struct Keyed {
    original_index: usize,
    primary: KeyValue,
    secondary: Option<KeyValue>,
}

pub fn sort_pgn(
    pgn_path: &Path,
    dest: &Path,
    opts: &SortOptions,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<TransformReport> {
    let (index_reader, _) = transform::open_or_build_index(pgn_path, cancel)?;
    let mmap = transform::map_pgn(pgn_path)?;
    let records: Vec<GameRecord> = index_reader.records().collect();
    let mut reporter = ProgressReporter::new("sorting", Some(records.len() as u64), progress_cb);

    let mut keyed = Vec::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        cancel.check()?;
        let primary = extract_key(opts.primary, &index_reader, &mmap, rec, i)?;
        let secondary = match opts.secondary {
            Some(k) => Some(extract_key(k, &index_reader, &mmap, rec, i)?),
            None => None,
        };
        keyed.push(Keyed { original_index: i, primary, secondary });
        reporter.report(i as u64 + 1);
    }

    let cmp = |a: &Keyed, b: &Keyed| -> Ordering {
        let mut ord = compare_values(&a.primary, &b.primary, opts.primary_dir);
        if ord == Ordering::Equal {
            if let (Some(ap), Some(bp)) = (&a.secondary, &b.secondary) {
                ord = compare_values(ap, bp, opts.secondary_dir);
            }
        }
        if ord == Ordering::Equal && opts.stable {
            ord = a.original_index.cmp(&b.original_index);
        }
        ord
    };

    if opts.stable {
        keyed.sort_by(cmp);
    } else {
        keyed.sort_unstable_by(cmp);
    }

    let mut out = String::new();
    for k in &keyed {
        cancel.check()?;
        let raw = transform::game_bytes(&mmap, &records[k.original_index], k.original_index)?;
        out.push_str(&String::from_utf8_lossy(raw));
        out.push_str("\n\n");
    }
    reporter.finish(records.len() as u64);

    transform::finish_with_index(dest, &out, cancel)?;

    Ok(TransformReport { games_processed: records.len() as u64, games_kept: records.len() as u64, errors: Vec::new() })
}

/// `Missing` always sorts last in ascending order and first in descending
/// order, independent of how the direction flips everything else.
fn compare_values(a: &KeyValue, b: &KeyValue, dir: SortDirection) -> Ordering {
    match (a, b) {
        (KeyValue::Missing, KeyValue::Missing) => Ordering::Equal,
        (KeyValue::Missing, _) => if dir == SortDirection::Ascending { Ordering::Greater } else { Ordering::Less },
        (_, KeyValue::Missing) => if dir == SortDirection::Ascending { Ordering::Less } else { Ordering::Greater },
        (KeyValue::Int(x), KeyValue::Int(y)) => {
            let raw = x.cmp(y);
            if dir == SortDirection::Ascending { raw } else { raw.reverse() }
        }
        (KeyValue::Text(x), KeyValue::Text(y)) => {
            let raw = x.cmp(y);
            if dir == SortDirection::Ascending { raw } else { raw.reverse() }
        }
        _ => Ordering::Equal,
    }
}

fn extract_key(kind: SortKey, heap: &IndexReader, mmap: &Mmap, rec: &GameRecord, idx: usize) -> Result<KeyValue> {
    Ok(match kind {
        SortKey::Date => int_or_missing(rec.date_compact as u64, rec.date_compact == 0),
        SortKey::WhiteElo => int_or_missing(rec.white_elo as u64, rec.white_elo == 0),
        SortKey::BlackElo => int_or_missing(rec.black_elo as u64, rec.black_elo == 0),
        SortKey::Result => KeyValue::Int(rec.result as u64),
        SortKey::Eco => int_or_missing(((rec.eco_category as u64) << 8) | rec.eco_number as u64, rec.eco_category == 0),
        SortKey::WhiteName => heap
            .heap_string(rec.white_name_id)
            .map(|s| KeyValue::Text(s.to_lowercase()))
            .unwrap_or(KeyValue::Missing),
        SortKey::BlackName => heap
            .heap_string(rec.black_name_id)
            .map(|s| KeyValue::Text(s.to_lowercase()))
            .unwrap_or(KeyValue::Missing),
        SortKey::Round | SortKey::Event => {
            let raw = transform::game_bytes(mmap, rec, idx)?;
            let bound = raw.len().min(config::HEADER_SCAN_BYTES);
            let tag_name = if kind == SortKey::Round { "Round" } else { "Event" };
            scan_header_value(&raw[..bound], tag_name).map(KeyValue::Text).unwrap_or(KeyValue::Missing)
        }
        SortKey::PlyCount => {
            let raw = transform::game_bytes(mmap, rec, idx)?;
            KeyValue::Int(count_plies(raw) as u64)
        }
    })
}

fn int_or_missing(v: u64, missing: bool) -> KeyValue {
    if missing { KeyValue::Missing } else { KeyValue::Int(v) }
}

/// Line-based scan of a bounded byte prefix for one header's value. Avoids
/// the tokenizer's whole-game completion assumption, since the prefix may
/// cut off mid-movetext.
fn scan_header_value(bytes: &[u8], name: &str) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('[') {
            if !line.is_empty() {
                break;
            }
            continue;
        }
        let inner = line.trim_start_matches('[').trim_end_matches(']');
        let mut parts = inner.splitn(2, ' ');
        let key = parts.next()?.trim();
        if key.eq_ignore_ascii_case(name) {
            let value = parts.next()?.trim().trim_matches('"');
            if value.is_empty() || value == "?" {
                return None;
            }
            return Some(value.to_string());
        }
    }
    None
}

fn count_plies(raw: &[u8]) -> u32 {
    let mut tok = PgnTokenizer::new(raw);
    let mut splitter = GameSplitter::new(&mut tok);
    let Ok(Some((_, tokens))) = splitter.next_game() else { return 0 };
    let (_, body) = pgn::split_headers(&tokens);
    let mut depth = 0u32;
    let mut count = 0u32;
    for t in body {
        match t {
            Token::VariationOpen => depth += 1,
            Token::VariationClose => depth = depth.saturating_sub(1),
            Token::SanMove(_) if depth == 0 => {
                count += 1;
                if count as usize >= config::PLY_COUNT_SCAN_LIMIT {
                    break;
                }
            }
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PGN: &str = "[White \"B\"]\n[Result \"1-0\"]\n[WhiteElo \"2700\"]\n\n1. e4 1-0\n\n\
                        [White \"A\"]\n[Result \"0-1\"]\n[WhiteElo \"2750\"]\n\n1. d4 0-1\n\n\
                        [White \"C\"]\n[Result \"*\"]\n\n1. c4 *\n\n";

    #[test]
    fn sorts_by_white_elo_descending_with_missing_last_in_ascending() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(&pgn_path, PGN).unwrap();
        let dest = dir.path().join("sorted.pgn");

        let opts = SortOptions { primary: SortKey::WhiteElo, primary_dir: SortDirection::Ascending, ..Default::default() };
        let cancel = CancellationToken::new();
        let report = sort_pgn(&pgn_path, &dest, &opts, &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 3);

        let text = std::fs::read_to_string(&dest).unwrap();
        let b_pos = text.find("[White \"B\"]").unwrap();
        let a_pos = text.find("[White \"A\"]").unwrap();
        let c_pos = text.find("[White \"C\"]").unwrap();
        // B (2700) < A (2750) < C (missing, sorts last ascending).
        assert!(b_pos < a_pos);
        assert!(a_pos < c_pos);
    }

    #[test]
    fn stable_sort_preserves_source_order_among_ties() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        let pgn = "[White \"First\"]\n[Result \"1-0\"]\n[WhiteElo \"2780\"]\n\n1. e4 1-0\n\n\
                   [White \"Second\"]\n[Result \"1/2-1/2\"]\n[WhiteElo \"2780\"]\n\n1. d4 1/2-1/2\n\n";
        std::fs::write(&pgn_path, pgn).unwrap();
        let dest = dir.path().join("sorted.pgn");

        let opts = SortOptions { primary: SortKey::WhiteElo, primary_dir: SortDirection::Ascending, ..Default::default() };
        let cancel = CancellationToken::new();
        sort_pgn(&pgn_path, &dest, &opts, &cancel, |_| {}).unwrap();

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.find("First").unwrap() < text.find("Second").unwrap());
    }

    #[test]
    fn header_scan_reads_round_within_bounded_prefix() {
        let bytes = b"[Event \"Test\"]\n[Round \"7\"]\n[White \"A\"]\n\n1. e4 *\n\n";
        assert_eq!(scan_header_value(bytes, "Round"), Some("7".to_string()));
        assert_eq!(scan_header_value(bytes, "Site"), None);
    }

    #[test]
    fn ply_count_scan_stops_at_limit() {
        let mut pgn = String::from("[Result \"*\"]\n\n");
        for i in 1..=250 {
            pgn.push_str(&format!("{i}. e4 e5 "));
        }
        pgn.push('*');
        assert_eq!(count_plies(pgn.as_bytes()), config::PLY_COUNT_SCAN_LIMIT as u32);
    }
}

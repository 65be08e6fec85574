// src/transform/split.rs
// ---------------------------------------------------------------------------
// Partitions an indexed PGN into multiple output files. Three selector
// families per §4.5.2: fixed-count chunking, tag-value partitioning (player
// name, ECO, Event — "both" emits a game into both the White and Black
// partitions), and date-precision bucketing (year / year-month / full date).
// Each partition gets its own filename (NFKC-normalised, sanitised, capped,
// disambiguated) and its own from-scratch heap + companion index.
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::config;
use crate::error::Result;
use crate::index::GameRecord;
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform::{self, TransformReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrecision {
    Year,
    Month,
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitBy {
    FixedCount(usize),
    White,
    Black,
    /// Emits every game into both its White partition and its Black partition.
    BothPlayers,
    Eco,
    Event,
    Date(DatePrecision),
}

#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub report: TransformReport,
    /// Paths of every partition file written, in the order partitions were
    /// first created.
    pub files: Vec<PathBuf>,
}

pub fn split_pgn(
    pgn_path: &Path,
    out_dir: &Path,
    by: SplitBy,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<SplitOutcome> {
    let (index_reader, _) = transform::open_or_build_index(pgn_path, cancel)?;
    let mmap = transform::map_pgn(pgn_path)?;
    let records: Vec<GameRecord> = index_reader.records().collect();
    let mut reporter = ProgressReporter::new("splitting", Some(records.len() as u64), progress_cb);

    // Ordered by first-seen key, so output file numbering is deterministic
    // and stable across runs on unchanged input.
    let mut partitions: BTreeMap<String, String> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut games_emitted = 0u64;

    for (i, rec) in records.iter().enumerate() {
        cancel.check()?;
        let raw = transform::game_bytes(&mmap, rec, i)?;
        let text = String::from_utf8_lossy(raw);

        for key in partition_keys(by, &index_reader, &mmap, rec, i)? {
            if !partitions.contains_key(&key) {
                order.push(key.clone());
            }
            let entry = partitions.entry(key).or_default();
            entry.push_str(&text);
            entry.push_str("\n\n");
            games_emitted += 1;
        }
        reporter.report(i as u64 + 1);
    }
    reporter.finish(records.len() as u64);

    std::fs::create_dir_all(out_dir).map_err(|e| crate::error::Error::io(out_dir, e))?;

    let stem = pgn_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "split".into());
    let mut used_names: Vec<String> = Vec::new();
    let mut files = Vec::with_capacity(order.len());

    for key in &order {
        cancel.check()?;
        let text = &partitions[key];
        let base = sanitize_filename(&format!("{stem}-{key}"));
        let name = disambiguate(&base, &used_names);
        used_names.push(name.clone());

        let dest = out_dir.join(format!("{name}.pgn"));
        transform::finish_with_index(&dest, text, cancel)?;
        files.push(dest);
    }

    Ok(SplitOutcome {
        report: TransformReport { games_processed: records.len() as u64, games_kept: games_emitted, errors: Vec::new() },
        files,
    })
}

fn partition_keys(
    by: SplitBy,
    heap: &crate::index::IndexReader,
    mmap: &memmap2::Mmap,
    rec: &GameRecord,
    idx: usize,
) -> Result<Vec<String>> {
    Ok(match by {
        SplitBy::FixedCount(n) => vec![format!("part-{:05}", idx / n.max(1))],
        SplitBy::White => vec![heap.heap_string(rec.white_name_id).unwrap_or("unknown").to_string()],
        SplitBy::Black => vec![heap.heap_string(rec.black_name_id).unwrap_or("unknown").to_string()],
        SplitBy::BothPlayers => {
            let w = heap.heap_string(rec.white_name_id).unwrap_or("unknown").to_string();
            let b = heap.heap_string(rec.black_name_id).unwrap_or("unknown").to_string();
            if w == b { vec![w] } else { vec![w, b] }
        }
        SplitBy::Eco => vec![if rec.eco_category == 0 {
            "unknown".to_string()
        } else {
            format!("{}{:02}", rec.eco_category as char, rec.eco_number)
        }],
        SplitBy::Event => {
            let raw = transform::game_bytes(mmap, rec, idx)?;
            let bound = raw.len().min(config::HEADER_SCAN_BYTES);
            vec![scan_header_value(&raw[..bound], "Event").unwrap_or_else(|| "unknown".to_string())]
        }
        SplitBy::Date(precision) => {
            let d = rec.date_compact;
            if d == 0 {
                vec!["unknown".to_string()]
            } else {
                let year = d / 10_000;
                let month = (d / 100) % 100;
                let day = d % 100;
                vec![match precision {
                    DatePrecision::Year => format!("{year:04}"),
                    DatePrecision::Month => format!("{year:04}-{month:02}"),
                    DatePrecision::Day => format!("{year:04}-{month:02}-{day:02}"),
                }]
            }
        }
    })
}

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

/// NFKC-normalises, replaces anything but ASCII alphanumerics/`-`/`_` with
/// `_`, collapses repeats, and caps the result to
/// [`config::SPLIT_FILENAME_MAX_LEN`] bytes.
fn sanitize_filename(raw: &str) -> String {
    let normalised: String = raw.nfkc().collect();
    let mut out = String::with_capacity(normalised.len());
    let mut last_was_underscore = false;
    for c in normalised.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let capped: String = trimmed.chars().take(config::SPLIT_FILENAME_MAX_LEN).collect();
    if capped.is_empty() { "split".to_string() } else { capped }
}

/// Appends `-2`, `-3`, ... if `base` collides with an already-used name,
/// re-applying the length cap so the suffix doesn't push past the limit.
fn disambiguate(base: &str, used: &[String]) -> String {
    if !used.iter().any(|u| u == base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let suffix = format!("-{n}");
        let budget = config::SPLIT_FILENAME_MAX_LEN.saturating_sub(suffix.len());
        let candidate = format!("{}{}", &base[..base.len().min(budget)], suffix);
        if !used.iter().any(|u| u == &candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PGN: &str = "[White \"Ana\"]\n[Black \"Bo\"]\n[Result \"1-0\"]\n\n1. e4 1-0\n\n\
                        [White \"Bo\"]\n[Black \"Ana\"]\n[Result \"0-1\"]\n\n1. d4 0-1\n\n\
                        [White \"Cid\"]\n[Black \"Ana\"]\n[Result \"*\"]\n\n1. c4 *\n\n";

    #[test]
    fn splits_by_white_into_one_file_per_player() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(&pgn_path, PGN).unwrap();
        let out = dir.path().join("out");

        let cancel = CancellationToken::new();
        let outcome = split_pgn(&pgn_path, &out, SplitBy::White, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.files.len(), 3);
        assert_eq!(outcome.report.games_kept, 3);
    }

    #[test]
    fn both_players_selector_double_emits_into_two_partitions() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(&pgn_path, "[White \"Ana\"]\n[Black \"Bo\"]\n[Result \"1-0\"]\n\n1. e4 1-0\n\n").unwrap();
        let out = dir.path().join("out");

        let cancel = CancellationToken::new();
        let outcome = split_pgn(&pgn_path, &out, SplitBy::BothPlayers, &cancel, |_| {}).unwrap();
        assert_eq!(outcome.files.len(), 2);
        assert_eq!(outcome.report.games_kept, 2);
    }

    #[test]
    fn fixed_count_chunks_sequentially() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(&pgn_path, PGN).unwrap();
        let out = dir.path().join("out");

        let cancel = CancellationToken::new();
        let outcome = split_pgn(&pgn_path, &out, SplitBy::FixedCount(2), &cancel, |_| {}).unwrap();
        assert_eq!(outcome.files.len(), 2); // games 0,1 in part-00000; game 2 in part-00001
    }

    #[test]
    fn sanitize_replaces_invalid_characters_and_caps_length() {
        let raw = "Tournament: Döåt/Slash Edition??".repeat(3);
        let name = sanitize_filename(&raw);
        assert!(name.len() <= config::SPLIT_FILENAME_MAX_LEN);
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
    }

    #[test]
    fn disambiguate_appends_numeric_suffix_on_collision() {
        let used = vec!["file".to_string()];
        assert_eq!(disambiguate("file", &used), "file-2");
        let used2 = vec!["file".to_string(), "file-2".to_string()];
        assert_eq!(disambiguate("file", &used2), "file-3");
    }
}

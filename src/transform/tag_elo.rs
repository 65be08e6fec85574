// src/transform/tag_elo.rs
// ---------------------------------------------------------------------------
// Tagger-Elo: fills in missing WhiteElo/BlackElo headers from an external
// rating source. The source is abstracted behind `RatingSource` so the CLI
// can back it with a CSV/FIDE-dump lookup table without this module caring
// about the format — it only needs `lookup(name, year, month) -> Option<u16>`.
// ---------------------------------------------------------------------------

use std::path::Path;

use crate::config;
use crate::error::{GameError, Result};
use crate::index::GameRecord;
use crate::pgn::{self, GameSplitter, PgnTokenizer, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform::{self, TransformReport};

/// A source of historical ratings, keyed by normalised player name and the
/// year/month the game was played.
pub trait RatingSource {
    fn lookup(&self, name: &str, year: u32, month: u32) -> Option<u16>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMatch {
    /// Name must match the source exactly (after heap normalisation).
    Exact,
    /// Falls back to a case-insensitive, punctuation-stripped comparison
    /// when no exact match is found.
    Fuzzy,
}

#[derive(Debug, Clone, Copy)]
pub struct TagEloOptions {
    pub name_match: NameMatch,
    /// Overwrite an existing Elo header rather than only filling gaps.
    pub overwrite: bool,
}

impl Default for TagEloOptions {
    fn default() -> Self {
        Self { name_match: NameMatch::Exact, overwrite: false }
    }
}

pub fn tag_elo(
    pgn_path: &Path,
    dest: &Path,
    source: &dyn RatingSource,
    opts: &TagEloOptions,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<TransformReport> {
    let (index_reader, _) = transform::open_or_build_index(pgn_path, cancel)?;
    let mmap = transform::map_pgn(pgn_path)?;
    let records: Vec<GameRecord> = index_reader.records().collect();
    let mut reporter = ProgressReporter::new("tagging elo", Some(records.len() as u64), progress_cb);

    let mut out = String::new();
    let mut errors = Vec::new();
    let mut tagged = 0u64;

    for (i, rec) in records.iter().enumerate() {
        cancel.check()?;
        let raw = transform::game_bytes(&mmap, rec, i)?;
        match apply_one(raw, rec, source, opts) {
            Ok((text, changed)) => {
                out.push_str(&text);
                out.push_str("\n\n");
                if changed {
                    tagged += 1;
                }
            }
            Err(msg) => {
                errors.push(GameError { game_index: i as u64, offset: rec.file_offset, message: msg });
                out.push_str(&String::from_utf8_lossy(raw));
                out.push_str("\n\n");
            }
        }
        reporter.report(i as u64 + 1);
    }
    reporter.finish(records.len() as u64);

    transform::finish_with_index(dest, &out, cancel)?;

    Ok(TransformReport { games_processed: records.len() as u64, games_kept: tagged, errors })
}

fn apply_one(
    raw: &[u8],
    rec: &GameRecord,
    source: &dyn RatingSource,
    opts: &TagEloOptions,
) -> std::result::Result<(String, bool), String> {
    let mut tok = PgnTokenizer::new(raw);
    let mut splitter = GameSplitter::new(&mut tok);
    let (_, tokens) = splitter.next_game().map_err(|e| e.to_string())?.ok_or_else(|| "empty game".to_string())?;
    let (headers, _) = pgn::split_headers(&tokens);

    let white = headers.iter().find(|(k, _)| *k == "White").map(|(_, v)| *v).unwrap_or("?");
    let black = headers.iter().find(|(k, _)| *k == "Black").map(|(_, v)| *v).unwrap_or("?");
    let (year, month) = date_parts(rec.date_compact);

    let mut new_white = None;
    let mut new_black = None;
    if opts.overwrite || rec.white_elo == 0 {
        if let Some(rating) = lookup(source, white, year, month, opts.name_match) {
            new_white = Some(clamp(rating));
        }
    }
    if opts.overwrite || rec.black_elo == 0 {
        if let Some(rating) = lookup(source, black, year, month, opts.name_match) {
            new_black = Some(clamp(rating));
        }
    }

    let changed = new_white.is_some() || new_black.is_some();
    let text = rewrite_headers(raw, &headers, new_white, new_black);
    Ok((text, changed))
}

fn lookup(source: &dyn RatingSource, name: &str, year: u32, month: u32, mode: NameMatch) -> Option<u16> {
    if let Some(r) = source.lookup(name, year, month) {
        return Some(r);
    }
    if mode == NameMatch::Fuzzy {
        let folded = fold(name);
        // A source that only indexes exact names won't find the folded
        // variant either; this mode exists for sources that do their own
        // fuzzy indexing. As a best-effort fallback we retry once more with
        // the folded form in case it happens to match verbatim.
        if folded != name {
            return source.lookup(&folded, year, month);
        }
    }
    None
}

fn fold(name: &str) -> String {
    name.chars().filter(|c| c.is_alphanumeric() || c.is_whitespace()).collect::<String>().to_lowercase()
}

fn clamp(rating: u16) -> u16 {
    if rating < config::ELO_MIN {
        config::ELO_MIN
    } else if rating > config::ELO_MAX {
        config::ELO_MAX
    } else {
        rating
    }
}

fn date_parts(packed: u32) -> (u32, u32) {
    (packed / 10_000, (packed / 100) % 100)
}

/// Rewrites just the header block, leaving movetext (comments, NAGs,
/// variations) untouched. The movetext is recovered by locating the first
/// blank line in the source text rather than re-serialising tokens.
fn rewrite_headers(raw: &[u8], headers: &[(&str, &str)], white: Option<u16>, black: Option<u16>) -> String {
    let text = String::from_utf8_lossy(raw);
    let movetext = match text.find("\n\n") {
        Some(idx) => &text[idx + 2..],
        None => "",
    };

    let mut out = String::new();
    let mut seen_white = false;
    let mut seen_black = false;

    for (k, v) in headers {
        match *k {
            "WhiteElo" if white.is_some() => {
                out.push_str(&format!("[WhiteElo \"{}\"]\n", white.unwrap()));
                seen_white = true;
            }
            "BlackElo" if black.is_some() => {
                out.push_str(&format!("[BlackElo \"{}\"]\n", black.unwrap()));
                seen_black = true;
            }
            _ => out.push_str(&format!("[{k} \"{v}\"]\n")),
        }
    }
    if !seen_white {
        if let Some(w) = white {
            out.push_str(&format!("[WhiteElo \"{w}\"]\n"));
        }
    }
    if !seen_black {
        if let Some(b) = black {
            out.push_str(&format!("[BlackElo \"{b}\"]\n"));
        }
    }

    out.push('\n');
    out.push_str(movetext);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct MapSource(HashMap<(String, u32, u32), u16>);
    impl RatingSource for MapSource {
        fn lookup(&self, name: &str, year: u32, month: u32) -> Option<u16> {
            self.0.get(&(name.to_string(), year, month)).copied()
        }
    }

    #[test]
    fn fills_missing_elo_from_source() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(&pgn_path, "[White \"Ana\"]\n[Black \"Bo\"]\n[Date \"2024.03.01\"]\n[Result \"1-0\"]\n\n1. e4 1-0\n\n")
            .unwrap();
        let dest = dir.path().join("tagged.pgn");

        let mut map = HashMap::new();
        map.insert(("Ana".to_string(), 2024, 3), 2500u16);
        let source = MapSource(map);

        let cancel = CancellationToken::new();
        let report = tag_elo(&pgn_path, &dest, &source, &TagEloOptions::default(), &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 1);

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("[WhiteElo \"2500\"]"));
        assert!(!text.contains("BlackElo"));
    }

    #[test]
    fn clamp_keeps_ratings_within_bounds() {
        assert_eq!(clamp(5000), config::ELO_MAX);
        assert_eq!(clamp(0), config::ELO_MIN);
        assert_eq!(clamp(2500), 2500);
    }

    #[test]
    fn does_not_overwrite_existing_rating_unless_asked() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(
            &pgn_path,
            "[White \"Ana\"]\n[WhiteElo \"2200\"]\n[Date \"2024.03.01\"]\n[Result \"1-0\"]\n\n1. e4 1-0\n\n",
        )
        .unwrap();
        let dest = dir.path().join("tagged.pgn");

        let mut map = HashMap::new();
        map.insert(("Ana".to_string(), 2024, 3), 2500u16);
        let source = MapSource(map);

        let cancel = CancellationToken::new();
        tag_elo(&pgn_path, &dest, &source, &TagEloOptions::default(), &cancel, |_| {}).unwrap();
        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("2200"));
    }
}

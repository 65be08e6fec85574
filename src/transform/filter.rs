// src/transform/filter.rs
// ---------------------------------------------------------------------------
// Filter-Checkmate: classifies each game's ending by replaying its mainline
// on a `Board`, keeps only games matching the requested ending, and
// cross-checks the classification against the game's `Result` tag. The
// indexer's trailing-`#` heuristic (`flags::CHECKMATE`) is a cheap hint used
// only at index-build time to skip non-candidates early elsewhere; it is
// never trusted here as a substitute for replay, since trailing `#` in the
// movetext doesn't guarantee the position it's attached to is actually mate.
// ---------------------------------------------------------------------------

use std::path::Path;

use crate::board::Board;
use crate::error::{GameError, Result};
use crate::index::GameRecord;
use crate::pgn::{self, GameSplitter, PgnTokenizer, ResultKind, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform::{self, TransformReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEnding {
    Checkmate,
    Stalemate,
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct FilterOptions {
    pub keep: GameEnding,
    /// Skip (rather than just warn about) games whose classified ending
    /// disagrees with their `Result` tag.
    pub strict: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self { keep: GameEnding::Checkmate, strict: false }
    }
}

pub fn filter_checkmate(
    pgn_path: &Path,
    dest: &Path,
    opts: &FilterOptions,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<TransformReport> {
    let (index_reader, _) = transform::open_or_build_index(pgn_path, cancel)?;
    let mmap = transform::map_pgn(pgn_path)?;
    let records: Vec<GameRecord> = index_reader.records().collect();
    let mut reporter = ProgressReporter::new("filtering", Some(records.len() as u64), progress_cb);

    let mut out = String::new();
    let mut kept = 0u64;
    let mut errors = Vec::new();

    for (i, rec) in records.iter().enumerate() {
        cancel.check()?;
        let raw = transform::game_bytes(&mmap, rec, i)?;
        let text = String::from_utf8_lossy(raw);

        let (ending, expected, declared) = match classify(rec, raw) {
            Ok(v) => v,
            Err(msg) => {
                errors.push(GameError { game_index: i as u64, offset: rec.file_offset, message: msg });
                reporter.report(i as u64 + 1);
                continue;
            }
        };

        let mut mismatched = false;
        if let (Some(exp), Some(decl)) = (expected, declared) {
            if exp != decl {
                mismatched = true;
                let msg = format!("classified ending {ending:?} implies result {exp:?}, but Result tag says {decl:?}");
                errors.push(GameError { game_index: i as u64, offset: rec.file_offset, message: msg });
            }
        }

        if mismatched && opts.strict {
            reporter.report(i as u64 + 1);
            continue;
        }

        if ending == opts.keep {
            out.push_str(&text);
            out.push_str("\n\n");
            kept += 1;
        }
        reporter.report(i as u64 + 1);
    }
    reporter.finish(records.len() as u64);

    transform::finish_with_index(dest, &out, cancel)?;

    Ok(TransformReport { games_processed: records.len() as u64, games_kept: kept, errors })
}

/// Classifies a game's ending by replaying its mainline. Returns
/// `(ending, expected_result, declared_result)`: `expected_result` is what
/// the `Result` tag *should* say given the classification (`None` for an
/// incomplete game, which has no fixed expectation); `declared_result` is
/// whatever the tag actually says.
fn classify(_rec: &GameRecord, raw: &[u8]) -> std::result::Result<(GameEnding, Option<ResultKind>, Option<ResultKind>), String> {
    let text = std::str::from_utf8(raw).map_err(|_| "invalid utf-8 in game bytes".to_string())?;
    let mut tok = PgnTokenizer::new(raw);
    let mut splitter = GameSplitter::new(&mut tok);
    let (_, tokens) = splitter
        .next_game()
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "empty game".to_string())?;
    let (_, body) = pgn::split_headers(&tokens);

    let declared = body.iter().find_map(|t| match t {
        Token::Result(r) => Some(*r),
        _ => None,
    });

    let mut board = Board::start_position();
    let mut depth = 0u32;
    for t in body {
        match t {
            Token::VariationOpen => depth += 1,
            Token::VariationClose => depth = depth.saturating_sub(1),
            Token::SanMove(s) if depth == 0 => {
                let mv = board.parse_san(s).map_err(|_| format!("unparseable move `{s}` in {text}"))?;
                board = board.apply(&mv);
            }
            _ => {}
        }
    }

    let (ending, expected) = if board.is_checkmate() {
        let exp = if board.turn() == shakmaty::Color::White { ResultKind::BlackWins } else { ResultKind::WhiteWins };
        (GameEnding::Checkmate, Some(exp))
    } else if board.is_stalemate() {
        (GameEnding::Stalemate, Some(ResultKind::Draw))
    } else {
        (GameEnding::Incomplete, None)
    };

    Ok((ending, expected, declared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keeps_only_checkmated_games() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        let mate = "[Result \"1-0\"]\n\n1. e4 e5 2. Bc4 Nc6 3. Qh5 Nf6 4. Qxf7# 1-0\n\n";
        let draw_stalemate = "[Result \"*\"]\n\n1. e4 e5 2. Nf3 *\n\n";
        std::fs::write(&pgn_path, format!("{mate}{draw_stalemate}")).unwrap();
        let dest = dir.path().join("mates.pgn");

        let cancel = CancellationToken::new();
        let report = filter_checkmate(&pgn_path, &dest, &FilterOptions::default(), &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 1);

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("Qxf7#"));
        assert!(!text.contains("Nf3 *"));
    }

    #[test]
    fn mismatched_result_tag_is_reported() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        // Checkmate for White (black to move, mated) but Result falsely says 0-1.
        let mate = "[Result \"0-1\"]\n\n1. e4 e5 2. Bc4 Nc6 3. Qh5 Nf6 4. Qxf7# 0-1\n\n";
        std::fs::write(&pgn_path, mate).unwrap();
        let dest = dir.path().join("mates.pgn");

        let cancel = CancellationToken::new();
        let report = filter_checkmate(&pgn_path, &dest, &FilterOptions::default(), &cancel, |_| {}).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.games_kept, 1); // non-strict: kept despite mismatch
    }

    #[test]
    fn strict_mode_skips_mismatched_games() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        let mate = "[Result \"0-1\"]\n\n1. e4 e5 2. Bc4 Nc6 3. Qh5 Nf6 4. Qxf7# 0-1\n\n";
        std::fs::write(&pgn_path, mate).unwrap();
        let dest = dir.path().join("mates.pgn");

        let cancel = CancellationToken::new();
        let opts = FilterOptions { keep: GameEnding::Checkmate, strict: true };
        let report = filter_checkmate(&pgn_path, &dest, &opts, &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 0);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn trailing_hash_without_real_checkmate_is_not_trusted() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        // "Qh4#" is textually suffixed with '#' but Black has a legal reply
        // (gxh4), so the real position is not checkmate. A classifier that
        // trusted the trailing '#' alone (or the indexer's flag derived from
        // it) would wrongly call this Checkmate; only full replay catches it.
        let fake_mate = "[Result \"*\"]\n\n1. e4 e5 2. g4 Nf6 3. Qh4# *\n\n";
        std::fs::write(&pgn_path, fake_mate).unwrap();
        let dest = dir.path().join("out.pgn");

        let cancel = CancellationToken::new();
        let report = filter_checkmate(&pgn_path, &dest, &FilterOptions::default(), &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 0, "Qh4# is not actually mate (gxh4 is legal); must not be kept as Checkmate");
    }

    #[test]
    fn keeps_stalemated_games_when_requested() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        // Classic stalemate (Black has no legal moves and isn't in check).
        let stalemate =
            "[Result \"1/2-1/2\"]\n\n1. e3 a5 2. Qh5 Ra6 3. Qxa5 h5 4. Qxc7 Rah6 5. h4 f6 6. Qxd7+ Kf7 \
             7. Qxb7 Qd3 8. Qxb8 Qh7 9. Qxc8 Kg6 10. Qe6 1/2-1/2\n\n";
        std::fs::write(&pgn_path, stalemate).unwrap();
        let dest = dir.path().join("stale.pgn");

        let cancel = CancellationToken::new();
        let opts = FilterOptions { keep: GameEnding::Stalemate, strict: false };
        let report = filter_checkmate(&pgn_path, &dest, &opts, &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 1);
    }
}

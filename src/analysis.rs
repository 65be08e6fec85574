// src/analysis.rs
// ---------------------------------------------------------------------------
// Analyzer: drives the board and a single UCI engine instance across one
// game's mainline, computing eval deltas and NAGs and writing them back as
// `{ [%eval ...] }` comments. Variations are preserved in the output
// verbatim but never evaluated. A game that fails mid-analysis (unparseable
// mainline move, engine crash) falls back to its original bytes rather than
// emitting a partially-annotated game.
// ---------------------------------------------------------------------------

use std::path::Path;

use memmap2::Mmap;

use crate::board::Board;
use crate::config;
use crate::engine::{Engine, Score};
use crate::error::{Error, GameError, Result};
use crate::index::{self, IndexReader};
use crate::indexer;
use crate::pgn::{self, GameSplitter, PgnTokenizer, ResultKind, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub depth: u8,
    pub annotator: Option<String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self { depth: config::DEFAULT_DEPTH, annotator: Some("pgnkit".into()) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub plies_analyzed: u32,
    pub annotated_pgn: String,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisSummary {
    pub games_analyzed: u64,
    pub games_fell_back: u64,
    pub warnings: Vec<GameError>,
}

/// Converts an engine score onto the single signed-centipawn axis used for
/// delta arithmetic and NAG thresholds: `sign(d) * (100_000 - min(|d|, 999) * 100)`
/// for mate scores, so a closer mate always outranks a more distant one.
pub fn score_to_ordering_cp(score: &Score) -> i32 {
    match score {
        Score::Centipawns(cp) => *cp,
        Score::MateIn(d) => {
            let magnitude = d.unsigned_abs().min(999) as i32;
            d.signum() * (100_000 - magnitude * 100)
        }
    }
}

/// Renders an eval for the `[%eval ...]` comment: pawn units to two
/// decimals for centipawn scores, `#d` (or `#-d`) for mate scores.
pub fn render_eval(score: &Score) -> String {
    match score {
        Score::Centipawns(cp) => format!("{:.2}", *cp as f64 / 100.0),
        Score::MateIn(d) => format!("#{d}"),
    }
}

/// Maps a mover's centipawn delta onto the NAG thresholds, most severe first.
pub fn nag_for_delta(delta: i32) -> Option<u16> {
    if delta <= config::NAG_BLUNDER_DELTA {
        Some(4)
    } else if delta <= config::NAG_MISTAKE_DELTA {
        Some(2)
    } else if delta <= config::NAG_INACCURACY_DELTA {
        Some(6)
    } else {
        None
    }
}

fn escape_tag_value(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Analyzes one game's tokens (headers + movetext) against `engine`,
/// returning the fully re-serialised, annotated game text.
pub async fn analyze_game(
    engine: &mut Engine,
    tokens: &[Token<'_>],
    opts: &AnalysisOptions,
    cancel: &CancellationToken,
) -> Result<AnalysisReport> {
    let (headers, body) = pgn::split_headers(tokens);
    let get = |key: &str| headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| *v);

    let mut board = match get("FEN") {
        Some(fen) => Board::from_fen(fen)?,
        None => Board::start_position(),
    };

    cancel.check()?;
    let initial = engine.go(&board, opts.depth).await?;
    let mut score_before = score_to_ordering_cp(
        &initial.score.ok_or_else(|| Error::EngineProtocol { reason: "engine returned no score".into() })?,
    );

    let mut out = String::new();
    for (key, value) in &headers {
        if key.eq_ignore_ascii_case("AnalysisDepth") || key.eq_ignore_ascii_case("Annotator") {
            continue;
        }
        out.push_str(&format!("[{key} \"{}\"]\n", escape_tag_value(value)));
    }
    out.push_str(&format!("[AnalysisDepth \"{}\"]\n", opts.depth));
    if let Some(annotator) = &opts.annotator {
        out.push_str(&format!("[Annotator \"{}\"]\n", escape_tag_value(annotator)));
    }
    out.push('\n');

    let mut variation_depth = 0u32;
    let mut plies_analyzed = 0u32;

    for token in body {
        cancel.check()?;
        match token {
            Token::VariationOpen => {
                variation_depth += 1;
                out.push_str("( ");
            }
            Token::VariationClose => {
                variation_depth = variation_depth.saturating_sub(1);
                out.push_str(") ");
            }
            Token::MoveNumber(n, is_black) => {
                if *is_black {
                    out.push_str(&format!("{n}... "));
                } else {
                    out.push_str(&format!("{n}. "));
                }
            }
            Token::SanMove(s) => {
                if variation_depth == 0 {
                    let mv = board
                        .parse_san(s)
                        .map_err(|_| Error::MalformedPgn { offset: 0, reason: format!("unparseable mainline move `{s}`") })?;
                    board = board.apply(&mv);

                    let search = engine.go(&board, opts.depth).await?;
                    let score_after = search
                        .score
                        .ok_or_else(|| Error::EngineProtocol { reason: "engine returned no score".into() })?;
                    let score_after_cp = score_to_ordering_cp(&score_after);
                    let delta = -score_after_cp - score_before;

                    out.push_str(s);
                    if let Some(nag) = nag_for_delta(delta) {
                        out.push_str(&format!(" ${nag}"));
                    }
                    out.push_str(&format!(" {{ [%eval {}] }} ", render_eval(&score_after)));

                    score_before = score_after_cp;
                    plies_analyzed += 1;
                } else {
                    out.push_str(s);
                    out.push(' ');
                }
            }
            Token::Nag(n) => out.push_str(&format!("${n} ")),
            Token::CommentBrace(c) => out.push_str(&format!("{{{c}}} ")),
            Token::CommentLine(c) => out.push_str(&format!(";{c}\n")),
            Token::Result(r) => out.push_str(r.as_str()),
            Token::Warning(_) => {}
            Token::TagOpen | Token::TagName(_) | Token::TagValue(_) | Token::TagClose | Token::GameSeparator => {}
        }
    }
    out.push_str("\n\n");

    Ok(AnalysisReport { plies_analyzed, annotated_pgn: out })
}

/// Drives analysis across every game in `pgn_path`, writing an annotated
/// copy to `dest` plus a fresh companion index. Games that fail analysis
/// (unparseable mainline, repeated engine crashes) fall back to their
/// original bytes. Cancellation is propagated immediately; the caller's
/// atomic-write discipline ensures no partial `dest` is ever observable.
pub async fn analyze_file(
    pgn_path: &Path,
    dest: &Path,
    engine_path: &str,
    opts: &AnalysisOptions,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<AnalysisSummary> {
    let index_path = index::companion_path(pgn_path);
    if !index_path.exists() {
        indexer::build_index(pgn_path, &index_path, cancel, |_| {})?;
    }
    let index_reader = IndexReader::open(&index_path)?;

    let file = std::fs::File::open(pgn_path).map_err(|e| Error::io(pgn_path, e))?;
    let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(pgn_path, e))? };

    let mut engine = Engine::spawn(engine_path).await?;
    engine.handshake().await?;

    let mut out = String::new();
    let mut warnings = Vec::new();
    let mut analyzed = 0u64;
    let mut fell_back = 0u64;
    let mut reporter = ProgressReporter::new("analyzing", Some(index_reader.record_count() as u64), progress_cb);

    for (i, record) in index_reader.records().enumerate() {
        cancel.check()?;
        let start = record.file_offset as usize;
        let end = start + record.length as usize;
        let raw = mmap
            .get(start..end)
            .ok_or_else(|| Error::IndexCorrupt { reason: format!("record {i} out of bounds") })?;
        let raw_text = String::from_utf8_lossy(raw).into_owned();

        let tokens = match tokenize_one_game(raw) {
            Ok(t) => t,
            Err(e) => {
                warnings.push(GameError { game_index: i as u64, offset: record.file_offset, message: e.to_string() });
                out.push_str(&raw_text);
                out.push_str("\n\n");
                fell_back += 1;
                reporter.report(i as u64 + 1);
                continue;
            }
        };

        match analyze_game(&mut engine, &tokens, opts, cancel).await {
            Ok(report) => {
                out.push_str(&report.annotated_pgn);
                analyzed += 1;
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warnings.push(GameError { game_index: i as u64, offset: record.file_offset, message: e.to_string() });
                out.push_str(&raw_text);
                out.push_str("\n\n");
                fell_back += 1;
                if matches!(e, Error::EngineProtocol { .. } | Error::EngineTimeout { .. }) {
                    engine.quit().await.ok();
                    engine = Engine::spawn(engine_path).await?;
                    engine.handshake().await?;
                }
            }
        }
        reporter.report(i as u64 + 1);
    }
    reporter.finish(index_reader.record_count() as u64);
    engine.quit().await.ok();

    index::write_atomic(dest, out.as_bytes())?;
    let dest_index = index::companion_path(dest);
    indexer::build_index(dest, &dest_index, cancel, |_| {})?;

    Ok(AnalysisSummary { games_analyzed: analyzed, games_fell_back: fell_back, warnings })
}

fn tokenize_one_game(raw: &[u8]) -> Result<Vec<Token<'_>>> {
    let mut tok = PgnTokenizer::new(raw);
    let mut splitter = GameSplitter::new(&mut tok);
    match splitter.next_game()? {
        Some((_, tokens)) => Ok(tokens),
        None => Err(Error::MalformedPgn { offset: 0, reason: "empty game record".into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_cp_prefers_closer_mates() {
        let near = score_to_ordering_cp(&Score::MateIn(2));
        let far = score_to_ordering_cp(&Score::MateIn(5));
        assert!(near > far);
        let losing_near = score_to_ordering_cp(&Score::MateIn(-2));
        let losing_far = score_to_ordering_cp(&Score::MateIn(-5));
        assert!(losing_near < losing_far);
    }

    #[test]
    fn render_eval_formats_cp_and_mate() {
        assert_eq!(render_eval(&Score::Centipawns(235)), "2.35");
        assert_eq!(render_eval(&Score::Centipawns(-50)), "-0.50");
        assert_eq!(render_eval(&Score::MateIn(3)), "#3");
        assert_eq!(render_eval(&Score::MateIn(-3)), "#-3");
    }

    #[test]
    fn nag_matches_spec_worked_example() {
        // score_before = +20 (mover's view); the engine's raw score after the
        // reply, from the new side to move, is +250 — i.e. -250 for the
        // original mover. delta = -(+250) - 20 = -270 -> NAG $2.
        let score_before = 20;
        let score_after_raw = 250;
        let delta = -score_after_raw - score_before;
        assert_eq!(delta, -270);
        assert_eq!(nag_for_delta(delta), Some(2));
    }

    #[test]
    fn nag_boundaries() {
        assert_eq!(nag_for_delta(-300), Some(4));
        assert_eq!(nag_for_delta(-301), Some(4));
        assert_eq!(nag_for_delta(-150), Some(2));
        assert_eq!(nag_for_delta(-200), Some(2));
        assert_eq!(nag_for_delta(-60), Some(6));
        assert_eq!(nag_for_delta(-100), Some(6));
        assert_eq!(nag_for_delta(-59), None);
        assert_eq!(nag_for_delta(10), None);
    }

    #[test]
    fn tokenize_one_game_reads_single_record() {
        let raw = b"[White \"A\"]\n[Result \"1-0\"]\n\n1. e4 1-0\n\n";
        let tokens = tokenize_one_game(raw).unwrap();
        assert!(tokens.iter().any(|t| matches!(t, Token::Result(ResultKind::WhiteWins))));
    }
}

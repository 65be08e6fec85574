// src/transform/tag_elegance.rs
// ---------------------------------------------------------------------------
// Tagger-Elegance: scores a previously-analyzed game (one carrying `{[%eval
// ...]}` comments on its mainline, written by `analysis::analyze_game`) along
// four components — Soundness (were material sacrifices compensated),
// Coherence (did the advantage hold once gained), Tactical (how many sharp
// swings), Quiet (the complement of Tactical) — normalises each against a
// median/MAD distribution, and stamps the combined 0..100 score plus a
// per-component breakdown onto the game as `[Elegance]` / `[EleganceDetails]`.
// A game with no eval annotations is left untouched and reported as an error.
// ---------------------------------------------------------------------------

use std::path::Path;

use shakmaty::{Color, Position, Role};

use crate::board::Board;
use crate::config;
use crate::error::{GameError, Result};
use crate::index::GameRecord;
use crate::pgn::{self, GameSplitter, PgnTokenizer, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform::{self, TransformReport};

#[derive(Debug, Clone, Copy)]
pub struct ComponentDistribution {
    pub median: f64,
    pub mad: f64,
}

impl Default for ComponentDistribution {
    /// A component's raw value is naturally bounded to `[0, 1]`; this
    /// baseline treats 0.5 as typical and 0.2 as one deviation.
    fn default() -> Self {
        Self { median: 0.5, mad: 0.2 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EleganceDistributions {
    pub soundness: ComponentDistribution,
    pub coherence: ComponentDistribution,
    pub tactical: ComponentDistribution,
    pub quiet: ComponentDistribution,
}

impl Default for EleganceDistributions {
    fn default() -> Self {
        Self {
            soundness: ComponentDistribution::default(),
            coherence: ComponentDistribution::default(),
            tactical: ComponentDistribution::default(),
            quiet: ComponentDistribution::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EleganceScore {
    pub soundness: u8,
    pub coherence: u8,
    pub tactical: u8,
    pub quiet: u8,
    pub combined: u8,
}

pub fn tag_elegance(
    pgn_path: &Path,
    dest: &Path,
    distributions: &EleganceDistributions,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<TransformReport> {
    let (index_reader, _) = transform::open_or_build_index(pgn_path, cancel)?;
    let mmap = transform::map_pgn(pgn_path)?;
    let records: Vec<GameRecord> = index_reader.records().collect();
    let mut reporter = ProgressReporter::new("tagging elegance", Some(records.len() as u64), progress_cb);

    let mut out = String::new();
    let mut errors = Vec::new();
    let mut scored = 0u64;

    for (i, rec) in records.iter().enumerate() {
        cancel.check()?;
        let raw = transform::game_bytes(&mmap, rec, i)?;
        match score_and_rewrite(raw, distributions) {
            Ok(text) => {
                out.push_str(&text);
                out.push_str("\n\n");
                scored += 1;
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
    Ok(TransformReport { games_processed: records.len() as u64, games_kept: scored, errors })
}

struct PlyRecord {
    mover: Color,
    white_material: i32,
    black_material: i32,
    eval_white_cp: Option<i32>,
}

fn score_and_rewrite(raw: &[u8], distributions: &EleganceDistributions) -> std::result::Result<String, String> {
    let mut tok = PgnTokenizer::new(raw);
    let mut splitter = GameSplitter::new(&mut tok);
    let (_, tokens) = splitter.next_game().map_err(|e| e.to_string())?.ok_or_else(|| "empty game".to_string())?;
    let (headers, body) = pgn::split_headers(&tokens);

    let plies = collect_plies(body)?;
    if !plies.iter().any(|p| p.eval_white_cp.is_some()) {
        return Err("no [%eval] annotations found; run analysis first".to_string());
    }

    let score = compute_score(&plies, distributions);

    let text = String::from_utf8_lossy(raw);
    let movetext = match text.find("\n\n") {
        Some(idx) => &text[idx + 2..],
        None => "",
    };

    let details = format!(
        "soundness={} coherence={} tactical={} quiet={}",
        score.soundness, score.coherence, score.tactical, score.quiet
    );

    let mut out = String::new();
    let mut wrote_elegance = false;
    let mut wrote_details = false;
    for (k, v) in &headers {
        match *k {
            "Elegance" => {
                out.push_str(&format!("[Elegance \"{}\"]\n", score.combined));
                wrote_elegance = true;
            }
            "EleganceDetails" => {
                out.push_str(&format!("[EleganceDetails \"{details}\"]\n"));
                wrote_details = true;
            }
            _ => out.push_str(&format!("[{k} \"{v}\"]\n")),
        }
    }
    if !wrote_elegance {
        out.push_str(&format!("[Elegance \"{}\"]\n", score.combined));
    }
    if !wrote_details {
        out.push_str(&format!("[EleganceDetails \"{details}\"]\n"));
    }
    out.push('\n');
    out.push_str(movetext);
    Ok(out)
}

fn collect_plies(body: &[Token<'_>]) -> std::result::Result<Vec<PlyRecord>, String> {
    let mut board = Board::start_position();
    let mut depth = 0u32;
    let mut plies = Vec::new();

    for t in body {
        match t {
            Token::VariationOpen => depth += 1,
            Token::VariationClose => depth = depth.saturating_sub(1),
            Token::SanMove(s) if depth == 0 => {
                let mover = board.turn();
                let mv = board.parse_san(s).map_err(|_| format!("unparseable mainline move `{s}`"))?;
                board = board.apply(&mv);
                plies.push(PlyRecord {
                    mover,
                    white_material: material_total(&board, Color::White),
                    black_material: material_total(&board, Color::Black),
                    eval_white_cp: None,
                });
            }
            Token::CommentBrace(c) if depth == 0 => {
                if let Some(raw_cp) = parse_eval_comment(c) {
                    if let Some(last) = plies.last_mut() {
                        // The engine reports from the perspective of whoever
                        // is to move after this ply, i.e. the mover's opponent.
                        let white_cp = if last.mover == Color::White { -raw_cp } else { raw_cp };
                        last.eval_white_cp = Some(white_cp);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(plies)
}

fn material_total(board: &Board, color: Color) -> i32 {
    let pos_board = board.as_position().board();
    [Role::Pawn, Role::Knight, Role::Bishop, Role::Rook, Role::Queen]
        .into_iter()
        .map(|role| (pos_board.by_color(color) & pos_board.by_role(role)).into_iter().count() as i32 * piece_value(role))
        .sum()
}

fn piece_value(role: Role) -> i32 {
    match role {
        Role::Pawn => 100,
        Role::Knight | Role::Bishop => 300,
        Role::Rook => 500,
        Role::Queen => 900,
        Role::King => 0,
    }
}

fn sac_allowance(magnitude: i32) -> i32 {
    if magnitude >= 900 - 100 {
        config::SAC_DROP_ALLOWANCE_QUEEN
    } else if magnitude >= 500 - 100 {
        config::SAC_DROP_ALLOWANCE_ROOK
    } else {
        config::SAC_DROP_ALLOWANCE_MINOR
    }
}

fn compute_score(plies: &[PlyRecord], distributions: &EleganceDistributions) -> EleganceScore {
    let n = plies.len();
    let diff: Vec<i32> = plies.iter().map(|p| p.white_material - p.black_material).collect();

    let mut sacrifices = 0u32;
    let mut sound_sacrifices = 0u32;
    for i in 0..n.saturating_sub(1) {
        let mover = plies[i].mover;
        let swing_against_mover = if mover == Color::White { diff[i] - diff[i + 1] } else { diff[i + 1] - diff[i] };
        if swing_against_mover < config::SAC_DROP_ALLOWANCE_MINOR {
            continue;
        }
        sacrifices += 1;
        let allowance = sac_allowance(swing_against_mover);

        let perspective = |white_cp: i32| if mover == Color::White { white_cp } else { -white_cp };
        let before = if i == 0 { 0 } else { plies[i - 1].eval_white_cp.map(perspective).unwrap_or(0) };
        let after = plies[i + 1].eval_white_cp.map(perspective).unwrap_or(before);
        if after - before >= -allowance {
            sound_sacrifices += 1;
        }
    }
    let soundness_raw = if sacrifices == 0 { 1.0 } else { sound_sacrifices as f64 / sacrifices as f64 };

    let evals: Vec<i32> = plies.iter().filter_map(|p| p.eval_white_cp).collect();
    let deltas: Vec<i32> = evals.windows(2).map(|w| w[1] - w[0]).collect();
    let coherence_raw = if deltas.is_empty() {
        0.5
    } else {
        let mean = deltas.iter().map(|d| *d as f64).sum::<f64>() / deltas.len() as f64;
        let variance = deltas.iter().map(|d| (*d as f64 - mean).powi(2)).sum::<f64>() / deltas.len() as f64;
        (1.0 - variance.sqrt() / 500.0).clamp(0.0, 1.0)
    };

    let sharp_threshold = config::NAG_INACCURACY_DELTA.unsigned_abs() as i32;
    let tactical_raw = if deltas.is_empty() {
        0.0
    } else {
        deltas.iter().filter(|d| d.abs() >= sharp_threshold).count() as f64 / deltas.len() as f64
    };
    let quiet_raw = 1.0 - tactical_raw;

    let soundness = normalise(soundness_raw, &distributions.soundness);
    let coherence = normalise(coherence_raw, &distributions.coherence);
    let tactical = normalise(tactical_raw, &distributions.tactical);
    let quiet = normalise(quiet_raw, &distributions.quiet);
    let combined = ((soundness as f64 + coherence as f64 + tactical as f64 + quiet as f64) / 4.0).round() as u8;

    EleganceScore { soundness, coherence, tactical, quiet, combined }
}

fn normalise(raw: f64, dist: &ComponentDistribution) -> u8 {
    let z = (raw - dist.median) / dist.mad.max(1e-6);
    let clipped = z.clamp(-3.0, 3.0);
    (((clipped + 3.0) / 6.0) * 100.0).round() as u8
}

/// Parses a `[%eval ...]` comment body into the raw ordering-centipawn axis,
/// inverting `analysis::render_eval`.
fn parse_eval_comment(comment: &str) -> Option<i32> {
    let idx = comment.find("%eval")?;
    let rest = comment[idx + 5..].trim();
    let token = rest.split(|c: char| c == ']' || c.is_whitespace()).next()?.trim();
    if let Some(mate) = token.strip_prefix('#') {
        let d: i32 = mate.parse().ok()?;
        let magnitude = d.unsigned_abs().min(999) as i32;
        return Some(d.signum() * (100_000 - magnitude * 100));
    }
    let pawns: f64 = token.parse().ok()?;
    Some((pawns * 100.0).round() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_cp_and_mate_eval_comments() {
        assert_eq!(parse_eval_comment("[%eval 2.35]"), Some(235));
        assert_eq!(parse_eval_comment("[%eval -1.10]"), Some(-110));
        assert_eq!(parse_eval_comment("[%eval #3]"), Some(100_000 - 300));
        assert_eq!(parse_eval_comment("[%eval #-2]"), Some(-(100_000 - 200)));
        assert_eq!(parse_eval_comment("not an eval"), None);
    }

    #[test]
    fn games_without_eval_annotations_are_reported_and_untouched() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(&pgn_path, "[Result \"1-0\"]\n\n1. e4 e5 1-0\n\n").unwrap();
        let dest = dir.path().join("scored.pgn");

        let cancel = CancellationToken::new();
        let report =
            tag_elegance(&pgn_path, &dest, &EleganceDistributions::default(), &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 0);
        assert_eq!(report.errors.len(), 1);

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(!text.contains("Elegance"));
    }

    #[test]
    fn annotated_game_gets_elegance_headers_in_range() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(
            &pgn_path,
            "[Result \"1-0\"]\n\n1. e4 { [%eval 0.20] } e5 { [%eval -0.15] } 2. Nf3 { [%eval 0.30] } 1-0\n\n",
        )
        .unwrap();
        let dest = dir.path().join("scored.pgn");

        let cancel = CancellationToken::new();
        let report =
            tag_elegance(&pgn_path, &dest, &EleganceDistributions::default(), &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 1);

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("[Elegance \""));
        assert!(text.contains("[EleganceDetails \""));
    }
}

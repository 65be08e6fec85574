// src/transform/unannotate.rs
// ---------------------------------------------------------------------------
// Unannotator: strips comments, NAGs, and/or variations from move text.
// Operates directly on the token stream (the tokenizer already discards the
// original whitespace), so the rewritten movetext is always a canonical,
// single-spaced rendering — running this twice on its own output changes
// nothing, which is the idempotence property the spec calls out.
// ---------------------------------------------------------------------------

use std::path::Path;

use crate::error::{GameError, Result};
use crate::index::GameRecord;
use crate::pgn::{self, GameSplitter, PgnTokenizer, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform::{self, TransformReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnannotateMode {
    /// Removes comments, NAGs, and variations.
    StripAll,
    /// Removes variations only; comments and NAGs on the mainline survive.
    PreserveMainline,
    /// Keeps only `[%eval ...]` / `[%clk ...]` comments; drops everything
    /// else (other comments, NAGs, variations).
    PreserveCritical,
    /// Removes comments (both `{...}` and `;...`) only.
    CommentsOnly,
    /// Removes variations only (alias kept distinct from `PreserveMainline`
    /// for callers that also want NAGs/comments untouched, which is in fact
    /// the same behaviour — both strip nothing but variations).
    VariationsOnly,
}

pub fn unannotate_pgn(
    pgn_path: &Path,
    dest: &Path,
    mode: UnannotateMode,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<TransformReport> {
    let (index_reader, _) = transform::open_or_build_index(pgn_path, cancel)?;
    let mmap = transform::map_pgn(pgn_path)?;
    let records: Vec<GameRecord> = index_reader.records().collect();
    let mut reporter = ProgressReporter::new("unannotating", Some(records.len() as u64), progress_cb);

    let mut out = String::new();
    let mut errors = Vec::new();
    let mut kept = 0u64;

    for (i, rec) in records.iter().enumerate() {
        cancel.check()?;
        let raw = transform::game_bytes(&mmap, rec, i)?;
        match strip_one(raw, mode) {
            Ok(text) => {
                out.push_str(&text);
                out.push_str("\n\n");
                kept += 1;
            }
            Err(msg) => {
                errors.push(GameError { game_index: i as u64, offset: rec.file_offset, message: msg });
            }
        }
        reporter.report(i as u64 + 1);
    }
    reporter.finish(records.len() as u64);

    transform::finish_with_index(dest, &out, cancel)?;
    Ok(TransformReport { games_processed: records.len() as u64, games_kept: kept, errors })
}

fn strip_one(raw: &[u8], mode: UnannotateMode) -> std::result::Result<String, String> {
    let mut tok = PgnTokenizer::new(raw);
    let mut splitter = GameSplitter::new(&mut tok);
    let (_, tokens) = splitter.next_game().map_err(|e| e.to_string())?.ok_or_else(|| "empty game".to_string())?;
    let (headers, body) = pgn::split_headers(&tokens);

    let keep_comments = matches!(mode, UnannotateMode::PreserveMainline);
    let keep_nags = matches!(mode, UnannotateMode::PreserveMainline | UnannotateMode::CommentsOnly | UnannotateMode::VariationsOnly);
    let keep_variations = matches!(mode, UnannotateMode::CommentsOnly);
    let critical_only = matches!(mode, UnannotateMode::PreserveCritical);

    let mut out = String::new();
    for (k, v) in &headers {
        out.push_str(&format!("[{k} \"{v}\"]\n"));
    }
    out.push('\n');

    let mut depth = 0u32;
    let mut first = true;
    for t in body {
        match t {
            Token::VariationOpen => {
                depth += 1;
                continue;
            }
            Token::VariationClose => {
                depth = depth.saturating_sub(1);
                continue;
            }
            _ => {}
        }
        // Variations are dropped innermost-first by construction: any token
        // at depth > 0 is inside at least one still-open variation, and by
        // the time its VariationClose is seen the deepest nesting has
        // already been skipped token-by-token.
        if depth > 0 && !keep_variations {
            continue;
        }

        match t {
            Token::MoveNumber(n, black_to_move) => {
                if !first {
                    out.push(' ');
                }
                first = false;
                if *black_to_move {
                    out.push_str(&format!("{n}..."));
                } else {
                    out.push_str(&format!("{n}."));
                }
            }
            Token::SanMove(s) => {
                if !first {
                    out.push(' ');
                }
                first = false;
                out.push_str(s);
            }
            Token::Nag(n) => {
                if keep_nags {
                    out.push_str(&format!(" ${n}"));
                }
            }
            Token::CommentBrace(c) => {
                let is_critical = c.contains("%eval") || c.contains("%clk");
                if keep_comments || (critical_only && is_critical) {
                    out.push_str(&format!(" {{{c}}}"));
                }
            }
            Token::CommentLine(c) => {
                if keep_comments {
                    out.push_str(&format!(" ;{c}"));
                }
            }
            Token::Result(r) => {
                if !first {
                    out.push(' ');
                }
                first = false;
                out.push_str(r.as_str());
            }
            Token::VariationOpen | Token::VariationClose => unreachable!(),
            _ => {}
        }
    }
    out.push('\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run(mode: UnannotateMode, pgn: &str) -> String {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(&pgn_path, pgn).unwrap();
        let dest = dir.path().join("out.pgn");
        let cancel = CancellationToken::new();
        unannotate_pgn(&pgn_path, &dest, mode, &cancel, |_| {}).unwrap();
        std::fs::read_to_string(&dest).unwrap()
    }

    const SOURCE: &str =
        "[Result \"1-0\"]\n\n1. e4 { good move } e5 $1 ( 1... c5 2. Nf3 ( 2. Nc3 ) d6 ) 2. Nf3 { [%eval 0.30] } 1-0\n\n";

    #[test]
    fn strip_all_removes_everything_but_moves() {
        let text = run(UnannotateMode::StripAll, SOURCE);
        assert!(!text.contains('{'));
        assert!(!text.contains('('));
        assert!(!text.contains('$'));
        assert!(text.contains("e4 e5 2. Nf3 1-0"));
    }

    #[test]
    fn preserve_mainline_drops_variations_only() {
        let text = run(UnannotateMode::PreserveMainline, SOURCE);
        assert!(!text.contains('('));
        assert!(text.contains("good move"));
        assert!(text.contains("$1"));
    }

    #[test]
    fn preserve_critical_keeps_only_eval_and_clock_comments() {
        let text = run(UnannotateMode::PreserveCritical, SOURCE);
        assert!(!text.contains("good move"));
        assert!(text.contains("%eval"));
        assert!(!text.contains('('));
    }

    #[test]
    fn comments_only_strips_comments_but_keeps_variations_and_nags() {
        let text = run(UnannotateMode::CommentsOnly, SOURCE);
        assert!(!text.contains('{'));
        assert!(text.contains('('));
        assert!(text.contains("$1"));
    }

    #[test]
    fn variations_only_strips_variations_but_keeps_comments_and_nags() {
        let text = run(UnannotateMode::VariationsOnly, SOURCE);
        assert!(!text.contains('('));
        assert!(text.contains("good move"));
        assert!(text.contains("$1"));
    }

    #[test]
    fn strip_all_is_idempotent() {
        let once = run(UnannotateMode::StripAll, SOURCE);
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("once.pgn");
        std::fs::write(&pgn_path, &once).unwrap();
        let dest = dir.path().join("twice.pgn");
        let cancel = CancellationToken::new();
        unannotate_pgn(&pgn_path, &dest, UnannotateMode::StripAll, &cancel, |_| {}).unwrap();
        let twice = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(once.trim(), twice.trim());
    }
}

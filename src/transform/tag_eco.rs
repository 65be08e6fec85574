// src/transform/tag_eco.rs
// ---------------------------------------------------------------------------
// Tagger-ECO: matches a game's opening moves against a trie built from a
// reference PGN (ECO/Opening/Variation headers + mainline), and stamps the
// deepest matching node's classification onto the game. The trie is built
// once per reference file and cached behind a mutex — per spec.md's note
// that the cache is shared mutable state, the first caller to build it wins
// and later callers reuse the same `Arc`.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::error::{Error, GameError, Result};
use crate::index::GameRecord;
use crate::pgn::{self, GameSplitter, PgnTokenizer, Token};
use crate::progress::{CancellationToken, Progress, ProgressReporter};
use crate::transform::{self, TransformReport};

#[derive(Debug, Clone)]
pub struct EcoEntry {
    pub eco: String,
    pub opening: String,
    pub variation: Option<String>,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    entry: Option<EcoEntry>,
}

pub struct EcoTrie {
    root: TrieNode,
}

impl EcoTrie {
    fn new() -> Self {
        Self { root: TrieNode::default() }
    }

    fn insert(&mut self, sans: &[&str], entry: EcoEntry) {
        let mut node = &mut self.root;
        for san in sans {
            node = node.children.entry(san.to_string()).or_default();
        }
        node.entry = Some(entry);
    }

    /// Walks `sans`, returning the entry at the deepest node reached that
    /// carries one (not necessarily the final node, if the position departs
    /// from the reference tree before the end of its sequence).
    pub fn lookup(&self, sans: &[&str]) -> Option<&EcoEntry> {
        let mut node = &self.root;
        let mut best = node.entry.as_ref();
        for san in sans {
            match node.children.get(*san) {
                Some(next) => {
                    node = next;
                    if node.entry.is_some() {
                        best = node.entry.as_ref();
                    }
                }
                None => break,
            }
        }
        best
    }

    pub fn build_from_pgn(text: &str) -> Result<Self> {
        let mut trie = EcoTrie::new();
        let mut tok = PgnTokenizer::new(text.as_bytes());
        let mut splitter = GameSplitter::new(&mut tok);
        while let Some((_, tokens)) = splitter.next_game()? {
            let (headers, body) = pgn::split_headers(&tokens);
            let eco = headers.iter().find(|(k, _)| *k == "ECO").map(|(_, v)| v.to_string());
            let opening = headers.iter().find(|(k, _)| *k == "Opening").map(|(_, v)| v.to_string());
            let variation = headers.iter().find(|(k, _)| *k == "Variation").map(|(_, v)| v.to_string());
            let (Some(eco), Some(opening)) = (eco, opening) else { continue };

            let sans = mainline_sans(body);
            if sans.is_empty() {
                continue;
            }
            trie.insert(&sans, EcoEntry { eco, opening, variation });
        }
        Ok(trie)
    }
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

lazy_static! {
    static ref TRIE_CACHE: Mutex<HashMap<PathBuf, Arc<EcoTrie>>> = Mutex::new(HashMap::new());
}

/// Returns the cached trie for `reference_pgn_path`, building it on first
/// use. Concurrent callers for the same path block on the mutex; the first
/// to arrive builds, the rest reuse its `Arc`.
pub fn get_or_build_trie(reference_pgn_path: &Path) -> Result<Arc<EcoTrie>> {
    let mut cache = TRIE_CACHE.lock().unwrap();
    if let Some(trie) = cache.get(reference_pgn_path) {
        return Ok(trie.clone());
    }
    let text = std::fs::read_to_string(reference_pgn_path).map_err(|e| Error::io(reference_pgn_path, e))?;
    let trie = Arc::new(EcoTrie::build_from_pgn(&text)?);
    cache.insert(reference_pgn_path.to_path_buf(), trie.clone());
    Ok(trie)
}

pub fn tag_eco(
    pgn_path: &Path,
    dest: &Path,
    reference_pgn_path: &Path,
    cancel: &CancellationToken,
    progress_cb: impl FnMut(Progress),
) -> Result<TransformReport> {
    let trie = get_or_build_trie(reference_pgn_path)?;
    let (index_reader, _) = transform::open_or_build_index(pgn_path, cancel)?;
    let mmap = transform::map_pgn(pgn_path)?;
    let records: Vec<GameRecord> = index_reader.records().collect();
    let mut reporter = ProgressReporter::new("tagging eco", Some(records.len() as u64), progress_cb);

    let mut out = String::new();
    let mut errors = Vec::new();
    let mut tagged = 0u64;

    for (i, rec) in records.iter().enumerate() {
        cancel.check()?;
        let raw = transform::game_bytes(&mmap, rec, i)?;
        match apply_one(raw, &trie) {
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

fn apply_one(raw: &[u8], trie: &EcoTrie) -> std::result::Result<(String, bool), String> {
    let mut tok = PgnTokenizer::new(raw);
    let mut splitter = GameSplitter::new(&mut tok);
    let (_, tokens) = splitter.next_game().map_err(|e| e.to_string())?.ok_or_else(|| "empty game".to_string())?;
    let (headers, body) = pgn::split_headers(&tokens);
    let sans = mainline_sans(body);

    let Some(entry) = trie.lookup(&sans) else {
        let text = String::from_utf8_lossy(raw).into_owned();
        return Ok((text, false));
    };

    let text = String::from_utf8_lossy(raw);
    let movetext = match text.find("\n\n") {
        Some(idx) => &text[idx + 2..],
        None => "",
    };

    let mut wrote_eco = false;
    let mut wrote_opening = false;
    let mut wrote_variation = false;
    let mut out = String::new();
    for (k, v) in &headers {
        match *k {
            "ECO" => {
                out.push_str(&format!("[ECO \"{}\"]\n", entry.eco));
                wrote_eco = true;
            }
            "Opening" => {
                out.push_str(&format!("[Opening \"{}\"]\n", entry.opening));
                wrote_opening = true;
            }
            "Variation" if entry.variation.is_some() => {
                out.push_str(&format!("[Variation \"{}\"]\n", entry.variation.as_ref().unwrap()));
                wrote_variation = true;
            }
            _ => out.push_str(&format!("[{k} \"{v}\"]\n")),
        }
    }
    if !wrote_eco {
        out.push_str(&format!("[ECO \"{}\"]\n", entry.eco));
    }
    if !wrote_opening {
        out.push_str(&format!("[Opening \"{}\"]\n", entry.opening));
    }
    if !wrote_variation {
        if let Some(v) = &entry.variation {
            out.push_str(&format!("[Variation \"{v}\"]\n"));
        }
    }
    out.push('\n');
    out.push_str(movetext);

    Ok((out, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const REFERENCE: &str = "[ECO \"C65\"]\n[Opening \"Ruy Lopez\"]\n[Variation \"Berlin Defence\"]\n[Result \"*\"]\n\n\
                              1. e4 e5 2. Nf3 Nc6 3. Bb5 Nf6 *\n\n\
                              [ECO \"C60\"]\n[Opening \"Ruy Lopez\"]\n[Result \"*\"]\n\n\
                              1. e4 e5 2. Nf3 Nc6 3. Bb5 *\n\n";

    #[test]
    fn deepest_matching_node_wins() {
        let trie = EcoTrie::build_from_pgn(REFERENCE).unwrap();
        let berlin = trie.lookup(&["e4", "e5", "Nf3", "Nc6", "Bb5", "Nf6"]).unwrap();
        assert_eq!(berlin.eco, "C65");
        assert_eq!(berlin.variation.as_deref(), Some("Berlin Defence"));

        let shallow = trie.lookup(&["e4", "e5", "Nf3", "Nc6", "Bb5"]).unwrap();
        assert_eq!(shallow.eco, "C60");

        let departs = trie.lookup(&["e4", "e5", "Nf3", "Nc6", "Bb5", "a6"]).unwrap();
        assert_eq!(departs.eco, "C60"); // falls back to the last matching node before departing
    }

    #[test]
    fn tags_a_game_from_the_reference_trie() {
        let dir = tempdir().unwrap();
        let reference_path = dir.path().join("reference.pgn");
        std::fs::write(&reference_path, REFERENCE).unwrap();

        let pgn_path = dir.path().join("g.pgn");
        std::fs::write(&pgn_path, "[White \"A\"]\n[Result \"1-0\"]\n\n1. e4 e5 2. Nf3 Nc6 3. Bb5 Nf6 1-0\n\n").unwrap();
        let dest = dir.path().join("tagged.pgn");

        let cancel = CancellationToken::new();
        let report = tag_eco(&pgn_path, &dest, &reference_path, &cancel, |_| {}).unwrap();
        assert_eq!(report.games_kept, 1);

        let text = std::fs::read_to_string(&dest).unwrap();
        assert!(text.contains("[ECO \"C65\"]"));
        assert!(text.contains("Berlin Defence"));
    }
}

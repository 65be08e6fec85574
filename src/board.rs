// src/board.rs
// ---------------------------------------------------------------------------
// Chess board primitives used by the analyzer, ECO trie matcher, checkmate
// verifier, and fuzzy dedup. Thin wrapper over `shakmaty`, which already
// produces the results the spec requires (legal move generation, SAN/FEN,
// Zobrist hashing) — the teacher and several pack repos use it the same way
// (e.g. `dotneB-duckdb-chess`, `nurdwerks-laughing-pancake`).
// ---------------------------------------------------------------------------

use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Position};

use crate::error::{Error, Result};

pub use shakmaty::Move;

#[derive(Debug, Clone, PartialEq)]
pub struct Board(Chess);

impl Board {
    pub fn start_position() -> Self {
        Self(Chess::default())
    }

    pub fn from_fen(s: &str) -> Result<Self> {
        let setup: Fen = s.parse().map_err(|_| Error::InvalidInput { reason: format!("bad FEN: {s}") })?;
        let pos = setup
            .into_position(CastlingMode::Standard)
            .map_err(|e| Error::InvalidInput { reason: format!("illegal FEN position: {e}") })?;
        Ok(Self(pos))
    }

    pub fn to_fen(&self) -> String {
        Fen::from_position(self.0.clone(), EnPassantMode::Legal).to_string()
    }

    pub fn legal_moves(&self) -> Vec<Move> {
        self.0.legal_moves().into_iter().collect()
    }

    /// Returns the position after `mv`. Does not mutate `self`.
    pub fn apply(&self, mv: &Move) -> Board {
        let mut next = self.0.clone();
        next.play_unchecked(mv);
        Board(next)
    }

    pub fn turn(&self) -> Color {
        self.0.turn()
    }

    pub fn in_check(&self) -> bool {
        !self.0.checkers().is_empty()
    }

    pub fn is_checkmate(&self) -> bool {
        self.0.is_checkmate()
    }

    pub fn is_stalemate(&self) -> bool {
        self.0.is_stalemate()
    }

    pub fn has_any_legal_move(&self) -> bool {
        !self.0.legal_moves().is_empty()
    }

    /// Escape hatch for interop with crates that speak `shakmaty::Chess`
    /// directly (the UCI engine adapter's move-list reconstruction).
    pub fn as_position(&self) -> &Chess {
        &self.0
    }

    pub fn zobrist_hash(&self) -> u64 {
        let Zobrist64(v) = self.0.zobrist_hash::<Zobrist64>(EnPassantMode::Legal);
        v
    }

    /// Parses a move token against this position. Accepts standard SAN
    /// (`Nf3`, `exd5+`, `O-O`, `O-O-O`, `e8=Q#`), tolerates `0-0`/`0-0-0`,
    /// and falls back to coordinate notation (`e2e4`, `Nb1c3`, `e7e8Q`).
    pub fn parse_san(&self, token: &str) -> Result<Move> {
        let normalised = token.replace('0', "O");
        if let Ok(san) = normalised.parse::<San>() {
            if let Ok(mv) = san.to_move(&self.0) {
                return Ok(mv);
            }
        }
        if let Ok(uci) = token.parse::<UciMove>() {
            if let Ok(mv) = uci.to_move(&self.0) {
                return Ok(mv);
            }
        }
        Err(Error::InvalidInput { reason: format!("unparseable move `{token}`") })
    }

    /// Renders `mv` as SAN against the current position.
    pub fn render_san(&self, mv: &Move) -> String {
        San::from_move(&self.0, mv).to_string()
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::start_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_fen_round_trips() {
        let b = Board::start_position();
        let fen = b.to_fen();
        let b2 = Board::from_fen(&fen).unwrap();
        assert_eq!(b2.to_fen(), fen);
    }

    #[test]
    fn parse_san_accepts_coordinate_and_zero_castling() {
        let b = Board::start_position();
        let mv = b.parse_san("e2e4").unwrap();
        let b2 = b.apply(&mv);
        assert_eq!(b2.to_fen().split(' ').next().unwrap(), "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR");

        // castling after clearing the king/rook path
        let mut cur = Board::start_position();
        for san in ["Nf3", "Nc6", "g3", "Nf6", "Bg2", "d5", "O-O"] {
            let mv = cur.parse_san(san).unwrap();
            cur = cur.apply(&mv);
        }
        assert!(cur.to_fen().contains('K'));

        let mut cur2 = Board::start_position();
        for san in ["Nf3", "Nc6", "g3", "Nf6", "Bg2", "d5", "0-0"] {
            let mv = cur2.parse_san(san).unwrap();
            cur2 = cur2.apply(&mv);
        }
        assert_eq!(cur.to_fen(), cur2.to_fen());
    }

    #[test]
    fn checkmate_detection_on_scholars_mate() {
        let mut b = Board::start_position();
        for san in ["e4", "e5", "Bc4", "Nc6", "Qh5", "Nf6", "Qxf7#"] {
            let mv = b.parse_san(san).unwrap();
            b = b.apply(&mv);
        }
        assert!(b.is_checkmate());
        assert!(b.in_check());
        assert!(!b.has_any_legal_move());
    }

    #[test]
    fn zobrist_hash_differs_between_positions() {
        let start = Board::start_position();
        let mv = start.parse_san("e4").unwrap();
        let after = start.apply(&mv);
        assert_ne!(start.zobrist_hash(), after.zobrist_hash());
    }
}

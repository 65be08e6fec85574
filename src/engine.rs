// src/engine.rs
// ---------------------------------------------------------------------------
// UCI engine adapter: spawns a subprocess, performs the `uci`/`isready`
// handshake, and drives one `go depth N` search per position. State machine:
// Spawned -> Handshaking -> Ready -> Searching -> Ready (or Aborted) -> Quit.
// Generalized from the teacher's Stockfish wrapper (puzzle solving, fixed
// MultiPV/tablebase probing) down to the single-position search the
// analyzer needs.
// ---------------------------------------------------------------------------

use std::borrow::Cow;
use std::time::Duration;

use futures_util::future::ready;
use log::trace;
use ruci::engine::{Info, Score as RuciScore};
use ruci::gui::{traits::Message as UciMessage, Go, IsReady, Position as UciPosition, Quit, SetOption, Stop};
use ruci::Engine as RuciEngine;
use shakmaty::fen::Fen;
use shakmaty::{Color, EnPassantMode};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use crate::board::{Board, Move};
use crate::config;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Spawned,
    Handshaking,
    Ready,
    Searching,
    Aborted,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Centipawns(i32),
    /// Plies to mate, signed from the side to move's perspective.
    MateIn(i32),
}

#[derive(Debug, Clone)]
pub struct SearchInfo {
    pub score: Option<Score>,
    pub depth: Option<u8>,
    pub nodes: Option<u64>,
    pub pv: Vec<Move>,
}

pub struct Engine {
    inner: RuciEngine<BufReader<ChildStdout>, ChildStdin>,
    child: Child,
    state: EngineState,
}

impl Engine {
    pub async fn spawn(path: &str) -> Result<Self> {
        let mut child = Command::new(path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::EngineProtocol { reason: format!("failed to spawn '{path}': {e}") })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::EngineProtocol { reason: "engine stdout unavailable".into() })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::EngineProtocol { reason: "engine stdin unavailable".into() })?;

        let inner = RuciEngine { engine: BufReader::new(stdout), gui: stdin, strict: false };
        Ok(Self { inner, child, state: EngineState::Spawned })
    }

    /// Runs `uci` / `setoption` / `isready`, leaving the adapter `Ready`.
    pub async fn handshake(&mut self) -> Result<()> {
        self.state = EngineState::Handshaking;
        timeout(Duration::from_millis(config::HANDSHAKE_TIMEOUT_MS), self.inner.use_uci_async(|_| ready(())))
            .await
            .map_err(|_| Error::EngineTimeout { stage: "uci handshake".into() })?
            .map_err(|e| Error::EngineProtocol { reason: e.to_string() })?;

        for (name, value) in [("Threads", config::THREADS), ("Hash", config::HASH_MB)] {
            self.send(SetOption { name: Cow::Borrowed(name), value: Some(Cow::Owned(value.to_string())) }).await?;
        }
        self.wait_ready().await?;
        self.state = EngineState::Ready;
        Ok(())
    }

    async fn send<C>(&mut self, cmd: C) -> Result<()>
    where
        C: UciMessage + std::fmt::Debug + Send + 'static,
    {
        trace!("> {cmd:?}");
        timeout(Duration::from_millis(config::READY_TIMEOUT_MS), self.inner.send_async(cmd))
            .await
            .map_err(|_| Error::EngineTimeout { stage: "send".into() })?
            .map_err(|e| Error::EngineProtocol { reason: e.to_string() })
    }

    async fn wait_ready(&mut self) -> Result<()> {
        self.send(IsReady).await?;
        timeout(Duration::from_millis(config::READY_TIMEOUT_MS), self.inner.is_ready_async())
            .await
            .map_err(|_| Error::EngineTimeout { stage: "isready".into() })?
            .map_err(|e| Error::EngineProtocol { reason: e.to_string() })
    }

    /// Searches `board` to `depth`, timing out after
    /// [`config::analysis_timeout_secs`]. On timeout the adapter sends
    /// `stop`, allows [`config::STOP_GRACE_MS`] for a reply, then kills the
    /// subprocess and reports `EngineTimeout` — callers (the analyzer) are
    /// expected to respawn.
    pub async fn go(&mut self, board: &Board, depth: u8) -> Result<SearchInfo> {
        self.state = EngineState::Searching;
        let fen = Fen::from_position(board.as_position().clone(), EnPassantMode::Legal);
        self.send(UciPosition::Fen { fen: Cow::Owned(fen), moves: Cow::Owned(Vec::new()) }).await?;
        self.wait_ready().await?;

        let turn = board.turn();
        let go = Go { depth: Some(depth as usize), ..Default::default() };
        let limit = Duration::from_secs(config::analysis_timeout_secs(depth));
        let captured = std::sync::Arc::new(std::sync::Mutex::new(None::<SearchInfo>));
        let sink = captured.clone();
        let board_for_cb = board.clone();

        let result = timeout(
            limit,
            self.inner.go_async(&go, move |info: Info| {
                if !info.pv.is_empty() {
                    *sink.lock().unwrap() = Some(convert_info(&info, turn, &board_for_cb));
                }
                ready(())
            }),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.state = EngineState::Ready;
                captured
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| Error::EngineProtocol { reason: "no search info received".into() })
            }
            Ok(Err(e)) => {
                self.state = EngineState::Ready;
                Err(Error::EngineProtocol { reason: e.to_string() })
            }
            Err(_) => {
                self.abort().await;
                Err(Error::EngineTimeout { stage: format!("go depth {depth}") })
            }
        }
    }

    /// Sends `stop`, waits briefly, and kills the subprocess if it doesn't
    /// settle. Taken on search timeout or external cancellation.
    pub async fn abort(&mut self) {
        let _ = timeout(Duration::from_millis(config::STOP_GRACE_MS), self.send(Stop)).await;
        let _ = timeout(Duration::from_millis(config::STOP_GRACE_MS), self.child.wait()).await;
        let _ = self.child.start_kill();
        self.state = EngineState::Aborted;
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub async fn quit(&mut self) -> Result<()> {
        let _ = self.send(Quit).await;
        let _ = timeout(Duration::from_millis(config::QUIT_GRACE_MS), self.child.wait()).await;
        let _ = self.child.start_kill();
        self.state = EngineState::Quit;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

fn convert_info(src: &Info, turn: Color, start: &Board) -> SearchInfo {
    let score = src.score.as_ref().map(|s| match s.kind.standardized(turn).score() {
        RuciScore::Centipawns(cp) => Score::Centipawns(cp as i32),
        RuciScore::MateIn(m) => Score::MateIn(m as i32),
    });
    let depth = src.depth.map(|d| d.depth as u8);
    let nodes = src.nodes.map(|n| n as u64);

    let mut cursor = start.clone();
    let mut pv = Vec::new();
    for uci in &src.pv {
        let Ok(mv) = uci.to_move(cursor.as_position()) else { break };
        cursor = cursor.apply(&mv);
        pv.push(mv);
    }

    SearchInfo { score, depth, nodes, pv }
}

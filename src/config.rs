// Configurações centralizadas para o toolkit de base de dados PGN

// ---------------------------------------------------------------------------
// Índice binário (.pbi)
// ---------------------------------------------------------------------------
pub const INDEX_MAGIC: &[u8; 8] = b"PGNIDXv3";
pub const INDEX_VERSION: u32 = 3;
// Polinômio/seed de CRC não documentados na fonte original (ver DESIGN.md):
// escolha própria, CRC-32 IEEE 802.3 via crc32fast.
pub const INDEX_SUFFIX: &str = "pbi";

// ---------------------------------------------------------------------------
// CLI padrões
// ---------------------------------------------------------------------------
pub const DEFAULT_DEPTH: u8 = 16;                  // Profundidade padrão para análise

// ---------------------------------------------------------------------------
// Motor UCI
// ---------------------------------------------------------------------------
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const READY_TIMEOUT_MS: u64 = 10_000;
pub const STOP_GRACE_MS: u64 = 500;
pub const QUIT_GRACE_MS: u64 = 2_000;
pub const THREADS: u32 = 4;
pub const HASH_MB: u32 = 1024;

/// clamp(ceil(depth * 2.5), 15, 120) segundos, por posição.
pub fn analysis_timeout_secs(depth: u8) -> u64 {
    let raw = (depth as f64 * 2.5).ceil() as u64;
    raw.clamp(15, 120)
}

// NAG thresholds (centipawn delta from the mover's perspective).
pub const NAG_BLUNDER_DELTA: i32 = -300;   // $4 Muito Fraco
pub const NAG_MISTAKE_DELTA: i32 = -150;   // $2 Fraco
pub const NAG_INACCURACY_DELTA: i32 = -60; // $6 Impreciso

// ---------------------------------------------------------------------------
// Progresso
// ---------------------------------------------------------------------------
pub const PROGRESS_MIN_INTERVAL_MS: u64 = 100;
pub const PROGRESS_MIN_GAMES: u64 = 200;

// ---------------------------------------------------------------------------
// Transformações
// ---------------------------------------------------------------------------
pub const SPLIT_FILENAME_MAX_LEN: usize = 64;
pub const PLY_COUNT_SCAN_LIMIT: usize = 200;
pub const HEADER_SCAN_BYTES: usize = 1024;

pub const TARGET_LOCKED_MAX_ATTEMPTS: u32 = 5;
pub const TARGET_LOCKED_BACKOFF_MS: u64 = 50;

// Elegância: limiares escalonados pelo valor da peça sacrificada (centipawns).
pub const SAC_DROP_ALLOWANCE_MINOR: i32 = 120;
pub const SAC_DROP_ALLOWANCE_ROOK: i32 = 200;
pub const SAC_DROP_ALLOWANCE_QUEEN: i32 = 300;

// Tagger de Elo.
pub const ELO_MIN: u16 = 0;
pub const ELO_MAX: u16 = 3000;

// Join — dedup fuzzy.
pub const FUZZY_DEDUP_DEFAULT_CONFIDENCE: f32 = 0.95;

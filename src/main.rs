// src/main.rs
// ---------------------------------------------------------------------------
// Thin CLI front end: parses args, wires a progress bar and a Ctrl-C
// cancellation token, and dispatches into the pgnkit library. One
// subcommand per transformation engine.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use pgnkit::config;
use pgnkit::index;
use pgnkit::indexer;
use pgnkit::progress::{CancellationToken, Progress};
use pgnkit::transform::filter::{filter_checkmate, FilterOptions, GameEnding};
use pgnkit::transform::join::{join_pgns, DedupMode, JoinOptions, RetentionPolicy};
use pgnkit::transform::sort::{sort_pgn, SortDirection, SortKey, SortOptions};
use pgnkit::transform::split::{split_pgn, DatePrecision, SplitBy};
use pgnkit::transform::tag_eco::tag_eco;
use pgnkit::transform::tag_elegance::{tag_elegance, EleganceDistributions};
use pgnkit::transform::tag_elo::{tag_elo, NameMatch, RatingSource, TagEloOptions};
use pgnkit::transform::unannotate::{unannotate_pgn, UnannotateMode};
use pgnkit::transform::validate::{validate_pgn, ValidateOptions, ValidationPass};

#[derive(Parser, Debug)]
#[command(author, version, about = "Binary-indexed PGN database toolkit")]
struct Args {
    #[command(subcommand)]
    command: Command,
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build (or rebuild) a game's companion `.pbi` index.
    Index { input: PathBuf },
    /// Sort games by a key, writing a new PGN + index.
    Sort {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, value_enum)]
        key: CliSortKey,
        #[arg(long)]
        descending: bool,
    },
    /// Partition games into one file per bucket.
    Split {
        input: PathBuf,
        out_dir: PathBuf,
        #[arg(long, value_enum)]
        by: CliSplitBy,
        #[arg(long)]
        count: Option<usize>,
    },
    /// Merge multiple PGNs, optionally deduplicating.
    Join {
        inputs: Vec<PathBuf>,
        output: PathBuf,
        #[arg(long, value_enum)]
        dedup: Option<CliDedupMode>,
        #[arg(long, value_enum, default_value = "first")]
        retention: CliRetention,
    },
    /// Keep only games ending in checkmate (or stalemate) per the Result tag.
    Filter {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        stalemate: bool,
        #[arg(long)]
        strict: bool,
    },
    /// Tag ECO/Opening/Variation headers from a reference PGN.
    TagEco { input: PathBuf, output: PathBuf, reference: PathBuf },
    /// Fill in missing Elo ratings from a CSV rating table.
    TagElo {
        input: PathBuf,
        output: PathBuf,
        ratings: PathBuf,
        #[arg(long)]
        fuzzy: bool,
        #[arg(long)]
        overwrite: bool,
    },
    /// Score games for tactical elegance (requires prior `analyze`).
    TagElegance { input: PathBuf, output: PathBuf },
    /// Strip comments/NAGs/variations per the requested mode.
    Unannotate {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, value_enum, default_value = "strip-all")]
        mode: CliUnannotateMode,
    },
    /// Run the multi-pass validator, reporting `(code, offset, message)`.
    Validate {
        input: PathBuf,
        #[arg(long, value_enum, default_value = "semantic")]
        up_to: CliValidationPass,
    },
    /// Annotate a game with engine evals and NAGs.
    Analyze {
        input: PathBuf,
        output: PathBuf,
        engine: String,
        #[arg(short, long, default_value_t = config::DEFAULT_DEPTH)]
        depth: u8,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CliSortKey {
    Date,
    WhiteElo,
    BlackElo,
    Result,
    Eco,
    WhiteName,
    BlackName,
    Round,
    Event,
    PlyCount,
}

impl From<CliSortKey> for SortKey {
    fn from(k: CliSortKey) -> Self {
        match k {
            CliSortKey::Date => SortKey::Date,
            CliSortKey::WhiteElo => SortKey::WhiteElo,
            CliSortKey::BlackElo => SortKey::BlackElo,
            CliSortKey::Result => SortKey::Result,
            CliSortKey::Eco => SortKey::Eco,
            CliSortKey::WhiteName => SortKey::WhiteName,
            CliSortKey::BlackName => SortKey::BlackName,
            CliSortKey::Round => SortKey::Round,
            CliSortKey::Event => SortKey::Event,
            CliSortKey::PlyCount => SortKey::PlyCount,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CliSplitBy {
    White,
    Black,
    Both,
    Eco,
    Event,
    Year,
    Month,
    Day,
    Count,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CliDedupMode {
    Strict,
    Movetext,
    Structural,
    Positional,
    Fuzzy,
}

impl From<CliDedupMode> for DedupMode {
    fn from(m: CliDedupMode) -> Self {
        match m {
            CliDedupMode::Strict => DedupMode::StrictHash,
            CliDedupMode::Movetext => DedupMode::MoveTextHash,
            CliDedupMode::Structural => DedupMode::StructuralHash,
            CliDedupMode::Positional => DedupMode::PositionalFingerprint,
            CliDedupMode::Fuzzy => DedupMode::Fuzzy,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CliRetention {
    First,
    Last,
    HighestRated,
    MostComplete,
}

impl From<CliRetention> for RetentionPolicy {
    fn from(r: CliRetention) -> Self {
        match r {
            CliRetention::First => RetentionPolicy::First,
            CliRetention::Last => RetentionPolicy::Last,
            CliRetention::HighestRated => RetentionPolicy::HighestRated,
            CliRetention::MostComplete => RetentionPolicy::MostComplete,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CliUnannotateMode {
    StripAll,
    PreserveMainline,
    PreserveCritical,
    CommentsOnly,
    VariationsOnly,
}

impl From<CliUnannotateMode> for UnannotateMode {
    fn from(m: CliUnannotateMode) -> Self {
        match m {
            CliUnannotateMode::StripAll => UnannotateMode::StripAll,
            CliUnannotateMode::PreserveMainline => UnannotateMode::PreserveMainline,
            CliUnannotateMode::PreserveCritical => UnannotateMode::PreserveCritical,
            CliUnannotateMode::CommentsOnly => UnannotateMode::CommentsOnly,
            CliUnannotateMode::VariationsOnly => UnannotateMode::VariationsOnly,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum CliValidationPass {
    Syntax,
    Structure,
    Semantic,
    Strict,
}

impl From<CliValidationPass> for ValidationPass {
    fn from(p: CliValidationPass) -> Self {
        match p {
            CliValidationPass::Syntax => ValidationPass::Syntax,
            CliValidationPass::Structure => ValidationPass::Structure,
            CliValidationPass::Semantic => ValidationPass::Semantic,
            CliValidationPass::Strict => ValidationPass::Strict,
        }
    }
}

fn setup_logger(level: &str) {
    env_logger::Builder::new().filter_level(level.parse().unwrap_or(log::LevelFilter::Info)).init();
}

/// A rating table loaded from a simple `name,year,month,rating` CSV. This is
/// the trivial in-repo stub standing in for a real FIDE/national-federation
/// rating feed, which is out of scope.
struct CsvRatingSource(HashMap<(String, u32, u32), u16>);

impl CsvRatingSource {
    fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).context("reading ratings CSV")?;
        let mut map = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() != 4 {
                continue;
            }
            let (name, year, month, rating) = (parts[0], parts[1], parts[2], parts[3]);
            if let (Ok(year), Ok(month), Ok(rating)) = (year.parse(), month.parse(), rating.parse()) {
                map.insert((name.to_string(), year, month), rating);
            }
        }
        Ok(Self(map))
    }
}

impl RatingSource for CsvRatingSource {
    fn lookup(&self, name: &str, year: u32, month: u32) -> Option<u16> {
        self.0.get(&(name.to_string(), year, month)).copied()
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let for_handler = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for_handler.cancel();
        }
    });
    token
}

fn bar_callback(bar: pgnkit::visual::CustomProgressBar) -> impl FnMut(Progress) {
    move |p: Progress| {
        pgnkit::visual::update_from_progress(&bar, &p);
    }
}

/// Runs a CPU-bound/blocking-I/O transform engine off the async runtime's
/// worker threads, the same split the teacher keeps between its synchronous
/// file scan and its async engine adapter.
async fn blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.context("background task panicked")?
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logger(&args.log_level);
    let cancel = cancel_on_ctrl_c();

    match args.command {
        Command::Index { input } => {
            blocking(move || {
                let dest = index::companion_path(&input);
                let bar = pgnkit::visual::create_progress(0, 0);
                let summary = indexer::build_index(&input, &dest, &cancel, bar_callback(bar)).context("building index")?;
                info!("indexed {} games ({} warnings)", summary.games_indexed, summary.warnings.len());
                pgnkit::visual::print_success(&format!("indexed {} games -> {}", summary.games_indexed, dest.display()));
                Ok(())
            })
            .await?;
        }
        Command::Sort { input, output, key, descending } => {
            blocking(move || {
                let opts = SortOptions {
                    primary: key.into(),
                    primary_dir: if descending { SortDirection::Descending } else { SortDirection::Ascending },
                    ..Default::default()
                };
                let bar = pgnkit::visual::create_progress(0, 0);
                let report = sort_pgn(&input, &output, &opts, &cancel, bar_callback(bar)).context("sorting")?;
                pgnkit::visual::render_transform_summary(report.games_processed, report.games_kept, &report.errors);
                Ok(())
            })
            .await?;
        }
        Command::Split { input, out_dir, by, count } => {
            blocking(move || {
                let selector = match by {
                    CliSplitBy::White => SplitBy::White,
                    CliSplitBy::Black => SplitBy::Black,
                    CliSplitBy::Both => SplitBy::BothPlayers,
                    CliSplitBy::Eco => SplitBy::Eco,
                    CliSplitBy::Event => SplitBy::Event,
                    CliSplitBy::Year => SplitBy::Date(DatePrecision::Year),
                    CliSplitBy::Month => SplitBy::Date(DatePrecision::Month),
                    CliSplitBy::Day => SplitBy::Date(DatePrecision::Day),
                    CliSplitBy::Count => SplitBy::FixedCount(count.unwrap_or(1)),
                };
                std::fs::create_dir_all(&out_dir).context("creating output directory")?;
                let bar = pgnkit::visual::create_progress(0, 0);
                let outcome = split_pgn(&input, &out_dir, selector, &cancel, bar_callback(bar)).context("splitting")?;
                pgnkit::visual::render_transform_summary(
                    outcome.report.games_processed,
                    outcome.report.games_kept,
                    &outcome.report.errors,
                );
                pgnkit::visual::print_success(&format!("wrote {} file(s)", outcome.files.len()));
                Ok(())
            })
            .await?;
        }
        Command::Join { inputs, output, dedup, retention } => {
            blocking(move || {
                let refs: Vec<&std::path::Path> = inputs.iter().map(|p| p.as_path()).collect();
                let opts = JoinOptions { dedup: dedup.map(Into::into), retention: retention.into(), ..Default::default() };
                let bar = pgnkit::visual::create_progress(0, 0);
                let report = join_pgns(&refs, &output, &opts, &cancel, bar_callback(bar)).context("joining")?;
                pgnkit::visual::render_transform_summary(report.games_processed, report.games_kept, &report.errors);
                Ok(())
            })
            .await?;
        }
        Command::Filter { input, output, stalemate, strict } => {
            blocking(move || {
                let opts = FilterOptions { keep: if stalemate { GameEnding::Stalemate } else { GameEnding::Checkmate }, strict };
                let bar = pgnkit::visual::create_progress(0, 0);
                let report = filter_checkmate(&input, &output, &opts, &cancel, bar_callback(bar)).context("filtering")?;
                pgnkit::visual::render_transform_summary(report.games_processed, report.games_kept, &report.errors);
                Ok(())
            })
            .await?;
        }
        Command::TagEco { input, output, reference } => {
            blocking(move || {
                let bar = pgnkit::visual::create_progress(0, 0);
                let report = tag_eco(&input, &output, &reference, &cancel, bar_callback(bar)).context("tagging eco")?;
                pgnkit::visual::render_transform_summary(report.games_processed, report.games_kept, &report.errors);
                Ok(())
            })
            .await?;
        }
        Command::TagElo { input, output, ratings, fuzzy, overwrite } => {
            blocking(move || {
                let source = CsvRatingSource::load(&ratings)?;
                let opts = TagEloOptions { name_match: if fuzzy { NameMatch::Fuzzy } else { NameMatch::Exact }, overwrite };
                let bar = pgnkit::visual::create_progress(0, 0);
                let report = tag_elo(&input, &output, &source, &opts, &cancel, bar_callback(bar)).context("tagging elo")?;
                pgnkit::visual::render_transform_summary(report.games_processed, report.games_kept, &report.errors);
                Ok(())
            })
            .await?;
        }
        Command::TagElegance { input, output } => {
            blocking(move || {
                let bar = pgnkit::visual::create_progress(0, 0);
                let report = tag_elegance(&input, &output, &EleganceDistributions::default(), &cancel, bar_callback(bar))
                    .context("scoring elegance")?;
                pgnkit::visual::render_transform_summary(report.games_processed, report.games_kept, &report.errors);
                Ok(())
            })
            .await?;
        }
        Command::Unannotate { input, output, mode } => {
            blocking(move || {
                let report = unannotate_pgn(&input, &output, mode.into(), &cancel, bar_callback(pgnkit::visual::create_progress(0, 0)))
                    .context("unannotating")?;
                pgnkit::visual::render_transform_summary(report.games_processed, report.games_kept, &report.errors);
                Ok(())
            })
            .await?;
        }
        Command::Validate { input, up_to } => {
            blocking(move || {
                let opts = ValidateOptions { up_to: up_to.into() };
                let bar = pgnkit::visual::create_progress(0, 0);
                let report = validate_pgn(&input, &opts, &cancel, bar_callback(bar)).context("validating")?;
                pgnkit::visual::print_success(&format!("checked {} game(s)", report.games_checked));
                for err in &report.errors {
                    pgnkit::visual::print_error(&format!("[{}] offset {}: {}", err.code, err.offset, err.message));
                }
                if !report.errors.is_empty() {
                    std::process::exit(1);
                }
                Ok(())
            })
            .await?;
        }
        Command::Analyze { input, output, engine, depth } => {
            let opts = pgnkit::analysis::AnalysisOptions { depth, annotator: Some("pgnkit".into()) };
            let bar = pgnkit::visual::create_progress(0, 0);
            let summary =
                pgnkit::analysis::analyze_file(&input, &output, &engine, &opts, &cancel, bar_callback(bar)).await.context("analyzing")?;
            pgnkit::visual::print_success(&format!("analyzed {} games ({} fell back)", summary.games_analyzed, summary.games_fell_back));
        }
    }

    Ok(())
}

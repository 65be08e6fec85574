// src/visual.rs
// Console and progress-bar plumbing for the CLI front end.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::GameError;
use crate::progress::Progress;

pub fn print_error(message: &str) {
    println!("{}", message.red().bold());
}

pub fn print_success(message: &str) {
    println!("{}", message.green().bold());
}

/// Wraps an `indicatif::ProgressBar`, adding an elapsed-time offset so a
/// resumed operation's ETA accounts for work already done in a prior run.
pub struct CustomProgressBar {
    progress_bar: ProgressBar,
    elapsed_offset: Arc<AtomicU64>,
}

impl CustomProgressBar {
    pub fn new(total: u64, elapsed_offset_secs: u64) -> Self {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.blue} {msg} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );
        CustomProgressBar { progress_bar: pb, elapsed_offset: Arc::new(AtomicU64::new(elapsed_offset_secs)) }
    }

    pub fn set_position(&self, pos: u64) {
        self.progress_bar.set_position(pos);
    }

    pub fn set_message(&self, msg: impl Into<String>) {
        self.progress_bar.set_message(msg.into());
    }
}

pub fn create_progress(total: u64, elapsed_offset: u64) -> CustomProgressBar {
    CustomProgressBar::new(total, elapsed_offset)
}

/// Turns a `progress::Progress` callback tick into a bar update; handed to
/// every transform's `progress_cb` parameter from the CLI.
pub fn update_from_progress(bar: &CustomProgressBar, progress: &Progress) {
    bar.set_message(progress.phase.clone());
    bar.set_position(progress.games_processed);
}

/// Summarises a completed transform: games processed/kept and any per-game
/// errors collected along the way.
pub fn render_transform_summary(games_processed: u64, games_kept: u64, errors: &[GameError]) {
    println!("games processed: {games_processed}");
    println!("games kept: {}", games_kept.to_string().green());
    if !errors.is_empty() {
        println!("{}", format!("{} game error(s):", errors.len()).yellow().bold());
        for err in errors.iter().take(20) {
            println!("  [{}] offset {}: {}", err.game_index, err.offset, err.message);
        }
        if errors.len() > 20 {
            println!("  ... and {} more", errors.len() - 20);
        }
    }
}

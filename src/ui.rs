//! Presentation layer: capability traits and the console implementation
//!
//! The core only talks to [`TargetPrompt`] and [`Ui`]; which implementation
//! runs is decided by the binary at startup.

use crate::download::{ClientDownload, DownloadListener, DownloadState};
use crate::metadata::TransferMetadata;
use crossterm::style::{Color, Stylize};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Asked for a save location when the caller did not fully specify one.
///
/// Leaving the metadata unspecified declines the download.
pub trait TargetPrompt: Send + Sync {
    fn prompt_for_target(&self, metadata: &mut TransferMetadata);
}

pub trait Ui: TargetPrompt {
    /// Informational line
    fn show(&self, message: &str);
    fn show_error(&self, message: &str);
    /// Something the user must notice (connection lost)
    fn alert(&self, message: &str);
    /// Security relevant (malicious input)
    fn alert_error(&self, message: &str);
    fn set_connected(&self, connected: bool);
    /// Release terminal resources. Called once, at exit.
    fn close(&self);
}

pub struct ConsoleUi {
    headless: bool,
    download_dir: Option<PathBuf>,
    multi: MultiProgress,
    connected: AtomicBool,
    closed: AtomicBool,
    // Serializes stdin prompts
    input: Mutex<()>,
}

impl ConsoleUi {
    pub fn new(headless: bool, download_dir: Option<PathBuf>) -> Self {
        Self {
            headless,
            download_dir,
            multi: MultiProgress::new(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            input: Mutex::new(()),
        }
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn println(&self, line: String) {
        self.multi.suspend(|| println!("{}", line));
    }

    fn eprintln(&self, line: String) {
        self.multi.suspend(|| eprintln!("{}", line));
    }

    /// Ask one question on stdin; `None` on EOF or a blank answer.
    fn ask(&self, question: &str) -> Option<String> {
        let _guard = self.input.lock();
        let answer = self.multi.suspend(|| {
            print!("{} ", question);
            let _ = io::stdout().flush();
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line),
            }
        })?;
        let answer = answer.trim();
        (!answer.is_empty()).then(|| answer.to_string())
    }

    /// Progress bar listener for one download. The bar appears once the
    /// download starts running, sized from the announced length.
    pub fn progress_listener(&self, metadata: &TransferMetadata) -> Arc<dyn DownloadListener> {
        let name = metadata.file_name.clone().unwrap_or_else(|| {
            let url = metadata.url().trim_end_matches('/');
            url.rsplit('/').next().unwrap_or(url).to_string()
        });
        Arc::new(ProgressReporter {
            multi: self.multi.clone(),
            bar: Mutex::new(None),
            name,
            started: Instant::now(),
        })
    }
}

impl TargetPrompt for ConsoleUi {
    fn prompt_for_target(&self, metadata: &mut TransferMetadata) {
        if !metadata.has_target_directory() {
            if let Some(dir) = &self.download_dir {
                metadata.target_directory = Some(dir.clone());
            } else if !self.headless {
                let question = format!(
                    "Save {} to directory (blank to skip):",
                    metadata.file_name.as_deref().unwrap_or(metadata.url())
                );
                metadata.target_directory = self.ask(&question).map(PathBuf::from);
            }
        }
        if !metadata.has_file_name() && !self.headless {
            metadata.file_name = self.ask("File name (blank to skip):");
        }
        if !metadata.is_target_specified() {
            self.show(&format!("Skipping {}: no save location", metadata.url()));
        }
    }
}

impl Ui for ConsoleUi {
    fn show(&self, message: &str) {
        self.println(message.to_string());
    }

    fn show_error(&self, message: &str) {
        self.eprintln(format!("{} {}", "error:".with(Color::Red).bold(), message));
    }

    fn alert(&self, message: &str) {
        self.eprintln(format!("{} {}", "!".with(Color::Yellow).bold(), message));
    }

    fn alert_error(&self, message: &str) {
        self.eprintln(format!(
            "{} {}",
            "SECURITY WARNING:".with(Color::Red).bold(),
            message
        ));
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.multi.clear();
        }
    }
}

struct ProgressReporter {
    multi: MultiProgress,
    bar: Mutex<Option<ProgressBar>>,
    name: String,
    started: Instant,
}

impl ProgressReporter {
    fn new_bar(&self, length: Option<u64>) -> ProgressBar {
        let bar = match length {
            Some(len) => {
                let bar = ProgressBar::new(len);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("  {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=> "),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("  {spinner} {msg} {bytes} {bytes_per_sec}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar.enable_steady_tick(Duration::from_millis(120));
                bar
            }
        };
        let bar = self.multi.add(bar);
        bar.set_message(self.name.clone());
        bar
    }

    fn with_bar(&self, download: &ClientDownload, f: impl FnOnce(&ProgressBar)) {
        let mut slot = self.bar.lock();
        let bar = slot.get_or_insert_with(|| self.new_bar(download.length()));
        f(bar);
    }
}

impl DownloadListener for ProgressReporter {
    fn state_changed(&self, download: &ClientDownload, state: DownloadState) {
        match state {
            DownloadState::Running => self.with_bar(download, |_| {}),
            DownloadState::Complete => {
                let secs = self.started.elapsed().as_secs_f64();
                let mb = download.bytes_written() as f64 / 1_048_576.0;
                self.with_bar(download, |bar| {
                    bar.finish_with_message(format!(
                        "{} {} ({:.1} MB in {:.1}s)",
                        "Completed".with(Color::Green).bold(),
                        self.name,
                        mb,
                        secs
                    ))
                });
            }
            DownloadState::Cancelled => self.with_bar(download, |bar| {
                bar.abandon_with_message(format!(
                    "{} {}",
                    "Cancelled".with(Color::Yellow).bold(),
                    self.name
                ))
            }),
            _ => {}
        }
    }

    fn progress(&self, download: &ClientDownload) {
        self.with_bar(download, |bar| {
            if let Some(len) = download.length() {
                if bar.length() != Some(len) {
                    bar.set_length(len);
                }
            }
            bar.set_position(download.bytes_written());
        });
    }

    fn failed(&self, download: &ClientDownload, message: &str) {
        self.with_bar(download, |bar| {
            bar.abandon_with_message(format!(
                "{} {}: {}",
                "Failed".with(Color::Red).bold(),
                self.name,
                message
            ))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::IdAllocator;

    #[test]
    fn headless_prompt_uses_default_directory() {
        let ui = ConsoleUi::new(true, Some(PathBuf::from("/tmp/downloads")));
        let ids = IdAllocator::new();
        let mut m = TransferMetadata::new(&ids, "bnj://h/a.bin").with_file_name("a.bin");
        ui.prompt_for_target(&mut m);
        assert!(m.is_target_specified());
        assert_eq!(m.target_directory, Some(PathBuf::from("/tmp/downloads")));
    }

    #[test]
    fn headless_prompt_without_directory_declines() {
        let ui = ConsoleUi::new(true, None);
        let ids = IdAllocator::new();
        let mut m = TransferMetadata::new(&ids, "bnj://h/a.bin").with_file_name("a.bin");
        ui.prompt_for_target(&mut m);
        assert!(!m.is_target_specified());
    }

    #[test]
    fn headless_prompt_never_invents_a_file_name() {
        let ui = ConsoleUi::new(true, Some(PathBuf::from("/tmp")));
        let ids = IdAllocator::new();
        let mut m = TransferMetadata::new(&ids, "bnj://h/");
        ui.prompt_for_target(&mut m);
        assert!(!m.is_target_specified());
    }
}

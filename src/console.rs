//! Console command language, shared by the interactive shell, `--command`
//! and `--script`.

use crate::controller::ConnectionController;
use crate::download::DownloadState;
use crate::endpoint::parse_endpoint;
use crate::ui::{ConsoleUi, Ui};
use anyhow::{anyhow, bail, Context, Result};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

pub const HELP: &str = "\
Commands:
  connect <host[:port]>            connect (or reconnect) to a server
  download <url> [dir] [name]      start a download
  status                           connection and download status
  wait                             wait until all downloads finished
  cancel                           cancel all downloads
  help                             this text
  exit | quit                      cancel downloads and leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(String),
    Download {
        url: String,
        dir: Option<PathBuf>,
        name: Option<String>,
    },
    Status,
    Wait,
    Cancel,
    Help,
    Exit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| anyhow!("empty command"))?;
        let args: Vec<&str> = words.collect();
        let arity = |min: usize, max: usize| -> Result<()> {
            if args.len() < min || args.len() > max {
                bail!("wrong number of arguments for '{}' (see 'help')", verb);
            }
            Ok(())
        };
        let cmd = match verb.to_ascii_lowercase().as_str() {
            "connect" | "open" => {
                arity(1, 1)?;
                Command::Connect(args[0].to_string())
            }
            "download" | "get" => {
                arity(1, 3)?;
                Command::Download {
                    url: args[0].to_string(),
                    dir: args.get(1).map(PathBuf::from),
                    name: args.get(2).map(|s| s.to_string()),
                }
            }
            "status" => {
                arity(0, 0)?;
                Command::Status
            }
            "wait" => {
                arity(0, 0)?;
                Command::Wait
            }
            "cancel" => {
                arity(0, 0)?;
                Command::Cancel
            }
            "help" | "?" => Command::Help,
            "exit" | "quit" => Command::Exit,
            other => bail!("unknown command '{}' (see 'help')", other),
        };
        Ok(cmd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Console {
    controller: Arc<ConnectionController>,
    ui: Arc<ConsoleUi>,
}

impl Console {
    pub fn new(controller: Arc<ConnectionController>, ui: Arc<ConsoleUi>) -> Self {
        Self { controller, ui }
    }

    /// Parse and run one line; blank lines and `#` comments do nothing.
    pub fn enter(&self, line: &str) -> Result<Flow> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(Flow::Continue);
        }
        self.execute(line.parse()?)
    }

    pub fn execute(&self, command: Command) -> Result<Flow> {
        match command {
            Command::Connect(target) => {
                let port = self.controller.config().port;
                let ep = parse_endpoint(&target, port)
                    .ok_or_else(|| anyhow!("invalid server address '{}'", target))?;
                self.controller
                    .connect(&ep.host, ep.port)
                    .with_context(|| format!("connect to {}", ep))?;
            }
            Command::Download { url, dir, name } => {
                let mut metadata = self.controller.new_metadata(url);
                metadata.target_directory = dir;
                metadata.file_name = name;
                let listener = self.ui.progress_listener(&metadata);
                if self.controller.request_download_from(&mut metadata, listener) {
                    self.ui.show(&format!("Started {}", metadata));
                }
            }
            Command::Status => self.status(),
            Command::Wait => self
                .controller
                .wait_for_downloads()
                .context("waiting for downloads")?,
            Command::Cancel => self.controller.cancel_downloads(),
            Command::Help => self.ui.show(HELP),
            Command::Exit => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    fn status(&self) {
        match self.controller.connection_address() {
            Some(addr) => self.ui.show(&format!("Connected to {}", addr)),
            None => self.ui.show("Not connected"),
        }
        let downloads = self.controller.downloads();
        if downloads.is_empty() {
            self.ui.show("No active downloads");
            return;
        }
        for d in downloads {
            let total = match d.length() {
                Some(len) => len.to_string(),
                None => "?".to_string(),
            };
            let mut line = format!(
                "  #{} [{}] {}/{} bytes written ({} received)",
                d.id(),
                d.state(),
                d.bytes_written(),
                total,
                d.bytes_received()
            );
            if d.state() == DownloadState::Error {
                if let Some(reason) = d.break_off_message() {
                    line.push_str(&format!(": {}", reason));
                }
            }
            self.ui.show(&line);
        }
    }

    /// Run every line of `path`, stopping at the first failing command.
    pub fn run_script(&self, path: &Path) -> Result<Flow> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("open script {}", path.display()))?;
        for (n, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read script {}", path.display()))?;
            let flow = self
                .enter(&line)
                .with_context(|| format!("{}:{}: {}", path.display(), n + 1, line.trim()))?;
            if flow == Flow::Exit {
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    /// Read commands from stdin until `exit` or EOF. Command errors are
    /// shown and the shell keeps going.
    pub fn run_interactive(&self) -> Result<()> {
        self.ui.show("Type 'help' for a list of commands.");
        let stdin = io::stdin();
        loop {
            print!("bininja> ");
            io::stdout().flush().ok();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).context("read command")? == 0 {
                return Ok(());
            }
            match self.enter(&line) {
                Ok(Flow::Exit) => return Ok(()),
                Ok(Flow::Continue) => {}
                Err(e) => self.ui.show_error(&format!("{:#}", e)),
            }
        }
    }
}

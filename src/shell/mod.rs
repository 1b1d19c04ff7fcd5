pub mod parser;
pub mod sftp;
pub mod terminal;

use crate::config::types::{CommandConfig, MatchMode, ShellConfig};

/// How a command line was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A configured `[[shell.commands]]` entry.
    Table,
    Builtin,
    NotFound,
    /// Blank line: nothing to run.
    Empty,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Table => "table",
            Resolution::Builtin => "builtin",
            Resolution::NotFound => "not_found",
            Resolution::Empty => "empty",
        }
    }
}

/// Result of running one fabricated command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
    /// The shell should end after this command (`exit`, `logout`).
    pub exit_requested: bool,
    pub resolution: Resolution,
    /// Prefix of the table entry or name of the built-in that answered.
    pub matched_rule: Option<String>,
}

impl CommandOutput {
    fn empty() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_status: 0,
            exit_requested: false,
            resolution: Resolution::Empty,
            matched_rule: None,
        }
    }

    fn builtin(name: &str, stdout: String, exit_status: u32) -> Self {
        Self {
            stdout,
            stderr: String::new(),
            exit_status,
            exit_requested: false,
            resolution: Resolution::Builtin,
            matched_rule: Some(name.to_string()),
        }
    }
}

struct TableEntry {
    words: Vec<String>,
    normalized: String,
    command: CommandConfig,
}

/// Configured command responses, matched per `MatchMode`.
pub struct CommandTable {
    mode: MatchMode,
    entries: Vec<TableEntry>,
}

impl CommandTable {
    pub fn new(mode: MatchMode, commands: &[CommandConfig]) -> Self {
        let entries = commands
            .iter()
            .map(|c| {
                let words = parser::tokenize(&c.prefix);
                TableEntry {
                    normalized: words.join(" "),
                    words,
                    command: c.clone(),
                }
            })
            .filter(|e| !e.words.is_empty())
            .collect();
        Self { mode, entries }
    }

    /// Find the entry answering `line`.
    ///
    /// Longest-prefix mode picks the entry with the most words that prefix the
    /// line on word boundaries; ties go to the earlier entry. Exact mode only
    /// accepts an entry equal to the whole normalized line.
    pub fn lookup(&self, line: &str) -> Option<&CommandConfig> {
        let words = parser::tokenize(line);
        if words.is_empty() {
            return None;
        }
        match self.mode {
            MatchMode::Exact => {
                let normalized = words.join(" ");
                self.entries
                    .iter()
                    .find(|e| e.normalized == normalized)
                    .map(|e| &e.command)
            }
            MatchMode::LongestPrefix => {
                let mut best: Option<&TableEntry> = None;
                for entry in &self.entries {
                    if !parser::is_word_prefix(&entry.words, &words) {
                        continue;
                    }
                    if best.map_or(true, |b| entry.words.len() > b.words.len()) {
                        best = Some(entry);
                    }
                }
                best.map(|e| &e.command)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fabricated command interpreter. Never executes anything: every answer comes
/// from the command table, a small set of built-ins, or "command not found".
pub struct Shell {
    table: CommandTable,
    username: String,
    hostname: String,
    not_found_exit_status: u32,
}

impl Shell {
    pub fn new(config: &ShellConfig, username: &str) -> Self {
        Self {
            table: CommandTable::new(config.match_mode, &config.commands),
            username: username.to_string(),
            hostname: config.hostname.clone(),
            not_found_exit_status: config.not_found_exit_status,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn home(&self) -> String {
        if self.username == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", self.username)
        }
    }

    pub fn prompt(&self) -> String {
        let sigil = if self.username == "root" { '#' } else { '$' };
        format!("{}@{}:~{} ", self.username, self.hostname, sigil)
    }

    /// Answer one command line. Output uses `\n` line endings.
    pub fn run_line(&self, line: &str) -> CommandOutput {
        let words = parser::tokenize(line);
        let Some(cmd) = words.first() else {
            return CommandOutput::empty();
        };

        if let Some(entry) = self.table.lookup(line) {
            return CommandOutput {
                stdout: entry.stdout.clone(),
                stderr: entry.stderr.clone(),
                exit_status: entry.exit_status,
                exit_requested: false,
                resolution: Resolution::Table,
                matched_rule: Some(entry.prefix.clone()),
            };
        }

        let args = &words[1..];
        match cmd.as_str() {
            "exit" | "logout" => {
                let status = args
                    .first()
                    .and_then(|a| a.parse::<i64>().ok())
                    .map(|n| n.rem_euclid(256) as u32)
                    .unwrap_or(0);
                let mut out = CommandOutput::builtin(cmd, String::new(), status);
                out.exit_requested = true;
                out
            }
            "echo" => {
                let (newline, args) = match args.first().map(String::as_str) {
                    Some("-n") => (false, &args[1..]),
                    _ => (true, args),
                };
                let mut text = args.join(" ");
                if newline {
                    text.push('\n');
                }
                CommandOutput::builtin(cmd, text, 0)
            }
            "true" | ":" => CommandOutput::builtin(cmd, String::new(), 0),
            "false" => CommandOutput::builtin(cmd, String::new(), 1),
            "whoami" => CommandOutput::builtin(cmd, format!("{}\n", self.username), 0),
            "hostname" => CommandOutput::builtin(cmd, format!("{}\n", self.hostname), 0),
            "pwd" => CommandOutput::builtin(cmd, format!("{}\n", self.home()), 0),
            _ => CommandOutput {
                stdout: String::new(),
                stderr: format!("{}: command not found\n", cmd),
                exit_status: self.not_found_exit_status,
                exit_requested: false,
                resolution: Resolution::NotFound,
                matched_rule: None,
            },
        }
    }
}

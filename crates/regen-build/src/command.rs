//! Command-line tokenization and command shape classification
use crate::error::{BuildError, BuildResult};
use std::fmt;

/// External conversion tools this engine knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// `gbagfx <src> <dst> [opts…]`
    GraphicsConvert,
    /// `rsfont <src> <dst> [opts…]`
    FontRasterize,
    /// `jsonproc <a> <b> <dst>`
    JsonProcess,
    /// `mapjson <mode> <game> <src> …`
    MapJsonProcess,
    /// `aif2pcm <src> <dst> [--compress]`
    AudioConvert,
    /// `mid2agb <src> [opts…]`
    MidiConvert,
}

impl ToolKind {
    /// All tools, in table order
    pub const ALL: [ToolKind; 6] = [
        Self::GraphicsConvert,
        Self::FontRasterize,
        Self::JsonProcess,
        Self::MapJsonProcess,
        Self::AudioConvert,
        Self::MidiConvert,
    ];

    /// Normalized executable identity
    pub fn identity(&self) -> &'static str {
        match self {
            Self::GraphicsConvert => "gbagfx",
            Self::FontRasterize => "rsfont",
            Self::JsonProcess => "jsonproc",
            Self::MapJsonProcess => "mapjson",
            Self::AudioConvert => "aif2pcm",
            Self::MidiConvert => "mid2agb",
        }
    }

    /// Look a tool up by normalized identity
    pub fn from_identity(identity: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.identity() == identity)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identity())
    }
}

/// The shape of a rule's command, decided once from its leading token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `cat a b … > out`
    Concat,
    /// One of the conversion tools
    Tool(ToolKind),
    /// `cd <dir> && <rest…>`
    ChangeDir,
    /// Recursive make invocation the orchestrator leaves to its caller
    Delegate,
}

impl CommandKind {
    /// Classify a leading token
    pub fn classify(program: &str) -> Option<Self> {
        if program == crate::env::MAKE_VAR {
            return Some(Self::Delegate);
        }
        match normalize_program(program).as_str() {
            "cat" => Some(Self::Concat),
            "cd" => Some(Self::ChangeDir),
            "make" | "gmake" => Some(Self::Delegate),
            identity => ToolKind::from_identity(identity).map(Self::Tool),
        }
    }
}

/// Reduce an executable reference to its identity: file name, lowercase,
/// without a `.exe` suffix
pub fn normalize_program(program: &str) -> String {
    let name = program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(program)
        .to_ascii_lowercase();
    match name.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => name,
    }
}

/// A tokenized, classified command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Argument vector, program first
    pub argv: Vec<String>,
    /// Recognized shape
    pub kind: CommandKind,
}

impl Command {
    /// Tokenize and classify a command line belonging to `target`
    pub fn parse(target: &str, line: &str) -> BuildResult<Self> {
        let argv = tokenize(line).map_err(|reason| BuildError::malformed(target, reason))?;
        Self::from_argv(target, argv)
    }

    /// Classify an already tokenized argument vector
    pub fn from_argv(target: &str, argv: Vec<String>) -> BuildResult<Self> {
        let program = argv
            .first()
            .ok_or_else(|| BuildError::malformed(target, "empty command"))?;
        let kind = CommandKind::classify(program).ok_or_else(|| {
            BuildError::UnrecognizedCommand {
                target: target.to_string(),
                command: argv.join(" "),
            }
        })?;
        Ok(Self { argv, kind })
    }

    /// Arguments after the program
    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }
}

/// Split a command line into words the way a POSIX shell would
///
/// Handles single quotes, double quotes (with `\"`, `\\`, `\$` and `` \` ``
/// escapes) and backslash escapes outside quotes. No expansion is performed.
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some('\n') => {}
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('\n') => {}
                    Some(c) => current.push(c),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

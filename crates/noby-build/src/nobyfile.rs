//! Build file parsing.
//!
//! The build file is a minimal Dockerfile dialect:
//!
//! ```text
//! FROM scratch
//! ENV GREETING=hello
//! HOST curl -o "$TARGET/rootfs.tar" https://example.org/rootfs.tar
//! RUN echo "$GREETING" > /out
//! ```
//!
//! Lines ending in `\` continue onto the next line; `#` starts a comment
//! line. Everything after the keyword is kept as one opaque string.

use std::fmt;
use std::path::{Path, PathBuf};

use noby_common::{NobyError, NobyResult};

/// Default build file name inside the context directory.
pub const DEFAULT_FILE: &str = "Dockerfile";

/// A single build instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `FROM <scratch | tag | layer key>`
    From {
        /// Base reference.
        base: String,
    },
    /// `ENV <name>=<default>`
    Env {
        /// Variable name.
        name: String,
        /// Default value.
        value: String,
    },
    /// `HOST <command>`, executed on the build host.
    Host {
        /// Shell command line.
        command: String,
    },
    /// `RUN <command>`, executed inside the build snapshot.
    Run {
        /// Shell command line.
        command: String,
    },
}

impl Instruction {
    /// Instruction keyword.
    #[must_use]
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::From { .. } => "FROM",
            Self::Env { .. } => "ENV",
            Self::Host { .. } => "HOST",
            Self::Run { .. } => "RUN",
        }
    }

    /// The command of a `HOST` or `RUN` instruction.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Host { command } | Self::Run { command } => Some(command),
            _ => None,
        }
    }

    /// Whether the instruction executes a command and produces a layer.
    #[must_use]
    pub const fn creates_layer(&self) -> bool {
        matches!(self, Self::Host { .. } | Self::Run { .. })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::From { base } => write!(f, "FROM {base}"),
            Self::Env { name, value } => write!(f, "ENV {name}={value}"),
            Self::Host { command } => write!(f, "HOST {command}"),
            Self::Run { command } => write!(f, "RUN {command}"),
        }
    }
}

/// Parsed build file: instructions in order, with their source lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    instructions: Vec<Instruction>,
    lines: Vec<usize>,
}

impl BuildPlan {
    /// Parse a build file from its text content.
    pub fn parse(content: &str) -> NobyResult<Self> {
        let mut instructions = Vec::new();
        let mut lines = Vec::new();

        for (line, text) in logical_lines(content) {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let instruction = parse_instruction(trimmed, line)?;

            match (&instruction, instructions.is_empty()) {
                (Instruction::From { .. }, false) => {
                    return Err(parse_error(line, "only one FROM instruction is supported"));
                }
                (Instruction::From { .. }, true) => {}
                (other, true) => {
                    return Err(parse_error(
                        line,
                        format!("first instruction must be FROM, found {}", other.keyword()),
                    ));
                }
                _ => {}
            }

            instructions.push(instruction);
            lines.push(line);
        }

        if instructions.is_empty() {
            return Err(parse_error(1, "build file contains no instructions"));
        }

        Ok(Self {
            instructions,
            lines,
        })
    }

    /// Read and parse the build file of a context directory.
    ///
    /// A relative `file` is resolved against `context`.
    pub fn load(context: &Path, file: &Path) -> NobyResult<Self> {
        let path = resolve_file(context, file);
        let content = std::fs::read_to_string(&path).map_err(|e| NobyError::Config {
            message: format!("Failed to read build file {}: {e}", path.display()),
        })?;
        Self::parse(&content)
    }

    /// All instructions in order.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Source line of the instruction at `index`.
    #[must_use]
    pub fn line(&self, index: usize) -> Option<usize> {
        self.lines.get(index).copied()
    }

    /// The `FROM` reference.
    #[must_use]
    pub fn base(&self) -> &str {
        match &self.instructions[0] {
            Instruction::From { base } => base,
            _ => unreachable!("parser guarantees FROM comes first"),
        }
    }

    /// `ENV` declarations in order.
    pub fn env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.instructions.iter().filter_map(|i| match i {
            Instruction::Env { name, value } => Some((name.as_str(), value.as_str())),
            _ => None,
        })
    }

    /// Number of instructions that produce layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.instructions.iter().filter(|i| i.creates_layer()).count()
    }
}

/// Resolve the build file path against the context directory.
#[must_use]
pub fn resolve_file(context: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        context.join(file)
    }
}

/// Whether `name` is a valid environment variable name.
#[must_use]
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Join continuation lines, yielding (first line number, text).
///
/// Continued lines keep their trailing backslash and are joined with a
/// newline, so the shell receives the command as written.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start = 0;

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();

        if current.is_empty() && (line.is_empty() || line.starts_with('#')) {
            logical.push((index + 1, line.to_string()));
            continue;
        }

        if current.is_empty() {
            start = index + 1;
        }
        current.push(line);

        if !line.ends_with('\\') {
            logical.push((start, current.join("\n")));
            current.clear();
        }
    }

    // Trailing continuation at end of file.
    if !current.is_empty() {
        logical.push((start, current.join("\n")));
    }

    logical
}

fn parse_instruction(text: &str, line: usize) -> NobyResult<Instruction> {
    let (keyword, rest) = match text.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (text, ""),
    };
    let keyword = keyword.to_ascii_uppercase();

    let require_argument = || {
        if rest.is_empty() {
            Err(parse_error(line, format!("{keyword} requires an argument")))
        } else {
            Ok(rest.to_string())
        }
    };

    match keyword.as_str() {
        "FROM" => {
            let base = require_argument()?;
            if base.split_whitespace().count() != 1 {
                return Err(parse_error(line, "FROM takes a single reference"));
            }
            Ok(Instruction::From { base })
        }
        "ENV" => parse_env(&require_argument()?, line),
        "HOST" => Ok(Instruction::Host {
            command: require_argument()?,
        }),
        "RUN" => Ok(Instruction::Run {
            command: require_argument()?,
        }),
        other => Err(parse_error(line, format!("unknown instruction '{other}'"))),
    }
}

fn parse_env(argument: &str, line: usize) -> NobyResult<Instruction> {
    let (name, value) = match (argument.split_once('='), argument.split_once(char::is_whitespace)) {
        // `NAME=value`; a space before the `=` means the docker `NAME value` form.
        (Some((name, value)), None) => (name, value),
        (Some((name, value)), Some((before_space, _))) if name.len() < before_space.len() => {
            (name, value)
        }
        (_, Some((name, value))) => (name, value.trim()),
        (None, None) => {
            return Err(parse_error(
                line,
                format!("ENV {argument} is missing a value, expected NAME=value"),
            ));
        }
    };

    if !is_valid_env_name(name) {
        return Err(parse_error(line, format!("invalid variable name '{name}'")));
    }

    Ok(Instruction::Env {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_error(line: usize, message: impl Into<String>) -> NobyError {
    NobyError::Parse {
        line,
        message: message.into(),
    }
}

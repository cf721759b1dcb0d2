//! # Recipe Parsing
//!
//! Line-oriented build recipes:
//!
//! ```text
//! FROM alpine:3.20.0
//! RUN apk add --no-cache curl
//! COPY app.sh /app.sh
//! WORKDIR /srv
//! ENV MODE=production
//! CMD ["/app.sh"]
//! ```
//!
//! Trailing `\` joins the next physical line. Blank lines and `#` comments
//! are ignored. The first directive must be `FROM`. Unknown directives are
//! warnings, not errors, so recipes written for richer builders still parse.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

/// One parsed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Shell command executed inside the tracer.
    Run(String),
    /// Copy from the build context into the rootfs.
    Copy { src: String, dst: String },
    /// Working directory for subsequent steps and the image default.
    Workdir(String),
    /// `KEY=VALUE` appended to the accumulated environment.
    Env(String),
    /// Image default command; last one wins.
    Cmd(Vec<String>),
}

impl Directive {
    /// Directive keyword, for progress rendering.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run(_) => "RUN",
            Self::Copy { .. } => "COPY",
            Self::Workdir(_) => "WORKDIR",
            Self::Env(_) => "ENV",
            Self::Cmd(_) => "CMD",
        }
    }

    /// Argument text, for progress rendering.
    pub fn args(&self) -> String {
        match self {
            Self::Run(cmd) => cmd.clone(),
            Self::Copy { src, dst } => format!("{} {}", src, dst),
            Self::Workdir(dir) => dir.clone(),
            Self::Env(entry) => entry.clone(),
            Self::Cmd(cmd) => serde_json::to_string(cmd).unwrap_or_default(),
        }
    }
}

/// One build step: the directive plus its canonical source line, which is
/// what the layer cache hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub directive: Directive,
    pub line: String,
}

/// A parsed recipe: the base image and the ordered steps after `FROM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    /// Base image reference from the `FROM` line.
    pub base: String,
    /// Steps in order; `FROM` is not a step.
    pub steps: Vec<Step>,
}

impl Recipe {
    /// Parses a recipe file.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Invalid(format!("cannot read recipe {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parses recipe text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut base: Option<String> = None;
        let mut steps = Vec::new();

        for line in logical_lines(content) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (keyword, rest) = match trimmed.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r.trim()),
                None => (trimmed, ""),
            };

            if base.is_none() {
                if keyword.eq_ignore_ascii_case("FROM") {
                    if rest.is_empty() {
                        return Err(Error::Invalid("FROM requires an image".to_string()));
                    }
                    base = Some(rest.to_string());
                    continue;
                }
                return Err(Error::Invalid(format!(
                    "recipe must start with FROM, found '{}'",
                    keyword
                )));
            }

            let directive = match keyword.to_ascii_uppercase().as_str() {
                "FROM" => {
                    return Err(Error::Invalid(
                        "multi-stage recipes are not supported: second FROM".to_string(),
                    ))
                }
                "RUN" => {
                    if rest.is_empty() {
                        return Err(Error::Invalid("RUN requires a command".to_string()));
                    }
                    Directive::Run(rest.to_string())
                }
                "COPY" => parse_copy(rest)?,
                "WORKDIR" => {
                    if rest.is_empty() {
                        return Err(Error::Invalid("WORKDIR requires a path".to_string()));
                    }
                    Directive::Workdir(rest.to_string())
                }
                "ENV" => parse_env(rest)?,
                "CMD" => parse_cmd(rest)?,
                other => {
                    warn!("ignoring unknown directive '{}'", other);
                    continue;
                }
            };

            steps.push(Step {
                directive,
                line: format!("{} {}", keyword.to_ascii_uppercase(), rest),
            });
        }

        let base = base.ok_or_else(|| Error::Invalid("recipe has no FROM line".to_string()))?;
        Ok(Self { base, steps })
    }
}

/// Joins physical lines ending in `\` into logical lines.
fn logical_lines(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
            current.push(' ');
        } else {
            current.push_str(line);
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn parse_copy(rest: &str) -> Result<Directive> {
    let mut parts = rest.split_whitespace();
    let src = parts.next();
    let dst = parts.next();
    match (src, dst, parts.next()) {
        (Some(src), Some(dst), None) => Ok(Directive::Copy {
            src: src.to_string(),
            dst: dst.to_string(),
        }),
        _ => Err(Error::Invalid(format!(
            "COPY requires exactly <src> <dst>, got '{}'",
            rest
        ))),
    }
}

fn parse_env(rest: &str) -> Result<Directive> {
    if rest.contains('=') {
        return Ok(Directive::Env(rest.to_string()));
    }
    match rest.split_once(char::is_whitespace) {
        Some((key, value)) => Ok(Directive::Env(format!("{}={}", key, value.trim()))),
        None => Err(Error::Invalid(format!(
            "ENV requires KEY=VALUE or KEY VALUE, got '{}'",
            rest
        ))),
    }
}

fn parse_cmd(rest: &str) -> Result<Directive> {
    let cmd: Vec<String> = serde_json::from_str(rest).map_err(|e| {
        Error::Invalid(format!("CMD requires a JSON array, got '{}': {}", rest, e))
    })?;
    Ok(Directive::Cmd(cmd))
}

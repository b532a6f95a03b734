//! Report templates with a fixed set of placeholders.
//!
//! Placeholders are written as `{name}`, literal braces as `{{` and `}}`.
//! Templates are validated when they are loaded, so rendering can't fail.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use derive_more::{Display, Error};
use regex::Regex;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}|[{}]").expect("token regex is valid"));

/// Values that can be substituted into a [Template].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Placeholder {
    /// Start of the run.
    #[display("date")]
    Date,
    /// Backup root.
    #[display("backup_dir")]
    BackupDir,
    /// Name of the failed step, empty on success.
    #[display("step")]
    Step,
    /// Identifier of the backed up instance.
    #[display("customer_name")]
    CustomerName,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "date" => Some(Self::Date),
            "backup_dir" => Some(Self::BackupDir),
            "step" => Some(Self::Step),
            "customer_name" => Some(Self::CustomerName),
            _ => None,
        }
    }
}

/// Substitution values of a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    pub date: String,
    pub backup_dir: String,
    pub step: String,
    pub customer_name: String,
}

impl Placeholders {
    fn get(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::Date => &self.date,
            Placeholder::BackupDir => &self.backup_dir,
            Placeholder::Step => &self.step,
            Placeholder::CustomerName => &self.customer_name,
        }
    }
}

#[derive(Debug, Display, Error)]
/// Errors on loading a [Template].
pub enum TemplateError {
    #[display("Reading template {} failed: {_1}", _0.display())]
    Read(#[error(not(source))] PathBuf, #[error(source)] io::Error),
    /// The template refers to a value that isn't supplied.
    #[display("Unknown placeholder {{{name}}} at byte {offset}")]
    UnknownPlaceholder { name: String, offset: usize },
    /// A single `{` or `}` that isn't part of a placeholder.
    #[display("Unmatched brace at byte {_0}")]
    UnmatchedBrace(#[error(ignore)] usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Value(Placeholder),
}

/// A parsed and validated report template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let source =
            std::fs::read_to_string(path).map_err(|e| TemplateError::Read(path.to_path_buf(), e))?;
        let template = source.parse()?;
        log::debug!(target: "notify", "Loaded template {}", path.display());
        Ok(template)
    }

    /// Placeholders used by the template, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = Placeholder> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Value(placeholder) => Some(*placeholder),
            Segment::Text(_) => None,
        })
    }

    pub fn render(&self, values: &Placeholders) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Text(text) => text.as_str(),
                Segment::Value(placeholder) => values.get(*placeholder),
            })
            .collect()
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut last = 0;

        for token in TOKEN.captures_iter(source) {
            let whole = token.get(0).expect("group 0 is the whole match");
            text.push_str(&source[last..whole.start()]);
            last = whole.end();

            match (whole.as_str(), token.get(1)) {
                ("{{", _) => text.push('{'),
                ("}}", _) => text.push('}'),
                (_, Some(name)) => {
                    let placeholder = Placeholder::from_name(name.as_str()).ok_or_else(|| {
                        TemplateError::UnknownPlaceholder {
                            name: name.as_str().to_string(),
                            offset: whole.start(),
                        }
                    })?;
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Value(placeholder));
                }
                _ => return Err(TemplateError::UnmatchedBrace(whole.start())),
            }
        }

        text.push_str(&source[last..]);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(Self { segments })
    }
}

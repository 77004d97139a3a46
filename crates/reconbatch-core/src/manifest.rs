//! Tab-separated input manifests.
//!
//! Two shapes feed the pipeline:
//!
//! - **Header-aware** ([`Manifest::read`]): the first non-blank line names
//!   the columns and every data row must match its width. Used by the
//!   per-row stages (`reconstruct`, `segment`, `mask-edit`, ...).
//! - **Headerless** ([`Manifest::read_headerless`]): positional fields,
//!   used by pre-synthesized command files where each line already is a
//!   complete command.
//!
//! Field values stay verbatim strings. Ratios, dates, and paths are not
//! interpreted here; a value only gets parsed when a later stage needs it.

use std::fs;
use std::path::Path;

use thiserror::Error;

/// Errors raised while reading a manifest file.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: no header line found")]
    MissingHeader { path: String },
    #[error("{path}:{line}: expected {expected} fields, found {found}")]
    ColumnCount {
        path: String,
        line: usize,
        expected: usize,
        found: usize,
    },
}

/// An input table: optional column names plus data records.
///
/// Blank lines are skipped on read. Error messages report the 1-based line
/// number in the underlying file, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    columns: Vec<String>,
    records: Vec<Vec<String>>,
}

impl Manifest {
    /// Read a header-aware manifest: first non-blank line names the
    /// columns, every data row must have exactly as many fields.
    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        let text = read_file(path)?;
        let mut lines = numbered_lines(&text);

        let (_, header) = lines
            .next()
            .ok_or_else(|| ManifestError::MissingHeader { path: display(path) })?;
        let columns: Vec<String> = split_fields(header);

        let mut records = Vec::new();
        for (line_no, line) in lines {
            let fields = split_fields(line);
            if fields.len() != columns.len() {
                return Err(ManifestError::ColumnCount {
                    path: display(path),
                    line: line_no,
                    expected: columns.len(),
                    found: fields.len(),
                });
            }
            records.push(fields);
        }

        Ok(Self { columns, records })
    }

    /// Read a headerless manifest: every non-blank line becomes one record
    /// of positional fields. An empty file yields an empty manifest.
    pub fn read_headerless(path: &Path) -> Result<Self, ManifestError> {
        let text = read_file(path)?;
        let records = numbered_lines(&text)
            .map(|(_, line)| split_fields(line))
            .collect();
        Ok(Self {
            columns: Vec::new(),
            records,
        })
    }

    /// Build a manifest in memory (tests and the study-tree builder).
    pub fn from_parts(columns: Vec<String>, records: Vec<Vec<String>>) -> Self {
        Self { columns, records }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of data records (header excluded).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate data rows in file order.
    pub fn rows(&self) -> impl Iterator<Item = ManifestRow<'_>> + '_ {
        (0..self.records.len()).map(move |i| ManifestRow {
            manifest: self,
            index: i + 1,
        })
    }
}

/// Borrowed view of one data row. `index` is the 1-based record number
/// (header excluded), used in error messages.
#[derive(Debug, Clone, Copy)]
pub struct ManifestRow<'a> {
    manifest: &'a Manifest,
    pub index: usize,
}

impl<'a> ManifestRow<'a> {
    /// All fields of this row, in column order.
    pub fn fields(&self) -> &'a [String] {
        &self.manifest.records[self.index - 1]
    }

    /// Field by column name (header-aware manifests only).
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let pos = self.manifest.columns.iter().position(|c| c == column)?;
        self.fields().get(pos).map(String::as_str)
    }

    /// Field by position (headerless manifests).
    pub fn position(&self, index: usize) -> Option<&'a str> {
        self.fields().get(index).map(String::as_str)
    }
}

fn read_file(path: &Path) -> Result<String, ManifestError> {
    fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: display(path),
        source,
    })
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Non-blank lines with their 1-based file line numbers, CR stripped.
fn numbered_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty())
}

fn split_fields(line: &str) -> Vec<String> {
    line.split('\t').map(str::to_string).collect()
}

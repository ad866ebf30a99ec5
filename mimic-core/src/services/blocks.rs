//! services/blocks.rs
//! Multi-block CSV files: per-profile tables concatenated into one file.
//!
//! ```text
//! linked_in_profile_name=alice
//! Name,Post_Content
//! alice,first post
//! linked_in_profile_name=bob
//! Name,Post_Content
//! ```
//!
//! Each block is a marker line `<prefix>=<identity>`, one header record, then
//! data records. Records are parsed one physical line at a time, so quoted
//! fields cannot span lines. A marker with nothing after it yields no block; a
//! marker with only a header yields an empty table.
//!
//! Also hosts the single-table append used by the personas file.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("line {line}: {reason}")]
    RowParse { line: usize, reason: String },
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl From<csv::Error> for BlockError {
    fn from(e: csv::Error) -> Self {
        let line = e.position().map(|p| p.line() as usize).unwrap_or(0);
        match e.into_kind() {
            csv::ErrorKind::Io(io) => BlockError::Io(io),
            other => BlockError::RowParse {
                line,
                reason: format!("{other:?}"),
            },
        }
    }
}

/// A header plus rows. Every row has exactly `columns.len()` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, top to bottom. Empty when the column is absent.
    pub fn column<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let idx = self.column_index(name);
        self.rows
            .iter()
            .filter_map(move |r| idx.and_then(|i| r.get(i)).map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileBlock {
    pub identity: String,
    pub table: Table,
}

/// Parsed file: blocks in first-seen order. A repeated identity replaces the
/// earlier table but keeps its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileBlocks {
    blocks: Vec<ProfileBlock>,
}

impl ProfileBlocks {
    pub fn get(&self, identity: &str) -> Option<&Table> {
        self.blocks
            .iter()
            .find(|b| b.identity == identity)
            .map(|b| &b.table)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(|b| b.identity.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProfileBlock> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn insert(&mut self, block: ProfileBlock) {
        match self.blocks.iter_mut().find(|b| b.identity == block.identity) {
            Some(slot) => slot.table = block.table,
            None => self.blocks.push(block),
        }
    }
}

/// One classified line of a multi-block file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockLine<'a> {
    Marker(&'a str),
    Record(&'a str),
    Blank,
}

#[derive(Debug, Clone)]
pub struct BlockFormat {
    marker_prefix: String,
}

impl BlockFormat {
    pub fn new(marker_prefix: impl Into<String>) -> Self {
        Self {
            marker_prefix: marker_prefix.into(),
        }
    }

    pub fn marker(&self, identity: &str) -> String {
        format!("{}={}", self.marker_prefix, identity)
    }

    pub fn classify<'a>(&self, line: &'a str) -> BlockLine<'a> {
        let line = line.trim_end();
        if line.is_empty() {
            return BlockLine::Blank;
        }
        match line
            .strip_prefix(self.marker_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('='))
        {
            Some(identity) => BlockLine::Marker(identity),
            None => BlockLine::Record(line),
        }
    }

    pub fn parse_file(&self, path: &Path) -> Result<ProfileBlocks, BlockError> {
        let f = fs::File::open(path)?;
        self.parse(BufReader::new(f))
    }

    /// Single pass over `source`. Lines before the first marker are ignored.
    pub fn parse<R: BufRead>(&self, source: R) -> Result<ProfileBlocks, BlockError> {
        let mut out = ProfileBlocks::default();
        let mut open: Option<(String, Option<Table>)> = None;

        for (idx, line) in source.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            match self.classify(&line) {
                BlockLine::Marker(identity) => {
                    flush(&mut out, open.take());
                    // A nameless marker only closes the previous block.
                    if !identity.trim().is_empty() {
                        open = Some((identity.to_string(), None));
                    }
                }
                BlockLine::Record(text) => {
                    let Some((_, table)) = open.as_mut() else {
                        continue;
                    };
                    let record = parse_record(text, line_no)?;
                    if let Some(t) = table.as_mut() {
                        if record.len() != t.columns.len() {
                            return Err(BlockError::RowParse {
                                line: line_no,
                                reason: format!(
                                    "expected {} fields, found {}",
                                    t.columns.len(),
                                    record.len()
                                ),
                            });
                        }
                        t.rows.push(record);
                    } else {
                        *table = Some(Table::new(record));
                    }
                }
                BlockLine::Blank => {}
            }
        }
        flush(&mut out, open);
        Ok(out)
    }

    /// Append one block (marker, header, rows) to `w` in the on-disk format.
    pub fn write_block<W: Write>(
        &self,
        w: &mut W,
        identity: &str,
        table: &Table,
    ) -> Result<(), BlockError> {
        writeln!(w, "{}", self.marker(identity))?;
        let mut csv_w = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(w);
        csv_w.write_record(&table.columns)?;
        for row in &table.rows {
            csv_w.write_record(row)?;
        }
        csv_w.flush()?;
        Ok(())
    }
}

fn flush(out: &mut ProfileBlocks, open: Option<(String, Option<Table>)>) {
    if let Some((identity, Some(table))) = open {
        out.insert(ProfileBlock { identity, table });
    }
}

fn parse_record(text: &str, line_no: usize) -> Result<Vec<String>, BlockError> {
    if has_unterminated_quote(text) {
        return Err(BlockError::RowParse {
            line: line_no,
            reason: "unterminated quoted field".into(),
        });
    }
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut record = csv::StringRecord::new();
    let got = rdr.read_record(&mut record).map_err(|e| BlockError::RowParse {
        line: line_no,
        reason: e.to_string(),
    })?;
    if !got {
        return Ok(Vec::new());
    }
    Ok(record.iter().map(str::to_string).collect())
}

/// A field opened with `"` that never closes on this line. Stray quotes inside
/// unquoted fields are literal and fine.
fn has_unterminated_quote(text: &str) -> bool {
    let mut chars = text.chars().peekable();
    let mut at_field_start = true;
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            continue;
        }
        match c {
            '"' if at_field_start => {
                in_quotes = true;
                at_field_start = false;
            }
            ',' => at_field_start = true,
            _ => at_field_start = false,
        }
    }
    in_quotes
}

/// Append `row` to a single-table CSV file, writing `columns` first if the file
/// does not exist yet. Earlier rows are never rewritten.
pub fn append_row<S: AsRef<str>>(path: &Path, columns: &[S], row: &[S]) -> Result<(), BlockError> {
    let fresh = !path.exists();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut w = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(f);
    if fresh {
        w.write_record(columns.iter().map(|c| c.as_ref()))?;
    }
    w.write_record(row.iter().map(|c| c.as_ref()))?;
    w.flush()?;
    Ok(())
}

/// Read a single-table CSV file (quoted multi-line fields allowed).
pub fn read_table(path: &Path) -> Result<Table, BlockError> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let columns = rdr.headers()?.iter().map(str::to_string).collect();
    let mut table = Table::new(columns);
    for rec in rdr.records() {
        table.rows.push(rec?.iter().map(str::to_string).collect());
    }
    Ok(table)
}

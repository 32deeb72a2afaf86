//! Migration Script Parser - Splits a SQL script into named migration steps
//!
//! The expected format is:
//!
//! ```text
//! # v1 - create users (block header, dashes/equals/spaces trimmed)
//! CREATE TABLE users (id int PRIMARY KEY, name text);
//! CREATE INDEX users_name ON users (name);
//!
//! # v2
//! ALTER TABLE users ADD COLUMN email text; # trailing comment
//! ```
//!
//! Every `;`-terminated statement becomes one step, numbered from 1 within
//! its block. Quoted strings, quoted identifiers and dollar-quoted bodies
//! are copied verbatim; whitespace elsewhere is collapsed to single spaces.

use std::path::Path;

use crate::definitions::{MigrationStep, MAX_STEP_NAME_LEN};
use crate::error::{MigrateResult, ParseError};

/// Parse a migration script into its ordered list of steps
pub fn parse_script(content: &str) -> Result<Vec<MigrationStep>, ParseError> {
    ScriptCursor::new(content).run()
}

/// Parse a migration script from raw bytes, rejecting invalid UTF-8
pub fn parse_script_bytes(content: &[u8]) -> Result<Vec<MigrationStep>, ParseError> {
    match std::str::from_utf8(content) {
        Ok(text) => parse_script(text),
        Err(e) => {
            let offset = e.valid_up_to();
            let line = content[..offset].iter().filter(|b| **b == b'\n').count() + 1;
            Err(ParseError::InvalidEncoding { offset, line })
        }
    }
}

/// Read and parse a migration script file
pub fn load_script(path: impl AsRef<Path>) -> MigrateResult<Vec<MigrationStep>> {
    let path = path.as_ref();
    let content = std::fs::read(path)?;
    let steps = parse_script_bytes(&content)?;
    tracing::debug!("Parsed {} migration step(s) from {}", steps.len(), path.display());
    Ok(steps)
}

/// Truncate a string to at most `max_bytes` without splitting a character
pub fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn is_block_name_trim(c: char) -> bool {
    matches!(c, ' ' | '\t' | '-' | '=' | '#')
}

fn is_dollar_tag_char(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphanumeric()
}

/// Transient parsing state
struct ScriptCursor<'a> {
    src: &'a str,
    pos: usize,
    block: Option<String>,
    sequence_no: u32,
    statement: String,
    pending_space: bool,
    line_start: bool,
    steps: Vec<MigrationStep>,
}

impl<'a> ScriptCursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            block: None,
            sequence_no: 1,
            statement: String::new(),
            pending_space: false,
            line_start: true,
            steps: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<MigrationStep>, ParseError> {
        while let Some(b) = self.peek() {
            if self.statement.is_empty() && self.between_statements(b)? {
                continue;
            }
            self.statement_token(b)?;
        }

        // The last statement of a script does not need a terminator
        self.finish_statement();
        Ok(self.steps)
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn line_at(&self, offset: usize) -> usize {
        self.src.as_bytes()[..offset].iter().filter(|b| **b == b'\n').count() + 1
    }

    fn find_eol(&self, from: usize) -> usize {
        self.src.as_bytes()[from..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
            .map_or(self.src.len(), |p| from + p)
    }

    /// Consume blanks, block headers and comments between statements.
    ///
    /// Returns false when `b` starts a new statement.
    fn between_statements(&mut self, b: u8) -> Result<bool, ParseError> {
        match b {
            b' ' | b'\t' => {
                self.pos += 1;
                Ok(true)
            }
            b'\r' | b'\n' => {
                self.pos += 1;
                self.line_start = true;
                Ok(true)
            }
            b'#' if self.line_start => {
                self.block_header()?;
                Ok(true)
            }
            b'#' => {
                self.pos = self.find_eol(self.pos);
                Ok(true)
            }
            _ => {
                if self.block.is_none() {
                    return Err(ParseError::OutsideBlock {
                        line: self.line_at(self.pos),
                    });
                }
                self.line_start = false;
                Ok(false)
            }
        }
    }

    fn block_header(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        let eol = self.find_eol(start);

        let name = self.src[start..eol].trim_matches(is_block_name_trim);
        if name.is_empty() {
            return Err(ParseError::EmptyBlockName {
                line: self.line_at(start),
            });
        }

        self.block = Some(truncate_on_char_boundary(name, MAX_STEP_NAME_LEN).to_string());
        self.sequence_no = 1;
        self.pos = eol;
        Ok(())
    }

    fn statement_token(&mut self, b: u8) -> Result<(), ParseError> {
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => {
                self.pos += 1;
                self.pending_space = true;
            }
            b'#' => {
                // Inline comment
                self.pos = self.find_eol(self.pos);
                self.pending_space = true;
            }
            b';' => {
                self.pos += 1;
                self.finish_statement();
            }
            b'\'' => {
                let end = self.scan_single_quoted()?;
                self.push_verbatim(end);
            }
            b'"' => {
                let end = self.scan_double_quoted()?;
                self.push_verbatim(end);
            }
            b'$' => {
                let end = self.scan_dollar_quoted()?;
                self.push_verbatim(end);
            }
            _ => {
                let ch = self.src[self.pos..].chars().next().unwrap_or(char::REPLACEMENT_CHARACTER);
                self.pos += ch.len_utf8();
                self.flush_space();
                self.statement.push(ch);
            }
        }
        Ok(())
    }

    fn flush_space(&mut self) {
        if self.pending_space && !self.statement.is_empty() {
            self.statement.push(' ');
        }
        self.pending_space = false;
    }

    fn push_verbatim(&mut self, end: usize) {
        self.flush_space();
        self.statement.push_str(&self.src[self.pos..end]);
        self.pos = end;
    }

    fn finish_statement(&mut self) {
        self.pending_space = false;
        if self.statement.is_empty() {
            return;
        }

        let mut sql = std::mem::take(&mut self.statement);
        sql.push(';');
        self.steps.push(MigrationStep {
            name: self.block.clone().unwrap_or_default(),
            sequence_no: self.sequence_no,
            sql,
        });
        self.sequence_no += 1;
    }

    /// `'...'` where `''` is a literal quote. Returns the offset past the closing quote.
    fn scan_single_quoted(&self) -> Result<usize, ParseError> {
        let bytes = self.src.as_bytes();
        let mut i = self.pos + 1;
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                if bytes.get(i + 1) == Some(&b'\'') {
                    i += 2;
                    continue;
                }
                return Ok(i + 1);
            }
            i += 1;
        }
        Err(ParseError::UnterminatedString {
            line: self.line_at(self.pos),
        })
    }

    /// `"..."` where a backslash escapes the next character
    fn scan_double_quoted(&self) -> Result<usize, ParseError> {
        let bytes = self.src.as_bytes();
        let mut i = self.pos + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b'"' => return Ok(i + 1),
                _ => i += 1,
            }
        }
        Err(ParseError::UnterminatedIdentifier {
            line: self.line_at(self.pos),
        })
    }

    /// `$tag$ ... $tag$`, tag made of `[A-Za-z0-9_]*`
    fn scan_dollar_quoted(&self) -> Result<usize, ParseError> {
        let bytes = self.src.as_bytes();
        let mut i = self.pos + 1;
        while i < bytes.len() && is_dollar_tag_char(bytes[i]) {
            i += 1;
        }
        if bytes.get(i) != Some(&b'$') {
            return Err(ParseError::InvalidDollarTag {
                line: self.line_at(self.pos),
            });
        }

        let body_start = i + 1;
        let tag = &self.src[self.pos..body_start];
        match self.src[body_start..].find(tag) {
            Some(found) => Ok(body_start + found + tag.len()),
            None => Err(ParseError::UnterminatedDollarQuote {
                tag: tag.to_string(),
                line: self.line_at(self.pos),
            }),
        }
    }
}

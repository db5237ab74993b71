use crate::error::{EngineError, Result};
use crate::source::SqlValue;
use std::fmt::Write as _;

/// Render one row as an INSERT statement.
pub fn render_insert(table: &str, columns: &[String], row: &[SqlValue]) -> String {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let vals = row
        .iter()
        .map(render_literal)
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) VALUES ({});", quote_ident(table), cols, vals)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn render_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Real(v) => {
            // {} on f64 prints the shortest representation that round-trips
            format!("{}", v)
        }
        SqlValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
        SqlValue::Blob(v) => {
            let mut out = String::with_capacity(v.len() * 2 + 3);
            out.push_str("X'");
            for b in v {
                let _ = write!(out, "{:02x}", b);
            }
            out.push('\'');
            out
        }
    }
}

/// Extract the table name from a schema definition statement, for the
/// drop-before-create path of overwriting restores.
pub fn table_of_schema_statement(sql: &str) -> Option<String> {
    let rest = sql.trim_start();
    let rest = strip_keyword(rest, "CREATE")?;
    let rest = strip_keyword(rest, "TABLE")?;
    let rest = strip_keyword(rest, "IF")
        .and_then(|r| strip_keyword(r, "NOT"))
        .and_then(|r| strip_keyword(r, "EXISTS"))
        .unwrap_or(rest);
    let rest = rest.trim_start();
    if let Some(stripped) = rest.strip_prefix('"') {
        // Quoted identifier, "" is an escaped quote
        let mut name = String::new();
        let mut chars = stripped.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    name.push('"');
                } else {
                    return Some(name);
                }
            } else {
                name.push(c);
            }
        }
        None
    } else {
        let name: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '(')
            .collect();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let trimmed = input.trim_start();
    if trimmed.len() >= keyword.len() && trimmed[..keyword.len()].eq_ignore_ascii_case(keyword) {
        Some(&trimmed[keyword.len()..])
    } else {
        None
    }
}

/// Incremental splitter that cuts a statement stream on `;` at top level,
/// honoring single-quoted string literals (with `''` escaping) so data
/// containing semicolons or newlines never splits a statement.
///
/// Operates on bytes: `'` and `;` are single-byte in UTF-8 and cannot occur
/// inside a multi-byte sequence, so chunk boundaries are safe anywhere.
#[derive(Default)]
pub struct StatementSplitter {
    buf: Vec<u8>,
    in_string: bool,
}

impl StatementSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every statement completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for &b in chunk {
            self.buf.push(b);
            match b {
                b'\'' => self.in_string = !self.in_string,
                b';' if !self.in_string => {
                    if let Some(stmt) = take_statement(&mut self.buf)? {
                        out.push(stmt);
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    /// Flush any trailing statement that was not `;`-terminated.
    pub fn finish(mut self) -> Result<Option<String>> {
        if self.in_string {
            return Err(EngineError::Pipeline(
                "statement stream ended inside a string literal".into(),
            ));
        }
        take_statement(&mut self.buf)
    }
}

fn take_statement(buf: &mut Vec<u8>) -> Result<Option<String>> {
    let raw = std::mem::take(buf);
    let text = String::from_utf8(raw)
        .map_err(|e| EngineError::Pipeline(format!("statement stream is not UTF-8: {}", e)))?;
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == ";" {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

//! A1 range parsing.
//!
//! Accepted forms, each optionally prefixed by `Sheet!` or `'Quoted Sheet'!`:
//! `A1`, `A1:B2`, `A:C`, `2:5`, `A2:C` (open-ended rows), and a bare sheet
//! name for the whole sheet. `$` anchors are ignored. Reversed corners
//! (`B2:A1`) are normalized.
//!
//! Parsed ranges are zero-based and end-exclusive; unset bounds are open.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Highest column reachable with three letters (ZZZ).
pub const MAX_COLUMNS: u32 = 18_278;
pub const MAX_ROWS: u32 = 10_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct A1Range {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_row: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_row: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_col: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_col: Option<u32>,
}

/// One side of a range: `B7`, `B`, or `7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Corner {
    row: Option<u32>,
    col: Option<u32>,
}

impl A1Range {
    /// Single cell, zero-based.
    pub fn cell(sheet: Option<&str>, row: u32, col: u32) -> Self {
        Self {
            sheet: sheet.map(String::from),
            start_row: Some(row),
            end_row: Some(row + 1),
            start_col: Some(col),
            end_col: Some(col + 1),
        }
    }

    pub fn whole_sheet(sheet: &str) -> Self {
        Self { sheet: Some(sheet.to_string()), ..Default::default() }
    }

    pub fn is_whole_sheet(&self) -> bool {
        self.start_row.is_none()
            && self.end_row.is_none()
            && self.start_col.is_none()
            && self.end_col.is_none()
    }

    /// Number of rows, when bounded on both ends.
    pub fn row_count(&self) -> Option<u32> {
        match (self.start_row, self.end_row) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        }
    }

    pub fn col_count(&self) -> Option<u32> {
        match (self.start_col, self.end_col) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        }
    }

    pub fn with_sheet(mut self, sheet: &str) -> Self {
        self.sheet = Some(sheet.to_string());
        self
    }

    /// Canonical A1 text (sheet quoted when needed).
    pub fn to_a1(&self) -> String {
        let cells = self.cells_a1();
        match (&self.sheet, cells) {
            (Some(sheet), Some(cells)) => format!("{}!{}", quote_sheet(sheet), cells),
            (Some(sheet), None) => quote_sheet(sheet),
            (None, Some(cells)) => cells,
            (None, None) => String::new(),
        }
    }

    fn cells_a1(&self) -> Option<String> {
        if self.is_whole_sheet() {
            return None;
        }
        let start = format_corner(self.start_col, self.start_row);
        let end = format_corner(self.end_col.map(|c| c - 1), self.end_row.map(|r| r - 1));
        if start == end && self.start_row.is_some() && self.start_col.is_some() {
            return Some(start);
        }
        Some(format!("{}:{}", start, end))
    }
}

impl fmt::Display for A1Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

/// Parse an A1 range. Fails `VALIDATION` with the given field path.
pub fn parse_a1(field: &str, input: &str) -> Result<A1Range> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CoreError::invalid_field(field, "range is empty"));
    }

    let (sheet, rest) = split_sheet(field, input)?;
    let Some(rest) = rest else {
        return Ok(A1Range { sheet, ..Default::default() });
    };

    let (start, end) = match rest.split_once(':') {
        Some((a, b)) => {
            let a = parse_corner(a).ok_or_else(|| bad_range(field, input))?;
            let b = parse_corner(b).ok_or_else(|| bad_range(field, input))?;
            (a, b)
        }
        None => {
            let corner = parse_corner(rest).ok_or_else(|| bad_range(field, input))?;
            if corner.row.is_none() || corner.col.is_none() {
                return Err(bad_range(field, input));
            }
            (corner, corner)
        }
    };

    // Row-only paired with column-only (`A:3`) has no meaning.
    let start_kind = (start.row.is_some(), start.col.is_some());
    let end_kind = (end.row.is_some(), end.col.is_some());
    let compatible = match (start_kind, end_kind) {
        ((true, true), _) => true,
        (a, b) => a == b,
    };
    if !compatible {
        return Err(bad_range(field, input));
    }

    let (start_row, end_row) = order(start.row, end.row);
    let (start_col, end_col) = order(start.col, end.col);

    Ok(A1Range {
        sheet,
        start_row,
        end_row: end_row.map(|r| r + 1),
        start_col,
        end_col: end_col.map(|c| c + 1),
    })
}

/// Zero-based column index to letters (0 → A, 26 → AA).
pub fn col_to_letters(col: u32) -> String {
    let mut result = String::new();
    let mut n = col;
    loop {
        result.insert(0, (b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    result
}

/// Letters to zero-based column index. At most three letters.
pub fn letters_to_col(letters: &str) -> Option<u32> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut col: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        col = col * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    Some(col - 1)
}

// ── Internal helpers ────────────────────────────────────────────────

fn bad_range(field: &str, input: &str) -> CoreError {
    CoreError::invalid_field(field, format!("malformed range '{}'", input))
}

fn order(a: Option<u32>, b: Option<u32>) -> (Option<u32>, Option<u32>) {
    match (a, b) {
        (Some(a), Some(b)) if a > b => (Some(b), Some(a)),
        other => other,
    }
}

/// Split `Sheet!A1` into sheet and cell part. A bare token that is not a
/// valid cell reference is a sheet name.
fn split_sheet<'a>(field: &str, input: &'a str) -> Result<(Option<String>, Option<&'a str>)> {
    if let Some(quoted) = input.strip_prefix('\'') {
        let mut name = String::new();
        let mut chars = quoted.char_indices();
        while let Some((i, c)) = chars.next() {
            if c != '\'' {
                name.push(c);
                continue;
            }
            // '' is an escaped quote
            if quoted[i + 1..].starts_with('\'') {
                name.push('\'');
                chars.next();
                continue;
            }
            let after = &quoted[i + 1..];
            if name.is_empty() {
                return Err(bad_range(field, input));
            }
            return match after.strip_prefix('!') {
                Some(cells) if !cells.is_empty() => Ok((Some(name), Some(cells))),
                Some(_) => Err(bad_range(field, input)),
                None if after.is_empty() => Ok((Some(name), None)),
                None => Err(bad_range(field, input)),
            };
        }
        return Err(bad_range(field, input));
    }

    match input.split_once('!') {
        Some((sheet, cells)) => {
            if sheet.is_empty() || cells.is_empty() {
                return Err(bad_range(field, input));
            }
            Ok((Some(sheet.to_string()), Some(cells)))
        }
        None => {
            if looks_like_cells(input) {
                Ok((None, Some(input)))
            } else if input.contains(':') || input.contains('\'') || cell_shaped(input) {
                Err(bad_range(field, input))
            } else {
                Ok((Some(input.to_string()), None))
            }
        }
    }
}

fn looks_like_cells(s: &str) -> bool {
    match s.split_once(':') {
        Some((a, b)) => parse_corner(a).is_some() && parse_corner(b).is_some(),
        None => parse_corner(s).map_or(false, |c| c.row.is_some() && c.col.is_some()),
    }
}

/// `A0`, `$B$0`: one to three letters then digits, but not a valid cell.
fn cell_shaped(s: &str) -> bool {
    let s: String = s.chars().filter(|c| *c != '$').collect();
    let letters = s.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    let digits = s.chars().skip(letters).take_while(|c| c.is_ascii_digit()).count();
    (1..=3).contains(&letters) && digits > 0 && letters + digits == s.len()
}

fn parse_corner(s: &str) -> Option<Corner> {
    let s = s.trim();
    let mut letters = String::new();
    let mut digits = String::new();
    for c in s.chars() {
        if c == '$' {
            continue;
        }
        if c.is_ascii_alphabetic() && digits.is_empty() {
            letters.push(c);
        } else if c.is_ascii_digit() {
            digits.push(c);
        } else {
            return None;
        }
    }
    if letters.is_empty() && digits.is_empty() {
        return None;
    }

    let col = if letters.is_empty() {
        None
    } else {
        Some(letters_to_col(&letters)?)
    };
    let row = if digits.is_empty() {
        None
    } else {
        let n: u32 = digits.parse().ok()?;
        if n == 0 || n > MAX_ROWS {
            return None;
        }
        Some(n - 1)
    };
    Some(Corner { row, col })
}

fn format_corner(col: Option<u32>, row: Option<u32>) -> String {
    let mut out = String::new();
    if let Some(c) = col {
        out.push_str(&col_to_letters(c));
    }
    if let Some(r) = row {
        out.push_str(&(r + 1).to_string());
    }
    out
}

fn quote_sheet(name: &str) -> String {
    let plain = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && !looks_like_cells(name);
    if plain {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

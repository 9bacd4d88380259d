//! Stateless helper utilities shared by the builder, backend and writer.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

use crate::conf::{
    C_ITEM_LABEL_BLANK, N_LEN_EXCEL_SHEET_NAME_MAX, N_NCOLS_EXCEL_MAX, N_NROWS_EXCEL_MAX,
    TUP_EXCEL_ILLEGAL,
};
use crate::spec::EnumCellValue;

////////////////////////////////////////////////////////////////////////////////
// #region Layout

/// First pivot body row for a report with `n_filters` page fields.
///
/// Page fields occupy rows `1..=n_filters`, one blank row follows, then the
/// header row; the body starts right after it.
pub fn calculate_first_data_row(n_filters: usize) -> u32 {
    if n_filters == 0 {
        2
    } else {
        n_filters as u32 + 3
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region SheetNormalization

/// Check a sheet name against Excel rules.
pub fn validate_sheet_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("sheet name is empty".to_string());
    }
    if name.chars().count() > N_LEN_EXCEL_SHEET_NAME_MAX {
        return Err(format!(
            "sheet name longer than {N_LEN_EXCEL_SHEET_NAME_MAX} characters"
        ));
    }
    if let Some(c_illegal) = TUP_EXCEL_ILLEGAL.iter().find(|c| name.contains(**c)) {
        return Err(format!("sheet name contains `{c_illegal}`"));
    }
    if name.starts_with('\'') || name.ends_with('\'') {
        return Err("sheet name starts or ends with an apostrophe".to_string());
    }
    Ok(())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region A1References

/// 1-based column number to letters (`1 -> A`, `28 -> AB`).
pub fn derive_column_letters(col: u32) -> String {
    let mut n_rest = col;
    let mut l_chars = Vec::new();
    while n_rest > 0 {
        let n_rem = (n_rest - 1) % 26;
        l_chars.push((b'A' + n_rem as u8) as char);
        n_rest = (n_rest - 1) / 26;
    }
    l_chars.iter().rev().collect()
}

/// Column letters to 1-based column number.
pub fn parse_column_letters(letters: &str) -> Result<u32, String> {
    if letters.is_empty() {
        return Err("missing column letters".to_string());
    }
    let mut n_col: u32 = 0;
    for chr in letters.chars() {
        if !chr.is_ascii_alphabetic() {
            return Err(format!("invalid column letters `{letters}`"));
        }
        let n_digit = (chr.to_ascii_uppercase() as u8 - b'A') as u32 + 1;
        n_col = n_col
            .checked_mul(26)
            .and_then(|v| v.checked_add(n_digit))
            .ok_or_else(|| format!("column `{letters}` out of range"))?;
    }
    if n_col > N_NCOLS_EXCEL_MAX {
        return Err(format!("column `{letters}` out of range"));
    }
    Ok(n_col)
}

/// Format a 1-based `(row, col)` pair as `A1`.
pub fn format_a1_cell(row: u32, col: u32) -> String {
    format!("{}{row}", derive_column_letters(col))
}

/// Parse `A1` or `$A$1` into a 1-based `(row, col)` pair.
pub fn parse_a1_cell(text: &str) -> Result<(u32, u32), String> {
    let c_cell = text.trim().replace('$', "");
    let n_split = c_cell
        .find(|chr: char| chr.is_ascii_digit())
        .ok_or_else(|| format!("missing row number in `{text}`"))?;
    let (c_letters, c_digits) = c_cell.split_at(n_split);
    let n_col = parse_column_letters(c_letters)?;
    let n_row: u32 = c_digits
        .parse()
        .map_err(|_| format!("invalid row number in `{text}`"))?;
    if n_row == 0 || n_row > N_NROWS_EXCEL_MAX {
        return Err(format!("row {n_row} out of range"));
    }
    Ok((n_row, n_col))
}

/// Parsed `sheet!A1:D11` reference; cells are 1-based `(row, col)`.
pub type TupA1Range = (Option<String>, (u32, u32), (u32, u32));

/// Parse `sheet!A1:D11`, `'my sheet'!A1:D11` or `A1:D11`.
///
/// Corners are normalized so the first cell is top-left.
pub fn parse_a1_range(text: &str) -> Result<TupA1Range, String> {
    let c_text = text.trim();
    let (c_sheet, c_cells) = match c_text.rfind('!') {
        Some(n_idx) => {
            let c_sheet = c_text[..n_idx].trim();
            let c_sheet = c_sheet
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .map(|s| s.replace("''", "'"))
                .unwrap_or_else(|| c_sheet.to_string());
            if c_sheet.is_empty() {
                return Err(format!("empty sheet name in `{text}`"));
            }
            (Some(c_sheet), &c_text[n_idx + 1..])
        }
        None => (None, c_text),
    };

    let (c_first, c_last) = match c_cells.split_once(':') {
        Some((first, last)) => (first, last),
        None => (c_cells, c_cells),
    };
    let (n_row_a, n_col_a) = parse_a1_cell(c_first)?;
    let (n_row_b, n_col_b) = parse_a1_cell(c_last)?;

    Ok((
        c_sheet,
        (n_row_a.min(n_row_b), n_col_a.min(n_col_b)),
        (n_row_a.max(n_row_b), n_col_a.max(n_col_b)),
    ))
}

/// Quote a sheet name for use in a range reference when needed.
pub fn quote_sheet_name(name: &str) -> String {
    if name.chars().all(|chr| chr.is_alphanumeric() || chr == '_') {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

/// Convert sorted indices to contiguous inclusive ranges.
pub fn derive_contiguous_ranges(sorted_indices: &[u32]) -> Vec<(u32, u32)> {
    let Some(&n_first) = sorted_indices.first() else {
        return vec![];
    };

    let mut l_contiguous_ranges = Vec::new();
    let mut n_idx_start = n_first;
    let mut n_idx_end = n_first;

    for idx in &sorted_indices[1..] {
        if *idx == n_idx_end + 1 {
            n_idx_end = *idx;
        } else {
            l_contiguous_ranges.push((n_idx_start, n_idx_end));
            n_idx_start = *idx;
            n_idx_end = *idx;
        }
    }

    l_contiguous_ranges.push((n_idx_start, n_idx_end));
    l_contiguous_ranges
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region CellValueConversion

/// Record normalization applied before values reach the data sheet.
///
/// Dates become the UTC midnight instant of that date; times of day become text.
pub fn normalize_record_value(value: EnumCellValue) -> EnumCellValue {
    match value {
        EnumCellValue::Date(date) => EnumCellValue::DateTime(derive_utc_midnight(date)),
        EnumCellValue::Time(time) => EnumCellValue::String(time.format("%H:%M:%S").to_string()),
        EnumCellValue::Number(n) if !n.is_finite() => EnumCellValue::None,
        other => other,
    }
}

pub fn derive_utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn derive_excel_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .unwrap_or(NaiveDate::MIN)
        .and_time(NaiveTime::MIN)
}

/// Excel serial day number (1900 date system) of an instant.
pub fn derive_excel_serial(value: &DateTime<Utc>) -> f64 {
    let delta = value.naive_utc() - derive_excel_epoch();
    delta.num_milliseconds() as f64 / 86_400_000.0
}

/// Instant for an Excel serial day number.
pub fn derive_datetime_from_excel_serial(serial: f64) -> Option<DateTime<Utc>> {
    if !serial.is_finite() {
        return None;
    }
    let n_ms = (serial * 86_400_000.0).round() as i64;
    Duration::try_milliseconds(n_ms)
        .and_then(|delta| derive_excel_epoch().checked_add_signed(delta))
        .map(|dt| dt.and_utc())
}

/// Calendar date of a date-like value.
pub fn derive_date(value: &EnumCellValue) -> Option<NaiveDate> {
    match value {
        EnumCellValue::Date(date) => Some(*date),
        EnumCellValue::DateTime(dt) => Some(dt.date_naive()),
        _ => None,
    }
}

fn format_number_label(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Pivot item label of a cell value. Empty values map to `(blank)`.
pub fn derive_item_label(value: &EnumCellValue) -> String {
    match value {
        EnumCellValue::None => C_ITEM_LABEL_BLANK.to_string(),
        EnumCellValue::String(text) if text.is_empty() => C_ITEM_LABEL_BLANK.to_string(),
        EnumCellValue::String(text) => text.clone(),
        EnumCellValue::Number(n) => format_number_label(*n),
        EnumCellValue::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        EnumCellValue::Date(date) => date.format("%Y-%m-%d").to_string(),
        EnumCellValue::DateTime(dt) => {
            if dt.time().num_seconds_from_midnight() == 0 && dt.time().nanosecond() == 0 {
                dt.format("%Y-%m-%d").to_string()
            } else {
                dt.format("%Y-%m-%d %H:%M:%S").to_string()
            }
        }
        EnumCellValue::Time(time) => time.format("%H:%M:%S").to_string(),
    }
}

/// Natural item order: numbers ascending, then text, then `(blank)` last.
pub fn compare_item_labels(a: &str, b: &str) -> Ordering {
    let rank = |label: &str| -> (u8, Option<f64>) {
        if label == C_ITEM_LABEL_BLANK {
            (2, None)
        } else if let Ok(n) = label.parse::<f64>() {
            (0, Some(n))
        } else {
            (1, None)
        }
    };
    let (n_rank_a, n_val_a) = rank(a);
    let (n_rank_b, n_val_b) = rank(b);
    n_rank_a.cmp(&n_rank_b).then_with(|| match (n_val_a, n_val_b) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)),
    })
}

/// Display width estimate; non-ASCII characters count as 1.6 columns.
pub fn estimate_unicode_string_width(s: &str) -> usize {
    let n_ascii = s.chars().filter(|chr| chr.is_ascii()).count();
    let n_non_ascii = s.chars().count().saturating_sub(n_ascii);
    n_ascii + (n_non_ascii as f64 * 1.6).round() as usize
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

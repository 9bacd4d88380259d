//! Tabular source data: file discovery and readers.
//!
//! CSV and Arrow IPC files are read with polars, spreadsheet files with
//! calamine. Only the first sheet of a spreadsheet is read; the first row is
//! the header row.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

use calamine::{Data, Reader, open_workbook_auto};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use polars::prelude::{AnyValue, CsvReadOptions, DataFrame, IpcReader, SerReader, TimeUnit};

use crate::spec::{EnumCellValue, SourceError, SpecRecord};
use crate::util::{
    derive_datetime_from_excel_serial, derive_item_label, derive_utc_midnight,
    normalize_record_value,
};

/// Extensions tried after the raw name, in order.
const TUP_SOURCE_EXTENSIONS: [&str; 3] = ["xlsx", "xls", "csv"];

/// Header row plus body rows, all rows as wide as the header.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpecSourceTable {
    pub l_headers: Vec<String>,
    pub l_rows: Vec<Vec<EnumCellValue>>,
}

impl SpecSourceTable {
    pub fn n_rows(&self) -> usize {
        self.l_rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.l_headers.len()
    }

    /// Headers come from the first record's keys; later records are read in
    /// that order and missing keys become blanks.
    pub fn from_records(records: &[SpecRecord]) -> Self {
        let Some(first) = records.first() else {
            return Self::default();
        };
        let l_headers: Vec<String> = first.keys().cloned().collect();
        let l_rows = records
            .iter()
            .map(|record| {
                l_headers
                    .iter()
                    .map(|key| {
                        record
                            .get(key)
                            .cloned()
                            .map(normalize_record_value)
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .collect();
        Self { l_headers, l_rows }
    }

    pub fn from_dataframe(df: &DataFrame) -> Result<Self, SourceError> {
        let l_headers: Vec<String> = df
            .get_column_names_str()
            .into_iter()
            .map(ToString::to_string)
            .collect();
        let l_cols = df.get_columns();
        let mut l_rows = Vec::with_capacity(df.height());
        for n_row in 0..df.height() {
            let mut l_row = Vec::with_capacity(l_cols.len());
            for col in l_cols {
                l_row.push(derive_cell_value_from_any_value(col.get(n_row)?));
            }
            l_rows.push(l_row);
        }
        Ok(Self { l_headers, l_rows })
    }

    /// Header row followed by body rows, as written to a sheet.
    pub fn to_grid(&self) -> Vec<Vec<EnumCellValue>> {
        let mut l_grid = Vec::with_capacity(self.l_rows.len() + 1);
        l_grid.push(
            self.l_headers
                .iter()
                .map(|h| EnumCellValue::String(h.clone()))
                .collect(),
        );
        l_grid.extend(self.l_rows.iter().cloned());
        l_grid
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region Discovery

/// Find the source file for `name`: the raw path, then `.xlsx`, `.xls`, `.csv`.
pub fn resolve_source_file(name: &Path) -> Result<PathBuf, SourceError> {
    if name.is_file() {
        return Ok(name.to_path_buf());
    }
    for c_ext in TUP_SOURCE_EXTENSIONS {
        let mut os_path = OsString::from(name.as_os_str());
        os_path.push(".");
        os_path.push(c_ext);
        let path = PathBuf::from(os_path);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "source file resolved");
            return Ok(path);
        }
    }
    Err(SourceError::UnknownFileFormat(name.to_path_buf()))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Readers

/// Read the first table of a source file.
pub fn read_source_table(path: &Path) -> Result<SpecSourceTable, SourceError> {
    let path = resolve_source_file(path)?;
    let c_ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let table = match c_ext.as_str() {
        "csv" | "txt" => read_csv_table(&path)?,
        "arrow" | "ipc" | "feather" => read_ipc_table(&path)?,
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => read_spreadsheet_table(&path)?,
        _ => return Err(SourceError::UnknownFileFormat(path)),
    };
    if table.l_headers.is_empty() {
        return Err(SourceError::Empty(path));
    }
    tracing::info!(
        path = %path.display(),
        n_rows = table.n_rows(),
        n_cols = table.n_cols(),
        "source loaded"
    );
    Ok(table)
}

fn read_csv_table(path: &Path) -> Result<SpecSourceTable, SourceError> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|options| options.with_try_parse_dates(true))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    SpecSourceTable::from_dataframe(&df)
}

fn read_ipc_table(path: &Path) -> Result<SpecSourceTable, SourceError> {
    let df = IpcReader::new(File::open(path)?).finish()?;
    SpecSourceTable::from_dataframe(&df)
}

fn read_spreadsheet_table(path: &Path) -> Result<SpecSourceTable, SourceError> {
    let mut workbook = open_workbook_auto(path)?;
    let Some(range) = workbook.worksheet_range_at(0) else {
        return Err(SourceError::Empty(path.to_path_buf()));
    };
    let range = range?;

    let mut it_rows = range.rows();
    let Some(l_header_cells) = it_rows.next() else {
        return Ok(SpecSourceTable::default());
    };
    let l_headers: Vec<String> = l_header_cells
        .iter()
        .map(|cell| match derive_cell_value_from_data(cell) {
            EnumCellValue::None => String::new(),
            EnumCellValue::String(text) => text,
            other => derive_item_label(&other),
        })
        .collect();

    let mut l_rows: Vec<Vec<EnumCellValue>> = it_rows
        .map(|row| {
            let mut l_row: Vec<EnumCellValue> =
                row.iter().map(derive_cell_value_from_data).collect();
            l_row.resize(l_headers.len(), EnumCellValue::None);
            l_row
        })
        .collect();
    while l_rows
        .last()
        .is_some_and(|row| row.iter().all(EnumCellValue::is_empty))
    {
        l_rows.pop();
    }
    Ok(SpecSourceTable { l_headers, l_rows })
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ValueConversion

fn derive_cell_value_from_data(cell: &Data) -> EnumCellValue {
    match cell {
        Data::Empty => EnumCellValue::None,
        Data::String(text) => EnumCellValue::String(text.clone()),
        Data::Float(val) => EnumCellValue::Number(*val),
        Data::Int(val) => EnumCellValue::Number(*val as f64),
        Data::Bool(val) => EnumCellValue::Boolean(*val),
        Data::Error(err) => EnumCellValue::String(format!("{err:?}")),
        Data::DateTime(dt) => derive_datetime_from_excel_serial(dt.as_f64())
            .map_or(EnumCellValue::Number(dt.as_f64()), EnumCellValue::DateTime),
        Data::DateTimeIso(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| EnumCellValue::DateTime(dt.with_timezone(&Utc)))
            .unwrap_or_else(|_| EnumCellValue::String(text.clone())),
        Data::DurationIso(text) => EnumCellValue::String(text.clone()),
    }
}

fn derive_cell_value_from_any_value(value: AnyValue<'_>) -> EnumCellValue {
    match value {
        AnyValue::Null => EnumCellValue::None,
        AnyValue::String(val) => EnumCellValue::String(val.to_string()),
        AnyValue::StringOwned(val) => EnumCellValue::String(val.to_string()),
        AnyValue::Boolean(val) => EnumCellValue::Boolean(val),
        AnyValue::UInt8(val) => EnumCellValue::Number(val as f64),
        AnyValue::UInt16(val) => EnumCellValue::Number(val as f64),
        AnyValue::UInt32(val) => EnumCellValue::Number(val as f64),
        AnyValue::UInt64(val) => EnumCellValue::Number(val as f64),
        AnyValue::Int8(val) => EnumCellValue::Number(val as f64),
        AnyValue::Int16(val) => EnumCellValue::Number(val as f64),
        AnyValue::Int32(val) => EnumCellValue::Number(val as f64),
        AnyValue::Int64(val) => EnumCellValue::Number(val as f64),
        AnyValue::Float32(val) => EnumCellValue::Number(val as f64),
        AnyValue::Float64(val) => EnumCellValue::Number(val),
        AnyValue::Date(n_days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .zip(Duration::try_days(i64::from(n_days)))
            .and_then(|(epoch, delta)| epoch.checked_add_signed(delta))
            .map_or(EnumCellValue::None, |date| {
                EnumCellValue::DateTime(derive_utc_midnight(date))
            }),
        AnyValue::Datetime(n_value, unit, _) => {
            let dt = match unit {
                TimeUnit::Nanoseconds => Some(DateTime::from_timestamp_nanos(n_value)),
                TimeUnit::Microseconds => DateTime::from_timestamp_micros(n_value),
                TimeUnit::Milliseconds => DateTime::from_timestamp_millis(n_value),
            };
            dt.map_or(EnumCellValue::None, EnumCellValue::DateTime)
        }
        AnyValue::Time(n_ns) => {
            let n_secs = (n_ns / 1_000_000_000) as u32;
            let n_nanos = (n_ns % 1_000_000_000) as u32;
            NaiveTime::from_num_seconds_from_midnight_opt(n_secs, n_nanos)
                .map_or(EnumCellValue::None, |time| {
                    normalize_record_value(EnumCellValue::Time(time))
                })
        }
        _ => EnumCellValue::String(value.to_string()),
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create");
        file.write_all(content.as_bytes()).expect("write");
        path
    }

    #[test]
    fn test_resolve_prefers_raw_then_extension_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path_base = dir.path().join("sales");
        assert!(matches!(
            resolve_source_file(&path_base),
            Err(SourceError::UnknownFileFormat(_))
        ));

        write_file(dir.path(), "sales.csv", "a\n1\n");
        assert_eq!(
            resolve_source_file(&path_base).expect("csv"),
            dir.path().join("sales.csv")
        );

        write_file(dir.path(), "sales.xls", "");
        assert_eq!(
            resolve_source_file(&path_base).expect("xls"),
            dir.path().join("sales.xls")
        );

        write_file(dir.path(), "sales", "a\n1\n");
        assert_eq!(resolve_source_file(&path_base).expect("raw"), path_base);
    }

    #[test]
    fn test_read_csv_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(
            dir.path(),
            "data.csv",
            "region,year,sales\nNorth,2023,10.5\nSouth,2024,20\n",
        );
        let table = read_source_table(&path).expect("read");
        assert_eq!(table.l_headers, vec!["region", "year", "sales"]);
        assert_eq!(table.n_rows(), 2);
        assert_eq!(table.l_rows[0][0], EnumCellValue::String("North".to_string()));
        assert_eq!(table.l_rows[0][2], EnumCellValue::Number(10.5));
        assert_eq!(table.l_rows[1][1], EnumCellValue::Number(2024.0));
    }

    #[test]
    fn test_from_records_follows_first_record_keys() {
        let mut first = SpecRecord::new();
        first.insert("b".to_string(), EnumCellValue::Number(1.0));
        first.insert("a".to_string(), EnumCellValue::from("x"));
        let mut second = SpecRecord::new();
        second.insert("a".to_string(), EnumCellValue::from("y"));
        second.insert(
            "b".to_string(),
            EnumCellValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).expect("date")),
        );

        let table = SpecSourceTable::from_records(&[first, second]);
        assert_eq!(table.l_headers, vec!["b", "a"]);
        assert_eq!(table.l_rows[1][0], EnumCellValue::DateTime(
            derive_utc_midnight(NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"))
        ));
        assert_eq!(table.l_rows[0][1], EnumCellValue::from("x"));
    }

    #[test]
    fn test_from_dataframe_converts_dates() {
        use polars::prelude::{Column, DataType, IntoColumn, NamedFrom, Series};

        let s_dates = Series::new("day".into(), &[19_723_i32])
            .cast(&DataType::Date)
            .expect("cast");
        let df = DataFrame::new(vec![
            s_dates.into_column(),
            Column::new("n".into(), &[3_i64]),
        ])
        .expect("df");
        let table = SpecSourceTable::from_dataframe(&df).expect("table");
        assert_eq!(table.l_headers, vec!["day", "n"]);
        assert_eq!(
            table.l_rows[0][0],
            EnumCellValue::DateTime(derive_utc_midnight(
                NaiveDate::from_ymd_opt(2024, 1, 1).expect("date")
            ))
        );
        assert_eq!(table.l_rows[0][1], EnumCellValue::Number(3.0));
    }
}

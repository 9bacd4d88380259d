//! Pivot report constants and default preset factories.

use crate::spec::SpecCellFormat;

/// Excel worksheet maximum row count.
pub const N_NROWS_EXCEL_MAX: u32 = 1_048_576;
/// Excel worksheet maximum column count.
pub const N_NCOLS_EXCEL_MAX: u32 = 16_384;
/// Excel sheet name maximum length.
pub const N_LEN_EXCEL_SHEET_NAME_MAX: usize = 31;
/// Characters not allowed in sheet names.
pub const TUP_EXCEL_ILLEGAL: [&str; 7] = ["*", ":", "?", "/", "\\", "[", "]"];

////////////////////////////////////////////////////////////////////////////////
// #region Workbook

/// Name of the sheet holding pivot source rows.
pub const C_SHEET_NAME_SOURCE: &str = "data";
/// Name of the table registered over the source rows.
pub const C_TABLE_NAME_SOURCE: &str = "DT_Source";
/// Name of the blank sheet every new workbook starts with.
pub const C_SHEET_NAME_DEFAULT: &str = "Sheet1";

/// Default output file name (without extension).
pub const C_FILE_NAME_DEFAULT: &str = "report";
/// Default output file extension.
pub const C_FILE_EXT_DEFAULT: &str = "xlsx";
/// Default output directory.
pub const C_FILE_PATH_DEFAULT: &str = "reports";

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region PivotLabels

/// Item label used for empty source cells.
pub const C_ITEM_LABEL_BLANK: &str = "(blank)";
/// Page-field label when every item is visible.
pub const C_PAGE_LABEL_ALL: &str = "(All)";
/// Page-field label when more than one (but not every) item is visible.
pub const C_PAGE_LABEL_MULTIPLE: &str = "(Multiple Items)";
/// Header of the row label column.
pub const C_HEADER_ROW_LABELS: &str = "Row Labels";
/// Label of the grand total row/column.
pub const C_LABEL_GRAND_TOTAL: &str = "Grand Total";
/// Separator used in conversion field keys.
pub const C_CONVERSION_ARROW: &str = " -> ";

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ConditionalFormatting

// Colors are BGR integers, as the spreadsheet object model stores them.

/// Data bar fill and border color.
pub const N_COLOR_DATA_BAR: u32 = 13_012_579;
/// Negative data bar fill and border color.
pub const N_COLOR_DATA_BAR_NEGATIVE: u32 = 255;
/// Color scale "good" end.
pub const N_COLOR_SCALE_GREEN: u32 = 8_109_667;
/// Color scale midpoint.
pub const N_COLOR_SCALE_YELLOW: u32 = 8_711_167;
/// Color scale "bad" end.
pub const N_COLOR_SCALE_RED: u32 = 7_039_480;
/// Percentile used for the color scale midpoint.
pub const N_COLOR_SCALE_MIDPOINT_PERCENTILE: u32 = 50;

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Charts

/// Chart width in backend units (pixels).
pub const N_CHART_WIDTH: u32 = 1000;
/// Chart height in backend units (pixels).
pub const N_CHART_HEIGHT: u32 = 600;

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Presets

/// Euro currency number format.
pub const FMT_EURO: &str = "[$€-2] # ##0,00";
/// Ruble currency number format.
pub const FMT_RUB: &str = "[$₽-2] # ##0,00";
/// Whole percent number format.
pub const FMT_PERCENT: &str = "0%";
/// Two-decimal percent number format.
pub const FMT_PERCENT_2: &str = "0.00%";
/// Integer number format.
pub const FMT_NUMBER: &str = "0";
/// Date format for materialized date cells.
pub const FMT_DATE: &str = "yyyy-mm-dd";
/// Date-time format for materialized date-time cells.
pub const FMT_DATETIME: &str = "yyyy-mm-dd hh:mm:ss";

/// Column width fitting a week interval label.
pub const W_WEEKS_INTERVAL: f64 = 22.29;
/// Column width fitting a price.
pub const W_PRICE: f64 = 13.29;
/// Excel default column width.
pub const W_COLUMN_DEFAULT: f64 = 8.43;
/// Excel default row height in points.
pub const H_ROW_DEFAULT: f64 = 15.0;

/// Resolve a named number format preset; unknown names pass through as format codes.
pub fn resolve_number_format(name: &str) -> &str {
    match name.trim().to_ascii_lowercase().as_str() {
        "euro" => FMT_EURO,
        "rub" => FMT_RUB,
        "percent" => FMT_PERCENT,
        "percent_2" => FMT_PERCENT_2,
        "number" => FMT_NUMBER,
        _ => name,
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Retry

/// Default maximum number of backend acquisition attempts.
pub const N_RETRY_ATTEMPTS_DEFAULT: usize = 5;
/// Default delay between backend acquisition attempts.
pub const N_RETRY_DELAY_MS_DEFAULT: u64 = 2_000;

// #endregion
////////////////////////////////////////////////////////////////////////////////

/// Named cell formats used when materializing a workbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecWorkbookFormats {
    /// Plain body cells.
    pub text: SpecCellFormat,
    /// Date and date-time body cells.
    pub date: SpecCellFormat,
    /// Pivot header row.
    pub header: SpecCellFormat,
    /// Pivot row labels.
    pub label: SpecCellFormat,
    /// Pivot grand total row.
    pub total: SpecCellFormat,
    /// Page-field rows above a pivot.
    pub filter: SpecCellFormat,
}

/// Build default named format presets used by [`crate::writer::write_workbook`].
pub fn derive_default_workbook_formats() -> SpecWorkbookFormats {
    let cfg_base_fmt_spec = SpecCellFormat {
        font_name: Some("Calibri".to_string()),
        font_size: Some(11),
        ..Default::default()
    };

    SpecWorkbookFormats {
        text: cfg_base_fmt_spec.clone(),
        date: cfg_base_fmt_spec.with_(SpecCellFormat {
            num_format: Some(FMT_DATE.to_string()),
            ..Default::default()
        }),
        header: cfg_base_fmt_spec.with_(SpecCellFormat {
            bold: Some(true),
            text_wrap: Some(true),
            valign: Some("top".to_string()),
            border: Some(1),
            ..Default::default()
        }),
        label: cfg_base_fmt_spec.with_(SpecCellFormat {
            align: Some("left".to_string()),
            ..Default::default()
        }),
        total: cfg_base_fmt_spec.with_(SpecCellFormat {
            bold: Some(true),
            top: Some(1),
            ..Default::default()
        }),
        filter: cfg_base_fmt_spec.with_(SpecCellFormat {
            bold: Some(true),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_number_format_presets_and_passthrough() {
        assert_eq!(resolve_number_format("percent_2"), "0.00%");
        assert_eq!(resolve_number_format("Euro"), FMT_EURO);
        assert_eq!(resolve_number_format("#,##0.0"), "#,##0.0");
    }

    #[test]
    fn test_default_header_format_wraps_text() {
        let formats = derive_default_workbook_formats();
        assert_eq!(formats.header.text_wrap, Some(true));
        assert_eq!(formats.header.bold, Some(true));
        assert_eq!(formats.date.num_format.as_deref(), Some(FMT_DATE));
    }
}

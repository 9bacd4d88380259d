//! XLSX writer that materializes a [`WorkbookModel`] on save.
//!
//! The model is buffered in memory; nothing touches the file system until
//! [`write_workbook`] runs. Pivot tables are written as their computed grid.
//! Conditional formats, charts and tables become native workbook objects.

use std::path::Path;

use chrono::Timelike;
use rust_xlsxwriter::{
    Chart, ChartType, Color, ConditionalFormat3ColorScale, ConditionalFormatDataBar,
    ConditionalFormatType, Format, FormatAlign, FormatBorder, Table, TableColumn, Workbook,
    Worksheet,
};

use crate::backend::{EnumChartKind, EnumConditionalRule, EnumFormatScope};
use crate::conf::{
    FMT_DATE, FMT_DATETIME, H_ROW_DEFAULT, N_NCOLS_EXCEL_MAX, N_NROWS_EXCEL_MAX, W_COLUMN_DEFAULT,
};
use crate::engine::SpecPivotView;
use crate::model::{SpecModelConditionalFormat, SpecModelSheet, WorkbookModel};
use crate::spec::{BackendError, EnumCellValue, SpecCellFormat};
use crate::util::{
    derive_column_letters, derive_contiguous_ranges, derive_excel_serial, derive_item_label,
    derive_utc_midnight, estimate_unicode_string_width,
};

/// Write every sheet of `model` to `path`.
pub fn write_workbook(model: &WorkbookModel, path: &Path) -> Result<(), BackendError> {
    let mut workbook = Workbook::new();

    for sheet in &model.l_sheets {
        let mut worksheet = Worksheet::new();
        worksheet.set_name(&sheet.name)?;

        let view = model.pivot_view(&sheet.name);
        write_sheet_cells(&mut worksheet, sheet, &model.formats.text)?;
        if let Some(view) = &view {
            write_pivot_view(&mut worksheet, view, model)?;
        }

        let n_formats = write_conditional_formats(&mut worksheet, sheet, view.as_ref())?;
        let n_charts = match &view {
            Some(view) => write_charts(&mut worksheet, sheet, view)?,
            None => 0,
        };

        for (n_col, width) in &sheet.dict_col_widths {
            worksheet.set_column_width(cast_col_num(*n_col)?, *width)?;
        }
        for n_row in &sheet.set_rows_wrapped {
            let n_height = derive_wrapped_row_height(model, sheet, *n_row);
            worksheet.set_row_height(cast_row_num(*n_row)?, n_height)?;
        }
        if let Some(cell) = sheet.freeze {
            worksheet.set_freeze_panes(cast_row_num(cell.row)?, cast_col_num(cell.col)?)?;
        }

        write_tables(&mut worksheet, sheet)?;
        if sheet.if_autofilter {
            let (n_row_last, n_col_last) = sheet.extent();
            if n_row_last > 0 && n_col_last > 0 {
                worksheet.autofilter(0, 0, cast_row_num(n_row_last)?, cast_col_num(n_col_last)?)?;
            }
        }

        tracing::debug!(
            sheet = %sheet.name,
            n_cells = sheet.dict_cells.len(),
            n_formats,
            n_charts,
            "sheet materialized"
        );
        workbook.push_worksheet(worksheet);
    }

    workbook.save(path)?;
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// #region Cells

fn write_sheet_cells(
    worksheet: &mut Worksheet,
    sheet: &SpecModelSheet,
    fmt_text: &SpecCellFormat,
) -> Result<(), BackendError> {
    let fmt_base = derive_rust_xlsx_format(fmt_text);
    for ((n_row, n_col), value) in &sheet.dict_cells {
        write_cell_with_format(worksheet, *n_row, *n_col, value, fmt_text, &fmt_base)?;
    }
    Ok(())
}

fn write_pivot_view(
    worksheet: &mut Worksheet,
    view: &SpecPivotView,
    model: &WorkbookModel,
) -> Result<(), BackendError> {
    let formats = &model.formats;
    for (n_offset, l_row) in view.l_cells.iter().enumerate() {
        let n_row = view.origin.row + n_offset as u32;
        let if_page_row = view.l_page_rows.contains(&n_row);
        let if_header = n_row == view.n_row_header;
        let if_total = n_row == view.n_row_grand_total;
        let n_depth = n_row
            .checked_sub(view.n_row_first_body)
            .and_then(|n| view.l_body_depths.get(n as usize))
            .copied();

        for (n_col_offset, value) in l_row.iter().enumerate() {
            let n_col = view.origin.col + n_col_offset as u32;
            let fmt_row = if if_page_row {
                if n_col_offset == 0 {
                    formats.filter.clone()
                } else {
                    formats.text.clone()
                }
            } else if if_header {
                formats.header.clone()
            } else if if_total {
                formats.total.clone()
            } else if n_col_offset == 0 {
                formats.label.with_(SpecCellFormat {
                    indent: n_depth.and_then(|n| u8::try_from(n).ok()),
                    ..Default::default()
                })
            } else {
                formats.text.clone()
            };
            let fmt_spec = match view.data_column_at(n_col) {
                Some(dc) if !if_page_row && !if_header => fmt_row.with_(SpecCellFormat {
                    num_format: dc.number_format.clone(),
                    ..Default::default()
                }),
                _ => fmt_row,
            };
            if value.is_empty() && !if_header && !if_total {
                continue;
            }
            let fmt_cell = derive_rust_xlsx_format(&fmt_spec);
            write_cell_with_format(worksheet, n_row, n_col, value, &fmt_spec, &fmt_cell)?;
        }
    }
    Ok(())
}

fn write_cell_with_format(
    worksheet: &mut Worksheet,
    row: u32,
    col: u32,
    value: &EnumCellValue,
    spec: &SpecCellFormat,
    format: &Format,
) -> Result<(), BackendError> {
    let n_row = cast_row_num(row)?;
    let n_col = cast_col_num(col)?;
    match value {
        EnumCellValue::None => {
            worksheet.write_blank(n_row, n_col, format)?;
        }
        EnumCellValue::String(val) => {
            worksheet.write_string_with_format(n_row, n_col, val, format)?;
        }
        EnumCellValue::Number(val) => {
            worksheet.write_number_with_format(n_row, n_col, *val, format)?;
        }
        EnumCellValue::Boolean(val) => {
            worksheet.write_boolean_with_format(n_row, n_col, *val, format)?;
        }
        EnumCellValue::Date(date) => {
            let fmt_date = derive_date_format(spec, FMT_DATE);
            let n_serial = derive_excel_serial(&derive_utc_midnight(*date));
            worksheet.write_number_with_format(n_row, n_col, n_serial, &fmt_date)?;
        }
        EnumCellValue::DateTime(dt) => {
            let c_fmt = if dt.num_seconds_from_midnight() == 0 {
                FMT_DATE
            } else {
                FMT_DATETIME
            };
            let fmt_date = derive_date_format(spec, c_fmt);
            worksheet.write_number_with_format(n_row, n_col, derive_excel_serial(dt), &fmt_date)?;
        }
        EnumCellValue::Time(time) => {
            let c_text = time.format("%H:%M:%S").to_string();
            worksheet.write_string_with_format(n_row, n_col, &c_text, format)?;
        }
    }
    Ok(())
}

fn derive_date_format(spec: &SpecCellFormat, num_format: &str) -> Format {
    let fmt_spec = match spec.num_format {
        Some(_) => spec.clone(),
        None => spec.with_(SpecCellFormat {
            num_format: Some(num_format.to_string()),
            ..Default::default()
        }),
    };
    derive_rust_xlsx_format(&fmt_spec)
}

fn derive_wrapped_row_height(model: &WorkbookModel, sheet: &SpecModelSheet, row: u32) -> f64 {
    let (_, n_col_extent) = sheet.extent();
    let n_col_last = model
        .pivot_view(&sheet.name)
        .map_or(0, |view| view.origin.col + view.n_cols().saturating_sub(1))
        .max(n_col_extent);

    let mut n_lines_max = 1_usize;
    for n_col in 1..=n_col_last {
        let Some(EnumCellValue::String(text)) = model.cell_value(&sheet.name, row, n_col) else {
            continue;
        };
        let n_width = sheet
            .dict_col_widths
            .get(&n_col)
            .copied()
            .unwrap_or(W_COLUMN_DEFAULT)
            .max(1.0);
        let n_lines = (estimate_unicode_string_width(&text) as f64 / n_width).ceil() as usize;
        n_lines_max = n_lines_max.max(n_lines);
    }
    H_ROW_DEFAULT * n_lines_max as f64
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region SheetObjects

/// Cells a conditional format covers, as `(first_row, last_row, l_cols)`.
fn derive_format_target(
    entry: &SpecModelConditionalFormat,
    view: Option<&SpecPivotView>,
) -> Option<(u32, u32, Vec<u32>)> {
    let l_cols_selected: Vec<u32> = (entry.first.col..=entry.last.col).collect();
    match (entry.format.scope, view) {
        (EnumFormatScope::Field, Some(view)) => {
            let Some(dc) = view.data_column_at(entry.first.col) else {
                return Some((entry.first.row, entry.last.row, l_cols_selected));
            };
            if view.l_body_depths.is_empty() {
                return None;
            }
            let l_cols: Vec<u32> = view
                .l_data_columns
                .iter()
                .filter(|other| other.n_data_field == dc.n_data_field && !other.if_grand_total)
                .map(|other| other.col)
                .collect();
            Some((view.n_row_first_body, view.n_row_last_body(), l_cols))
        }
        _ => {
            if entry.last.row < entry.first.row {
                return None;
            }
            Some((entry.first.row, entry.last.row, l_cols_selected))
        }
    }
}

fn write_conditional_formats(
    worksheet: &mut Worksheet,
    sheet: &SpecModelSheet,
    view: Option<&SpecPivotView>,
) -> Result<usize, BackendError> {
    // first-priority rules go first, the most recent one on top
    let mut l_ordered: Vec<&SpecModelConditionalFormat> = sheet
        .l_conditional_formats
        .iter()
        .filter(|entry| entry.format.if_first_priority)
        .rev()
        .collect();
    l_ordered.extend(
        sheet
            .l_conditional_formats
            .iter()
            .filter(|entry| !entry.format.if_first_priority),
    );

    let mut n_written = 0;
    for entry in l_ordered {
        let Some((n_row_first, n_row_last, l_cols)) = derive_format_target(entry, view) else {
            continue;
        };
        let l_ranges = derive_contiguous_ranges(&l_cols);
        let Some(&(n_col_first, n_col_last)) = l_ranges.first() else {
            continue;
        };
        let c_multi_range = l_ranges
            .iter()
            .map(|(n_a, n_b)| {
                format!(
                    "{}{}:{}{}",
                    derive_column_letters(*n_a),
                    n_row_first,
                    derive_column_letters(*n_b),
                    n_row_last
                )
            })
            .collect::<Vec<_>>()
            .join(" ");

        let (r1, c1) = (cast_row_num(n_row_first)?, cast_col_num(n_col_first)?);
        let (r2, c2) = (cast_row_num(n_row_last)?, cast_col_num(n_col_last)?);
        match &entry.format.rule {
            EnumConditionalRule::DataBar {
                color_bar,
                color_negative,
                if_gradient,
            } => {
                let cf = ConditionalFormatDataBar::new()
                    .set_fill_color(derive_color(*color_bar))
                    .set_border_color(derive_color(*color_bar))
                    .set_negative_fill_color(derive_color(*color_negative))
                    .set_negative_border_color(derive_color(*color_negative))
                    .set_solid_fill(!*if_gradient)
                    .set_multi_range(&c_multi_range);
                worksheet.add_conditional_format(r1, c1, r2, c2, &cf)?;
            }
            EnumConditionalRule::ColorScale3 {
                color_lowest,
                color_midpoint,
                n_midpoint_percentile,
                color_highest,
            } => {
                let cf = ConditionalFormat3ColorScale::new()
                    .set_minimum_color(derive_color(*color_lowest))
                    .set_midpoint(
                        ConditionalFormatType::Percentile,
                        f64::from(*n_midpoint_percentile),
                    )
                    .set_midpoint_color(derive_color(*color_midpoint))
                    .set_maximum_color(derive_color(*color_highest))
                    .set_multi_range(&c_multi_range);
                worksheet.add_conditional_format(r1, c1, r2, c2, &cf)?;
            }
        }
        n_written += 1;
    }
    Ok(n_written)
}

fn write_charts(
    worksheet: &mut Worksheet,
    sheet: &SpecModelSheet,
    view: &SpecPivotView,
) -> Result<usize, BackendError> {
    if view.l_body_depths.is_empty() {
        return Ok(0);
    }
    let n_row_first = cast_row_num(view.n_row_first_body)?;
    let n_row_last = cast_row_num(view.n_row_last_body())?;
    let n_row_header = cast_row_num(view.n_row_header)?;
    let n_col_labels = cast_col_num(view.origin.col)?;

    for entry in &sheet.l_charts {
        let mut chart = match entry.placement.kind {
            EnumChartKind::ClusteredColumn => Chart::new(ChartType::Column),
        };
        for dc in view.l_data_columns.iter().filter(|dc| !dc.if_grand_total) {
            let n_col = cast_col_num(dc.col)?;
            chart
                .add_series()
                .set_categories((
                    sheet.name.as_str(),
                    n_row_first,
                    n_col_labels,
                    n_row_last,
                    n_col_labels,
                ))
                .set_values((sheet.name.as_str(), n_row_first, n_col, n_row_last, n_col))
                .set_name((sheet.name.as_str(), n_row_header, n_col));
        }
        chart
            .set_width(entry.placement.width)
            .set_height(entry.placement.height);
        worksheet.insert_chart(
            cast_row_num(entry.anchor.row)?,
            cast_col_num(entry.anchor.col)?,
            &chart,
        )?;
    }
    Ok(sheet.l_charts.len())
}

fn write_tables(worksheet: &mut Worksheet, sheet: &SpecModelSheet) -> Result<(), BackendError> {
    for entry in &sheet.l_tables {
        let range = &entry.range;
        let mut l_headers: Vec<String> = Vec::new();
        for n_col in range.first.col..=range.last.col {
            let c_base = match sheet.dict_cells.get(&(range.first.row, n_col)) {
                Some(value) if !value.is_empty() => derive_item_label(value),
                _ => format!("Column{}", n_col - range.first.col + 1),
            };
            // table headers must be unique
            let mut c_header = c_base.clone();
            let mut n_suffix = 2;
            while l_headers.iter().any(|h| h.eq_ignore_ascii_case(&c_header)) {
                c_header = format!("{c_base}{n_suffix}");
                n_suffix += 1;
            }
            l_headers.push(c_header);
        }
        let l_columns: Vec<TableColumn> = l_headers
            .into_iter()
            .map(|c_header| TableColumn::new().set_header(c_header))
            .collect();
        let table = Table::new().set_name(&entry.name).set_columns(&l_columns);
        worksheet.add_table(
            cast_row_num(range.first.row)?,
            cast_col_num(range.first.col)?,
            cast_row_num(range.last.row)?,
            cast_col_num(range.last.col)?,
            &table,
        )?;
    }
    Ok(())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region FormatMapping

fn derive_rust_xlsx_format(spec: &SpecCellFormat) -> Format {
    let mut format = Format::new();

    if let Some(val) = &spec.font_name {
        format = format.set_font_name(val.clone());
    }
    if let Some(val) = spec.font_size {
        format = format.set_font_size(val as f64);
    }
    if spec.bold.unwrap_or(false) {
        format = format.set_bold();
    }
    if spec.italic.unwrap_or(false) {
        format = format.set_italic();
    }

    if let Some(val) = &spec.align
        && let Some(align) = derive_format_align(val)
    {
        format = format.set_align(align);
    }
    if let Some(val) = &spec.valign
        && let Some(align) = derive_format_align(val)
    {
        format = format.set_align(align);
    }
    if let Some(val) = spec.indent
        && val > 0
    {
        format = format.set_indent(val);
    }

    if let Some(val) = &spec.num_format {
        format = format.set_num_format(val.clone());
    }
    if let Some(val) = &spec.bg_color {
        format = format.set_background_color(val.as_str());
    }
    if let Some(val) = &spec.font_color {
        format = format.set_font_color(val.as_str());
    }

    if let Some(val) = spec.border {
        format = format.set_border(derive_format_border(val));
    }
    if let Some(val) = spec.top {
        format = format.set_border_top(derive_format_border(val));
    }

    if spec.text_wrap.unwrap_or(false) {
        format = format.set_text_wrap();
    }

    format
}

fn derive_format_border(border: i64) -> FormatBorder {
    match border {
        1 => FormatBorder::Thin,
        2 => FormatBorder::Medium,
        3 => FormatBorder::Dashed,
        4 => FormatBorder::Dotted,
        5 => FormatBorder::Thick,
        6 => FormatBorder::Double,
        7 => FormatBorder::Hair,
        _ => FormatBorder::None,
    }
}

fn derive_format_align(align: &str) -> Option<FormatAlign> {
    let value = align.trim().to_ascii_lowercase();
    match value.as_str() {
        "general" => Some(FormatAlign::General),
        "left" => Some(FormatAlign::Left),
        "center" => Some(FormatAlign::Center),
        "right" => Some(FormatAlign::Right),
        "top" => Some(FormatAlign::Top),
        "bottom" => Some(FormatAlign::Bottom),
        "vcenter" | "vertical_center" => Some(FormatAlign::VerticalCenter),
        _ => None,
    }
}

/// BGR integer (spreadsheet object model order) to an RGB color.
fn derive_color(bgr: u32) -> Color {
    let n_red = bgr & 0xFF;
    let n_green = (bgr >> 8) & 0xFF;
    let n_blue = (bgr >> 16) & 0xFF;
    Color::RGB((n_red << 16) | (n_green << 8) | n_blue)
}

/// 1-based row to the writer's 0-based row.
fn cast_row_num(row: u32) -> Result<u32, BackendError> {
    row.checked_sub(1)
        .filter(|n| *n < N_NROWS_EXCEL_MAX)
        .ok_or_else(|| BackendError::InvalidRange {
            range: format!("row {row}"),
            reason: "row is outside the worksheet".to_string(),
        })
}

/// 1-based column to the writer's 0-based column.
fn cast_col_num(col: u32) -> Result<u16, BackendError> {
    col.checked_sub(1)
        .filter(|n| *n < N_NCOLS_EXCEL_MAX)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| BackendError::InvalidRange {
            range: format!("column {col}"),
            reason: "column is outside the worksheet".to_string(),
        })
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PivotBackend, SpecCellRange, SpecCellRef};

    #[test]
    fn test_derive_color_swaps_bgr() {
        assert_eq!(derive_color(13_012_579), Color::RGB(0x638EC6));
        assert_eq!(derive_color(255), Color::RGB(0xFF0000));
    }

    #[test]
    fn test_cast_rejects_zero_and_overflow() {
        assert_eq!(cast_row_num(1).ok(), Some(0));
        assert!(cast_row_num(0).is_err());
        assert!(cast_col_num(N_NCOLS_EXCEL_MAX + 1).is_err());
        assert_eq!(cast_col_num(3).ok(), Some(2));
    }

    #[test]
    fn test_write_workbook_produces_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.xlsx");

        let mut model = WorkbookModel::new();
        let rows = vec![
            vec!["region".into(), "sales".into()],
            vec!["North".into(), 10.0.into()],
            vec!["South".into(), 20.0.into()],
        ];
        model
            .write_grid("Sheet1", SpecCellRef::new(1, 1), &rows)
            .expect("write");
        let range = SpecCellRange::parse("A1:B3", "Sheet1").expect("range");
        model.add_table(&range, "DT_Source").expect("table");
        model.save(&path).expect("save");

        let n_len = std::fs::metadata(&path).expect("metadata").len();
        assert!(n_len > 0);
    }
}

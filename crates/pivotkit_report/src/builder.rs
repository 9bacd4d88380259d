//! Pivot sheet builder.
//!
//! [`build_pivot`] turns one [`SpecPivotReport`] into a pivot sheet through a
//! fixed sequence of backend calls. Only sheet, cache and table creation are
//! fatal; anything that goes wrong afterwards is recorded as a warning in the
//! returned [`SpecPivotBuildReport`] and the build moves on.

use crate::backend::{
    DataFieldId, EnumChartKind, EnumFieldOrientation, EnumGroupingPeriod, PivotBackend,
    SpecCellRange, SpecCellRef, SpecChartPlacement,
};
use crate::conf::{N_CHART_HEIGHT, N_CHART_WIDTH, resolve_number_format};
use crate::formatting::apply_conditional_formatting;
use crate::progress::{ProgressSink, SpecProgressEvent, emit};
use crate::spec::{
    EnumBuildStep, EnumConditionalFormatting, EnumGroupingRule, EnumValueCalculation,
    PivotBuildError, SpecColumnField, SpecFilterField, SpecPivotBuildReport, SpecPivotReport,
    SpecRowField, SpecValueField,
};

/// Build the pivot sheet described by `descriptor` from `source_range`.
///
/// The descriptor's own `source` reference, when set, replaces
/// `source_range`; sheet-less references resolve against the source sheet.
pub fn build_pivot(
    backend: &mut dyn PivotBackend,
    source_range: &SpecCellRange,
    descriptor: &SpecPivotReport,
    progress: Option<&dyn ProgressSink>,
) -> Result<SpecPivotBuildReport, PivotBuildError> {
    let c_sheet = descriptor.sheet.as_str();
    let n_first_data_row = descriptor.first_data_row();
    let mut report = SpecPivotBuildReport {
        sheet_name: c_sheet.to_string(),
        first_data_row: n_first_data_row,
        ..Default::default()
    };

    // 1-2. sheet, cache, table
    backend
        .add_sheet(c_sheet)
        .map_err(|source| PivotBuildError::SheetCreation {
            sheet: c_sheet.to_string(),
            source,
        })?;
    let source_range = match &descriptor.source {
        Some(c_ref) => match SpecCellRange::parse(c_ref, &source_range.sheet) {
            Ok(range) => range,
            Err(reason) => {
                discard_sheet(backend, c_sheet);
                return Err(PivotBuildError::SourceRange {
                    range: c_ref.clone(),
                    reason,
                });
            }
        },
        None => source_range.clone(),
    };
    let cache = match backend.create_pivot_cache(&source_range) {
        Ok(cache) => cache,
        Err(source) => {
            discard_sheet(backend, c_sheet);
            return Err(PivotBuildError::CacheCreation {
                sheet: c_sheet.to_string(),
                source,
            });
        }
    };
    emit(
        progress,
        SpecProgressEvent::message(format!("Working on sheet: {c_sheet}")),
    );
    if let Err(source) = backend.create_pivot_table(cache, c_sheet, SpecCellRef::new(1, 1), c_sheet)
    {
        discard_sheet(backend, c_sheet);
        return Err(PivotBuildError::TableCreation {
            sheet: c_sheet.to_string(),
            source,
        });
    }
    tracing::info!(sheet = c_sheet, source = %source_range, "pivot table created");

    // 3-6. fields
    let c_table = c_sheet;
    for (n_idx, filter) in descriptor.filters.iter().enumerate() {
        place_filter_field(backend, c_table, filter, n_idx + 1, &mut report);
    }
    for (n_idx, row) in descriptor.rows.iter().enumerate() {
        place_row_field(backend, c_table, row, n_idx + 1, &mut report);
    }
    for (n_idx, column) in descriptor.cols.iter().enumerate() {
        place_column_field(backend, c_table, column, n_idx + 2, &mut report);
    }
    for (n_idx, value) in descriptor.values.iter().enumerate() {
        let n_col = n_idx as u32 + 2;
        if place_value_field(backend, c_sheet, n_first_data_row, n_col, value, &mut report) {
            report.n_data_fields += 1;
        }
    }

    // 7. grouping
    if let Some(rule) = descriptor.group_function {
        let period = match rule {
            EnumGroupingRule::ByWeeks => EnumGroupingPeriod::Days(7),
            EnumGroupingRule::ByMonths => EnumGroupingPeriod::Months,
        };
        if let Err(err) =
            backend.group_field_at(c_sheet, SpecCellRef::new(n_first_data_row, 1), period)
        {
            report.warn(EnumBuildStep::Grouping, None, None, err.to_string());
        }
    }

    // 8. collapse the first row field to its top level
    if descriptor.collide
        && descriptor.rows.len() > 1
        && let Some(first) = descriptor.rows.first()
    {
        collapse_row_field(backend, c_table, &first.key, progress, &mut report);
    }

    // 9. freeze panes below the header, right of the labels
    if descriptor.freeze_panes && !descriptor.graph {
        let cell = SpecCellRef::new(n_first_data_row, 2);
        let result = backend
            .select(c_sheet, cell, cell)
            .and_then(|()| backend.freeze_panes(c_sheet));
        if let Err(err) = result {
            report.warn(EnumBuildStep::FreezePanes, None, None, err.to_string());
        }
    }

    // 10. column widths, header row wrap
    for (n_idx, width) in descriptor.col_width.iter().enumerate() {
        if let Err(err) = backend.set_column_width(c_sheet, n_idx as u32 + 1, width.width()) {
            report.warn(EnumBuildStep::ColumnWidth, None, None, err.to_string());
        }
    }
    if n_first_data_row > 1
        && let Err(err) = backend.set_row_wrap_autofit(c_sheet, n_first_data_row - 1)
    {
        report.warn(EnumBuildStep::ColumnWidth, None, None, err.to_string());
    }

    // 11. chart
    if descriptor.graph {
        let cell = SpecCellRef::new(n_first_data_row, 1);
        let placement = SpecChartPlacement {
            kind: EnumChartKind::ClusteredColumn,
            width: N_CHART_WIDTH,
            height: N_CHART_HEIGHT,
        };
        let result = backend
            .select(c_sheet, cell, cell)
            .and_then(|()| backend.add_chart(c_sheet, placement));
        if let Err(err) = result {
            report.warn(EnumBuildStep::Chart, None, None, err.to_string());
        }
    }

    tracing::info!(
        sheet = c_sheet,
        n_data_fields = report.n_data_fields,
        n_warnings = report.warnings.len(),
        "pivot sheet built"
    );
    Ok(report)
}

fn discard_sheet(backend: &mut dyn PivotBackend, sheet: &str) {
    if let Err(err) = backend.delete_sheet(sheet) {
        tracing::debug!(sheet, %err, "half-built sheet left in place");
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region Fields

fn place_filter_field(
    backend: &mut dyn PivotBackend,
    table: &str,
    filter: &SpecFilterField,
    n_index: usize,
    report: &mut SpecPivotBuildReport,
) {
    let c_key = filter.selection.key.as_str();
    if let Err(err) = backend.set_field_orientation(table, c_key, EnumFieldOrientation::Page) {
        report.warn(EnumBuildStep::Filter, Some(c_key), None, err.to_string());
        return;
    }
    let n_position = filter.position.unwrap_or(n_index);
    if let Err(err) = backend.set_field_position(table, c_key, n_position) {
        report.warn(EnumBuildStep::Filter, Some(c_key), None, err.to_string());
    }
    let Some(l_selected) = &filter.selection.selected else {
        return;
    };
    if let Err(err) = backend.set_multiple_page_items(table, c_key, true) {
        report.warn(EnumBuildStep::Filter, Some(c_key), None, err.to_string());
        return;
    }
    apply_item_visibility(backend, table, c_key, l_selected, EnumBuildStep::Filter, report);
}

fn place_row_field(
    backend: &mut dyn PivotBackend,
    table: &str,
    row: &SpecRowField,
    n_index: usize,
    report: &mut SpecPivotBuildReport,
) {
    let c_key = row.key.as_str();
    if let Err(err) = backend.set_field_orientation(table, c_key, EnumFieldOrientation::Row) {
        report.warn(EnumBuildStep::Row, Some(c_key), None, err.to_string());
        return;
    }
    let n_position = row.position.unwrap_or(n_index);
    if let Err(err) = backend.set_field_position(table, c_key, n_position) {
        report.warn(EnumBuildStep::Row, Some(c_key), None, err.to_string());
    }
}

fn place_column_field(
    backend: &mut dyn PivotBackend,
    table: &str,
    column: &SpecColumnField,
    n_index: usize,
    report: &mut SpecPivotBuildReport,
) {
    let c_key = column.selection.key.as_str();
    if let Err(err) = backend.set_field_orientation(table, c_key, EnumFieldOrientation::Column) {
        report.warn(EnumBuildStep::Column, Some(c_key), None, err.to_string());
        return;
    }
    let n_position = column.position.unwrap_or(n_index);
    if let Err(err) = backend.set_field_position(table, c_key, n_position) {
        report.warn(EnumBuildStep::Column, Some(c_key), None, err.to_string());
    }
    let Some(l_selected) = &column.selection.selected else {
        return;
    };
    let l_present =
        apply_item_visibility(backend, table, c_key, l_selected, EnumBuildStep::Column, report);
    for (n_idx, c_item) in l_present.iter().enumerate() {
        if let Err(err) = backend.set_item_position(table, c_key, c_item, n_idx + 1) {
            report.warn(EnumBuildStep::Column, Some(c_key), Some(c_item), err.to_string());
        }
    }
}

/// Show selected items first so a field never runs out of visible items.
///
/// Returns the selected items present in the field, in selection order;
/// each missing name is a warning.
fn apply_item_visibility(
    backend: &mut dyn PivotBackend,
    table: &str,
    field: &str,
    l_selected: &[String],
    step: EnumBuildStep,
    report: &mut SpecPivotBuildReport,
) -> Vec<String> {
    let l_items = match backend.pivot_items(table, field) {
        Ok(l_items) => l_items,
        Err(err) => {
            report.warn(step, Some(field), None, err.to_string());
            return Vec::new();
        }
    };
    let mut l_present = Vec::with_capacity(l_selected.len());
    for c_item in l_selected {
        if l_items.contains(c_item) {
            l_present.push(c_item.clone());
        } else {
            report.warn(step, Some(field), Some(c_item), format!("item `{c_item}` not found"));
        }
    }
    let (l_shown, l_hidden): (Vec<&String>, Vec<&String>) =
        l_items.iter().partition(|item| l_selected.contains(item));
    for (c_item, if_visible) in l_shown
        .into_iter()
        .map(|item| (item, true))
        .chain(l_hidden.into_iter().map(|item| (item, false)))
    {
        if let Err(err) = backend.set_item_visible(table, field, c_item, if_visible) {
            report.warn(step, Some(field), Some(c_item), err.to_string());
        }
    }
    l_present
}

/// Add one value field; `false` when it never became a data field.
fn place_value_field(
    backend: &mut dyn PivotBackend,
    sheet: &str,
    n_first_data_row: u32,
    n_col: u32,
    value: &SpecValueField,
    report: &mut SpecPivotBuildReport,
) -> bool {
    let table = sheet;
    let field = value.resolve();
    let c_key = field.key.as_str();
    let warn = |report: &mut SpecPivotBuildReport, msg: String| {
        report.warn(EnumBuildStep::Value, Some(c_key), None, msg);
    };

    let id: DataFieldId = match &field.calculated {
        Some(EnumValueCalculation::Formula(c_formula)) => {
            let id = match backend.add_calculated_field(table, c_key, c_formula) {
                Ok(id) => id,
                Err(err) => {
                    warn(report, err.to_string());
                    return false;
                }
            };
            if let Err(err) = backend.set_data_field_caption(table, id, &format!("{c_key} ")) {
                warn(report, err.to_string());
            }
            id
        }
        Some(EnumValueCalculation::Calculation(calculation)) => {
            let id = match backend.add_data_field(table, c_key) {
                Ok(id) => id,
                Err(err) => {
                    warn(report, err.to_string());
                    return false;
                }
            };
            if let Err(err) = backend.set_data_field_calculation(table, id, *calculation) {
                warn(report, err.to_string());
            }
            id
        }
        Some(EnumValueCalculation::Aggregation(_)) | None => {
            match backend.add_data_field(table, c_key) {
                Ok(id) => id,
                Err(err) => {
                    warn(report, err.to_string());
                    return false;
                }
            }
        }
    };

    if let Err(err) = backend.set_data_field_orientation(table, id, EnumFieldOrientation::Data) {
        warn(report, err.to_string());
    }
    if field.formula().is_none()
        && let Err(err) = backend.set_data_field_function(table, id, field.derive_function())
    {
        warn(report, err.to_string());
    }
    if field.conditional_formatting != EnumConditionalFormatting::None
        && let Err(err) = apply_conditional_formatting(
            backend,
            sheet,
            n_first_data_row,
            n_col,
            field.conditional_formatting,
        )
    {
        report.warn(
            EnumBuildStep::ConditionalFormatting,
            Some(c_key),
            None,
            err.to_string(),
        );
    }
    if let Some(c_name) = &field.displayed_name
        && let Err(err) = backend.set_data_field_caption(table, id, &format!("{c_name} "))
    {
        warn(report, err.to_string());
    }
    if let Some(c_format) = &field.number_format
        && let Err(err) =
            backend.set_data_field_number_format(table, id, resolve_number_format(c_format))
    {
        warn(report, err.to_string());
    }
    true
}

fn collapse_row_field(
    backend: &mut dyn PivotBackend,
    table: &str,
    field: &str,
    progress: Option<&dyn ProgressSink>,
    report: &mut SpecPivotBuildReport,
) {
    let l_items = match backend.pivot_items(table, field) {
        Ok(l_items) => l_items,
        Err(err) => {
            report.warn(EnumBuildStep::Collapse, Some(field), None, err.to_string());
            return;
        }
    };
    let n_total = l_items.len();
    for (n_idx, c_item) in l_items.iter().enumerate() {
        emit(
            progress,
            SpecProgressEvent::step(
                format!(
                    "Working on sheet: {table}, colliding rows: {} of {n_total}",
                    n_idx + 1
                ),
                n_idx + 1,
                n_total,
            ),
        );
        if let Err(err) = backend.set_item_show_detail(table, field, c_item, false) {
            report.warn(EnumBuildStep::Collapse, Some(field), Some(c_item), err.to_string());
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendJournal, EnumBackendOp};
    use crate::model::WorkbookModel;
    use crate::spec::{EnumCellValue, EnumConsolidationFunction, EnumPivotCalculation};

    fn derive_model() -> (WorkbookModel, BackendJournal, SpecCellRange) {
        let journal = BackendJournal::new();
        let mut model = WorkbookModel::new().with_journal(journal.clone());
        let l_rows: Vec<Vec<EnumCellValue>> = vec![
            vec!["region".into(), "year".into(), "channel".into(), "sales".into()],
            vec!["North".into(), 2023_i64.into(), "web".into(), 10.0.into()],
            vec!["South".into(), 2023_i64.into(), "shop".into(), 20.0.into()],
            vec!["North".into(), 2024_i64.into(), "web".into(), 30.0.into()],
            vec!["East".into(), 2024_i64.into(), "shop".into(), 40.0.into()],
        ];
        model
            .write_grid("Sheet1", SpecCellRef::new(1, 1), &l_rows)
            .expect("write");
        let range = SpecCellRange::parse("Sheet1!A1:D5", "Sheet1").expect("range");
        (model, journal, range)
    }

    #[test]
    fn test_unfiltered_filter_makes_no_visibility_calls() {
        let (mut model, journal, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.filters = vec![SpecFilterField::new("year")];
        descriptor.values = vec![SpecValueField::new("sales")];

        let report = build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert!(report.warnings.is_empty());
        assert_eq!(report.first_data_row, 4);
        assert_eq!(
            journal.count_where(|op| matches!(
                op,
                EnumBackendOp::SetItemVisible { .. } | EnumBackendOp::SetMultiplePageItems { .. }
            )),
            0
        );
    }

    #[test]
    fn test_selected_filter_enables_multiple_items() {
        let (mut model, journal, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.filters = vec![SpecFilterField::new("region").with_selected(["North", "East"])];
        descriptor.values = vec![SpecValueField::new("sales")];

        build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert_eq!(
            journal.count_where(|op| matches!(
                op,
                EnumBackendOp::SetMultiplePageItems { enabled: true, .. }
            )),
            1
        );
        let table = model.pivot_table("p").expect("table");
        let field = table.field("region").expect("field");
        assert!(!field.item("South").expect("south").if_visible);
        assert!(field.item("North").expect("north").if_visible);
    }

    #[test]
    fn test_column_selection_order() {
        let (mut model, _, _) = derive_model();
        let l_rows: Vec<Vec<EnumCellValue>> = vec![
            vec!["k".into(), "v".into()],
            vec!["A".into(), 1.0.into()],
            vec!["B".into(), 2.0.into()],
            vec!["C".into(), 3.0.into()],
            vec!["D".into(), 4.0.into()],
        ];
        model
            .write_grid("Sheet1", SpecCellRef::new(1, 6), &l_rows)
            .expect("write");
        let range_kv = SpecCellRange::new("Sheet1", SpecCellRef::new(1, 6), SpecCellRef::new(5, 7));
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.cols = vec![SpecColumnField::new("k").with_selected(["B", "A", "C"])];
        descriptor.values = vec![SpecValueField::new("v")];

        let report = build_pivot(&mut model, &range_kv, &descriptor, None).expect("build");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        let l_items = model.pivot_items("p", "k").expect("items");
        assert_eq!(&l_items[..3], &["B", "A", "C"]);
        let table = model.pivot_table("p").expect("table");
        assert!(!table.field("k").expect("k").item("D").expect("d").if_visible);
    }

    #[test]
    fn test_collapse_once_per_item_and_not_with_one_row_field() {
        let (mut model, journal, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.rows = vec![SpecRowField::new("region"), SpecRowField::new("channel")];
        descriptor.values = vec![SpecValueField::new("sales")];
        build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert_eq!(
            journal.count_where(|op| matches!(
                op,
                EnumBackendOp::SetItemShowDetail { show: false, .. }
            )),
            3
        );

        let (mut model, journal, range) = derive_model();
        descriptor.sheet = "single".to_string();
        descriptor.rows.truncate(1);
        build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert_eq!(
            journal.count_where(|op| matches!(op, EnumBackendOp::SetItemShowDetail { .. })),
            0
        );
    }

    #[test]
    fn test_formula_and_calculation_code_paths() {
        let (mut model, journal, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.rows = vec![SpecRowField::new("region")];
        descriptor.values = vec![
            SpecValueField::new("per_year").with_formula("= sales / year"),
            SpecValueField::new("sales").with_calculation(EnumPivotCalculation::PercentOfTotal),
        ];
        let report = build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert_eq!(report.n_data_fields, 2);

        assert_eq!(
            journal.count_where(|op| matches!(op, EnumBackendOp::AddCalculatedField { .. })),
            1
        );
        assert_eq!(
            journal.count_where(|op| matches!(
                op,
                EnumBackendOp::SetDataFieldCalculation {
                    calculation: EnumPivotCalculation::PercentOfTotal,
                    ..
                }
            )),
            1
        );
        // consolidation function is not set on the calculated field
        assert_eq!(
            journal.count_where(|op| matches!(op, EnumBackendOp::SetDataFieldFunction { .. })),
            1
        );
        assert!(journal.snapshot().contains(&EnumBackendOp::SetDataFieldCaption {
            table: "p".to_string(),
            id: 0,
            caption: "per_year ".to_string(),
        }));
    }

    #[test]
    fn test_aggregation_code_adds_plain_data_field() {
        let (mut model, journal, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.rows = vec![SpecRowField::new("region")];
        descriptor.values = vec![
            serde_json::from_str(r#"{"key":"sales","calculated":"count"}"#).expect("parse"),
        ];
        let report = build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.n_data_fields, 1);

        assert_eq!(
            journal.count_where(|op| matches!(op, EnumBackendOp::AddCalculatedField { .. })),
            0
        );
        assert_eq!(
            journal.count_where(|op| matches!(op, EnumBackendOp::SetDataFieldCalculation { .. })),
            0
        );
        assert!(journal.snapshot().contains(&EnumBackendOp::SetDataFieldFunction {
            table: "p".to_string(),
            id: 0,
            function: EnumConsolidationFunction::Count,
        }));
    }

    #[test]
    fn test_filter_position_override() {
        let (mut model, journal, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.filters = vec![
            SpecFilterField::new("year"),
            SpecFilterField::new("region").with_position(1),
        ];
        descriptor.values = vec![SpecValueField::new("sales")];
        let report = build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);

        assert!(journal.snapshot().contains(&EnumBackendOp::SetFieldPosition {
            table: "p".to_string(),
            field: "region".to_string(),
            position: 1,
        }));
        let table = model.pivot_table("p").expect("table");
        let l_pages: Vec<&str> = table
            .fields_oriented(EnumFieldOrientation::Page)
            .iter()
            .map(|field| field.name.as_str())
            .collect();
        assert_eq!(l_pages, vec!["region", "year"]);
    }

    #[test]
    fn test_missing_selected_items_warn_and_keep_order() {
        let (mut model, journal, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.filters =
            vec![SpecFilterField::new("region").with_selected(["Nowhere", "South"])];
        descriptor.cols =
            vec![SpecColumnField::new("channel").with_selected(["shop", "phone", "web", "mail"])];
        descriptor.values = vec![SpecValueField::new("sales")];

        let report = build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert_eq!(report.n_data_fields, 1);
        let l_missing: Vec<(EnumBuildStep, Option<&str>)> = report
            .warnings
            .iter()
            .map(|warning| (warning.step, warning.item.as_deref()))
            .collect();
        assert_eq!(
            l_missing,
            vec![
                (EnumBuildStep::Filter, Some("Nowhere")),
                (EnumBuildStep::Column, Some("phone")),
                (EnumBuildStep::Column, Some("mail")),
            ]
        );

        let l_positions: Vec<(String, usize)> = journal
            .snapshot()
            .into_iter()
            .filter_map(|op| match op {
                EnumBackendOp::SetItemPosition { item, position, .. } => Some((item, position)),
                _ => None,
            })
            .collect();
        assert_eq!(
            l_positions,
            vec![("shop".to_string(), 1), ("web".to_string(), 2)]
        );
        assert_eq!(model.pivot_items("p", "channel").expect("items"), vec!["shop", "web"]);
        let table = model.pivot_table("p").expect("table");
        assert!(!table.field("region").expect("region").item("North").expect("n").if_visible);
    }

    #[test]
    fn test_invalid_formula_skips_value_field() {
        let (mut model, _, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.values = vec![
            SpecValueField::new("bad").with_formula("= sales / missing"),
            SpecValueField::new("sales"),
        ];
        let report = build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert_eq!(report.n_data_fields, 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].step, EnumBuildStep::Value);
        assert_eq!(report.warnings[0].field.as_deref(), Some("bad"));
    }

    #[test]
    fn test_unknown_row_key_is_a_warning() {
        let (mut model, _, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.rows = vec![SpecRowField::new("nope"), SpecRowField::new("region")];
        descriptor.values = vec![SpecValueField::new("sales")];
        let report = build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].step, EnumBuildStep::Row);
    }

    #[test]
    fn test_malformed_source_reference_is_fatal_and_discards_sheet() {
        let (mut model, _, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.source = Some("data!A1:??".to_string());
        let err = build_pivot(&mut model, &range, &descriptor, None).expect_err("fatal");
        assert!(matches!(err, PivotBuildError::SourceRange { .. }));
        assert!(model.sheet("p").is_none());
    }

    #[test]
    fn test_freeze_panes_and_chart_are_exclusive() {
        let (mut model, journal, range) = derive_model();
        let mut descriptor = SpecPivotReport::new("p");
        descriptor.rows = vec![SpecRowField::new("region")];
        descriptor.values = vec![SpecValueField::new("sales")];
        descriptor.graph = true;
        let report = build_pivot(&mut model, &range, &descriptor, None).expect("build");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(journal.count_where(|op| matches!(op, EnumBackendOp::FreezePanes(_))), 0);
        assert_eq!(journal.count_where(|op| matches!(op, EnumBackendOp::AddChart { .. })), 1);
        let sheet = model.sheet("p").expect("sheet");
        assert_eq!(sheet.l_charts[0].anchor, SpecCellRef::new(2, 1));
    }
}

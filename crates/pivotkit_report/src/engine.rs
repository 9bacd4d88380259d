//! In-memory pivot table state and view computation.
//!
//! A pivot table is a snapshot of its source range (the cache) plus field
//! state (orientation, position, item visibility/order/detail, grouping) and
//! data fields. [`compute_pivot_view`] turns that state into the compact
//! grid a spreadsheet application would display:
//!
//! - page fields on rows `anchor..`, one per row, followed by a blank row
//! - a header row (`Row Labels`, then one header per data column)
//! - body rows in item order, nested row fields indented, collapsed items
//!   without children
//! - a `Grand Total` row and, with column fields, grand total columns

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};

use crate::backend::{EnumFieldOrientation, EnumGroupingPeriod, SpecCellRange, SpecCellRef};
use crate::conf::{
    C_HEADER_ROW_LABELS, C_LABEL_GRAND_TOTAL, C_PAGE_LABEL_ALL, C_PAGE_LABEL_MULTIPLE,
    FMT_PERCENT_2,
};
use crate::formula::{EnumFormulaEvalError, SpecFormula};
use crate::spec::{EnumCellValue, EnumConsolidationFunction, EnumPivotCalculation};
use crate::util::{compare_item_labels, derive_date, derive_item_label};

/// Nesting limit for calculated fields referring to calculated fields.
const N_FORMULA_DEPTH_MAX: usize = 8;

////////////////////////////////////////////////////////////////////////////////
// #region PivotState

/// Snapshot of a pivot source range: header row plus body rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecPivotCacheState {
    pub source: SpecCellRange,
    pub l_headers: Vec<String>,
    pub l_rows: Vec<Vec<EnumCellValue>>,
}

impl SpecPivotCacheState {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.l_headers.iter().position(|h| h == name)
    }

    fn value(&self, n_row: usize, n_col: usize) -> &EnumCellValue {
        static NONE: EnumCellValue = EnumCellValue::None;
        self.l_rows
            .get(n_row)
            .and_then(|row| row.get(n_col))
            .unwrap_or(&NONE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecPivotItemState {
    pub name: String,
    pub if_visible: bool,
    pub if_show_detail: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecPivotFieldState {
    pub name: String,
    pub orientation: EnumFieldOrientation,
    /// 1-based position within its orientation group; 0 when hidden.
    pub position: usize,
    pub l_items: Vec<SpecPivotItemState>,
    pub if_multiple_page_items: bool,
    pub grouping: Option<EnumGroupingPeriod>,
    /// Set for calculated fields.
    pub formula: Option<SpecFormula>,
}

impl SpecPivotFieldState {
    pub fn item(&self, name: &str) -> Option<&SpecPivotItemState> {
        self.l_items.iter().find(|item| item.name == name)
    }

    pub fn n_visible(&self) -> usize {
        self.l_items.iter().filter(|item| item.if_visible).count()
    }

    fn is_visible(&self, label: &str) -> bool {
        self.item(label).is_none_or(|item| item.if_visible)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecDataFieldState {
    /// Pivot field aggregated by this data field.
    pub source: String,
    pub caption: Option<String>,
    pub function: EnumConsolidationFunction,
    pub calculation: EnumPivotCalculation,
    pub number_format: Option<String>,
    /// Order among data-oriented fields; `None` until oriented as data.
    pub n_order: Option<usize>,
}

impl SpecDataFieldState {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            caption: None,
            function: EnumConsolidationFunction::Sum,
            calculation: EnumPivotCalculation::Normal,
            number_format: None,
            n_order: None,
        }
    }

    /// Header caption; defaults to `Sum of <field>` style.
    pub fn derive_caption(&self) -> String {
        match &self.caption {
            Some(caption) => caption.clone(),
            None => format!("{} of {}", self.function.caption_prefix(), self.source),
        }
    }

    pub fn derive_number_format(&self) -> Option<String> {
        self.number_format.clone().or_else(|| {
            self.calculation
                .is_percent()
                .then(|| FMT_PERCENT_2.to_string())
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecPivotTableState {
    pub name: String,
    pub sheet: String,
    pub anchor: SpecCellRef,
    pub n_cache: usize,
    pub l_fields: Vec<SpecPivotFieldState>,
    pub l_data_fields: Vec<SpecDataFieldState>,
}

impl SpecPivotTableState {
    /// New table with one hidden field per cache column.
    pub fn new(
        name: impl Into<String>,
        sheet: impl Into<String>,
        anchor: SpecCellRef,
        n_cache: usize,
        cache: &SpecPivotCacheState,
    ) -> Self {
        let l_fields = cache
            .l_headers
            .iter()
            .map(|header| SpecPivotFieldState {
                name: header.clone(),
                orientation: EnumFieldOrientation::Hidden,
                position: 0,
                l_items: derive_field_items(cache, header, None),
                if_multiple_page_items: false,
                grouping: None,
                formula: None,
            })
            .collect();
        Self {
            name: name.into(),
            sheet: sheet.into(),
            anchor,
            n_cache,
            l_fields,
            l_data_fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&SpecPivotFieldState> {
        self.l_fields.iter().find(|field| field.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut SpecPivotFieldState> {
        self.l_fields.iter_mut().find(|field| field.name == name)
    }

    /// Fields with `orientation`, in position order.
    pub fn fields_oriented(&self, orientation: EnumFieldOrientation) -> Vec<&SpecPivotFieldState> {
        let mut l_fields: Vec<_> = self
            .l_fields
            .iter()
            .filter(|field| field.orientation == orientation)
            .collect();
        l_fields.sort_by_key(|field| field.position);
        l_fields
    }

    /// Data-oriented data fields as `(index, state)`, in display order.
    pub fn data_fields_oriented(&self) -> Vec<(usize, &SpecDataFieldState)> {
        let mut l_data: Vec<_> = self
            .l_data_fields
            .iter()
            .enumerate()
            .filter(|(_, df)| df.n_order.is_some())
            .collect();
        l_data.sort_by_key(|(_, df)| df.n_order);
        l_data
    }

    /// Move `field` to `orientation`, appended at the end of that group.
    pub fn orient_field(&mut self, name: &str, orientation: EnumFieldOrientation) -> bool {
        let Some(n_idx) = self.l_fields.iter().position(|field| field.name == name) else {
            return false;
        };
        let orientation_old = self.l_fields[n_idx].orientation;
        if orientation_old == orientation {
            return true;
        }
        let n_position = if orientation == EnumFieldOrientation::Hidden {
            0
        } else {
            self.fields_oriented(orientation).len() + 1
        };
        let field = &mut self.l_fields[n_idx];
        field.orientation = orientation;
        field.position = n_position;
        self.renumber(orientation_old);
        true
    }

    /// Move `field` to 1-based `position` within its group; past-the-end appends.
    pub fn move_field(&mut self, name: &str, position: usize) {
        let Some(field) = self.field(name) else {
            return;
        };
        let orientation = field.orientation;
        let mut l_names: Vec<String> = self
            .fields_oriented(orientation)
            .iter()
            .map(|f| f.name.clone())
            .filter(|n| n != name)
            .collect();
        let n_insert = position.saturating_sub(1).min(l_names.len());
        l_names.insert(n_insert, name.to_string());
        for (n_idx, c_name) in l_names.iter().enumerate() {
            if let Some(field) = self.field_mut(c_name) {
                field.position = n_idx + 1;
            }
        }
    }

    fn renumber(&mut self, orientation: EnumFieldOrientation) {
        if orientation == EnumFieldOrientation::Hidden {
            return;
        }
        let l_names: Vec<String> = self
            .fields_oriented(orientation)
            .iter()
            .map(|f| f.name.clone())
            .collect();
        for (n_idx, c_name) in l_names.iter().enumerate() {
            if let Some(field) = self.field_mut(c_name) {
                field.position = n_idx + 1;
            }
        }
    }
}

/// Distinct item labels of a cache column in natural order, all visible.
pub fn derive_field_items(
    cache: &SpecPivotCacheState,
    field: &str,
    grouping: Option<EnumGroupingPeriod>,
) -> Vec<SpecPivotItemState> {
    let Some(labeler) = FieldLabeler::new(cache, field, grouping) else {
        return Vec::new();
    };
    let mut l_labels: Vec<String> = Vec::new();
    for n_row in 0..cache.l_rows.len() {
        let c_label = labeler.label(cache, n_row);
        if !l_labels.contains(&c_label) {
            l_labels.push(c_label);
        }
    }
    l_labels.sort_by(|a, b| compare_item_labels(a, b));
    l_labels
        .into_iter()
        .map(|name| SpecPivotItemState {
            name,
            if_visible: true,
            if_show_detail: true,
        })
        .collect()
}

/// Whether every non-empty value of `field` is a date, with at least one date.
pub fn is_date_field(cache: &SpecPivotCacheState, field: &str) -> bool {
    let Some(n_col) = cache.column_index(field) else {
        return false;
    };
    let mut if_any_date = false;
    for n_row in 0..cache.l_rows.len() {
        let value = cache.value(n_row, n_col);
        if value.is_empty() {
            continue;
        }
        if derive_date(value).is_none() {
            return false;
        }
        if_any_date = true;
    }
    if_any_date
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Labels

struct FieldLabeler {
    n_col: usize,
    grouping: Option<EnumGroupingPeriod>,
    date_start: Option<NaiveDate>,
}

impl FieldLabeler {
    fn new(
        cache: &SpecPivotCacheState,
        field: &str,
        grouping: Option<EnumGroupingPeriod>,
    ) -> Option<Self> {
        let n_col = cache.column_index(field)?;
        let date_start = match grouping {
            Some(EnumGroupingPeriod::Days(_)) => (0..cache.l_rows.len())
                .filter_map(|n_row| derive_date(cache.value(n_row, n_col)))
                .min(),
            _ => None,
        };
        Some(Self {
            n_col,
            grouping,
            date_start,
        })
    }

    fn label(&self, cache: &SpecPivotCacheState, n_row: usize) -> String {
        let value = cache.value(n_row, self.n_col);
        let (Some(grouping), Some(date)) = (self.grouping, derive_date(value)) else {
            return derive_item_label(value);
        };
        match grouping {
            EnumGroupingPeriod::Months => date.format("%Y-%m").to_string(),
            EnumGroupingPeriod::Days(n_days) => {
                let n_days = i64::from(n_days.max(1));
                let date_start = self.date_start.unwrap_or(date);
                let n_bucket = (date - date_start).num_days().div_euclid(n_days);
                let date_from = date_start + Duration::days(n_bucket * n_days);
                let date_to = date_from + Duration::days(n_days - 1);
                format!("{} - {}", date_from.format("%Y-%m-%d"), date_to.format("%Y-%m-%d"))
            }
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region View

/// One value column of a computed pivot view.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecViewDataColumn {
    /// Absolute 1-based sheet column.
    pub col: u32,
    /// Index into `SpecPivotTableState::l_data_fields`.
    pub n_data_field: usize,
    pub if_grand_total: bool,
    pub caption: String,
    pub number_format: Option<String>,
}

/// Computed pivot grid anchored at `origin`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecPivotView {
    pub origin: SpecCellRef,
    /// Row 0 is the anchor row.
    pub l_cells: Vec<Vec<EnumCellValue>>,
    pub l_page_rows: Vec<u32>,
    pub n_row_header: u32,
    pub n_row_first_body: u32,
    /// Outline depth of each body row, from `n_row_first_body`.
    pub l_body_depths: Vec<usize>,
    pub n_row_grand_total: u32,
    pub l_data_columns: Vec<SpecViewDataColumn>,
}

impl SpecPivotView {
    pub fn n_rows(&self) -> u32 {
        self.l_cells.len() as u32
    }

    pub fn n_cols(&self) -> u32 {
        self.l_cells.iter().map(Vec::len).max().unwrap_or(0) as u32
    }

    /// Value at an absolute 1-based cell.
    pub fn value_at(&self, row: u32, col: u32) -> Option<&EnumCellValue> {
        let n_row = row.checked_sub(self.origin.row)? as usize;
        let n_col = col.checked_sub(self.origin.col)? as usize;
        self.l_cells.get(n_row)?.get(n_col)
    }

    /// Last body row (the header row when the body is empty).
    pub fn n_row_last_body(&self) -> u32 {
        self.n_row_first_body + self.l_body_depths.len() as u32 - 1
    }

    pub fn last_filled_row(&self, col: u32) -> Option<u32> {
        (0..self.n_rows())
            .rev()
            .map(|n| self.origin.row + n)
            .find(|row| self.value_at(*row, col).is_some_and(|v| !v.is_empty()))
    }

    pub fn last_filled_col(&self, row: u32) -> Option<u32> {
        (0..self.n_cols())
            .rev()
            .map(|n| self.origin.col + n)
            .find(|col| self.value_at(row, *col).is_some_and(|v| !v.is_empty()))
    }

    pub fn data_column_at(&self, col: u32) -> Option<&SpecViewDataColumn> {
        self.l_data_columns.iter().find(|dc| dc.col == col)
    }
}

struct BodyRow {
    n_depth: usize,
    label: String,
    l_records: Vec<usize>,
}

struct ColumnGroup {
    label: Option<String>,
    if_grand_total: bool,
}

/// Compute the displayed grid of `table`.
pub fn compute_pivot_view(
    table: &SpecPivotTableState,
    cache: &SpecPivotCacheState,
) -> SpecPivotView {
    let l_page_fields = table.fields_oriented(EnumFieldOrientation::Page);
    let l_row_fields = table.fields_oriented(EnumFieldOrientation::Row);
    let l_col_fields = table.fields_oriented(EnumFieldOrientation::Column);
    let l_data_fields = table.data_fields_oriented();

    let derive_labelers = |l_fields: &[&SpecPivotFieldState]| -> Vec<Option<FieldLabeler>> {
        l_fields
            .iter()
            .map(|field| FieldLabeler::new(cache, &field.name, field.grouping))
            .collect()
    };
    let l_page_labelers = derive_labelers(&l_page_fields);
    let l_row_labelers = derive_labelers(&l_row_fields);
    let l_col_labelers = derive_labelers(&l_col_fields);

    // record filter: every oriented field must show the record's item
    let l_records: Vec<usize> = (0..cache.l_rows.len())
        .filter(|n_row| {
            [
                (&l_page_fields, &l_page_labelers),
                (&l_row_fields, &l_row_labelers),
                (&l_col_fields, &l_col_labelers),
            ]
            .iter()
            .all(|(l_fields, l_labelers)| {
                l_fields.iter().zip(l_labelers.iter()).all(|(field, labeler)| {
                    labeler
                        .as_ref()
                        .is_none_or(|lab| field.is_visible(&lab.label(cache, *n_row)))
                })
            })
        })
        .collect();

    // column groups: leaf combinations of column field items
    let mut l_col_groups: Vec<ColumnGroup> = Vec::new();
    let mut dict_col_group_of: BTreeMap<usize, usize> = BTreeMap::new();
    if l_col_fields.is_empty() {
        l_col_groups.push(ColumnGroup {
            label: None,
            if_grand_total: false,
        });
        for n_rec in &l_records {
            dict_col_group_of.insert(*n_rec, 0);
        }
    } else {
        let mut dict_paths: BTreeMap<Vec<usize>, Vec<usize>> = BTreeMap::new();
        for n_rec in &l_records {
            let l_path: Vec<usize> = l_col_fields
                .iter()
                .zip(l_col_labelers.iter())
                .map(|(field, labeler)| {
                    let c_label = labeler
                        .as_ref()
                        .map(|lab| lab.label(cache, *n_rec))
                        .unwrap_or_default();
                    field
                        .l_items
                        .iter()
                        .position(|item| item.name == c_label)
                        .unwrap_or(usize::MAX)
                })
                .collect();
            dict_paths.entry(l_path).or_default().push(*n_rec);
        }
        for (l_path, l_recs) in &dict_paths {
            let c_label = l_path
                .iter()
                .zip(l_col_fields.iter())
                .map(|(n_item, field)| {
                    field
                        .l_items
                        .get(*n_item)
                        .map(|item| item.name.clone())
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join(" / ");
            let n_group = l_col_groups.len();
            l_col_groups.push(ColumnGroup {
                label: Some(c_label),
                if_grand_total: false,
            });
            for n_rec in l_recs {
                dict_col_group_of.insert(*n_rec, n_group);
            }
        }
        l_col_groups.push(ColumnGroup {
            label: Some(C_LABEL_GRAND_TOTAL.to_string()),
            if_grand_total: true,
        });
    }

    // body rows in item order, respecting show-detail
    let mut l_body: Vec<BodyRow> = Vec::new();
    if !l_row_fields.is_empty() {
        emit_body_rows(
            cache,
            &l_row_fields,
            &l_row_labelers,
            0,
            &l_records,
            &mut l_body,
        );
    }

    let n_page_rows = l_page_fields.len() as u32;
    let n_row_header = if n_page_rows > 0 {
        table.anchor.row + n_page_rows + 1
    } else {
        table.anchor.row
    };
    let n_row_first_body = n_row_header + 1;
    let n_row_grand_total = n_row_first_body + l_body.len() as u32;

    let mut l_data_columns: Vec<SpecViewDataColumn> = Vec::new();
    let mut l_column_keys: Vec<(usize, usize)> = Vec::new();
    for (n_group, group) in l_col_groups.iter().enumerate() {
        for (n_df, df) in &l_data_fields {
            let c_caption = df.derive_caption();
            let c_header = match (&group.label, l_data_fields.len()) {
                (None, _) => c_caption,
                (Some(label), 1) => label.clone(),
                (Some(_), _) if group.if_grand_total => format!("Total {c_caption}"),
                (Some(label), _) => format!("{label} {c_caption}"),
            };
            l_data_columns.push(SpecViewDataColumn {
                col: table.anchor.col + 1 + l_data_columns.len() as u32,
                n_data_field: *n_df,
                if_grand_total: group.if_grand_total,
                caption: c_header,
                number_format: df.derive_number_format(),
            });
            l_column_keys.push((n_group, *n_df));
        }
    }

    let evaluator = CellEvaluator { table, cache };
    let ref_col_groups = &l_col_groups;
    let ref_col_group_of = &dict_col_group_of;
    let in_group = move |n_group: usize| {
        let group = &ref_col_groups[n_group];
        move |n_rec: &usize| {
            group.if_grand_total || ref_col_group_of.get(n_rec) == Some(&n_group)
        }
    };

    let n_width = (1 + l_data_columns.len()).max(if n_page_rows > 0 { 2 } else { 1 });
    let mut l_cells: Vec<Vec<EnumCellValue>> = Vec::new();
    for field in &l_page_fields {
        let n_visible = field.n_visible();
        let c_label = if n_visible == field.l_items.len() {
            C_PAGE_LABEL_ALL.to_string()
        } else if n_visible == 1 {
            field
                .l_items
                .iter()
                .find(|item| item.if_visible)
                .map(|item| item.name.clone())
                .unwrap_or_default()
        } else {
            C_PAGE_LABEL_MULTIPLE.to_string()
        };
        let mut l_row = vec![EnumCellValue::None; n_width];
        l_row[0] = EnumCellValue::String(field.name.clone());
        l_row[1] = EnumCellValue::String(c_label);
        l_cells.push(l_row);
    }
    if n_page_rows > 0 {
        l_cells.push(vec![EnumCellValue::None; n_width]);
    }

    let mut l_header = vec![EnumCellValue::None; n_width];
    if !l_row_fields.is_empty() {
        l_header[0] = EnumCellValue::String(C_HEADER_ROW_LABELS.to_string());
    }
    for (n_idx, dc) in l_data_columns.iter().enumerate() {
        l_header[n_idx + 1] = EnumCellValue::String(dc.caption.clone());
    }
    l_cells.push(l_header);

    // raw aggregates: body rows then the grand total row
    let mut l_raw: Vec<Vec<Result<Option<f64>, EnumFormulaEvalError>>> = Vec::new();
    for row in &l_body {
        l_raw.push(
            l_column_keys
                .iter()
                .map(|(n_group, n_df)| {
                    let l_cell_recs: Vec<usize> =
                        row.l_records.iter().copied().filter(in_group(*n_group)).collect();
                    evaluator.evaluate(*n_df, &l_cell_recs)
                })
                .collect(),
        );
    }
    let l_grand: Vec<Result<Option<f64>, EnumFormulaEvalError>> = l_column_keys
        .iter()
        .map(|(n_group, n_df)| {
            let l_cell_recs: Vec<usize> =
                l_records.iter().copied().filter(in_group(*n_group)).collect();
            evaluator.evaluate(*n_df, &l_cell_recs)
        })
        .collect();

    let l_shown = apply_calculations(
        table,
        &l_body,
        &l_raw,
        &l_grand,
        &l_column_keys,
        &l_col_groups,
    );

    for (row, l_values) in l_body.iter().zip(l_shown.body.iter()) {
        let mut l_row = vec![EnumCellValue::None; n_width];
        l_row[0] = EnumCellValue::String(row.label.clone());
        for (n_idx, value) in l_values.iter().enumerate() {
            l_row[n_idx + 1] = derive_shown_value(value);
        }
        l_cells.push(l_row);
    }
    let mut l_total_row = vec![EnumCellValue::None; n_width];
    l_total_row[0] = EnumCellValue::String(C_LABEL_GRAND_TOTAL.to_string());
    for (n_idx, value) in l_shown.grand.iter().enumerate() {
        l_total_row[n_idx + 1] = derive_shown_value(value);
    }
    l_cells.push(l_total_row);

    SpecPivotView {
        origin: table.anchor,
        l_cells,
        l_page_rows: (0..n_page_rows).map(|n| table.anchor.row + n).collect(),
        n_row_header,
        n_row_first_body,
        l_body_depths: l_body.iter().map(|row| row.n_depth).collect(),
        n_row_grand_total,
        l_data_columns,
    }
}

fn emit_body_rows(
    cache: &SpecPivotCacheState,
    l_fields: &[&SpecPivotFieldState],
    l_labelers: &[Option<FieldLabeler>],
    n_level: usize,
    l_records: &[usize],
    l_body: &mut Vec<BodyRow>,
) {
    let (Some(field), Some(labeler)) = (l_fields.get(n_level), l_labelers.get(n_level)) else {
        return;
    };
    let Some(labeler) = labeler else {
        return;
    };
    let mut dict_by_label: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for n_rec in l_records {
        dict_by_label
            .entry(labeler.label(cache, *n_rec))
            .or_default()
            .push(*n_rec);
    }
    for item in field.l_items.iter().filter(|item| item.if_visible) {
        let Some(l_item_recs) = dict_by_label.get(&item.name) else {
            continue;
        };
        l_body.push(BodyRow {
            n_depth: n_level,
            label: item.name.clone(),
            l_records: l_item_recs.clone(),
        });
        if item.if_show_detail {
            emit_body_rows(cache, l_fields, l_labelers, n_level + 1, l_item_recs, l_body);
        }
    }
}

fn derive_shown_value(value: &Result<Option<f64>, EnumFormulaEvalError>) -> EnumCellValue {
    match value {
        Ok(Some(n)) => EnumCellValue::Number(*n),
        Ok(None) => EnumCellValue::None,
        Err(err) => EnumCellValue::String(err.to_string()),
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Aggregation

struct CellEvaluator<'a> {
    table: &'a SpecPivotTableState,
    cache: &'a SpecPivotCacheState,
}

impl CellEvaluator<'_> {
    fn evaluate(
        &self,
        n_df: usize,
        l_records: &[usize],
    ) -> Result<Option<f64>, EnumFormulaEvalError> {
        let Some(df) = self.table.l_data_fields.get(n_df) else {
            return Ok(None);
        };
        if l_records.is_empty() {
            return Ok(None);
        }
        if let Some(formula) = self.table.field(&df.source).and_then(|f| f.formula.as_ref()) {
            return self.evaluate_formula(formula, l_records, 0).map(Some);
        }
        let Some(n_col) = self.cache.column_index(&df.source) else {
            return Ok(None);
        };
        aggregate_values(
            df.function,
            l_records.iter().map(|n_rec| self.cache.value(*n_rec, n_col)),
        )
        .map(Some)
    }

    fn evaluate_formula(
        &self,
        formula: &SpecFormula,
        l_records: &[usize],
        n_depth: usize,
    ) -> Result<f64, EnumFormulaEvalError> {
        if n_depth > N_FORMULA_DEPTH_MAX {
            return Err(EnumFormulaEvalError::UnknownField);
        }
        let lookup = |name: &str| -> Option<f64> {
            if let Some(inner) = self.table.field(name).and_then(|f| f.formula.as_ref()) {
                return self.evaluate_formula(inner, l_records, n_depth + 1).ok();
            }
            let n_col = self.cache.column_index(name)?;
            Some(
                l_records
                    .iter()
                    .filter_map(|n_rec| self.cache.value(*n_rec, n_col).as_number())
                    .sum(),
            )
        };
        formula.evaluate(&lookup)
    }
}

/// Aggregate `values` with `function`, skipping empties.
pub fn aggregate_values<'a>(
    function: EnumConsolidationFunction,
    values: impl Iterator<Item = &'a EnumCellValue>,
) -> Result<f64, EnumFormulaEvalError> {
    let mut n_nonempty = 0_usize;
    let mut l_nums: Vec<f64> = Vec::new();
    for value in values {
        if value.is_empty() {
            continue;
        }
        n_nonempty += 1;
        if let Some(n) = value.as_number() {
            l_nums.push(n);
        }
    }

    let n_len = l_nums.len() as f64;
    let calculate_var = |n_ddof: f64| -> Result<f64, EnumFormulaEvalError> {
        if n_len - n_ddof <= 0.0 {
            return Err(EnumFormulaEvalError::DivZero);
        }
        let n_mean = l_nums.iter().sum::<f64>() / n_len;
        Ok(l_nums.iter().map(|x| (x - n_mean).powi(2)).sum::<f64>() / (n_len - n_ddof))
    };

    match function {
        EnumConsolidationFunction::Sum => Ok(l_nums.iter().sum()),
        EnumConsolidationFunction::Count => Ok(n_nonempty as f64),
        EnumConsolidationFunction::CountNums => Ok(n_len),
        EnumConsolidationFunction::Average => {
            if l_nums.is_empty() {
                Err(EnumFormulaEvalError::DivZero)
            } else {
                Ok(l_nums.iter().sum::<f64>() / n_len)
            }
        }
        EnumConsolidationFunction::Max => {
            Ok(l_nums.iter().copied().reduce(f64::max).unwrap_or(0.0))
        }
        EnumConsolidationFunction::Min => {
            Ok(l_nums.iter().copied().reduce(f64::min).unwrap_or(0.0))
        }
        EnumConsolidationFunction::Product => {
            if l_nums.is_empty() {
                Ok(0.0)
            } else {
                Ok(l_nums.iter().product())
            }
        }
        EnumConsolidationFunction::Var => calculate_var(1.0),
        EnumConsolidationFunction::VarP => calculate_var(0.0),
        EnumConsolidationFunction::StdDev => calculate_var(1.0).map(f64::sqrt),
        EnumConsolidationFunction::StdDevP => calculate_var(0.0).map(f64::sqrt),
    }
}

struct ShownValues {
    body: Vec<Vec<Result<Option<f64>, EnumFormulaEvalError>>>,
    grand: Vec<Result<Option<f64>, EnumFormulaEvalError>>,
}

fn apply_calculations(
    table: &SpecPivotTableState,
    l_body: &[BodyRow],
    l_raw: &[Vec<Result<Option<f64>, EnumFormulaEvalError>>],
    l_grand: &[Result<Option<f64>, EnumFormulaEvalError>],
    l_column_keys: &[(usize, usize)],
    l_col_groups: &[ColumnGroup],
) -> ShownValues {
    let mut shown = ShownValues {
        body: l_raw.to_vec(),
        grand: l_grand.to_vec(),
    };

    let divide = |value: &Result<Option<f64>, EnumFormulaEvalError>,
                  total: &Result<Option<f64>, EnumFormulaEvalError>| {
        match (value, total) {
            (Err(err), _) | (_, Err(err)) => Err(*err),
            (Ok(None), _) => Ok(None),
            (Ok(Some(_)), Ok(None)) => Err(EnumFormulaEvalError::DivZero),
            (Ok(Some(v)), Ok(Some(t))) => {
                if *t == 0.0 {
                    Err(EnumFormulaEvalError::DivZero)
                } else {
                    Ok(Some(v / t))
                }
            }
        }
    };

    for (n_key, (_, n_df)) in l_column_keys.iter().enumerate() {
        let Some(df) = table.l_data_fields.get(*n_df) else {
            continue;
        };
        // grand total column of the same data field, if column fields exist
        let n_key_row_total = l_column_keys.iter().position(|(g, d)| {
            d == n_df && l_col_groups.get(*g).is_some_and(|group| group.if_grand_total)
        });
        let n_key_grand = n_key_row_total.unwrap_or(n_key);

        match df.calculation {
            EnumPivotCalculation::Normal => {}
            EnumPivotCalculation::PercentOfTotal => {
                let total = &l_grand[n_key_grand];
                for (n_row, l_values) in shown.body.iter_mut().enumerate() {
                    l_values[n_key] = divide(&l_raw[n_row][n_key], total);
                }
                shown.grand[n_key] = divide(&l_grand[n_key], total);
            }
            EnumPivotCalculation::PercentOfRow => {
                for (n_row, l_values) in shown.body.iter_mut().enumerate() {
                    l_values[n_key] = divide(&l_raw[n_row][n_key], &l_raw[n_row][n_key_grand]);
                }
                shown.grand[n_key] = divide(&l_grand[n_key], &l_grand[n_key_grand]);
            }
            EnumPivotCalculation::PercentOfColumn => {
                let total = &l_grand[n_key];
                for (n_row, l_values) in shown.body.iter_mut().enumerate() {
                    l_values[n_key] = divide(&l_raw[n_row][n_key], total);
                }
                shown.grand[n_key] = divide(&l_grand[n_key], total);
            }
            EnumPivotCalculation::RunningTotal => {
                // accumulators per depth reset when a shallower row starts
                let mut l_acc: Vec<f64> = Vec::new();
                for (n_row, row) in l_body.iter().enumerate() {
                    l_acc.truncate(row.n_depth + 1);
                    l_acc.resize(row.n_depth + 1, 0.0);
                    if let Ok(Some(v)) = &l_raw[n_row][n_key] {
                        l_acc[row.n_depth] += v;
                        shown.body[n_row][n_key] = Ok(Some(l_acc[row.n_depth]));
                    }
                }
            }
        }
    }
    shown
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

//! In-memory workbook object graph implementing [`PivotBackend`].
//!
//! Validation mirrors the spreadsheet object model closely enough for the
//! builder's failure handling to be meaningful: unknown fields and items,
//! hiding the last visible item, zero positions, captions clashing with field
//! names and malformed formulas are all rejected. `save` materializes the
//! graph through [`crate::writer::write_workbook`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::backend::{
    BackendFactory, BackendJournal, DataFieldId, EnumBackendOp, EnumFieldOrientation,
    EnumGroupingPeriod, PivotBackend, PivotCacheId, SpecCellRange, SpecCellRef,
    SpecChartPlacement, SpecConditionalFormat,
};
use crate::conf::{
    C_SHEET_NAME_DEFAULT, SpecWorkbookFormats, derive_default_workbook_formats,
};
use crate::engine::{
    SpecDataFieldState, SpecPivotCacheState, SpecPivotFieldState, SpecPivotTableState,
    SpecPivotView, compute_pivot_view, derive_field_items, is_date_field,
};
use crate::formula::parse_formula;
use crate::source::read_source_table;
use crate::spec::{
    BackendError, EnumCellValue, EnumConsolidationFunction, EnumPivotCalculation,
};
use crate::util::{derive_item_label, validate_sheet_name};
use crate::writer::write_workbook;

////////////////////////////////////////////////////////////////////////////////
// #region ObjectGraph

#[derive(Debug, Clone, PartialEq)]
pub struct SpecModelConditionalFormat {
    pub format: SpecConditionalFormat,
    pub first: SpecCellRef,
    pub last: SpecCellRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecModelChart {
    pub anchor: SpecCellRef,
    pub placement: SpecChartPlacement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecModelTable {
    pub range: SpecCellRange,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecModelSheet {
    pub name: String,
    pub dict_cells: BTreeMap<(u32, u32), EnumCellValue>,
    pub active: SpecCellRef,
    pub selection: (SpecCellRef, SpecCellRef),
    pub freeze: Option<SpecCellRef>,
    pub dict_col_widths: BTreeMap<u32, f64>,
    pub set_rows_wrapped: BTreeSet<u32>,
    pub l_conditional_formats: Vec<SpecModelConditionalFormat>,
    pub l_charts: Vec<SpecModelChart>,
    pub l_tables: Vec<SpecModelTable>,
    pub if_autofilter: bool,
}

impl SpecModelSheet {
    fn new(name: &str) -> Self {
        let cell_a1 = SpecCellRef::new(1, 1);
        Self {
            name: name.to_string(),
            dict_cells: BTreeMap::new(),
            active: cell_a1,
            selection: (cell_a1, cell_a1),
            freeze: None,
            dict_col_widths: BTreeMap::new(),
            set_rows_wrapped: BTreeSet::new(),
            l_conditional_formats: Vec::new(),
            l_charts: Vec::new(),
            l_tables: Vec::new(),
            if_autofilter: false,
        }
    }

    /// Extent of written cells as `(last_row, last_col)`.
    pub fn extent(&self) -> (u32, u32) {
        self.dict_cells
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .fold((0, 0), |(r, c), ((row, col), _)| (r.max(*row), c.max(*col)))
    }
}

/// Workbook held in memory until saved.
#[derive(Debug)]
pub struct WorkbookModel {
    pub(crate) l_sheets: Vec<SpecModelSheet>,
    pub(crate) l_caches: Vec<SpecPivotCacheState>,
    pub(crate) l_tables: Vec<SpecPivotTableState>,
    pub(crate) formats: SpecWorkbookFormats,
    journal: BackendJournal,
    if_released: bool,
}

impl Default for WorkbookModel {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkbookModel {
    /// New workbook with one blank default sheet.
    pub fn new() -> Self {
        Self {
            l_sheets: vec![SpecModelSheet::new(C_SHEET_NAME_DEFAULT)],
            l_caches: Vec::new(),
            l_tables: Vec::new(),
            formats: derive_default_workbook_formats(),
            journal: BackendJournal::new(),
            if_released: false,
        }
    }

    pub fn with_journal(mut self, journal: BackendJournal) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_formats(mut self, formats: SpecWorkbookFormats) -> Self {
        self.formats = formats;
        self
    }

    pub fn journal(&self) -> &BackendJournal {
        &self.journal
    }

    pub fn sheet(&self, name: &str) -> Option<&SpecModelSheet> {
        self.l_sheets.iter().find(|s| s.name == name)
    }

    pub fn pivot_table(&self, name: &str) -> Option<&SpecPivotTableState> {
        self.l_tables.iter().find(|t| t.name == name)
    }

    /// Pivot table anchored on `sheet`, if any.
    pub fn pivot_table_on(&self, sheet: &str) -> Option<&SpecPivotTableState> {
        self.l_tables.iter().find(|t| t.sheet == sheet)
    }

    /// Computed grid of the pivot table on `sheet`.
    pub fn pivot_view(&self, sheet: &str) -> Option<SpecPivotView> {
        let table = self.pivot_table_on(sheet)?;
        let cache = self.l_caches.get(table.n_cache)?;
        Some(compute_pivot_view(table, cache))
    }

    /// Displayed value at a cell: pivot grid first, then written cells.
    pub fn cell_value(&self, sheet: &str, row: u32, col: u32) -> Option<EnumCellValue> {
        if let Some(view) = self.pivot_view(sheet)
            && let Some(value) = view.value_at(row, col)
            && !value.is_empty()
        {
            return Some(value.clone());
        }
        self.sheet(sheet)?.dict_cells.get(&(row, col)).cloned()
    }

    fn ensure_live(&self) -> Result<(), BackendError> {
        if self.if_released {
            return Err(BackendError::Released);
        }
        Ok(())
    }

    fn sheet_mut(&mut self, name: &str) -> Result<&mut SpecModelSheet, BackendError> {
        self.l_sheets
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| BackendError::SheetNotFound(name.to_string()))
    }

    fn sheet_ref(&self, name: &str) -> Result<&SpecModelSheet, BackendError> {
        self.sheet(name)
            .ok_or_else(|| BackendError::SheetNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut SpecPivotTableState, BackendError> {
        self.l_tables
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| BackendError::TableNotFound(name.to_string()))
    }

    fn table_ref(&self, name: &str) -> Result<&SpecPivotTableState, BackendError> {
        self.pivot_table(name)
            .ok_or_else(|| BackendError::TableNotFound(name.to_string()))
    }

    fn field_mut<'a>(
        &'a mut self,
        table: &str,
        field: &str,
    ) -> Result<&'a mut SpecPivotFieldState, BackendError> {
        let table_state = self.table_mut(table)?;
        table_state
            .field_mut(field)
            .ok_or_else(|| BackendError::FieldNotFound {
                table: table.to_string(),
                field: field.to_string(),
            })
    }

    fn data_field_mut(
        &mut self,
        table: &str,
        id: DataFieldId,
    ) -> Result<&mut SpecDataFieldState, BackendError> {
        self.table_mut(table)?
            .l_data_fields
            .get_mut(id.0)
            .ok_or(BackendError::DataFieldNotFound(id.0))
    }

    fn validate_new_sheet_name(&self, name: &str) -> Result<(), BackendError> {
        validate_sheet_name(name).map_err(|reason| BackendError::InvalidSheetName {
            name: name.to_string(),
            reason,
        })?;
        if self
            .l_sheets
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(name))
        {
            return Err(BackendError::SheetExists(name.to_string()));
        }
        Ok(())
    }

    fn next_data_order(table: &SpecPivotTableState) -> usize {
        table
            .l_data_fields
            .iter()
            .filter_map(|df| df.n_order)
            .max()
            .map_or(0, |n| n + 1)
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Capability

impl PivotBackend for WorkbookModel {
    fn sheet_names(&self) -> Vec<String> {
        self.l_sheets.iter().map(|s| s.name.clone()).collect()
    }

    fn add_sheet(&mut self, name: &str) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::AddSheet(name.to_string()));
        self.ensure_live()?;
        self.validate_new_sheet_name(name)?;
        self.l_sheets.push(SpecModelSheet::new(name));
        Ok(())
    }

    fn rename_sheet(&mut self, from: &str, to: &str) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::RenameSheet {
            from: from.to_string(),
            to: to.to_string(),
        });
        self.ensure_live()?;
        self.sheet_ref(from)?;
        if from != to {
            self.validate_new_sheet_name(to)?;
        }
        self.sheet_mut(from)?.name = to.to_string();
        for cache in self.l_caches.iter_mut().filter(|c| c.source.sheet == from) {
            cache.source.sheet = to.to_string();
        }
        for table in self.l_tables.iter_mut().filter(|t| t.sheet == from) {
            table.sheet = to.to_string();
        }
        Ok(())
    }

    fn delete_sheet(&mut self, name: &str) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::DeleteSheet(name.to_string()));
        self.ensure_live()?;
        let n_idx = self
            .l_sheets
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| BackendError::SheetNotFound(name.to_string()))?;
        if self.l_sheets.len() == 1 {
            return Err(BackendError::Rejected(
                "a workbook must contain at least one sheet".to_string(),
            ));
        }
        self.l_sheets.remove(n_idx);
        self.l_tables.retain(|t| t.sheet != name);
        Ok(())
    }

    fn copy_sheet_from_file(&mut self, path: &Path, name: &str) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::CopySheetFromFile {
            path: path.to_path_buf(),
            name: name.to_string(),
        });
        self.ensure_live()?;
        self.validate_new_sheet_name(name)?;
        let table = read_source_table(path)?;

        let mut sheet = SpecModelSheet::new(name);
        for (n_col, header) in table.l_headers.iter().enumerate() {
            sheet
                .dict_cells
                .insert((1, n_col as u32 + 1), EnumCellValue::String(header.clone()));
        }
        for (n_row, row) in table.l_rows.iter().enumerate() {
            for (n_col, value) in row.iter().enumerate() {
                if !value.is_empty() {
                    sheet
                        .dict_cells
                        .insert((n_row as u32 + 2, n_col as u32 + 1), value.clone());
                }
            }
        }
        // copied sheets keep their filter buttons
        sheet.if_autofilter = true;
        self.l_sheets.push(sheet);
        Ok(())
    }

    fn write_grid(
        &mut self,
        sheet: &str,
        origin: SpecCellRef,
        rows: &[Vec<EnumCellValue>],
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::WriteGrid {
            sheet: sheet.to_string(),
            origin,
            n_rows: rows.len(),
        });
        self.ensure_live()?;
        let sheet_state = self.sheet_mut(sheet)?;
        for (n_row, row) in rows.iter().enumerate() {
            for (n_col, value) in row.iter().enumerate() {
                let key = (origin.row + n_row as u32, origin.col + n_col as u32);
                if value.is_empty() {
                    sheet_state.dict_cells.remove(&key);
                } else {
                    sheet_state.dict_cells.insert(key, value.clone());
                }
            }
        }
        Ok(())
    }

    fn last_filled_row(&self, sheet: &str, col: u32) -> Result<u32, BackendError> {
        let sheet_state = self.sheet_ref(sheet)?;
        let n_row_cells = sheet_state
            .dict_cells
            .iter()
            .filter(|((_, c), v)| *c == col && !v.is_empty())
            .map(|((r, _), _)| *r)
            .max();
        let n_row_pivot = self
            .pivot_view(sheet)
            .and_then(|view| view.last_filled_row(col));
        Ok(n_row_cells.max(n_row_pivot).unwrap_or(1))
    }

    fn last_filled_col(&self, sheet: &str, row: u32) -> Result<u32, BackendError> {
        let sheet_state = self.sheet_ref(sheet)?;
        let n_col_cells = sheet_state
            .dict_cells
            .iter()
            .filter(|((r, _), v)| *r == row && !v.is_empty())
            .map(|((_, c), _)| *c)
            .max();
        let n_col_pivot = self
            .pivot_view(sheet)
            .and_then(|view| view.last_filled_col(row));
        Ok(n_col_cells.max(n_col_pivot).unwrap_or(1))
    }

    fn clear_autofilter(&mut self, sheet: &str) -> Result<(), BackendError> {
        self.journal
            .push(EnumBackendOp::ClearAutofilter(sheet.to_string()));
        self.ensure_live()?;
        self.sheet_mut(sheet)?.if_autofilter = false;
        Ok(())
    }

    fn add_table(&mut self, range: &SpecCellRange, name: &str) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::AddTable {
            range: range.to_string(),
            name: name.to_string(),
        });
        self.ensure_live()?;
        if self
            .l_sheets
            .iter()
            .flat_map(|s| s.l_tables.iter())
            .any(|t| t.name == name)
        {
            return Err(BackendError::Rejected(format!("table `{name}` already exists")));
        }
        if range.n_rows() < 2 {
            return Err(BackendError::InvalidRange {
                range: range.to_string(),
                reason: "a table needs a header row and at least one data row".to_string(),
            });
        }
        let sheet_state = self.sheet_mut(&range.sheet)?;
        if sheet_state.if_autofilter {
            return Err(BackendError::Rejected(
                "a table cannot overlap a range with an active auto-filter".to_string(),
            ));
        }
        sheet_state.l_tables.push(SpecModelTable {
            range: range.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    fn create_pivot_cache(&mut self, source: &SpecCellRange) -> Result<PivotCacheId, BackendError> {
        self.journal
            .push(EnumBackendOp::CreatePivotCache(source.to_string()));
        self.ensure_live()?;
        let sheet_state = self.sheet_ref(&source.sheet)?;
        let invalid = |reason: String| BackendError::InvalidRange {
            range: source.to_string(),
            reason,
        };
        if source.n_rows() < 2 {
            return Err(invalid(
                "source needs a header row and at least one data row".to_string(),
            ));
        }

        let mut l_headers: Vec<String> = Vec::new();
        for n_col in source.first.col..=source.last.col {
            let value = sheet_state
                .dict_cells
                .get(&(source.first.row, n_col))
                .cloned()
                .unwrap_or_default();
            if value.is_empty() {
                return Err(invalid(format!(
                    "header cell {} is empty; field name is not valid",
                    SpecCellRef::new(source.first.row, n_col)
                )));
            }
            let c_base = derive_item_label(&value);
            let mut c_header = c_base.clone();
            let mut n_suffix = 2;
            while l_headers.contains(&c_header) {
                c_header = format!("{c_base}{n_suffix}");
                n_suffix += 1;
            }
            l_headers.push(c_header);
        }

        let l_rows: Vec<Vec<EnumCellValue>> = ((source.first.row + 1)..=source.last.row)
            .map(|n_row| {
                (source.first.col..=source.last.col)
                    .map(|n_col| {
                        sheet_state
                            .dict_cells
                            .get(&(n_row, n_col))
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .collect();

        self.l_caches.push(SpecPivotCacheState {
            source: source.clone(),
            l_headers,
            l_rows,
        });
        Ok(PivotCacheId(self.l_caches.len() - 1))
    }

    fn create_pivot_table(
        &mut self,
        cache: PivotCacheId,
        sheet: &str,
        anchor: SpecCellRef,
        name: &str,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::CreatePivotTable {
            sheet: sheet.to_string(),
            name: name.to_string(),
        });
        self.ensure_live()?;
        self.sheet_ref(sheet)?;
        let cache_state = self
            .l_caches
            .get(cache.0)
            .ok_or(BackendError::CacheNotFound(cache.0))?;
        if self.pivot_table(name).is_some() {
            return Err(BackendError::Rejected(format!(
                "pivot table `{name}` already exists"
            )));
        }
        if self.pivot_table_on(sheet).is_some() {
            return Err(BackendError::Rejected(format!(
                "sheet `{sheet}` already holds a pivot table"
            )));
        }
        let table = SpecPivotTableState::new(name, sheet, anchor, cache.0, cache_state);
        self.l_tables.push(table);
        Ok(())
    }

    fn pivot_items(&self, table: &str, field: &str) -> Result<Vec<String>, BackendError> {
        let table_state = self.table_ref(table)?;
        let field_state = table_state
            .field(field)
            .ok_or_else(|| BackendError::FieldNotFound {
                table: table.to_string(),
                field: field.to_string(),
            })?;
        Ok(field_state.l_items.iter().map(|i| i.name.clone()).collect())
    }

    fn set_field_orientation(
        &mut self,
        table: &str,
        field: &str,
        orientation: EnumFieldOrientation,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetFieldOrientation {
            table: table.to_string(),
            field: field.to_string(),
            orientation,
        });
        self.ensure_live()?;
        let field_state = self.field_mut(table, field)?;
        let if_calculated = field_state.formula.is_some();
        if if_calculated
            && !matches!(
                orientation,
                EnumFieldOrientation::Data | EnumFieldOrientation::Hidden
            )
        {
            return Err(BackendError::Rejected(format!(
                "calculated field `{field}` can only be a data field"
            )));
        }

        let table_state = self.table_mut(table)?;
        if orientation == EnumFieldOrientation::Data {
            let mut df = SpecDataFieldState::new(field);
            df.n_order = Some(Self::next_data_order(table_state));
            table_state.l_data_fields.push(df);
            return Ok(());
        }
        table_state.orient_field(field, orientation);
        Ok(())
    }

    fn set_field_position(
        &mut self,
        table: &str,
        field: &str,
        position: usize,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetFieldPosition {
            table: table.to_string(),
            field: field.to_string(),
            position,
        });
        self.ensure_live()?;
        if position == 0 {
            return Err(BackendError::InvalidPosition(position));
        }
        let field_state = self.field_mut(table, field)?;
        if field_state.orientation == EnumFieldOrientation::Hidden {
            return Err(BackendError::Rejected(format!(
                "field `{field}` is not placed in the table"
            )));
        }
        self.table_mut(table)?.move_field(field, position);
        Ok(())
    }

    fn set_multiple_page_items(
        &mut self,
        table: &str,
        field: &str,
        enabled: bool,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetMultiplePageItems {
            table: table.to_string(),
            field: field.to_string(),
            enabled,
        });
        self.ensure_live()?;
        self.field_mut(table, field)?.if_multiple_page_items = enabled;
        Ok(())
    }

    fn set_item_visible(
        &mut self,
        table: &str,
        field: &str,
        item: &str,
        visible: bool,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetItemVisible {
            table: table.to_string(),
            field: field.to_string(),
            item: item.to_string(),
            visible,
        });
        self.ensure_live()?;
        let field_state = self.field_mut(table, field)?;
        if field_state.orientation == EnumFieldOrientation::Page
            && !field_state.if_multiple_page_items
            && !visible
        {
            return Err(BackendError::Rejected(format!(
                "field `{field}` does not allow multiple page items"
            )));
        }
        let n_visible = field_state.n_visible();
        let item_state = field_state
            .l_items
            .iter_mut()
            .find(|i| i.name == item)
            .ok_or_else(|| BackendError::ItemNotFound {
                field: field.to_string(),
                item: item.to_string(),
            })?;
        if !visible && item_state.if_visible && n_visible <= 1 {
            return Err(BackendError::Rejected(
                "at least one item must remain visible".to_string(),
            ));
        }
        item_state.if_visible = visible;
        Ok(())
    }

    fn set_item_position(
        &mut self,
        table: &str,
        field: &str,
        item: &str,
        position: usize,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetItemPosition {
            table: table.to_string(),
            field: field.to_string(),
            item: item.to_string(),
            position,
        });
        self.ensure_live()?;
        let field_state = self.field_mut(table, field)?;
        if position == 0 || position > field_state.l_items.len() {
            return Err(BackendError::InvalidPosition(position));
        }
        let n_idx = field_state
            .l_items
            .iter()
            .position(|i| i.name == item)
            .ok_or_else(|| BackendError::ItemNotFound {
                field: field.to_string(),
                item: item.to_string(),
            })?;
        let item_state = field_state.l_items.remove(n_idx);
        field_state.l_items.insert(position - 1, item_state);
        Ok(())
    }

    fn set_item_show_detail(
        &mut self,
        table: &str,
        field: &str,
        item: &str,
        show: bool,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetItemShowDetail {
            table: table.to_string(),
            field: field.to_string(),
            item: item.to_string(),
            show,
        });
        self.ensure_live()?;
        let field_state = self.field_mut(table, field)?;
        if !matches!(
            field_state.orientation,
            EnumFieldOrientation::Row | EnumFieldOrientation::Column
        ) {
            return Err(BackendError::Rejected(format!(
                "field `{field}` is not a row or column field"
            )));
        }
        let item_state = field_state
            .l_items
            .iter_mut()
            .find(|i| i.name == item)
            .ok_or_else(|| BackendError::ItemNotFound {
                field: field.to_string(),
                item: item.to_string(),
            })?;
        item_state.if_show_detail = show;
        Ok(())
    }

    fn add_calculated_field(
        &mut self,
        table: &str,
        name: &str,
        formula: &str,
    ) -> Result<DataFieldId, BackendError> {
        self.journal.push(EnumBackendOp::AddCalculatedField {
            table: table.to_string(),
            name: name.to_string(),
            formula: formula.to_string(),
        });
        self.ensure_live()?;
        let invalid = |reason: String| BackendError::InvalidFormula {
            formula: formula.to_string(),
            reason,
        };
        let parsed = parse_formula(formula).map_err(invalid)?;
        let table_state = self.table_mut(table)?;
        for c_ref in parsed.field_refs() {
            if c_ref == name || table_state.field(&c_ref).is_none() {
                return Err(invalid(format!("unknown field `{c_ref}`")));
            }
        }

        match table_state.field_mut(name) {
            Some(existing) if existing.formula.is_none() => {
                return Err(BackendError::Rejected(format!(
                    "`{name}` is already a source field name"
                )));
            }
            Some(existing) => existing.formula = Some(parsed),
            None => table_state.l_fields.push(SpecPivotFieldState {
                name: name.to_string(),
                orientation: EnumFieldOrientation::Hidden,
                position: 0,
                l_items: Vec::new(),
                if_multiple_page_items: false,
                grouping: None,
                formula: Some(parsed),
            }),
        }
        table_state.l_data_fields.push(SpecDataFieldState::new(name));
        Ok(DataFieldId(table_state.l_data_fields.len() - 1))
    }

    fn add_data_field(&mut self, table: &str, field: &str) -> Result<DataFieldId, BackendError> {
        self.journal.push(EnumBackendOp::AddDataField {
            table: table.to_string(),
            field: field.to_string(),
        });
        self.ensure_live()?;
        self.field_mut(table, field)?;
        let table_state = self.table_mut(table)?;
        let mut df = SpecDataFieldState::new(field);
        df.n_order = Some(Self::next_data_order(table_state));
        table_state.l_data_fields.push(df);
        Ok(DataFieldId(table_state.l_data_fields.len() - 1))
    }

    fn set_data_field_orientation(
        &mut self,
        table: &str,
        id: DataFieldId,
        orientation: EnumFieldOrientation,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetDataFieldOrientation {
            table: table.to_string(),
            id: id.0,
            orientation,
        });
        self.ensure_live()?;
        let table_state = self.table_mut(table)?;
        let n_order_next = Self::next_data_order(table_state);
        let df = table_state
            .l_data_fields
            .get_mut(id.0)
            .ok_or(BackendError::DataFieldNotFound(id.0))?;
        match orientation {
            EnumFieldOrientation::Data => {
                if df.n_order.is_none() {
                    df.n_order = Some(n_order_next);
                }
            }
            EnumFieldOrientation::Hidden => df.n_order = None,
            _ => {
                return Err(BackendError::Rejected(
                    "a data field can only be data-oriented or hidden".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn set_data_field_caption(
        &mut self,
        table: &str,
        id: DataFieldId,
        caption: &str,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetDataFieldCaption {
            table: table.to_string(),
            id: id.0,
            caption: caption.to_string(),
        });
        self.ensure_live()?;
        let table_state = self.table_ref(table)?;
        if table_state.l_fields.iter().any(|f| f.name == caption) {
            return Err(BackendError::Rejected(format!(
                "caption `{caption}` clashes with a field name"
            )));
        }
        if table_state
            .l_data_fields
            .iter()
            .enumerate()
            .any(|(n_idx, df)| n_idx != id.0 && df.caption.as_deref() == Some(caption))
        {
            return Err(BackendError::Rejected(format!(
                "caption `{caption}` is already used"
            )));
        }
        self.data_field_mut(table, id)?.caption = Some(caption.to_string());
        Ok(())
    }

    fn set_data_field_calculation(
        &mut self,
        table: &str,
        id: DataFieldId,
        calculation: EnumPivotCalculation,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetDataFieldCalculation {
            table: table.to_string(),
            id: id.0,
            calculation,
        });
        self.ensure_live()?;
        self.data_field_mut(table, id)?.calculation = calculation;
        Ok(())
    }

    fn set_data_field_function(
        &mut self,
        table: &str,
        id: DataFieldId,
        function: EnumConsolidationFunction,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetDataFieldFunction {
            table: table.to_string(),
            id: id.0,
            function,
        });
        self.ensure_live()?;
        self.data_field_mut(table, id)?.function = function;
        Ok(())
    }

    fn set_data_field_number_format(
        &mut self,
        table: &str,
        id: DataFieldId,
        number_format: &str,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetDataFieldNumberFormat {
            table: table.to_string(),
            id: id.0,
            number_format: number_format.to_string(),
        });
        self.ensure_live()?;
        self.data_field_mut(table, id)?.number_format = Some(number_format.to_string());
        Ok(())
    }

    fn group_field_at(
        &mut self,
        sheet: &str,
        cell: SpecCellRef,
        period: EnumGroupingPeriod,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::GroupFieldAt {
            sheet: sheet.to_string(),
            cell,
            period,
        });
        self.ensure_live()?;
        let reject = || BackendError::Rejected("cannot group that selection".to_string());
        let view = self.pivot_view(sheet).ok_or_else(reject)?;
        let table_state = self.pivot_table_on(sheet).ok_or_else(reject)?;
        if cell.col != table_state.anchor.col || cell.row < view.n_row_first_body {
            return Err(reject());
        }
        let n_depth = *view
            .l_body_depths
            .get((cell.row - view.n_row_first_body) as usize)
            .ok_or_else(reject)?;
        let c_field = table_state
            .fields_oriented(EnumFieldOrientation::Row)
            .get(n_depth)
            .map(|f| f.name.clone())
            .ok_or_else(reject)?;
        let cache = self
            .l_caches
            .get(table_state.n_cache)
            .ok_or(BackendError::CacheNotFound(table_state.n_cache))?;
        if !is_date_field(cache, &c_field) {
            return Err(reject());
        }
        let l_items = derive_field_items(cache, &c_field, Some(period));
        let c_table = table_state.name.clone();

        let field_state = self.field_mut(&c_table, &c_field)?;
        field_state.grouping = Some(period);
        field_state.l_items = l_items;
        Ok(())
    }

    fn select(
        &mut self,
        sheet: &str,
        first: SpecCellRef,
        last: SpecCellRef,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::Select {
            sheet: sheet.to_string(),
            first,
            last,
        });
        self.ensure_live()?;
        if first.row == 0 || first.col == 0 || last.row < first.row || last.col < first.col {
            return Err(BackendError::InvalidRange {
                range: format!("{first}:{last}"),
                reason: "empty or inverted selection".to_string(),
            });
        }
        let sheet_state = self.sheet_mut(sheet)?;
        sheet_state.active = first;
        sheet_state.selection = (first, last);
        Ok(())
    }

    fn add_conditional_format(
        &mut self,
        sheet: &str,
        format: &SpecConditionalFormat,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::AddConditionalFormat {
            sheet: sheet.to_string(),
            format: format.clone(),
        });
        self.ensure_live()?;
        let sheet_state = self.sheet_mut(sheet)?;
        let (first, last) = sheet_state.selection;
        sheet_state
            .l_conditional_formats
            .push(SpecModelConditionalFormat {
                format: format.clone(),
                first,
                last,
            });
        Ok(())
    }

    fn freeze_panes(&mut self, sheet: &str) -> Result<(), BackendError> {
        self.journal
            .push(EnumBackendOp::FreezePanes(sheet.to_string()));
        self.ensure_live()?;
        let sheet_state = self.sheet_mut(sheet)?;
        sheet_state.freeze = Some(sheet_state.active);
        Ok(())
    }

    fn set_column_width(&mut self, sheet: &str, col: u32, width: f64) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetColumnWidth {
            sheet: sheet.to_string(),
            col,
            width,
        });
        self.ensure_live()?;
        if col == 0 || !(0.0..=255.0).contains(&width) {
            return Err(BackendError::Rejected(format!(
                "invalid column width {width} for column {col}"
            )));
        }
        self.sheet_mut(sheet)?.dict_col_widths.insert(col, width);
        Ok(())
    }

    fn set_row_wrap_autofit(&mut self, sheet: &str, row: u32) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::SetRowWrapAutofit {
            sheet: sheet.to_string(),
            row,
        });
        self.ensure_live()?;
        if row == 0 {
            return Err(BackendError::InvalidPosition(0));
        }
        self.sheet_mut(sheet)?.set_rows_wrapped.insert(row);
        Ok(())
    }

    fn add_chart(
        &mut self,
        sheet: &str,
        placement: SpecChartPlacement,
    ) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::AddChart {
            sheet: sheet.to_string(),
            placement,
        });
        self.ensure_live()?;
        let view = self.pivot_view(sheet);
        let if_has_data = view.as_ref().is_some_and(|v| {
            !v.l_data_columns.is_empty() && !v.l_body_depths.is_empty()
        });
        if !if_has_data {
            return Err(BackendError::Rejected(format!(
                "sheet `{sheet}` has no pivot data to chart"
            )));
        }
        let sheet_state = self.sheet_mut(sheet)?;
        let anchor = sheet_state.active;
        sheet_state.l_charts.push(SpecModelChart { anchor, placement });
        Ok(())
    }

    fn save(&mut self, path: &Path) -> Result<(), BackendError> {
        self.journal.push(EnumBackendOp::Save(path.to_path_buf()));
        self.ensure_live()?;
        write_workbook(self, path)
    }

    fn release(&mut self) {
        if self.if_released {
            return;
        }
        self.journal.push(EnumBackendOp::Release);
        self.if_released = true;
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Factory

/// Hands out fresh [`WorkbookModel`]s sharing one journal.
#[derive(Debug, Clone)]
pub struct WorkbookModelFactory {
    journal: BackendJournal,
    formats: SpecWorkbookFormats,
}

impl Default for WorkbookModelFactory {
    fn default() -> Self {
        Self {
            journal: BackendJournal::new(),
            formats: derive_default_workbook_formats(),
        }
    }
}

impl WorkbookModelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: BackendJournal) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_formats(mut self, formats: SpecWorkbookFormats) -> Self {
        self.formats = formats;
        self
    }

    pub fn journal(&self) -> &BackendJournal {
        &self.journal
    }
}

impl BackendFactory for WorkbookModelFactory {
    fn acquire(&self) -> Result<Box<dyn PivotBackend>, BackendError> {
        Ok(Box::new(
            WorkbookModel::new()
                .with_journal(self.journal.clone())
                .with_formats(self.formats.clone()),
        ))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn derive_model_with_data() -> WorkbookModel {
        let mut model = WorkbookModel::new();
        let rows = vec![
            vec!["region".into(), "year".into(), "sales".into()],
            vec!["North".into(), 2023_i64.into(), 10.0.into()],
            vec!["South".into(), 2023_i64.into(), 20.0.into()],
            vec!["North".into(), 2024_i64.into(), 30.0.into()],
        ];
        model
            .write_grid(C_SHEET_NAME_DEFAULT, SpecCellRef::new(1, 1), &rows)
            .expect("write");
        model
    }

    fn derive_model_with_pivot() -> WorkbookModel {
        let mut model = derive_model_with_data();
        let range = SpecCellRange::parse("Sheet1!A1:C4", "Sheet1").expect("range");
        let cache = model.create_pivot_cache(&range).expect("cache");
        model.add_sheet("pivot").expect("sheet");
        model
            .create_pivot_table(cache, "pivot", SpecCellRef::new(1, 1), "pivot")
            .expect("table");
        model
    }

    #[test]
    fn test_last_filled_row_and_col() {
        let model = derive_model_with_data();
        assert_eq!(model.last_filled_row("Sheet1", 1).expect("row"), 4);
        assert_eq!(model.last_filled_col("Sheet1", 1).expect("col"), 3);
        assert_eq!(model.last_filled_row("Sheet1", 9).expect("row"), 1);
    }

    #[test]
    fn test_add_sheet_rejects_duplicates_and_bad_names() {
        let mut model = WorkbookModel::new();
        model.add_sheet("pivot").expect("add");
        assert!(matches!(
            model.add_sheet("PIVOT"),
            Err(BackendError::SheetExists(_))
        ));
        assert!(matches!(
            model.add_sheet("a:b"),
            Err(BackendError::InvalidSheetName { .. })
        ));
        assert_eq!(model.sheet_names(), vec!["Sheet1", "pivot"]);
    }

    #[test]
    fn test_cache_requires_header_cells() {
        let mut model = derive_model_with_data();
        let range = SpecCellRange::parse("Sheet1!A1:E4", "Sheet1").expect("range");
        assert!(matches!(
            model.create_pivot_cache(&range),
            Err(BackendError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let mut model = derive_model_with_pivot();
        assert!(matches!(
            model.set_field_orientation("pivot", "missing", EnumFieldOrientation::Row),
            Err(BackendError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn test_last_visible_item_cannot_be_hidden() {
        let mut model = derive_model_with_pivot();
        model
            .set_field_orientation("pivot", "region", EnumFieldOrientation::Column)
            .expect("orient");
        model
            .set_item_visible("pivot", "region", "North", false)
            .expect("hide north");
        assert!(matches!(
            model.set_item_visible("pivot", "region", "South", false),
            Err(BackendError::Rejected(_))
        ));
    }

    #[test]
    fn test_page_items_need_multiple_selection() {
        let mut model = derive_model_with_pivot();
        model
            .set_field_orientation("pivot", "year", EnumFieldOrientation::Page)
            .expect("orient");
        assert!(model.set_item_visible("pivot", "year", "2023", false).is_err());
        model
            .set_multiple_page_items("pivot", "year", true)
            .expect("enable");
        model
            .set_item_visible("pivot", "year", "2023", false)
            .expect("hide");
    }

    #[test]
    fn test_caption_matching_field_name_is_rejected() {
        let mut model = derive_model_with_pivot();
        let id = model.add_data_field("pivot", "sales").expect("data field");
        assert!(model.set_data_field_caption("pivot", id, "sales").is_err());
        model
            .set_data_field_caption("pivot", id, "sales ")
            .expect("caption with trailing space");
    }

    #[test]
    fn test_calculated_field_validates_refs() {
        let mut model = derive_model_with_pivot();
        assert!(matches!(
            model.add_calculated_field("pivot", "bad", "= sales / nothing"),
            Err(BackendError::InvalidFormula { .. })
        ));
        assert!(matches!(
            model.add_calculated_field("pivot", "sales", "= year * 2"),
            Err(BackendError::Rejected(_))
        ));
        let id = model
            .add_calculated_field("pivot", "per_year", "= sales / year")
            .expect("calculated");
        let table = model.pivot_table("pivot").expect("table");
        assert_eq!(table.l_data_fields[id.0].n_order, None);
    }

    #[test]
    fn test_item_position_and_bounds() {
        let mut model = derive_model_with_pivot();
        model
            .set_item_position("pivot", "region", "South", 1)
            .expect("move");
        assert_eq!(
            model.pivot_items("pivot", "region").expect("items"),
            vec!["South", "North"]
        );
        assert!(matches!(
            model.set_item_position("pivot", "region", "South", 3),
            Err(BackendError::InvalidPosition(3))
        ));
    }

    #[test]
    fn test_released_backend_rejects_calls() {
        let mut model = WorkbookModel::new();
        model.release();
        model.release();
        assert!(matches!(model.add_sheet("x"), Err(BackendError::Released)));
        assert_eq!(
            model
                .journal()
                .count_where(|op| matches!(op, EnumBackendOp::Release)),
            1
        );
    }
}

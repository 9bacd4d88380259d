//! Spreadsheet backend capability.
//!
//! The builder and orchestrator talk only to [`PivotBackend`]. Coordinates
//! are 1-based like the spreadsheet object model; handles returned by the
//! backend (`PivotCacheId`, `DataFieldId`) are only valid for that backend.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::spec::{
    BackendError, EnumCellValue, EnumConsolidationFunction, EnumPivotCalculation,
};
use crate::util::{format_a1_cell, parse_a1_range, quote_sheet_name};

////////////////////////////////////////////////////////////////////////////////
// #region Handles

/// 1-based cell coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpecCellRef {
    pub row: u32,
    pub col: u32,
}

impl SpecCellRef {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for SpecCellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_a1_cell(self.row, self.col))
    }
}

/// Rectangular range on a named sheet, inclusive on both corners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecCellRange {
    pub sheet: String,
    pub first: SpecCellRef,
    pub last: SpecCellRef,
}

impl SpecCellRange {
    pub fn new(sheet: impl Into<String>, first: SpecCellRef, last: SpecCellRef) -> Self {
        Self {
            sheet: sheet.into(),
            first,
            last,
        }
    }

    /// Parse `sheet!A1:D11`; a reference without a sheet uses `sheet_default`.
    pub fn parse(text: &str, sheet_default: &str) -> Result<Self, String> {
        let (c_sheet, (n_row_a, n_col_a), (n_row_b, n_col_b)) = parse_a1_range(text)?;
        Ok(Self {
            sheet: c_sheet.unwrap_or_else(|| sheet_default.to_string()),
            first: SpecCellRef::new(n_row_a, n_col_a),
            last: SpecCellRef::new(n_row_b, n_col_b),
        })
    }

    pub fn n_rows(&self) -> u32 {
        self.last.row - self.first.row + 1
    }

    pub fn n_cols(&self) -> u32 {
        self.last.col - self.first.col + 1
    }
}

impl fmt::Display for SpecCellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}!{}:{}",
            quote_sheet_name(&self.sheet),
            self.first,
            self.last
        )
    }
}

/// Pivot cache handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PivotCacheId(pub usize);

/// Data field handle within one pivot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataFieldId(pub usize);

/// Where a pivot field is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumFieldOrientation {
    Hidden,
    Page,
    Row,
    Column,
    Data,
}

/// Date grouping periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumGroupingPeriod {
    /// Fixed-width day buckets.
    Days(u32),
    Months,
}

/// Conditional format rule, colors as BGR integers.
#[derive(Debug, Clone, PartialEq)]
pub enum EnumConditionalRule {
    DataBar {
        color_bar: u32,
        color_negative: u32,
        if_gradient: bool,
    },
    ColorScale3 {
        color_lowest: u32,
        color_midpoint: u32,
        n_midpoint_percentile: u32,
        color_highest: u32,
    },
}

/// Cells a conditional format applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumFormatScope {
    /// The selected cells.
    Selection,
    /// Every body cell of the data field under the selection.
    Field,
}

/// Conditional format request.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecConditionalFormat {
    pub rule: EnumConditionalRule,
    pub scope: EnumFormatScope,
    pub if_first_priority: bool,
}

/// Chart kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumChartKind {
    ClusteredColumn,
}

/// Chart request, anchored at the active cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecChartPlacement {
    pub kind: EnumChartKind,
    pub width: u32,
    pub height: u32,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Capability

/// Spreadsheet object-model operations used to build pivot reports.
///
/// Every operation is fallible and reports its own [`BackendError`]. Calls
/// are idempotent where the object model is (orientation, position,
/// visibility, captions).
pub trait PivotBackend {
    /// Sheet names in workbook order.
    fn sheet_names(&self) -> Vec<String>;
    /// Append a new sheet after the last sheet.
    fn add_sheet(&mut self, name: &str) -> Result<(), BackendError>;
    fn rename_sheet(&mut self, from: &str, to: &str) -> Result<(), BackendError>;
    fn delete_sheet(&mut self, name: &str) -> Result<(), BackendError>;
    /// Copy the first sheet of an external file in as `name`.
    fn copy_sheet_from_file(&mut self, path: &Path, name: &str) -> Result<(), BackendError>;

    /// Write a block of rows with its top-left corner at `origin`.
    fn write_grid(
        &mut self,
        sheet: &str,
        origin: SpecCellRef,
        rows: &[Vec<EnumCellValue>],
    ) -> Result<(), BackendError>;
    /// Last non-empty row in `col`, scanning up from the sheet bottom (1 when empty).
    fn last_filled_row(&self, sheet: &str, col: u32) -> Result<u32, BackendError>;
    /// Last non-empty column in `row`, scanning left from the sheet edge (1 when empty).
    fn last_filled_col(&self, sheet: &str, row: u32) -> Result<u32, BackendError>;
    fn clear_autofilter(&mut self, sheet: &str) -> Result<(), BackendError>;
    /// Register a list table over `range`.
    fn add_table(&mut self, range: &SpecCellRange, name: &str) -> Result<(), BackendError>;

    fn create_pivot_cache(&mut self, source: &SpecCellRange) -> Result<PivotCacheId, BackendError>;
    fn create_pivot_table(
        &mut self,
        cache: PivotCacheId,
        sheet: &str,
        anchor: SpecCellRef,
        name: &str,
    ) -> Result<(), BackendError>;

    /// Item names of a field in current display order.
    fn pivot_items(&self, table: &str, field: &str) -> Result<Vec<String>, BackendError>;
    fn set_field_orientation(
        &mut self,
        table: &str,
        field: &str,
        orientation: EnumFieldOrientation,
    ) -> Result<(), BackendError>;
    fn set_field_position(
        &mut self,
        table: &str,
        field: &str,
        position: usize,
    ) -> Result<(), BackendError>;
    fn set_multiple_page_items(
        &mut self,
        table: &str,
        field: &str,
        enabled: bool,
    ) -> Result<(), BackendError>;
    fn set_item_visible(
        &mut self,
        table: &str,
        field: &str,
        item: &str,
        visible: bool,
    ) -> Result<(), BackendError>;
    fn set_item_position(
        &mut self,
        table: &str,
        field: &str,
        item: &str,
        position: usize,
    ) -> Result<(), BackendError>;
    fn set_item_show_detail(
        &mut self,
        table: &str,
        field: &str,
        item: &str,
        show: bool,
    ) -> Result<(), BackendError>;

    /// Define a calculated field and return its (not yet oriented) data field.
    fn add_calculated_field(
        &mut self,
        table: &str,
        name: &str,
        formula: &str,
    ) -> Result<DataFieldId, BackendError>;
    /// Create a data field aggregating a source field.
    fn add_data_field(&mut self, table: &str, field: &str) -> Result<DataFieldId, BackendError>;
    fn set_data_field_orientation(
        &mut self,
        table: &str,
        id: DataFieldId,
        orientation: EnumFieldOrientation,
    ) -> Result<(), BackendError>;
    fn set_data_field_caption(
        &mut self,
        table: &str,
        id: DataFieldId,
        caption: &str,
    ) -> Result<(), BackendError>;
    fn set_data_field_calculation(
        &mut self,
        table: &str,
        id: DataFieldId,
        calculation: EnumPivotCalculation,
    ) -> Result<(), BackendError>;
    fn set_data_field_function(
        &mut self,
        table: &str,
        id: DataFieldId,
        function: EnumConsolidationFunction,
    ) -> Result<(), BackendError>;
    fn set_data_field_number_format(
        &mut self,
        table: &str,
        id: DataFieldId,
        number_format: &str,
    ) -> Result<(), BackendError>;

    /// Group the row field under `cell` by date period.
    fn group_field_at(
        &mut self,
        sheet: &str,
        cell: SpecCellRef,
        period: EnumGroupingPeriod,
    ) -> Result<(), BackendError>;

    /// Select `first..=last`; the active cell becomes `first`.
    fn select(&mut self, sheet: &str, first: SpecCellRef, last: SpecCellRef)
    -> Result<(), BackendError>;
    /// Add a conditional format over the current selection.
    fn add_conditional_format(
        &mut self,
        sheet: &str,
        format: &SpecConditionalFormat,
    ) -> Result<(), BackendError>;
    /// Freeze rows above and columns left of the active cell.
    fn freeze_panes(&mut self, sheet: &str) -> Result<(), BackendError>;
    fn set_column_width(&mut self, sheet: &str, col: u32, width: f64) -> Result<(), BackendError>;
    /// Wrap text in `row` and fit its height to the content.
    fn set_row_wrap_autofit(&mut self, sheet: &str, row: u32) -> Result<(), BackendError>;
    /// Insert a chart of the sheet's pivot data at the active cell.
    fn add_chart(&mut self, sheet: &str, placement: SpecChartPlacement)
    -> Result<(), BackendError>;

    fn save(&mut self, path: &Path) -> Result<(), BackendError>;
    /// Release the underlying application or resources. Safe to call twice.
    fn release(&mut self);
}

/// Creates backend instances on the thread that will use them.
pub trait BackendFactory: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn PivotBackend>, BackendError>;
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Journal

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum EnumBackendOp {
    AddSheet(String),
    RenameSheet { from: String, to: String },
    DeleteSheet(String),
    CopySheetFromFile { path: PathBuf, name: String },
    WriteGrid { sheet: String, origin: SpecCellRef, n_rows: usize },
    ClearAutofilter(String),
    AddTable { range: String, name: String },
    CreatePivotCache(String),
    CreatePivotTable { sheet: String, name: String },
    SetFieldOrientation { table: String, field: String, orientation: EnumFieldOrientation },
    SetFieldPosition { table: String, field: String, position: usize },
    SetMultiplePageItems { table: String, field: String, enabled: bool },
    SetItemVisible { table: String, field: String, item: String, visible: bool },
    SetItemPosition { table: String, field: String, item: String, position: usize },
    SetItemShowDetail { table: String, field: String, item: String, show: bool },
    AddCalculatedField { table: String, name: String, formula: String },
    AddDataField { table: String, field: String },
    SetDataFieldOrientation { table: String, id: usize, orientation: EnumFieldOrientation },
    SetDataFieldCaption { table: String, id: usize, caption: String },
    SetDataFieldCalculation { table: String, id: usize, calculation: EnumPivotCalculation },
    SetDataFieldFunction { table: String, id: usize, function: EnumConsolidationFunction },
    SetDataFieldNumberFormat { table: String, id: usize, number_format: String },
    GroupFieldAt { sheet: String, cell: SpecCellRef, period: EnumGroupingPeriod },
    Select { sheet: String, first: SpecCellRef, last: SpecCellRef },
    AddConditionalFormat { sheet: String, format: SpecConditionalFormat },
    FreezePanes(String),
    SetColumnWidth { sheet: String, col: u32, width: f64 },
    SetRowWrapAutofit { sheet: String, row: u32 },
    AddChart { sheet: String, placement: SpecChartPlacement },
    Save(PathBuf),
    Release,
}

/// Shared, append-only log of backend calls.
#[derive(Debug, Clone, Default)]
pub struct BackendJournal(Arc<Mutex<Vec<EnumBackendOp>>>);

impl BackendJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, op: EnumBackendOp) {
        tracing::trace!(?op, "backend call");
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(op);
    }

    pub fn snapshot(&self) -> Vec<EnumBackendOp> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count_where(&self, predicate: impl Fn(&EnumBackendOp) -> bool) -> usize {
        self.snapshot().iter().filter(|op| predicate(op)).count()
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

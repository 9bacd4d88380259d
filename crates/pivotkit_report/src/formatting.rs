//! Conditional formatting of pivot value columns.

use crate::backend::{
    EnumConditionalRule, EnumFormatScope, PivotBackend, SpecCellRef, SpecConditionalFormat,
};
use crate::conf::{
    N_COLOR_DATA_BAR, N_COLOR_DATA_BAR_NEGATIVE, N_COLOR_SCALE_GREEN,
    N_COLOR_SCALE_MIDPOINT_PERCENTILE, N_COLOR_SCALE_RED, N_COLOR_SCALE_YELLOW,
};
use crate::spec::{BackendError, EnumConditionalFormatting};

/// Apply `mode` to the value column starting at (`row`, `col`) of `sheet`.
///
/// Bars cover the body rows down to the row above the grand total; color
/// scales are attached to the whole data field. The selection is reset to
/// `A1` afterwards.
pub fn apply_conditional_formatting(
    backend: &mut dyn PivotBackend,
    sheet: &str,
    row: u32,
    col: u32,
    mode: EnumConditionalFormatting,
) -> Result<(), BackendError> {
    let cell_first = SpecCellRef::new(row, col);
    match mode {
        EnumConditionalFormatting::None => return Ok(()),
        EnumConditionalFormatting::Bars => {
            let n_row_total = backend.last_filled_row(sheet, 1)?;
            let n_row_last = n_row_total.saturating_sub(1).max(row);
            backend.select(sheet, cell_first, SpecCellRef::new(n_row_last, col))?;
            backend.add_conditional_format(
                sheet,
                &SpecConditionalFormat {
                    rule: EnumConditionalRule::DataBar {
                        color_bar: N_COLOR_DATA_BAR,
                        color_negative: N_COLOR_DATA_BAR_NEGATIVE,
                        if_gradient: true,
                    },
                    scope: EnumFormatScope::Selection,
                    if_first_priority: true,
                },
            )?;
        }
        EnumConditionalFormatting::MaxIsGreen | EnumConditionalFormatting::MaxIsRed => {
            let (color_lowest, color_highest) = match mode {
                EnumConditionalFormatting::MaxIsGreen => (N_COLOR_SCALE_RED, N_COLOR_SCALE_GREEN),
                _ => (N_COLOR_SCALE_GREEN, N_COLOR_SCALE_RED),
            };
            backend.select(sheet, cell_first, cell_first)?;
            backend.add_conditional_format(
                sheet,
                &SpecConditionalFormat {
                    rule: EnumConditionalRule::ColorScale3 {
                        color_lowest,
                        color_midpoint: N_COLOR_SCALE_YELLOW,
                        n_midpoint_percentile: N_COLOR_SCALE_MIDPOINT_PERCENTILE,
                        color_highest,
                    },
                    scope: EnumFormatScope::Field,
                    if_first_priority: true,
                },
            )?;
        }
    }
    tracing::debug!(sheet, row, col, ?mode, "conditional formatting applied");
    let cell_a1 = SpecCellRef::new(1, 1);
    backend.select(sheet, cell_a1, cell_a1)
}

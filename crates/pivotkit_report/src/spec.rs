//! Pivot report descriptor models, run options, reports and error types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use indexmap::IndexMap;
use serde::de::value::StrDeserializer;
use serde::de::{Error as _, IntoDeserializer};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::conf::{
    C_CONVERSION_ARROW, C_FILE_EXT_DEFAULT, C_FILE_NAME_DEFAULT, C_FILE_PATH_DEFAULT, FMT_PERCENT_2,
    N_RETRY_ATTEMPTS_DEFAULT, N_RETRY_DELAY_MS_DEFAULT, W_PRICE, W_WEEKS_INTERVAL,
};
use crate::util::calculate_first_data_row;

////////////////////////////////////////////////////////////////////////////////
// #region CellFormat

/// Cell format used when materializing a workbook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SpecCellFormat {
    /// Font family name.
    pub font_name: Option<String>,
    /// Font size in points.
    pub font_size: Option<i64>,
    /// Bold style.
    pub bold: Option<bool>,
    /// Italic style.
    pub italic: Option<bool>,

    /// Horizontal alignment.
    pub align: Option<String>,
    /// Vertical alignment.
    pub valign: Option<String>,
    /// Border style for all sides.
    pub border: Option<i64>,
    /// Text wrap.
    pub text_wrap: Option<bool>,
    /// Indentation level.
    pub indent: Option<u8>,

    /// Top border override.
    pub top: Option<i64>,

    /// Number format code.
    pub num_format: Option<String>,
    /// Background fill color.
    pub bg_color: Option<String>,
    /// Font color.
    pub font_color: Option<String>,
}

impl SpecCellFormat {
    /// Return a new format by overlaying `patch` onto `self`.
    pub fn with_(&self, patch: SpecCellFormat) -> SpecCellFormat {
        self.merge(&patch)
    }

    /// Merge two formats with right-side non-`None` overwrite semantics.
    pub fn merge(&self, other: &SpecCellFormat) -> SpecCellFormat {
        SpecCellFormat {
            font_name: other.font_name.clone().or_else(|| self.font_name.clone()),
            font_size: other.font_size.or(self.font_size),
            bold: other.bold.or(self.bold),
            italic: other.italic.or(self.italic),
            align: other.align.clone().or_else(|| self.align.clone()),
            valign: other.valign.clone().or_else(|| self.valign.clone()),
            border: other.border.or(self.border),
            text_wrap: other.text_wrap.or(self.text_wrap),
            indent: other.indent.or(self.indent),
            top: other.top.or(self.top),
            num_format: other.num_format.clone().or_else(|| self.num_format.clone()),
            bg_color: other.bg_color.clone().or_else(|| self.bg_color.clone()),
            font_color: other.font_color.clone().or_else(|| self.font_color.clone()),
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region CellValues

/// Normalized cell value flowing from sources through the backend to the writer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EnumCellValue {
    /// Missing/blank value.
    #[default]
    None,
    /// Text value.
    String(String),
    /// Numeric value.
    Number(f64),
    /// Boolean value.
    Boolean(bool),
    /// Calendar date without time.
    Date(NaiveDate),
    /// Instant in UTC.
    DateTime(DateTime<Utc>),
    /// Time of day.
    Time(NaiveTime),
}

impl EnumCellValue {
    /// Blank cells and empty strings count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            EnumCellValue::None => true,
            EnumCellValue::String(text) => text.is_empty(),
            _ => false,
        }
    }

    /// Numeric view of the value used by aggregations.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            EnumCellValue::Number(value) if value.is_finite() => Some(*value),
            EnumCellValue::String(text) => {
                text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
            }
            _ => None,
        }
    }
}

impl From<&str> for EnumCellValue {
    fn from(value: &str) -> Self {
        EnumCellValue::String(value.to_string())
    }
}

impl From<String> for EnumCellValue {
    fn from(value: String) -> Self {
        EnumCellValue::String(value)
    }
}

impl From<f64> for EnumCellValue {
    fn from(value: f64) -> Self {
        EnumCellValue::Number(value)
    }
}

impl From<i64> for EnumCellValue {
    fn from(value: i64) -> Self {
        EnumCellValue::Number(value as f64)
    }
}

impl From<bool> for EnumCellValue {
    fn from(value: bool) -> Self {
        EnumCellValue::Boolean(value)
    }
}

impl From<NaiveDate> for EnumCellValue {
    fn from(value: NaiveDate) -> Self {
        EnumCellValue::Date(value)
    }
}

impl From<NaiveTime> for EnumCellValue {
    fn from(value: NaiveTime) -> Self {
        EnumCellValue::Time(value)
    }
}

impl From<DateTime<Utc>> for EnumCellValue {
    fn from(value: DateTime<Utc>) -> Self {
        EnumCellValue::DateTime(value)
    }
}

/// One source row: ordered column name to value.
pub type SpecRecord = IndexMap<String, EnumCellValue>;

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region FieldDescriptors

/// Source column key with optional category selection.
///
/// `selected = None` means no filtering and natural order. When present, the
/// selection controls both visibility and explicit category order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpecFieldSelection {
    /// Source column name.
    pub key: String,
    /// Visible category values in display order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<Vec<String>>,
}

impl SpecFieldSelection {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            selected: None,
        }
    }

    pub fn with_selected<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected = Some(items.into_iter().map(Into::into).collect());
        self
    }
}

/// Page (filter) field. Position defaults to the 1-based order among filters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpecFilterField {
    #[serde(flatten)]
    pub selection: SpecFieldSelection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl SpecFilterField {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            selection: SpecFieldSelection::new(key),
            position: None,
        }
    }

    pub fn with_selected<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = self.selection.with_selected(items);
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// Row field. Deserializes from either a bare key or `{ key, position }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RowFieldRepr")]
pub struct SpecRowField {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RowFieldRepr {
    Key(String),
    Full {
        key: String,
        #[serde(default)]
        position: Option<usize>,
    },
}

impl From<RowFieldRepr> for SpecRowField {
    fn from(repr: RowFieldRepr) -> Self {
        match repr {
            RowFieldRepr::Key(key) => SpecRowField { key, position: None },
            RowFieldRepr::Full { key, position } => SpecRowField { key, position },
        }
    }
}

impl SpecRowField {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            position: None,
        }
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// Column field with category selection and optional position override.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpecColumnField {
    #[serde(flatten)]
    pub selection: SpecFieldSelection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl SpecColumnField {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            selection: SpecFieldSelection::new(key),
            position: None,
        }
    }

    pub fn with_selected<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = self.selection.with_selected(items);
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// Built-in data field calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumPivotCalculation {
    /// Plain aggregate.
    #[default]
    Normal,
    /// Share of the grand total.
    PercentOfTotal,
    /// Share of the row total.
    PercentOfRow,
    /// Share of the column total.
    PercentOfColumn,
    /// Cumulative sum down the rows.
    RunningTotal,
}

impl EnumPivotCalculation {
    /// Whether the calculation yields a ratio.
    pub fn is_percent(self) -> bool {
        matches!(
            self,
            EnumPivotCalculation::PercentOfTotal
                | EnumPivotCalculation::PercentOfRow
                | EnumPivotCalculation::PercentOfColumn
        )
    }
}

/// The `calculated` slot of a value field.
///
/// Text forms: a calculation code (`percent_of_total`), an aggregation code
/// (`count`) or a formula starting with `=`. Anything else is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumValueCalculation {
    /// Data field with a built-in calculation.
    Calculation(EnumPivotCalculation),
    /// Data field with a consolidation function.
    Aggregation(EnumConsolidationFunction),
    /// Calculated field defined by an expression over other fields.
    Formula(String),
}

impl FromStr for EnumValueCalculation {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let c_text = text.trim();
        if c_text.starts_with('=') {
            return Ok(EnumValueCalculation::Formula(c_text.to_string()));
        }
        if let Some(calculation) = parse_code::<EnumPivotCalculation>(c_text) {
            return Ok(EnumValueCalculation::Calculation(calculation));
        }
        if let Some(function) = parse_code::<EnumConsolidationFunction>(c_text) {
            return Ok(EnumValueCalculation::Aggregation(function));
        }
        Err(ConfigError::UnknownCalculation(text.to_string()))
    }
}

/// Snake-case enum code, e.g. `percent_of_total`.
fn parse_code<'de, T: Deserialize<'de>>(text: &'de str) -> Option<T> {
    let de: StrDeserializer<'de, serde::de::value::Error> = text.into_deserializer();
    T::deserialize(de).ok()
}

impl Serialize for EnumValueCalculation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EnumValueCalculation::Calculation(calculation) => calculation.serialize(serializer),
            EnumValueCalculation::Aggregation(function) => function.serialize(serializer),
            EnumValueCalculation::Formula(text) => serializer.serialize_str(text),
        }
    }
}

impl<'de> Deserialize<'de> for EnumValueCalculation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse::<Self>().map_err(D::Error::custom)
    }
}

/// Aggregate applied to a data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumConsolidationFunction {
    #[default]
    Sum,
    Count,
    Average,
    Max,
    Min,
    Product,
    CountNums,
    StdDev,
    StdDevP,
    Var,
    VarP,
}

impl EnumConsolidationFunction {
    /// Caption prefix in "Sum of x" style.
    pub fn caption_prefix(self) -> &'static str {
        match self {
            EnumConsolidationFunction::Sum => "Sum",
            EnumConsolidationFunction::Count => "Count",
            EnumConsolidationFunction::Average => "Average",
            EnumConsolidationFunction::Max => "Max",
            EnumConsolidationFunction::Min => "Min",
            EnumConsolidationFunction::Product => "Product",
            EnumConsolidationFunction::CountNums => "Count",
            EnumConsolidationFunction::StdDev => "StdDev",
            EnumConsolidationFunction::StdDevP => "StdDevp",
            EnumConsolidationFunction::Var => "Var",
            EnumConsolidationFunction::VarP => "Varp",
        }
    }
}

/// Conditional formatting mode attached to a value field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumConditionalFormatting {
    #[default]
    None,
    /// 3-color scale with the highest value green.
    MaxIsGreen,
    /// 3-color scale with the highest value red.
    MaxIsRed,
    /// Gradient data bars.
    #[serde(alias = "data_bars")]
    Bars,
}

/// Conversion target shown in the conversion key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnumConversionTarget {
    Integer(i64),
    Ratio(f64),
    Label(String),
}

impl fmt::Display for EnumConversionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnumConversionTarget::Integer(value) => write!(f, "{value}"),
            EnumConversionTarget::Ratio(value) => {
                let n_pct = (value * 100.0 * 100.0).round() / 100.0;
                write!(f, "{n_pct}%")
            }
            EnumConversionTarget::Label(value) => f.write_str(value),
        }
    }
}

/// Ratio of two fields, e.g. orders over visits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecConversion {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EnumConversionTarget>,
}

impl SpecConversion {
    /// Field key `"{from} -> {to}"`, with `" [{target}]"` appended when set.
    pub fn derive_key(&self) -> String {
        let key = format!("{}{}{}", self.from, C_CONVERSION_ARROW, self.to);
        match &self.target {
            Some(target) => format!("{key} [{target}]"),
            None => key,
        }
    }

    pub fn derive_formula(&self) -> String {
        format!("= '{}' / '{}'", self.to, self.from)
    }
}

/// Aggregated measure of a pivot report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpecValueField {
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculated: Option<EnumValueCalculation>,
    #[serde(default)]
    pub consolidation_function: EnumConsolidationFunction,
    #[serde(default)]
    pub conditional_formatting: EnumConditionalFormatting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayed_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<SpecConversion>,
}

impl SpecValueField {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.calculated = Some(EnumValueCalculation::Formula(formula.into()));
        self
    }

    pub fn with_calculation(mut self, calculation: EnumPivotCalculation) -> Self {
        self.calculated = Some(EnumValueCalculation::Calculation(calculation));
        self
    }

    pub fn with_function(mut self, function: EnumConsolidationFunction) -> Self {
        self.consolidation_function = function;
        self
    }

    pub fn with_aggregation(mut self, function: EnumConsolidationFunction) -> Self {
        self.calculated = Some(EnumValueCalculation::Aggregation(function));
        self
    }

    pub fn with_conditional_formatting(mut self, mode: EnumConditionalFormatting) -> Self {
        self.conditional_formatting = mode;
        self
    }

    pub fn with_displayed_name(mut self, name: impl Into<String>) -> Self {
        self.displayed_name = Some(name.into());
        self
    }

    pub fn with_number_format(mut self, number_format: impl Into<String>) -> Self {
        self.number_format = Some(number_format.into());
        self
    }

    /// Build a conversion value field; all other attributes resolve from it.
    pub fn conversion(
        from: impl Into<String>,
        to: impl Into<String>,
        target: Option<EnumConversionTarget>,
    ) -> Self {
        Self {
            conversion: Some(SpecConversion {
                from: from.into(),
                to: to.into(),
                target,
            }),
            ..Default::default()
        }
    }

    /// Effective field with conversion attributes filled in.
    ///
    /// Explicitly set attributes take precedence over derived ones. The
    /// descriptor itself is never mutated.
    pub fn resolve(&self) -> SpecValueField {
        let Some(conversion) = &self.conversion else {
            return self.clone();
        };
        let key = if self.key.is_empty() {
            conversion.derive_key()
        } else {
            self.key.clone()
        };
        SpecValueField {
            calculated: self
                .calculated
                .clone()
                .or_else(|| Some(EnumValueCalculation::Formula(conversion.derive_formula()))),
            consolidation_function: self.consolidation_function,
            conditional_formatting: self.conditional_formatting,
            displayed_name: self.displayed_name.clone().or_else(|| Some(key.clone())),
            number_format: self
                .number_format
                .clone()
                .or_else(|| Some(FMT_PERCENT_2.to_string())),
            conversion: None,
            key,
        }
    }

    /// Consolidation function in effect: an aggregation code in `calculated`
    /// overrides `consolidation_function`.
    pub fn derive_function(&self) -> EnumConsolidationFunction {
        match &self.calculated {
            Some(EnumValueCalculation::Aggregation(function)) => *function,
            _ => self.consolidation_function,
        }
    }

    /// Formula text when the field is a calculated field.
    pub fn formula(&self) -> Option<&str> {
        match &self.calculated {
            Some(EnumValueCalculation::Formula(text)) => Some(text),
            _ => None,
        }
    }
}

/// Grouping applied to the first row field after the table is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumGroupingRule {
    /// 7-day buckets starting at the earliest date.
    ByWeeks,
    /// Year and month buckets.
    ByMonths,
}

/// Column width entry: explicit width or a named preset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnumColumnWidth {
    Width(f64),
    Preset(EnumColumnWidthPreset),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumColumnWidthPreset {
    WeeksInterval,
    Price,
}

impl EnumColumnWidth {
    pub fn width(self) -> f64 {
        match self {
            EnumColumnWidth::Width(value) => value,
            EnumColumnWidth::Preset(EnumColumnWidthPreset::WeeksInterval) => W_WEEKS_INTERVAL,
            EnumColumnWidth::Preset(EnumColumnWidthPreset::Price) => W_PRICE,
        }
    }
}

impl From<f64> for EnumColumnWidth {
    fn from(value: f64) -> Self {
        EnumColumnWidth::Width(value)
    }
}

fn default_pivot_sheet() -> String {
    "pivot".to_string()
}

fn default_true() -> bool {
    true
}

/// Declarative description of one pivot sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecPivotReport {
    #[serde(default = "default_pivot_sheet")]
    pub sheet: String,
    /// A1 source range override, e.g. `data!A1:D11`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub filters: Vec<SpecFilterField>,
    #[serde(default)]
    pub rows: Vec<SpecRowField>,
    #[serde(default)]
    pub cols: Vec<SpecColumnField>,
    #[serde(default)]
    pub values: Vec<SpecValueField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_function: Option<EnumGroupingRule>,
    /// Collapse the first row field (needs two or more row fields).
    #[serde(default = "default_true")]
    pub collide: bool,
    #[serde(default = "default_true")]
    pub freeze_panes: bool,
    #[serde(default)]
    pub col_width: Vec<EnumColumnWidth>,
    /// Insert a clustered column chart.
    #[serde(default)]
    pub graph: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_data_row: Option<u32>,
}

impl Default for SpecPivotReport {
    fn default() -> Self {
        Self {
            sheet: default_pivot_sheet(),
            source: None,
            filters: Vec::new(),
            rows: Vec::new(),
            cols: Vec::new(),
            values: Vec::new(),
            group_function: None,
            collide: true,
            freeze_panes: true,
            col_width: Vec::new(),
            graph: false,
            first_data_row: None,
        }
    }
}

impl SpecPivotReport {
    pub fn new(sheet: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            ..Default::default()
        }
    }

    /// First pivot body row: override, else `filters + 3` with filters, else 2.
    pub fn first_data_row(&self) -> u32 {
        self.first_data_row
            .unwrap_or_else(|| calculate_first_data_row(self.filters.len()))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region RunOptions

/// Delay growth between acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumBackoff {
    #[default]
    Fixed,
    Exponential,
}

/// Bounded retry for backend acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecRetryPolicy {
    pub attempts_max: usize,
    pub delay_ms: u64,
    pub backoff: EnumBackoff,
}

impl Default for SpecRetryPolicy {
    fn default() -> Self {
        Self {
            attempts_max: N_RETRY_ATTEMPTS_DEFAULT,
            delay_ms: N_RETRY_DELAY_MS_DEFAULT,
            backoff: EnumBackoff::Fixed,
        }
    }
}

impl SpecRetryPolicy {
    /// Delay after the failed attempt `n_attempt` (1-based).
    pub fn delay_after(&self, n_attempt: usize) -> Duration {
        let n_ms = match self.backoff {
            EnumBackoff::Fixed => self.delay_ms,
            EnumBackoff::Exponential => {
                let n_shift = n_attempt.saturating_sub(1).min(16) as u32;
                self.delay_ms.saturating_mul(1_u64 << n_shift)
            }
        };
        Duration::from_millis(n_ms)
    }
}

fn default_file_name() -> String {
    C_FILE_NAME_DEFAULT.to_string()
}

fn default_file_ext() -> String {
    C_FILE_EXT_DEFAULT.to_string()
}

fn default_file_path() -> PathBuf {
    PathBuf::from(C_FILE_PATH_DEFAULT)
}

/// One report run: output location, retry policy and pivot sheets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecReportConfig {
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_file_ext")]
    pub file_ext: String,
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,
    /// External source file whose first sheet becomes the `data` sheet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer_file: Option<PathBuf>,
    #[serde(default)]
    pub retry: SpecRetryPolicy,
    #[serde(default)]
    pub pivots: Vec<SpecPivotReport>,
}

impl Default for SpecReportConfig {
    fn default() -> Self {
        Self {
            file_name: default_file_name(),
            file_ext: default_file_ext(),
            file_path: default_file_path(),
            outer_file: None,
            retry: SpecRetryPolicy::default(),
            pivots: Vec::new(),
        }
    }
}

impl SpecReportConfig {
    /// `{file_path}/{file_name}.{file_ext}`.
    pub fn path_file_out(&self) -> PathBuf {
        let c_ext = self.file_ext.trim_start_matches('.');
        let c_ext = if c_ext.is_empty() { C_FILE_EXT_DEFAULT } else { c_ext };
        self.file_path.join(format!("{}.{}", self.file_name, c_ext))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ReportOutcome

/// Builder step a warning was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumBuildStep {
    Filter,
    Row,
    Column,
    Value,
    ConditionalFormatting,
    Grouping,
    Collapse,
    FreezePanes,
    ColumnWidth,
    Chart,
}

impl fmt::Display for EnumBuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c_name = match self {
            EnumBuildStep::Filter => "filter",
            EnumBuildStep::Row => "row",
            EnumBuildStep::Column => "column",
            EnumBuildStep::Value => "value",
            EnumBuildStep::ConditionalFormatting => "conditional_formatting",
            EnumBuildStep::Grouping => "grouping",
            EnumBuildStep::Collapse => "collapse",
            EnumBuildStep::FreezePanes => "freeze_panes",
            EnumBuildStep::ColumnWidth => "column_width",
            EnumBuildStep::Chart => "chart",
        };
        f.write_str(c_name)
    }
}

/// Non-fatal failure recorded while building a pivot sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecBuildWarning {
    pub sheet: String,
    pub step: EnumBuildStep,
    pub field: Option<String>,
    pub item: Option<String>,
    pub message: String,
}

impl fmt::Display for SpecBuildWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.sheet, self.step)?;
        if let Some(field) = &self.field {
            write!(f, " field `{field}`")?;
        }
        if let Some(item) = &self.item {
            write!(f, " item `{item}`")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Per-sheet build report.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SpecPivotBuildReport {
    pub sheet_name: String,
    pub first_data_row: u32,
    /// Value fields that made it into the table as data fields.
    pub n_data_fields: usize,
    pub warnings: Vec<SpecBuildWarning>,
}

impl SpecPivotBuildReport {
    /// Record a warning and log it.
    pub fn warn(
        &mut self,
        step: EnumBuildStep,
        field: Option<&str>,
        item: Option<&str>,
        msg: impl AsRef<str>,
    ) {
        let warning = SpecBuildWarning {
            sheet: self.sheet_name.clone(),
            step,
            field: field.map(str::to_string),
            item: item.map(str::to_string),
            message: msg.as_ref().to_string(),
        };
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }
}

/// A sheet that failed fatally; the batch continued without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecSheetFailure {
    pub sheet: String,
    pub message: String,
}

/// How a report run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EnumReportStatus {
    /// Workbook written to the given path.
    Saved(PathBuf),
    /// Stopped by the progress sink; nothing was saved.
    Cancelled,
}

/// Result of a report run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecReportOutcome {
    pub status: EnumReportStatus,
    pub sheets: Vec<SpecPivotBuildReport>,
    pub failures: Vec<SpecSheetFailure>,
    /// Backend acquisition attempts used.
    pub n_attempts: usize,
}

impl SpecReportOutcome {
    pub fn n_warnings(&self) -> usize {
        self.sheets.iter().map(|s| s.warnings.len()).sum()
    }

    pub fn path_saved(&self) -> Option<&PathBuf> {
        match &self.status {
            EnumReportStatus::Saved(path) => Some(path),
            EnumReportStatus::Cancelled => None,
        }
    }
}

impl fmt::Display for SpecReportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            EnumReportStatus::Saved(path) => writeln!(f, "Saved: {}", path.display())?,
            EnumReportStatus::Cancelled => writeln!(f, "Cancelled")?,
        }
        writeln!(
            f,
            "Sheets: {} built, {} failed, {} warnings",
            self.sheets.len(),
            self.failures.len(),
            self.n_warnings()
        )?;
        for failure in &self.failures {
            writeln!(f, "  failed [{}]: {}", failure.sheet, failure.message)?;
        }
        for sheet in &self.sheets {
            for warning in &sheet.warnings {
                writeln!(f, "  warning {warning}")?;
            }
        }
        Ok(())
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Errors

/// Failure of a single backend operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sheet not found: {0}")]
    SheetNotFound(String),
    #[error("sheet already exists: {0}")]
    SheetExists(String),
    #[error("invalid sheet name `{name}`: {reason}")]
    InvalidSheetName { name: String, reason: String },
    #[error("pivot table not found: {0}")]
    TableNotFound(String),
    #[error("field `{field}` not found in pivot table `{table}`")]
    FieldNotFound { table: String, field: String },
    #[error("item `{item}` not found in field `{field}`")]
    ItemNotFound { field: String, item: String },
    #[error("data field handle {0} is not valid")]
    DataFieldNotFound(usize),
    #[error("pivot cache handle {0} is not valid")]
    CacheNotFound(usize),
    #[error("invalid range `{range}`: {reason}")]
    InvalidRange { range: String, reason: String },
    #[error("invalid formula `{formula}`: {reason}")]
    InvalidFormula { formula: String, reason: String },
    #[error("invalid position {0}")]
    InvalidPosition(usize),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("backend was already released")]
    Released,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("source read failed: {0}")]
    Source(#[from] SourceError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("xlsx write failed: {0}")]
    XlsxWrite(#[from] rust_xlsxwriter::XlsxError),
}

/// Fatal failure while building one pivot sheet.
#[derive(Debug, Error)]
pub enum PivotBuildError {
    #[error("cannot create sheet `{sheet}`: {source}")]
    SheetCreation {
        sheet: String,
        #[source]
        source: BackendError,
    },
    #[error("invalid source range `{range}`: {reason}")]
    SourceRange { range: String, reason: String },
    #[error("cannot create pivot cache for `{sheet}`: {source}")]
    CacheCreation {
        sheet: String,
        #[source]
        source: BackendError,
    },
    #[error("cannot create pivot table `{sheet}`: {source}")]
    TableCreation {
        sheet: String,
        #[source]
        source: BackendError,
    },
}

/// Failure to locate or read tabular source data.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no source file found for `{0}` (tried raw, .xlsx, .xls, .csv)")]
    UnknownFileFormat(PathBuf),
    #[error("source `{0}` has no header row")]
    Empty(PathBuf),
    #[error("record set is empty")]
    NoRecords,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("polars read failed: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
    #[error("spreadsheet read failed: {0}")]
    Spreadsheet(#[from] calamine::Error),
}

/// Failure to load a report configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config extension for `{0}` (expected .yaml, .yml or .json)")]
    UnknownExtension(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML config error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON config error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(
        "unknown value calculation `{0}` (expected a calculation code, an aggregation code or a formula starting with `=`)"
    )]
    UnknownCalculation(String),
}

/// Failure of a whole report run.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("backend unavailable after {attempts} attempt(s): {last}")]
    BackendUnavailable { attempts: usize, last: BackendError },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{step} failed: {source}")]
    Backend {
        step: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("cannot create output directory `{path}`: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("report worker panicked")]
    WorkerPanicked,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_data_row_defaults_and_override() {
        let mut report = SpecPivotReport::new("p");
        assert_eq!(report.first_data_row(), 2);

        report.filters = vec![SpecFilterField::new("a"), SpecFilterField::new("b")];
        assert_eq!(report.first_data_row(), 5);

        report.first_data_row = Some(9);
        assert_eq!(report.first_data_row(), 9);
    }

    #[test]
    fn test_conversion_resolves_without_mutating_descriptor() {
        let field = SpecValueField::conversion(
            "visits",
            "orders",
            Some(EnumConversionTarget::Ratio(0.125)),
        );
        let resolved = field.resolve();

        assert_eq!(resolved.key, "visits -> orders [12.5%]");
        assert_eq!(resolved.formula(), Some("= 'orders' / 'visits'"));
        assert_eq!(resolved.number_format.as_deref(), Some(FMT_PERCENT_2));
        assert_eq!(
            resolved.displayed_name.as_deref(),
            Some("visits -> orders [12.5%]")
        );
        assert!(field.key.is_empty());
        assert!(field.conversion.is_some());
    }

    #[test]
    fn test_conversion_explicit_fields_win() {
        let mut field = SpecValueField::conversion("a", "b", None);
        field.number_format = Some("0%".to_string());
        field.displayed_name = Some("CR".to_string());
        let resolved = field.resolve();

        assert_eq!(resolved.key, "a -> b");
        assert_eq!(resolved.number_format.as_deref(), Some("0%"));
        assert_eq!(resolved.displayed_name.as_deref(), Some("CR"));
    }

    #[test]
    fn test_value_field_calculated_deserializes_code_before_formula() {
        let field: SpecValueField =
            serde_json::from_str(r#"{"key":"sales","calculated":"percent_of_total"}"#)
                .expect("parse");
        assert_eq!(
            field.calculated,
            Some(EnumValueCalculation::Calculation(
                EnumPivotCalculation::PercentOfTotal
            ))
        );

        let field: SpecValueField =
            serde_json::from_str(r#"{"key":"margin","calculated":"= profit / sales"}"#)
                .expect("parse");
        assert_eq!(field.formula(), Some("= profit / sales"));
    }

    #[test]
    fn test_value_field_aggregation_code_is_not_a_formula() {
        let field: SpecValueField = serde_json::from_str(
            r#"{"key":"sales","calculated":"count","consolidation_function":"max"}"#,
        )
        .expect("parse");
        assert_eq!(
            field.calculated,
            Some(EnumValueCalculation::Aggregation(
                EnumConsolidationFunction::Count
            ))
        );
        assert_eq!(field.formula(), None);
        assert_eq!(field.derive_function(), EnumConsolidationFunction::Count);

        let err = serde_json::from_str::<SpecValueField>(r#"{"key":"x","calculated":"bogus"}"#)
            .expect_err("rejected");
        assert!(err.to_string().contains("bogus"), "{err}");
        assert!(matches!(
            "profit / sales".parse::<EnumValueCalculation>(),
            Err(ConfigError::UnknownCalculation(_))
        ));
    }

    #[test]
    fn test_row_field_accepts_bare_key() {
        let l_rows: Vec<SpecRowField> =
            serde_json::from_str(r#"["region", {"key": "city", "position": 1}]"#).expect("parse");
        assert_eq!(l_rows[0], SpecRowField::new("region"));
        assert_eq!(l_rows[1], SpecRowField::new("city").with_position(1));
    }

    #[test]
    fn test_retry_delay_backoff() {
        let policy = SpecRetryPolicy {
            attempts_max: 4,
            delay_ms: 100,
            backoff: EnumBackoff::Exponential,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));

        let policy = SpecRetryPolicy::default();
        assert_eq!(policy.delay_after(3), Duration::from_millis(2_000));
    }

    #[test]
    fn test_path_file_out_strips_dot_from_extension() {
        let config = SpecReportConfig {
            file_name: "sales".to_string(),
            file_ext: ".xlsx".to_string(),
            file_path: PathBuf::from("out"),
            ..Default::default()
        };
        assert_eq!(config.path_file_out(), PathBuf::from("out").join("sales.xlsx"));
    }
}

//! `pivotkit_report` v1:
//! Pivot-table report generator.
//!
//! Module layout:
//! - `conf`       : constants, colors, number formats and presets
//! - `spec`       : descriptors, run options, outcomes and errors
//! - `util`       : pure helper functions (A1 refs, dates, labels)
//! - `backend`    : spreadsheet capability trait and call journal
//! - `engine`     : pivot cache/table state and view computation
//! - `formula`    : calculated-field formula parser and evaluator
//! - `model`      : in-memory workbook backend
//! - `writer`     : xlsx writer for the in-memory workbook
//! - `source`     : record sets and external source files
//! - `progress`   : progress events and cancellation
//! - `formatting` : conditional formatting of value columns
//! - `builder`    : per-sheet pivot builder
//! - `config`     : YAML/JSON report configuration
//! - `report`     : run orchestration
pub mod backend;
pub mod builder;
pub mod conf;
pub mod config;
pub mod engine;
pub mod formatting;
pub mod formula;
pub mod model;
pub mod progress;
pub mod report;
pub mod source;
pub mod spec;
pub mod util;
pub mod writer;

pub use backend::{
    BackendFactory, BackendJournal, DataFieldId, EnumBackendOp, EnumFieldOrientation,
    PivotBackend, PivotCacheId, SpecCellRange, SpecCellRef,
};
pub use builder::build_pivot;
pub use config::{load_report_config, parse_report_config_json, parse_report_config_yaml};
pub use model::{WorkbookModel, WorkbookModelFactory};
pub use progress::{FlagProgressSink, LogProgressSink, ProgressSink, SpecProgressEvent};
pub use report::{EnumReportSource, join_report, run_report, spawn_report};
pub use source::{SpecSourceTable, read_source_table, resolve_source_file};
pub use spec::{
    BackendError, ConfigError, EnumCellValue, EnumColumnWidth, EnumConditionalFormatting,
    EnumConsolidationFunction, EnumGroupingRule, EnumPivotCalculation, EnumReportStatus,
    EnumValueCalculation, PivotBuildError, ReportError, SourceError, SpecColumnField,
    SpecFilterField, SpecPivotBuildReport, SpecPivotReport, SpecRecord, SpecReportConfig,
    SpecReportOutcome, SpecRetryPolicy, SpecRowField, SpecValueField,
};

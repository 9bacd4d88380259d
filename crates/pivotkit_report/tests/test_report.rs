use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use calamine::{Data, Reader, open_workbook_auto};
use pivotkit_report::spec::EnumBackoff;
use pivotkit_report::{
    BackendError, BackendFactory, BackendJournal, EnumBackendOp, EnumCellValue,
    EnumConsolidationFunction, EnumReportSource, EnumReportStatus, FlagProgressSink,
    PivotBackend, ProgressSink, ReportError, SpecColumnField, SpecPivotReport,
    SpecProgressEvent, SpecRecord, SpecReportConfig, SpecRetryPolicy, SpecRowField,
    SpecValueField, WorkbookModelFactory, join_report, load_report_config, run_report,
    spawn_report,
};

fn derive_sales_records() -> Vec<SpecRecord> {
    [
        ("North", 2023.0, 10.0),
        ("North", 2024.0, 20.0),
        ("South", 2023.0, 5.0),
        ("South", 2024.0, 7.0),
    ]
    .into_iter()
    .map(|(region, year, sales)| {
        let mut record = SpecRecord::new();
        record.insert("region".to_string(), EnumCellValue::from(region));
        record.insert("year".to_string(), EnumCellValue::from(year));
        record.insert("sales".to_string(), EnumCellValue::from(sales));
        record
    })
    .collect()
}

fn derive_region_pivot(sheet: &str) -> SpecPivotReport {
    let mut descriptor = SpecPivotReport::new(sheet);
    descriptor.rows = vec![SpecRowField::new("region")];
    descriptor.values = vec![SpecValueField::new("sales").with_displayed_name("Sales")];
    descriptor
}

fn derive_config(dir: &Path, pivots: Vec<SpecPivotReport>) -> SpecReportConfig {
    SpecReportConfig {
        file_name: "sales".to_string(),
        file_path: dir.join("out"),
        retry: SpecRetryPolicy {
            attempts_max: 3,
            delay_ms: 0,
            backoff: EnumBackoff::Fixed,
        },
        pivots,
        ..Default::default()
    }
}

fn read_cell(path: &Path, sheet: &str, row: u32, col: u32) -> Option<Data> {
    let mut workbook = open_workbook_auto(path).expect("open workbook");
    let range = workbook.worksheet_range(sheet).expect("sheet range");
    range.get_value((row - 1, col - 1)).cloned()
}

/// Counts sheet starts and stops the run after `n_sheets_max` of them.
struct StopAfterSheets {
    n_sheets_max: usize,
    n_sheets: AtomicUsize,
    n_done: AtomicUsize,
}

impl ProgressSink for StopAfterSheets {
    fn emit(&self, event: SpecProgressEvent) {
        if event.if_done {
            self.n_done.fetch_add(1, Ordering::SeqCst);
        }
        if event.n_current.is_none()
            && event
                .message
                .as_deref()
                .is_some_and(|msg| msg.starts_with("Working on sheet:"))
        {
            self.n_sheets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_running(&self) -> bool {
        self.n_sheets.load(Ordering::SeqCst) < self.n_sheets_max
    }
}

struct UnavailableFactory {
    n_calls: AtomicUsize,
}

impl BackendFactory for UnavailableFactory {
    fn acquire(&self) -> Result<Box<dyn PivotBackend>, BackendError> {
        self.n_calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Unavailable("spreadsheet application busy".to_string()))
    }
}

#[test]
fn test_region_year_sales_report_is_saved() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut descriptor = derive_region_pivot("by region");
    descriptor.cols = vec![SpecColumnField::new("year")];
    let config = derive_config(dir.path(), vec![descriptor]);
    let journal = BackendJournal::new();
    let factory = WorkbookModelFactory::new().with_journal(journal.clone());

    let outcome = run_report(
        &factory,
        &config,
        &EnumReportSource::Records(derive_sales_records()),
        None,
    )
    .expect("report");

    let path = dir.path().join("out").join("sales.xlsx");
    assert_eq!(outcome.status, EnumReportStatus::Saved(path.clone()));
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.sheets[0].first_data_row, 2);
    assert_eq!(outcome.sheets[0].n_data_fields, 1);
    assert!(path.exists());

    let workbook = open_workbook_auto(&path).expect("open workbook");
    assert_eq!(
        workbook.sheet_names(),
        vec!["data".to_string(), "by region".to_string()]
    );
    assert_eq!(
        read_cell(&path, "by region", 1, 2),
        Some(Data::String("2023".to_string()))
    );
    assert_eq!(
        read_cell(&path, "by region", 2, 1),
        Some(Data::String("North".to_string()))
    );
    assert_eq!(read_cell(&path, "by region", 2, 4), Some(Data::Float(30.0)));
    assert_eq!(read_cell(&path, "by region", 3, 2), Some(Data::Float(5.0)));
    assert_eq!(read_cell(&path, "by region", 4, 4), Some(Data::Float(42.0)));
    assert_eq!(
        read_cell(&path, "data", 1, 3),
        Some(Data::String("sales".to_string()))
    );

    let l_ops = journal.snapshot();
    assert!(l_ops.contains(&EnumBackendOp::ClearAutofilter("data".to_string())));
    assert!(l_ops.contains(&EnumBackendOp::AddTable {
        range: "data!A1:C5".to_string(),
        name: "DT_Source".to_string(),
    }));
    assert!(l_ops.contains(&EnumBackendOp::FreezePanes("by region".to_string())));
    assert!(matches!(l_ops.last(), Some(EnumBackendOp::Release)));
}

#[test]
fn test_ten_record_scenario_orders_selected_years() {
    let dir = tempfile::tempdir().expect("tempdir");
    let l_records: Vec<SpecRecord> = (0..10)
        .map(|n| {
            let mut record = SpecRecord::new();
            let region = ["North", "South", "East"][n % 3];
            record.insert("region".to_string(), EnumCellValue::from(region));
            let year = if n % 2 == 0 { "2024" } else { "2023" };
            record.insert("year".to_string(), EnumCellValue::from(year));
            record.insert("sales".to_string(), EnumCellValue::from(n as f64 + 1.0));
            record
        })
        .collect();
    let mut descriptor = SpecPivotReport::new("scenario");
    descriptor.rows = vec![SpecRowField::new("region")];
    descriptor.cols = vec![SpecColumnField::new("year").with_selected(["2023", "2024"])];
    descriptor.values = vec![
        SpecValueField::new("sales").with_function(EnumConsolidationFunction::Sum),
    ];
    let config = derive_config(dir.path(), vec![descriptor]);
    let journal = BackendJournal::new();
    let factory = WorkbookModelFactory::new().with_journal(journal.clone());

    let outcome = run_report(&factory, &config, &l_records.into(), None).expect("report");

    assert_eq!(outcome.sheets.len(), 1);
    assert_eq!(outcome.sheets[0].first_data_row, 2);
    assert_eq!(outcome.sheets[0].n_data_fields, 1);
    let l_ops = journal.snapshot();
    let l_positions: Vec<(String, usize)> = l_ops
        .iter()
        .filter_map(|op| match op {
            EnumBackendOp::SetItemPosition { item, position, .. } => {
                Some((item.clone(), *position))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        l_positions,
        vec![("2023".to_string(), 1), ("2024".to_string(), 2)]
    );
    assert_eq!(
        journal.count_where(|op| matches!(op, EnumBackendOp::AddCalculatedField { .. })),
        0
    );
    assert_eq!(
        journal.count_where(|op| matches!(
            op,
            EnumBackendOp::AddDataField { field, .. } if field == "sales"
        )),
        1
    );

    let path = outcome.path_saved().expect("saved");
    assert_eq!(
        read_cell(path, "scenario", 1, 2),
        Some(Data::String("2023".to_string()))
    );
    assert_eq!(
        read_cell(path, "scenario", 1, 3),
        Some(Data::String("2024".to_string()))
    );
    // 1 + 2 + ... + 10
    assert_eq!(read_cell(path, "scenario", 5, 4), Some(Data::Float(55.0)));
}

#[test]
fn test_cancellation_after_three_of_ten_sheets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let l_pivots = (1..=10)
        .map(|n| derive_region_pivot(&format!("p{n}")))
        .collect();
    let config = derive_config(dir.path(), l_pivots);
    let journal = BackendJournal::new();
    let factory = WorkbookModelFactory::new().with_journal(journal.clone());
    let sink = StopAfterSheets {
        n_sheets_max: 3,
        n_sheets: AtomicUsize::new(0),
        n_done: AtomicUsize::new(0),
    };

    let outcome = run_report(
        &factory,
        &config,
        &EnumReportSource::Records(derive_sales_records()),
        Some(&sink),
    )
    .expect("report");

    assert_eq!(outcome.status, EnumReportStatus::Cancelled);
    assert_eq!(outcome.sheets.len(), 3);
    assert_eq!(sink.n_done.load(Ordering::SeqCst), 1);
    assert_eq!(
        journal.count_where(|op| matches!(op, EnumBackendOp::CreatePivotTable { .. })),
        3
    );
    assert_eq!(
        journal.count_where(|op| matches!(op, EnumBackendOp::Save(_))),
        0
    );
    assert_eq!(
        journal.count_where(|op| matches!(op, EnumBackendOp::Release)),
        1
    );
    assert!(!dir.path().join("out").join("sales.xlsx").exists());
}

#[test]
fn test_cancelled_while_loading_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = derive_config(dir.path(), vec![derive_region_pivot("p1")]);
    let sink = FlagProgressSink::new();
    sink.cancel();

    let outcome = run_report(
        &WorkbookModelFactory::new(),
        &config,
        &EnumReportSource::Records(derive_sales_records()),
        Some(&sink),
    )
    .expect("report");
    assert_eq!(outcome.status, EnumReportStatus::Cancelled);
    assert!(outcome.sheets.is_empty());
}

#[test]
fn test_retry_exhaustion_reports_attempts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = derive_config(dir.path(), vec![derive_region_pivot("p1")]);
    let factory = UnavailableFactory {
        n_calls: AtomicUsize::new(0),
    };

    let err = run_report(
        &factory,
        &config,
        &EnumReportSource::Records(derive_sales_records()),
        None,
    )
    .expect_err("no backend");
    assert!(matches!(
        err,
        ReportError::BackendUnavailable {
            attempts: 3,
            last: BackendError::Unavailable(_)
        }
    ));
    assert_eq!(factory.n_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_malformed_source_range_skips_only_that_sheet() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut broken = derive_region_pivot("broken");
    broken.source = Some("data!A1:??".to_string());
    let config = derive_config(
        dir.path(),
        vec![derive_region_pivot("first"), broken, derive_region_pivot("last")],
    );

    let outcome = run_report(
        &WorkbookModelFactory::new(),
        &config,
        &EnumReportSource::Records(derive_sales_records()),
        None,
    )
    .expect("report");

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].sheet, "broken");
    let l_built: Vec<&str> = outcome
        .sheets
        .iter()
        .map(|sheet| sheet.sheet_name.as_str())
        .collect();
    assert_eq!(l_built, vec!["first", "last"]);

    let path = outcome.path_saved().expect("saved");
    let workbook = open_workbook_auto(path).expect("open workbook");
    assert!(!workbook.sheet_names().contains(&"broken".to_string()));
}

#[test]
fn test_external_csv_source_with_yaml_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path_csv = dir.path().join("sales.csv");
    std::fs::write(
        &path_csv,
        "region,year,sales\nNorth,2023,10\nNorth,2024,20\nSouth,2023,5\nSouth,2024,7\n",
    )
    .expect("write csv");
    let path_config = dir.path().join("report.yaml");
    std::fs::write(
        &path_config,
        format!(
            "file_name: from_csv\n\
             file_path: {}\n\
             pivots:\n  - sheet: totals\n    rows: [region]\n    values:\n      - key: sales\n",
            dir.path().join("out").display()
        ),
    )
    .expect("write config");

    let config = load_report_config(&path_config).expect("config");
    let journal = BackendJournal::new();
    let handle = spawn_report(
        Arc::new(WorkbookModelFactory::new().with_journal(journal.clone())),
        config,
        EnumReportSource::ExternalFile(path_csv),
        None,
    );
    let outcome = join_report(handle).expect("report");

    let path = outcome.path_saved().expect("saved").clone();
    assert!(path.ends_with("from_csv.xlsx"));
    assert!(journal.snapshot().contains(&EnumBackendOp::DeleteSheet("Sheet1".to_string())));
    assert!(journal.snapshot().contains(&EnumBackendOp::AddTable {
        range: "data!A1:C5".to_string(),
        name: "DT_Source".to_string(),
    }));
    assert_eq!(read_cell(&path, "totals", 4, 2), Some(Data::Float(42.0)));
}

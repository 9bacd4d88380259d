//! Report orchestration: acquire a backend, load the data sheet, build every
//! pivot sheet and save the workbook.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::backend::{BackendFactory, PivotBackend, SpecCellRange, SpecCellRef};
use crate::builder::build_pivot;
use crate::conf::{C_SHEET_NAME_SOURCE, C_TABLE_NAME_SOURCE};
use crate::progress::{ProgressSink, SpecProgressEvent, emit, is_running};
use crate::source::SpecSourceTable;
use crate::spec::{
    BackendError, EnumCellValue, EnumReportStatus, ReportError, SourceError, SpecRecord,
    SpecReportConfig, SpecReportOutcome, SpecRetryPolicy, SpecSheetFailure,
};

/// Where the `data` sheet comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum EnumReportSource {
    Records(Vec<SpecRecord>),
    Table(SpecSourceTable),
    /// First sheet of an external file, copied in by the backend.
    ExternalFile(PathBuf),
}

impl From<Vec<SpecRecord>> for EnumReportSource {
    fn from(records: Vec<SpecRecord>) -> Self {
        EnumReportSource::Records(records)
    }
}

impl From<SpecSourceTable> for EnumReportSource {
    fn from(table: SpecSourceTable) -> Self {
        EnumReportSource::Table(table)
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region Session

/// Owns an acquired backend and releases it when dropped.
struct BackendSession {
    backend: Box<dyn PivotBackend>,
}

impl BackendSession {
    fn new(backend: Box<dyn PivotBackend>) -> Self {
        Self { backend }
    }
}

impl Deref for BackendSession {
    type Target = dyn PivotBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl DerefMut for BackendSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend.as_mut()
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        self.backend.release();
        tracing::debug!("backend released");
    }
}

/// Acquire a backend, retrying per `policy`. Returns the backend and the
/// number of attempts used.
fn acquire_backend(
    factory: &dyn BackendFactory,
    policy: &SpecRetryPolicy,
) -> Result<(Box<dyn PivotBackend>, usize), ReportError> {
    let n_attempts_max = policy.attempts_max.max(1);
    let mut n_attempt = 0;
    loop {
        n_attempt += 1;
        match factory.acquire() {
            Ok(backend) => {
                tracing::debug!(n_attempt, "backend acquired");
                return Ok((backend, n_attempt));
            }
            Err(e) if n_attempt < n_attempts_max => {
                let delay = policy.delay_after(n_attempt);
                tracing::warn!(
                    n_attempt,
                    n_attempts_max,
                    delay_ms = delay.as_millis() as u64,
                    "backend acquisition failed: {e}"
                );
                thread::sleep(delay);
            }
            Err(e) => {
                return Err(ReportError::BackendUnavailable {
                    attempts: n_attempt,
                    last: e,
                });
            }
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region DataSheet

fn step_err(step: &'static str) -> impl FnOnce(BackendError) -> ReportError {
    move |source| ReportError::Backend { step, source }
}

/// Copy the first sheet of `path` in as `data` and drop the blank default sheet.
///
/// Returns the last filled (row, col) of the copied sheet.
fn load_external_file(
    backend: &mut dyn PivotBackend,
    path: &std::path::Path,
    progress: Option<&dyn ProgressSink>,
) -> Result<(u32, u32), ReportError> {
    emit(progress, SpecProgressEvent::message("Loading data from file..."));
    let l_sheets_before = backend.sheet_names();
    backend
        .copy_sheet_from_file(path, C_SHEET_NAME_SOURCE)
        .map_err(step_err("copy data sheet"))?;
    for c_sheet in l_sheets_before
        .iter()
        .filter(|name| name.as_str() != C_SHEET_NAME_SOURCE)
    {
        backend
            .delete_sheet(c_sheet)
            .map_err(step_err("delete default sheet"))?;
    }
    let n_row_last = backend
        .last_filled_row(C_SHEET_NAME_SOURCE, 1)
        .map_err(step_err("scan data sheet"))?;
    let n_col_last = backend
        .last_filled_col(C_SHEET_NAME_SOURCE, 1)
        .map_err(step_err("scan data sheet"))?;
    tracing::info!(
        path = %path.display(),
        n_row_last,
        n_col_last,
        "data sheet copied from file"
    );
    Ok((n_row_last, n_col_last))
}

/// Write `table` into the default sheet renamed to `data`, one row at a time.
///
/// Returns `None` when the progress sink stopped the run.
fn load_table(
    backend: &mut dyn PivotBackend,
    table: &SpecSourceTable,
    progress: Option<&dyn ProgressSink>,
) -> Result<Option<(u32, u32)>, ReportError> {
    if table.l_headers.is_empty() || table.n_rows() == 0 {
        return Err(SourceError::NoRecords.into());
    }
    let c_sheet_default = backend
        .sheet_names()
        .into_iter()
        .next()
        .ok_or_else(|| ReportError::Backend {
            step: "rename default sheet",
            source: BackendError::SheetNotFound(C_SHEET_NAME_SOURCE.to_string()),
        })?;
    if c_sheet_default != C_SHEET_NAME_SOURCE {
        backend
            .rename_sheet(&c_sheet_default, C_SHEET_NAME_SOURCE)
            .map_err(step_err("rename default sheet"))?;
    }

    let l_header_row: Vec<EnumCellValue> = table
        .l_headers
        .iter()
        .map(|header| header.as_str().into())
        .collect();
    backend
        .write_grid(C_SHEET_NAME_SOURCE, SpecCellRef::new(1, 1), &[l_header_row])
        .map_err(step_err("write data header"))?;

    let n_total = table.n_rows() + 1;
    for (idx, row) in table.l_rows.iter().enumerate() {
        let n_row = idx as u32 + 2;
        if !is_running(progress) {
            return Ok(None);
        }
        emit(
            progress,
            SpecProgressEvent::step(
                format!("Loading data: {n_row} of {n_total}"),
                n_row as usize,
                n_total,
            ),
        );
        backend
            .write_grid(
                C_SHEET_NAME_SOURCE,
                SpecCellRef::new(n_row, 1),
                std::slice::from_ref(row),
            )
            .map_err(step_err("write data row"))?;
    }
    tracing::info!(n_rows = table.n_rows(), "data sheet written");
    Ok(Some((n_total as u32, table.n_cols() as u32)))
}

fn stop_cancelled(progress: Option<&dyn ProgressSink>) {
    tracing::info!("report cancelled");
    emit(progress, SpecProgressEvent::done());
    if let Some(sink) = progress {
        sink.terminate();
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Run

/// Run one report end to end.
///
/// Sheet-level failures are collected in the outcome and the batch moves on;
/// cancellation through `progress` stops before saving. The backend is
/// released on every exit path.
pub fn run_report(
    factory: &dyn BackendFactory,
    config: &SpecReportConfig,
    source: &EnumReportSource,
    progress: Option<&dyn ProgressSink>,
) -> Result<SpecReportOutcome, ReportError> {
    emit(progress, SpecProgressEvent::message("Building pivot tables..."));
    let (backend, n_attempts) = acquire_backend(factory, &config.retry)?;
    let mut session = BackendSession::new(backend);
    let mut outcome = SpecReportOutcome {
        status: EnumReportStatus::Cancelled,
        sheets: Vec::new(),
        failures: Vec::new(),
        n_attempts,
    };

    let extent = match source {
        EnumReportSource::ExternalFile(path) => {
            Some(load_external_file(&mut *session, path, progress)?)
        }
        EnumReportSource::Table(table) => load_table(&mut *session, table, progress)?,
        EnumReportSource::Records(records) => {
            let table = SpecSourceTable::from_records(records);
            load_table(&mut *session, &table, progress)?
        }
    };
    let Some((n_row_last, n_col_last)) = extent else {
        stop_cancelled(progress);
        return Ok(outcome);
    };

    let source_range = SpecCellRange::new(
        C_SHEET_NAME_SOURCE,
        SpecCellRef::new(1, 1),
        SpecCellRef::new(n_row_last, n_col_last),
    );
    session
        .clear_autofilter(C_SHEET_NAME_SOURCE)
        .map_err(step_err("clear autofilter"))?;
    session
        .add_table(&source_range, C_TABLE_NAME_SOURCE)
        .map_err(step_err("register source table"))?;

    for descriptor in &config.pivots {
        if !is_running(progress) {
            stop_cancelled(progress);
            return Ok(outcome);
        }
        match build_pivot(&mut *session, &source_range, descriptor, progress) {
            Ok(report) => outcome.sheets.push(report),
            Err(e) => {
                tracing::warn!(sheet = %descriptor.sheet, "pivot sheet skipped: {e}");
                outcome.failures.push(SpecSheetFailure {
                    sheet: descriptor.sheet.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    emit(progress, SpecProgressEvent::message("Saving result..."));
    std::fs::create_dir_all(&config.file_path).map_err(|source| ReportError::OutputDir {
        path: config.file_path.clone(),
        source,
    })?;
    let path_out = config.path_file_out();
    session.save(&path_out).map_err(step_err("save workbook"))?;
    tracing::info!(
        path = %path_out.display(),
        n_sheets = outcome.sheets.len(),
        n_failures = outcome.failures.len(),
        n_warnings = outcome.n_warnings(),
        "report saved"
    );
    outcome.status = EnumReportStatus::Saved(path_out);
    Ok(outcome)
}

/// Run [`run_report`] on a background thread; the backend is acquired there.
pub fn spawn_report(
    factory: Arc<dyn BackendFactory>,
    config: SpecReportConfig,
    source: EnumReportSource,
    progress: Option<Arc<dyn ProgressSink>>,
) -> JoinHandle<Result<SpecReportOutcome, ReportError>> {
    thread::spawn(move || run_report(factory.as_ref(), &config, &source, progress.as_deref()))
}

/// Wait for a spawned report; a panicked worker maps to
/// [`ReportError::WorkerPanicked`].
pub fn join_report(
    handle: JoinHandle<Result<SpecReportOutcome, ReportError>>,
) -> Result<SpecReportOutcome, ReportError> {
    handle.join().map_err(|_| ReportError::WorkerPanicked)?
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendJournal, EnumBackendOp};
    use crate::model::WorkbookModelFactory;
    use crate::spec::{EnumBackoff, SpecPivotReport, SpecRowField, SpecValueField};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn derive_records() -> Vec<SpecRecord> {
        [("North", 10.0), ("South", 20.0), ("North", 5.0)]
            .into_iter()
            .map(|(region, sales)| {
                let mut record = SpecRecord::new();
                record.insert("region".to_string(), EnumCellValue::from(region));
                record.insert("sales".to_string(), EnumCellValue::from(sales));
                record
            })
            .collect()
    }

    fn derive_config(dir: &std::path::Path) -> SpecReportConfig {
        let mut descriptor = SpecPivotReport::new("by region");
        descriptor.rows = vec![SpecRowField::new("region")];
        descriptor.values = vec![SpecValueField::new("sales")];
        SpecReportConfig {
            file_path: dir.to_path_buf(),
            file_name: "unit".to_string(),
            retry: SpecRetryPolicy {
                attempts_max: 3,
                delay_ms: 0,
                backoff: EnumBackoff::Fixed,
            },
            pivots: vec![descriptor],
            ..Default::default()
        }
    }

    struct FlakyFactory {
        n_failures: usize,
        n_calls: AtomicUsize,
        inner: WorkbookModelFactory,
    }

    impl BackendFactory for FlakyFactory {
        fn acquire(&self) -> Result<Box<dyn PivotBackend>, BackendError> {
            let n_call = self.n_calls.fetch_add(1, Ordering::SeqCst);
            if n_call < self.n_failures {
                return Err(BackendError::Unavailable("busy".to_string()));
            }
            self.inner.acquire()
        }
    }

    #[test]
    fn test_records_are_written_row_by_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = BackendJournal::new();
        let factory = WorkbookModelFactory::new().with_journal(journal.clone());
        let outcome = run_report(
            &factory,
            &derive_config(dir.path()),
            &EnumReportSource::Records(derive_records()),
            None,
        )
        .expect("run");

        assert_eq!(outcome.n_attempts, 1);
        assert!(outcome.path_saved().is_some_and(|path| path.exists()));
        assert_eq!(
            journal.count_where(|op| matches!(op, EnumBackendOp::WriteGrid { .. })),
            4
        );
        assert!(journal.snapshot().contains(&EnumBackendOp::AddTable {
            range: "data!A1:B4".to_string(),
            name: C_TABLE_NAME_SOURCE.to_string(),
        }));
        assert_eq!(
            journal.count_where(|op| matches!(op, EnumBackendOp::Release)),
            1
        );
    }

    #[test]
    fn test_retry_then_succeed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = FlakyFactory {
            n_failures: 2,
            n_calls: AtomicUsize::new(0),
            inner: WorkbookModelFactory::new(),
        };
        let outcome = run_report(
            &factory,
            &derive_config(dir.path()),
            &derive_records().into(),
            None,
        )
        .expect("run");
        assert_eq!(outcome.n_attempts, 3);
    }

    #[test]
    fn test_empty_records_rejected_and_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = BackendJournal::new();
        let factory = WorkbookModelFactory::new().with_journal(journal.clone());
        let err = run_report(
            &factory,
            &derive_config(dir.path()),
            &EnumReportSource::Records(Vec::new()),
            None,
        )
        .expect_err("empty");
        assert!(matches!(err, ReportError::Source(SourceError::NoRecords)));
        assert_eq!(
            journal.count_where(|op| matches!(op, EnumBackendOp::Release)),
            1
        );
    }

    #[test]
    fn test_spawned_report_saves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = spawn_report(
            Arc::new(WorkbookModelFactory::new()),
            derive_config(dir.path()),
            derive_records().into(),
            None,
        );
        let outcome = join_report(handle).expect("join");
        assert_eq!(outcome.sheets.len(), 1);
        assert_eq!(outcome.sheets[0].sheet_name, "by region");
    }
}

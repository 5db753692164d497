//! Bulk file ingestion: parse an uploaded CSV or spreadsheet into loosely
//! typed rows, normalize heterogeneously named columns, and upsert the five
//! related record types row by row.
//!
//! Rows are independent: a failing row lands in the error list and processing
//! continues. Counts report only records this run created, so re-ingesting an
//! identical file yields all-zero counts under the natural-key dedup rules.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use prms_core::{Address, Gender, IngestStats, NewPolicy, NewUser};
use prms_storage::{PolicyStore, StoreError};

pub const CRATE_NAME: &str = "prms-ingest";

/// Header→value mapping for one parsed row. Empty cells are omitted.
pub type RawRow = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported file format '{0}'; upload a CSV or XLSX file")]
    UnsupportedExtension(String),
    #[error("no data found in the uploaded file")]
    EmptyFile,
    #[error("reading upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("parsing spreadsheet: {0}")]
    Spreadsheet(String),
    #[error("ingestion worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Rejections the caller should surface as invalid input rather than an
    /// internal failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            IngestError::UnsupportedExtension(_) | IngestError::EmptyFile
        )
    }
}

// ── Header alias tables ──────────────────────────────────────────────────
//
// Each logical field resolves through a fixed priority list of the header
// spellings seen in real upload files.

const AGENT_NAME: &[&str] = &["agent", "agentName", "agent_name", "Agent Name"];
const FIRST_NAME: &[&str] = &["firstname", "firstName", "first_name", "First Name"];
const LAST_NAME: &[&str] = &["lastname", "lastName", "last_name", "Last Name"];
const DATE_OF_BIRTH: &[&str] = &["dob", "dateOfBirth", "date_of_birth", "Date of Birth"];
const STREET: &[&str] = &["address", "street", "Street Address"];
const CITY: &[&str] = &["city", "City"];
const STATE: &[&str] = &["state", "State"];
const ZIP_CODE: &[&str] = &["zip", "zipCode", "zip_code", "Zip Code"];
const PHONE: &[&str] = &["phone", "phoneNumber", "phone_number", "Phone Number"];
const EMAIL: &[&str] = &["email", "Email"];
const GENDER: &[&str] = &["gender", "Gender"];
const USER_TYPE: &[&str] = &["userType", "user_type", "User Type"];
const ACCOUNT_NAME: &[&str] = &["account_name", "accountName", "Account Name"];
const CATEGORY_NAME: &[&str] = &["category_name", "categoryName", "Category Name", "lob", "LOB"];
const COMPANY_NAME: &[&str] = &["company_name", "companyName", "Company Name", "carrier", "Carrier"];
const POLICY_NUMBER: &[&str] = &["policy_number", "policyNumber", "Policy Number"];
const POLICY_START: &[&str] = &["policy_start_date", "policyStartDate", "Policy Start Date"];
const POLICY_END: &[&str] = &["policy_end_date", "policyEndDate", "Policy End Date"];

fn lookup<'a>(row: &'a RawRow, aliases: &[&str]) -> Option<&'a str> {
    aliases
        .iter()
        .find_map(|alias| row.get(*alias))
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn parse_flexible_date(input: &str) -> Option<NaiveDate> {
    const FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%Y/%m/%d"];
    let input = input.trim();
    FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
}

// ── Normalization ────────────────────────────────────────────────────────

/// One row after field resolution, ready for the upsert chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRecord {
    pub agent_name: Option<String>,
    pub user: Option<NewUser>,
    pub account_name: Option<String>,
    pub category_name: Option<String>,
    pub carrier_name: Option<String>,
    pub policy_number: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Resolve aliases and apply the defaulting rules. The combined first-name
/// column may carry a full name; the first whitespace token becomes the first
/// name and the remainder the last name, falling back to an explicit
/// last-name column.
pub fn normalize_row(row: &RawRow, today: NaiveDate) -> RowRecord {
    let agent_name = lookup(row, AGENT_NAME).map(str::to_string);

    let user = lookup(row, FIRST_NAME).map(|full_name| {
        let mut parts = full_name.split_whitespace();
        let first_name = parts.next().unwrap_or(full_name).to_string();
        let split_rest = parts.collect::<Vec<_>>().join(" ");
        let last_name = if split_rest.is_empty() {
            lookup(row, LAST_NAME).unwrap_or_default().to_string()
        } else {
            split_rest
        };

        let date_of_birth = lookup(row, DATE_OF_BIRTH)
            .and_then(parse_flexible_date)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(1990, 1, 1).expect("valid default dob"));
        let email = lookup(row, EMAIL)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{first_name}@example.com"));

        NewUser {
            first_name,
            last_name,
            date_of_birth,
            address: Address {
                street: lookup(row, STREET).unwrap_or("Unknown Street").to_string(),
                city: lookup(row, CITY).unwrap_or("Unknown City").to_string(),
                state: lookup(row, STATE).unwrap_or("Unknown State").to_string(),
                zip_code: lookup(row, ZIP_CODE).unwrap_or("00000").to_string(),
            },
            phone_number: lookup(row, PHONE).unwrap_or_default().to_string(),
            email,
            gender: lookup(row, GENDER)
                .map(Gender::parse_lenient)
                .unwrap_or(Gender::Other),
            user_type: lookup(row, USER_TYPE).unwrap_or("Standard").to_string(),
        }
    });

    let start_date = lookup(row, POLICY_START)
        .and_then(parse_flexible_date)
        .unwrap_or(today);
    let end_date = lookup(row, POLICY_END)
        .and_then(parse_flexible_date)
        .unwrap_or_else(|| start_date + Days::new(365));

    RowRecord {
        agent_name,
        user,
        account_name: lookup(row, ACCOUNT_NAME).map(str::to_string),
        category_name: lookup(row, CATEGORY_NAME).map(str::to_string),
        carrier_name: lookup(row, COMPANY_NAME).map(str::to_string),
        policy_number: lookup(row, POLICY_NUMBER).map(str::to_string),
        start_date,
        end_date,
    }
}

// ── File parsing ─────────────────────────────────────────────────────────

/// Parse an upload into rows, detecting the format by file extension.
/// Blocking; run it on the blocking pool.
pub fn parse_rows(path: &Path, original_name: &str) -> Result<Vec<RawRow>, IngestError> {
    let extension = Path::new(original_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let rows = match extension.as_str() {
        "csv" => parse_csv(path)?,
        "xlsx" | "xls" => parse_spreadsheet(path)?,
        other => return Err(IngestError::UnsupportedExtension(other.to_string())),
    };

    if rows.is_empty() {
        return Err(IngestError::EmptyFile);
    }
    Ok(rows)
}

fn parse_csv(path: &Path) -> Result<Vec<RawRow>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = RawRow::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            if !value.is_empty() {
                row.insert(header.to_string(), value.to_string());
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn parse_spreadsheet(path: &Path) -> Result<Vec<RawRow>, IngestError> {
    use calamine::{open_workbook_auto, Reader};

    let mut workbook =
        open_workbook_auto(path).map_err(|err| IngestError::Spreadsheet(err.to_string()))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| IngestError::Spreadsheet("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|err| IngestError::Spreadsheet(err.to_string()))?;

    let mut sheet_rows = range.rows();
    let headers: Vec<String> = match sheet_rows.next() {
        Some(header_row) => header_row.iter().map(cell_to_string).collect(),
        None => return Ok(Vec::new()),
    };

    let mut rows = Vec::new();
    for sheet_row in sheet_rows {
        let mut row = RawRow::new();
        for (header, cell) in headers.iter().zip(sheet_row.iter()) {
            let value = cell_to_string(cell);
            let value = value.trim();
            if !header.trim().is_empty() && !value.is_empty() {
                row.insert(header.trim().to_string(), value.to_string());
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR({:?})", e),
        Data::DateTime(dt) => format!("{}", dt),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub rows_processed: usize,
    pub stats: IngestStats,
}

pub struct IngestPipeline {
    store: Arc<dyn PolicyStore>,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Ingest one uploaded file. The file is deleted afterwards on both the
    /// success and failure paths.
    pub async fn ingest_file(
        &self,
        path: PathBuf,
        original_name: &str,
    ) -> Result<IngestReport, IngestError> {
        let result = self.ingest_inner(&path, original_name).await;
        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %err, "failed to remove uploaded file");
        }
        result
    }

    async fn ingest_inner(
        &self,
        path: &Path,
        original_name: &str,
    ) -> Result<IngestReport, IngestError> {
        let parse_path = path.to_path_buf();
        let name = original_name.to_string();
        let rows = tokio::task::spawn_blocking(move || parse_rows(&parse_path, &name))
            .await
            .map_err(|err| IngestError::Worker(err.to_string()))??;

        let today = Utc::now().date_naive();
        let mut stats = IngestStats::default();
        for (index, row) in rows.iter().enumerate() {
            if let Err(err) = self.ingest_row(row, today, &mut stats).await {
                stats.errors.push(format!("row {}: {}", index + 1, err));
            }
        }

        info!(
            file = original_name,
            rows = rows.len(),
            policies = stats.policies,
            users = stats.users,
            errors = stats.errors.len(),
            "ingestion complete"
        );
        Ok(IngestReport {
            rows_processed: rows.len(),
            stats,
        })
    }

    /// Resolve/create the entities a single row names. A Policy is created
    /// only when the user, category, carrier and policy number all resolved
    /// from this row.
    async fn ingest_row(
        &self,
        row: &RawRow,
        today: NaiveDate,
        stats: &mut IngestStats,
    ) -> Result<(), IngestError> {
        let record = normalize_row(row, today);

        if let Some(agent_name) = &record.agent_name {
            let (_, created) = self.store.get_or_create_agent(agent_name).await?;
            if created {
                stats.agents += 1;
            }
        }

        let mut user_id = None;
        if let Some(draft) = &record.user {
            match self.store.find_user_by_email(&draft.email).await? {
                Some(existing) => user_id = Some(existing.id),
                None => match self.store.create_user(draft.clone()).await {
                    Ok(user) => {
                        stats.users += 1;
                        user_id = Some(user.id);
                    }
                    // A concurrent upload landed the same email first.
                    Err(StoreError::Duplicate { .. }) => {
                        user_id = self
                            .store
                            .find_user_by_email(&draft.email)
                            .await?
                            .map(|user| user.id);
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }

        if let (Some(user_id), Some(account_name)) = (user_id, &record.account_name) {
            let (_, created) = self.store.get_or_create_account(user_id, account_name).await?;
            if created {
                stats.user_accounts += 1;
            }
        }

        let mut category_id = None;
        if let Some(category_name) = &record.category_name {
            let (category, created) = self.store.get_or_create_category(category_name).await?;
            if created {
                stats.policy_categories += 1;
            }
            category_id = Some(category.id);
        }

        let mut carrier_id = None;
        if let Some(carrier_name) = &record.carrier_name {
            let (carrier, created) = self.store.get_or_create_carrier(carrier_name).await?;
            if created {
                stats.policy_carriers += 1;
            }
            carrier_id = Some(carrier.id);
        }

        if let (Some(user_id), Some(category_id), Some(carrier_id), Some(policy_number)) =
            (user_id, category_id, carrier_id, &record.policy_number)
        {
            if self.store.find_policy_by_number(policy_number).await?.is_none() {
                let draft = NewPolicy {
                    policy_number: policy_number.clone(),
                    start_date: record.start_date,
                    end_date: record.end_date,
                    category_id,
                    carrier_id,
                    user_id,
                };
                match self.store.create_policy(draft).await {
                    Ok(_) => stats.policies += 1,
                    // Raced with a concurrent upload of the same number.
                    Err(StoreError::Duplicate { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(())
    }
}

// ── Admission gate ───────────────────────────────────────────────────────

/// Bounded admission gate for concurrent ingestions. Uploads beyond the
/// bound are rejected rather than queued; the in-flight count feeds the
/// health endpoint.
#[derive(Debug, Clone)]
pub struct IngestGate {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct IngestPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for IngestPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IngestGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn try_begin(&self) -> Option<IngestPermit> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(IngestPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prms_storage::MemStore;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 7).unwrap()
    }

    const SAMPLE_CSV: &str = "\
agent,firstname,dob,address,city,state,zip,phone,email,gender,userType,account_name,category_name,company_name,policy_number,policy_start_date,policy_end_date
Sam Rivers,Alice Smith,1985-04-12,1 Main St,Springfield,IL,62701,555-0100,alice@example.com,Female,Standard,Household,Auto,Acme Mutual,P-100,2025-01-01,2026-01-01
Sam Rivers,Bob Jones,1979-09-30,2 Oak Ave,Portland,OR,97201,555-0101,bob@example.com,Male,Premium,Personal,Home,Liberty,P-200,2025-03-01,2026-03-01
";

    fn write_upload(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn alias_lists_resolve_in_priority_order() {
        let r = row(&[("Policy Number", "P-9"), ("LOB", "Auto"), ("Carrier", "Acme")]);
        assert_eq!(lookup(&r, POLICY_NUMBER), Some("P-9"));
        assert_eq!(lookup(&r, CATEGORY_NAME), Some("Auto"));
        assert_eq!(lookup(&r, COMPANY_NAME), Some("Acme"));
        assert_eq!(lookup(&r, AGENT_NAME), None);
    }

    #[test]
    fn combined_name_field_is_split() {
        let r = row(&[("firstname", "Mary Jane Watson"), ("email", "mj@example.com")]);
        let record = normalize_row(&r, today());
        let user = record.user.unwrap();
        assert_eq!(user.first_name, "Mary");
        assert_eq!(user.last_name, "Jane Watson");
    }

    #[test]
    fn explicit_last_name_is_a_fallback_only() {
        let r = row(&[("firstname", "Mary"), ("lastname", "Watson")]);
        let user = normalize_row(&r, today()).user.unwrap();
        assert_eq!(user.last_name, "Watson");

        let r = row(&[("firstname", "Mary Jane"), ("lastname", "Watson")]);
        let user = normalize_row(&r, today()).user.unwrap();
        assert_eq!(user.last_name, "Jane");
    }

    #[test]
    fn normalization_applies_defaults() {
        let r = row(&[("firstname", "Mary")]);
        let record = normalize_row(&r, today());
        let user = record.user.unwrap();
        assert_eq!(user.email, "Mary@example.com");
        assert_eq!(user.address.street, "Unknown Street");
        assert_eq!(user.address.zip_code, "00000");
        assert_eq!(user.gender, Gender::Other);
        assert_eq!(user.user_type, "Standard");
        assert_eq!(user.date_of_birth, NaiveDate::from_ymd_opt(1990, 1, 1).unwrap());
        assert_eq!(record.start_date, today());
        assert_eq!(record.end_date, today() + Days::new(365));
    }

    #[test]
    fn dates_parse_in_several_formats() {
        assert_eq!(
            parse_flexible_date("2025-06-01"),
            NaiveDate::from_ymd_opt(2025, 6, 1)
        );
        assert_eq!(
            parse_flexible_date("06/01/2025"),
            NaiveDate::from_ymd_opt(2025, 6, 1)
        );
        assert_eq!(parse_flexible_date("not a date"), None);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_upload(&dir, "upload.txt", "hello");
        let err = parse_rows(&path, "upload.txt").unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedExtension(ref ext) if ext == "txt"));
        assert!(err.is_rejection());
    }

    #[test]
    fn header_only_csv_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_upload(&dir, "upload.csv", "firstname,email\n");
        let err = parse_rows(&path, "upload.csv").unwrap_err();
        assert!(matches!(err, IngestError::EmptyFile));
    }

    #[tokio::test]
    async fn ingestion_creates_all_entity_types_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let pipeline = IngestPipeline::new(store.clone());

        let path = write_upload(&dir, "policies.csv", SAMPLE_CSV);
        let report = pipeline.ingest_file(path.clone(), "policies.csv").await.unwrap();

        assert_eq!(report.rows_processed, 2);
        assert_eq!(report.stats.agents, 1); // same agent on both rows
        assert_eq!(report.stats.users, 2);
        assert_eq!(report.stats.user_accounts, 2);
        assert_eq!(report.stats.policy_categories, 2);
        assert_eq!(report.stats.policy_carriers, 2);
        assert_eq!(report.stats.policies, 2);
        assert!(report.stats.errors.is_empty());
        assert!(!path.exists(), "upload must be deleted after processing");

        // Identical re-upload creates nothing.
        let path = write_upload(&dir, "policies.csv", SAMPLE_CSV);
        let report = pipeline.ingest_file(path, "policies.csv").await.unwrap();
        assert_eq!(report.stats, IngestStats::default());
    }

    #[tokio::test]
    async fn partial_row_yields_no_policy_but_keeps_other_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let pipeline = IngestPipeline::new(store.clone());

        // No policy_number column at all.
        let csv = "\
firstname,email,category_name,company_name
Carol Diaz,carol@example.com,Life,Acme Mutual
";
        let path = write_upload(&dir, "partial.csv", csv);
        let report = pipeline.ingest_file(path, "partial.csv").await.unwrap();

        assert_eq!(report.stats.users, 1);
        assert_eq!(report.stats.policy_categories, 1);
        assert_eq!(report.stats.policy_carriers, 1);
        assert_eq!(report.stats.policies, 0);
        assert!(store.list_policies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_row_is_collected_and_later_rows_still_process() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let pipeline = IngestPipeline::new(store.clone());

        // First row has an inverted date range, second is fine.
        let csv = "\
firstname,email,category_name,company_name,policy_number,policy_start_date,policy_end_date
Dave Li,dave@example.com,Auto,Acme,P-1,2027-01-01,2025-01-01
Erin Fox,erin@example.com,Auto,Acme,P-2,2025-01-01,2026-01-01
";
        let path = write_upload(&dir, "mixed.csv", csv);
        let report = pipeline.ingest_file(path, "mixed.csv").await.unwrap();

        assert_eq!(report.stats.errors.len(), 1);
        assert!(report.stats.errors[0].starts_with("row 1:"));
        assert_eq!(report.stats.policies, 1);
        assert_eq!(report.stats.users, 2);
    }

    #[tokio::test]
    async fn file_is_deleted_on_the_failure_path_too() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        let pipeline = IngestPipeline::new(store);

        let path = write_upload(&dir, "upload.txt", "not ingestable");
        let err = pipeline.ingest_file(path.clone(), "upload.txt").await.unwrap_err();
        assert!(err.is_rejection());
        assert!(!path.exists());
    }

    #[test]
    fn gate_bounds_concurrent_ingests() {
        let gate = IngestGate::new(2);
        let first = gate.try_begin().unwrap();
        let _second = gate.try_begin().unwrap();
        assert_eq!(gate.in_flight(), 2);
        assert!(gate.try_begin().is_none());

        drop(first);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_begin().is_some());
    }
}

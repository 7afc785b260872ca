use crate::backend::{BackendError, PushItem, PushOutcome, RemoteBackend};
use crate::config::SheetsConfig;
use crate::models::{Priority, SourceRow, Status, Task, TaskId};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const SHEETS_API: &str = "https://sheets.googleapis.com/v4";

/// Column layout of the task sheet. Row 1 carries these headers; data rows
/// start at row 2. Reads map columns by header name so a user reordering
/// columns in the spreadsheet UI doesn't corrupt the store.
const COLUMNS: [&str; 10] = [
    "id",
    "title",
    "description",
    "category",
    "status",
    "priority",
    "due_at",
    "created_at",
    "updated_at",
    "revision",
];

/// How many rows one write call may carry. Larger batches are split.
const MAX_ROWS_PER_WRITE: usize = 50;

/// Spreadsheet-of-record backend: one row per task, first row as headers.
///
/// `SourceRow` for this backend is the 1-based sheet row number. Hard
/// deletes clear the row instead of removing the dimension, so row numbers
/// held by other processes stay valid; cleared rows are skipped on read.
pub struct SheetsBackend {
    client: Client,
    base_url: String,
    spreadsheet_id: String,
    sheet: String,
    token: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Serialize)]
struct WriteRange {
    range: String,
    #[serde(rename = "majorDimension")]
    major_dimension: &'static str,
    values: Vec<Vec<String>>,
}

#[derive(Serialize)]
struct BatchUpdateRequest {
    #[serde(rename = "valueInputOption")]
    value_input_option: &'static str,
    data: Vec<WriteRange>,
}

#[derive(Deserialize)]
struct BatchGetResponse {
    #[serde(rename = "valueRanges", default)]
    value_ranges: Vec<ValueRange>,
}

#[derive(Deserialize)]
struct AppendResponse {
    updates: AppendUpdates,
}

#[derive(Deserialize)]
struct AppendUpdates {
    #[serde(rename = "updatedRange")]
    updated_range: String,
}

impl SheetsBackend {
    pub fn new(config: &SheetsConfig, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: SHEETS_API.to_string(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            sheet: config.sheet.clone(),
            token: config.api_token.clone(),
            timeout,
        }
    }

    /// Point the backend at a different API host (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}",
            self.base_url, self.spreadsheet_id, range
        )
    }

    fn check_status(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BackendError::Auth(format!("HTTP {status}")));
        }
        Err(BackendError::Unavailable(format!("HTTP {status}")))
    }

    fn get_range(&self, range: &str) -> Result<ValueRange, BackendError> {
        let resp = self
            .client
            .get(self.values_url(range))
            .bearer_auth(&self.token)
            .query(&[("majorDimension", "ROWS")])
            .timeout(self.timeout)
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Self::check_status(resp)?
            .json::<ValueRange>()
            .map_err(|e| BackendError::Malformed(e.to_string()))
    }

    /// Read several single-row ranges in one call.
    fn batch_get_rows(&self, rows: &[u32]) -> Result<Vec<ValueRange>, BackendError> {
        let url = format!(
            "{}/spreadsheets/{}/values:batchGet",
            self.base_url, self.spreadsheet_id
        );
        let mut query: Vec<(&str, String)> = vec![("majorDimension", "ROWS".to_string())];
        for row in rows {
            query.push(("ranges", self.row_range(*row)));
        }
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&query)
            .timeout(self.timeout)
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let body: BatchGetResponse = Self::check_status(resp)?
            .json()
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(body.value_ranges)
    }

    fn row_range(&self, row: u32) -> String {
        format!("{}!A{row}:J{row}", self.sheet)
    }

    fn write_rows(&self, data: Vec<WriteRange>) -> Result<(), BackendError> {
        let url = format!(
            "{}/spreadsheets/{}/values:batchUpdate",
            self.base_url, self.spreadsheet_id
        );
        let body = BatchUpdateRequest {
            value_input_option: "RAW",
            data,
        };
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Self::check_status(resp)?;
        Ok(())
    }

    fn append_row(&self, task: &Task) -> Result<SourceRow, BackendError> {
        let url = format!(
            "{}:append",
            self.values_url(&format!("{}!A1:J1", self.sheet))
        );
        let body = WriteRange {
            range: format!("{}!A1:J1", self.sheet),
            major_dimension: "ROWS",
            values: vec![encode_row(task)],
        };
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .query(&[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&body)
            .timeout(self.timeout)
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let appended: AppendResponse = Self::check_status(resp)?
            .json()
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        let row = parse_row_number(&appended.updates.updated_range).ok_or_else(|| {
            BackendError::Malformed(format!(
                "unparseable append range {:?}",
                appended.updates.updated_range
            ))
        })?;
        Ok(SourceRow(row.to_string()))
    }

    /// Current (id, revision) of a sheet row, `None` when the row is cleared.
    fn row_head(range: &ValueRange) -> Option<(String, u64)> {
        let row = range.values.first()?;
        let id = cell(row, 0);
        if id.is_empty() {
            return None;
        }
        let revision = cell(row, 9).parse::<u64>().ok()?;
        Some((id, revision))
    }
}

impl RemoteBackend for SheetsBackend {
    fn describe(&self) -> String {
        format!("sheets:{}/{}", self.spreadsheet_id, self.sheet)
    }

    fn fetch_all(&self) -> Result<Vec<Task>, BackendError> {
        let range = self.get_range(&format!("{}!A1:J", self.sheet))?;
        let mut rows = range.values.into_iter().enumerate();

        let Some((_, header)) = rows.next() else {
            return Ok(Vec::new());
        };
        let index = header_index(&header)?;

        let mut tasks = Vec::new();
        for (offset, row) in rows {
            let row_number = offset as u32 + 1;
            if row.iter().all(|v| cell_value(v).is_empty()) {
                continue; // cleared by a hard delete
            }
            match decode_row(&index, &row) {
                Ok(mut task) => {
                    task.source_row = Some(SourceRow(row_number.to_string()));
                    tasks.push(task);
                }
                Err(reason) => {
                    tracing::warn!("skipping sheet row {row_number}: {reason}");
                }
            }
        }
        Ok(tasks)
    }

    fn push(&self, batch: &[PushItem]) -> Result<PushOutcome, BackendError> {
        let mut outcome = PushOutcome::default();

        for chunk in batch.chunks(MAX_ROWS_PER_WRITE) {
            let mut updates: Vec<(&PushItem, u32)> = Vec::new();
            for item in chunk {
                match (&item.task.source_row, item.base_revision) {
                    (Some(row), Some(_)) => match row.as_str().parse::<u32>() {
                        Ok(number) => updates.push((item, number)),
                        Err(_) => {
                            return Err(BackendError::Malformed(format!(
                                "source row {:?} is not a sheet row number",
                                row.as_str()
                            )));
                        }
                    },
                    // No remote row yet: append.
                    _ => {
                        let source_row = self.append_row(&item.task)?;
                        outcome.written.push((item.task.id, source_row));
                    }
                }
            }

            if updates.is_empty() {
                continue;
            }

            // Re-read the target rows so a row rewritten by another process
            // since our last fetch turns into a per-task conflict instead of
            // a silent overwrite.
            let rows: Vec<u32> = updates.iter().map(|(_, number)| *number).collect();
            let current = self.batch_get_rows(&rows)?;

            let mut writes = Vec::new();
            for (position, (item, number)) in updates.iter().enumerate() {
                let head = current.get(position).and_then(Self::row_head);
                let stale = match (&head, item.base_revision) {
                    (Some((id, revision)), Some(base)) => {
                        *id != item.task.id.to_string() || *revision != base
                    }
                    // Row cleared out from under us.
                    (None, Some(_)) => true,
                    _ => false,
                };
                if stale {
                    outcome.conflicts.push(item.task.id);
                    continue;
                }
                writes.push(WriteRange {
                    range: self.row_range(*number),
                    major_dimension: "ROWS",
                    values: vec![encode_row(&item.task)],
                });
                outcome
                    .written
                    .push((item.task.id, SourceRow(number.to_string())));
            }

            if !writes.is_empty() {
                self.write_rows(writes)?;
            }
        }

        Ok(outcome)
    }

    fn delete(&self, id: TaskId, source_row: &SourceRow) -> Result<(), BackendError> {
        let number: u32 = source_row
            .as_str()
            .parse()
            .map_err(|_| BackendError::Malformed(format!("bad source row {:?}", source_row)))?;

        let current = self.get_range(&self.row_range(number))?;
        match Self::row_head(&current) {
            Some((row_id, _)) if row_id == id.to_string() => {}
            _ => return Err(BackendError::NotFound(id)),
        }

        let url = format!("{}:clear", self.values_url(&self.row_range(number)));
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({}))
            .timeout(self.timeout)
            .send()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Self::check_status(resp)?;
        Ok(())
    }
}

fn cell_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn cell(row: &[Value], index: usize) -> String {
    row.get(index).map(cell_value).unwrap_or_default()
}

/// Map header names to column positions. Every known column must be present.
fn header_index(header: &[Value]) -> Result<Vec<usize>, BackendError> {
    let names: Vec<String> = header.iter().map(cell_value).collect();
    COLUMNS
        .iter()
        .map(|wanted| {
            names
                .iter()
                .position(|name| name == wanted)
                .ok_or_else(|| BackendError::Malformed(format!("missing column {wanted:?}")))
        })
        .collect()
}

fn encode_row(task: &Task) -> Vec<String> {
    vec![
        task.id.to_string(),
        task.title.clone(),
        task.description.clone(),
        task.category.clone().unwrap_or_default(),
        task.status.as_str().to_string(),
        task.priority.as_str().to_string(),
        task.due_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        task.created_at.to_rfc3339(),
        task.updated_at.to_rfc3339(),
        task.revision.to_string(),
    ]
}

fn decode_row(index: &[usize], row: &[Value]) -> Result<Task, String> {
    let field = |column: usize| cell(row, index[column]);

    let id = TaskId::parse(&field(0)).ok_or_else(|| format!("bad id {:?}", field(0)))?;
    let title = field(1);
    if title.is_empty() {
        return Err("empty title".to_string());
    }
    let status =
        Status::parse(&field(4)).ok_or_else(|| format!("unknown status {:?}", field(4)))?;
    let priority =
        Priority::parse(&field(5)).ok_or_else(|| format!("unknown priority {:?}", field(5)))?;
    let revision = field(9)
        .parse::<u64>()
        .map_err(|_| format!("bad revision {:?}", field(9)))?;

    let parse_time = |label: &str, value: String| -> Result<DateTime<Utc>, String> {
        DateTime::parse_from_rfc3339(&value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| format!("bad {label} {value:?}"))
    };

    let due_at = {
        let raw = field(6);
        if raw.is_empty() {
            None
        } else {
            Some(parse_time("due_at", raw)?)
        }
    };

    let category = {
        let raw = field(3);
        if raw.is_empty() { None } else { Some(raw) }
    };

    Ok(Task {
        id,
        title,
        description: field(2),
        category,
        status,
        priority,
        due_at,
        created_at: parse_time("created_at", field(7))?,
        updated_at: parse_time("updated_at", field(8))?,
        revision,
        source_row: None,
    })
}

/// Pull the data row number out of an A1 range like `Tasks!A7:J7`.
fn parse_row_number(range: &str) -> Option<u32> {
    let tail = range.rsplit('!').next()?;
    let first = tail.split(':').next()?;
    let digits: String = first.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// src/table/sheets.rs

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{fs, sync::Arc, time::Duration};
use tracing::{debug, info};
use url::Url;

use super::auth::ServiceAccountTokens;
use super::{a1_range, quote_title, Connector, Row, Table};
use crate::config::{CredentialSource, StoreConfig};
use crate::error::{Result, StoreError};

/// Opens (or creates) one worksheet of a Google spreadsheet.
pub struct SheetsConnector {
    http: Client,
    api_base: Url,
    spreadsheet_id: String,
    worksheet: String,
    credentials: CredentialSource,
    service_account: Option<ServiceAccountTokens>,
    new_sheet_rows: u32,
    new_sheet_cols: u32,
}

/// A connected worksheet. Holds the bearer token obtained at connect time and the
/// numeric sheet id needed for structural edits.
pub struct SheetsTable {
    http: Client,
    api_base: Url,
    spreadsheet_id: String,
    title: String,
    sheet_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl SheetsConnector {
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        let api_base = parse_base(&cfg.api_base)?;
        let service_account = match &cfg.credentials {
            CredentialSource::ServiceAccount(path) => Some(ServiceAccountTokens::new(path)),
            _ => None,
        };
        Ok(Self {
            http,
            api_base,
            spreadsheet_id: cfg.spreadsheet_id.clone(),
            worksheet: cfg.worksheet.clone(),
            credentials: cfg.credentials.clone(),
            service_account,
            new_sheet_rows: cfg.new_sheet_rows,
            new_sheet_cols: cfg.new_sheet_cols,
        })
    }

    fn read_token(&self) -> Result<String> {
        let token = match &self.credentials {
            CredentialSource::Env(var) => std::env::var(var).map_err(|_| {
                StoreError::Auth(format!("environment variable {} is not set", var))
            })?,
            CredentialSource::File(path) => fs::read_to_string(path).map_err(|e| {
                StoreError::Auth(format!("reading token file {}: {}", path.display(), e))
            })?,
            CredentialSource::Token(t) => t.clone(),
            CredentialSource::ServiceAccount(path) => match &self.service_account {
                Some(tokens) => tokens.token(&self.http)?,
                None => {
                    return Err(StoreError::Auth(format!(
                        "no token source for service account {}",
                        path.display()
                    )))
                }
            },
        };
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(StoreError::Auth("access token is empty".into()));
        }
        Ok(token)
    }

    fn add_sheet(&self, token: &str) -> Result<i64> {
        let url = endpoint(
            &self.api_base,
            &["spreadsheets", &format!("{}:batchUpdate", self.spreadsheet_id)],
        )?;
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": self.worksheet,
                        "gridProperties": {
                            "rowCount": self.new_sheet_rows,
                            "columnCount": self.new_sheet_cols,
                        }
                    }
                }
            }]
        });
        let reply: Value = send(self.http.post(url).bearer_auth(token).json(&body))
            .map_err(unavailable_if_missing)?
            .json()?;
        reply
            .pointer("/replies/0/addSheet/properties/sheetId")
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::Decode("addSheet reply carries no sheetId".into()))
    }
}

impl Connector for SheetsConnector {
    fn connect(&self) -> Result<Arc<dyn Table>> {
        let token = self.read_token()?;

        // ─── 1) find the worksheet by title ─────────────────────────────
        let mut url = endpoint(&self.api_base, &["spreadsheets", &self.spreadsheet_id])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");
        let meta: SpreadsheetMeta = send(self.http.get(url).bearer_auth(&token))
            .map_err(unavailable_if_missing)?
            .json()?;

        let existing = meta
            .sheets
            .into_iter()
            .find(|s| s.properties.title == self.worksheet)
            .map(|s| s.properties.sheet_id);

        // ─── 2) create it when absent ───────────────────────────────────
        let sheet_id = match existing {
            Some(id) => id,
            None => {
                info!(worksheet = %self.worksheet, "worksheet missing; creating");
                self.add_sheet(&token)?
            }
        };
        debug!(worksheet = %self.worksheet, sheet_id, "connected");

        Ok(Arc::new(SheetsTable {
            http: self.http.clone(),
            api_base: self.api_base.clone(),
            spreadsheet_id: self.spreadsheet_id.clone(),
            title: self.worksheet.clone(),
            sheet_id,
            token,
        }))
    }
}

impl SheetsTable {
    fn values_url(&self, range: &str, suffix: &str) -> Result<Url> {
        endpoint(
            &self.api_base,
            &[
                "spreadsheets",
                &self.spreadsheet_id,
                "values",
                &format!("{}{}", range, suffix),
            ],
        )
    }

    fn sheet_range(&self, cells: &str) -> String {
        format!("{}!{}", quote_title(&self.title), cells)
    }

    fn get_values(&self, range: &str) -> Result<Vec<Row>> {
        let url = self.values_url(range, "")?;
        let vr: ValueRange = send(self.http.get(url).bearer_auth(&self.token))?.json()?;
        Ok(vr.values.into_iter().map(cells_to_row).collect())
    }

    fn batch_update(&self, request: Value) -> Result<()> {
        let url = endpoint(
            &self.api_base,
            &["spreadsheets", &format!("{}:batchUpdate", self.spreadsheet_id)],
        )?;
        send(
            self.http
                .post(url)
                .bearer_auth(&self.token)
                .json(&json!({ "requests": [request] })),
        )?;
        Ok(())
    }
}

impl Table for SheetsTable {
    fn title(&self) -> &str {
        &self.title
    }

    fn header(&self) -> Result<Row> {
        let range = self.sheet_range("1:1");
        Ok(self.get_values(&range)?.into_iter().next().unwrap_or_default())
    }

    fn rows(&self) -> Result<Vec<Row>> {
        self.get_values(&quote_title(&self.title))
    }

    fn write_rows(&self, start_row: usize, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let width = rows.iter().map(Vec::len).max().unwrap_or(1);
        let range = self.sheet_range(&a1_range(start_row, start_row + rows.len() - 1, width));
        let mut url = self.values_url(&range, "")?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        send(
            self.http
                .put(url)
                .bearer_auth(&self.token)
                .json(&json!({ "range": range, "majorDimension": "ROWS", "values": rows })),
        )?;
        Ok(())
    }

    fn append_row(&self, values: &[String]) -> Result<()> {
        let range = self.sheet_range("A1");
        let mut url = self.values_url(&range, ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        send(
            self.http
                .post(url)
                .bearer_auth(&self.token)
                .json(&json!({ "majorDimension": "ROWS", "values": [values] })),
        )?;
        Ok(())
    }

    fn delete_row(&self, row_number: usize) -> Result<()> {
        if row_number == 0 {
            return Err(StoreError::InvalidRecord("row numbers start at 1".into()));
        }
        self.batch_update(json!({
            "deleteDimension": {
                "range": {
                    "sheetId": self.sheet_id,
                    "dimension": "ROWS",
                    "startIndex": row_number - 1,
                    "endIndex": row_number,
                }
            }
        }))
    }

    fn clear(&self) -> Result<()> {
        let url = self.values_url(&quote_title(&self.title), ":clear")?;
        send(self.http.post(url).bearer_auth(&self.token).json(&json!({})))?;
        Ok(())
    }
}

fn parse_base(base: &str) -> Result<Url> {
    let trimmed = base.trim_end_matches('/');
    Url::parse(&format!("{}/", trimmed))
        .map_err(|e| StoreError::Unavailable(format!("bad api_base {:?}: {}", base, e)))
}

/// Join path segments onto the API base, percent-encoding each one.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| StoreError::Unavailable(format!("api_base {} cannot be a base", base)))?;
        path.pop_if_empty();
        for seg in segments {
            path.push(seg);
        }
    }
    Ok(url)
}

/// Values come back typed when the sheet holds numbers or booleans; the store
/// only deals in text.
fn cells_to_row(cells: Vec<Value>) -> Row {
    cells
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect()
}

fn send(req: RequestBuilder) -> Result<Response> {
    let resp = req.send()?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(classify(status, &body))
}

/// Map an HTTP failure onto the store's error taxonomy.
pub(crate) fn classify(status: StatusCode, body: &str) -> StoreError {
    let msg = format!("{}: {}", status, body.trim());
    let quota_body = ["RESOURCE_EXHAUSTED", "RATE_LIMIT_EXCEEDED", "rateLimitExceeded", "Quota exceeded"]
        .iter()
        .any(|marker| body.contains(*marker));

    if status == StatusCode::TOO_MANY_REQUESTS || quota_body {
        StoreError::Quota(msg)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StoreError::Auth(msg)
    } else {
        StoreError::Io(msg)
    }
}

/// During connect, a missing spreadsheet means the store can never work.
fn unavailable_if_missing(err: StoreError) -> StoreError {
    match err {
        StoreError::Io(msg) if msg.starts_with("404") => StoreError::Unavailable(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_quota_auth_and_other() {
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "").is_quota());
        assert!(classify(
            StatusCode::FORBIDDEN,
            r#"{"error":{"status":"PERMISSION_DENIED","message":"Quota exceeded for quota metric"}}"#
        )
        .is_quota());
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, "invalid token"),
            StoreError::Auth(_)
        ));
        assert!(matches!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
            StoreError::Io(_)
        ));
    }

    #[test]
    fn missing_spreadsheet_is_fatal_on_connect() {
        let err = unavailable_if_missing(classify(StatusCode::NOT_FOUND, "not found"));
        assert!(err.is_fatal());
    }

    #[test]
    fn endpoint_encodes_ranges() {
        let base = parse_base("https://sheets.googleapis.com/v4").unwrap();
        let url = endpoint(&base, &["spreadsheets", "abc", "values", "'my data'!A1:N1"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc/values/'my%20data'!A1:N1"
        );

        let url = endpoint(&base, &["spreadsheets", "abc:batchUpdate"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc:batchUpdate"
        );
    }

    #[test]
    fn typed_cells_become_text() {
        let row = cells_to_row(vec![json!("a"), json!(3), json!(true), Value::Null]);
        assert_eq!(row, vec!["a", "3", "true", ""]);
    }

    #[test]
    fn token_sources() {
        let cfg = StoreConfig {
            spreadsheet_id: "x".into(),
            credentials: CredentialSource::Token("  secret \n".into()),
            ..StoreConfig::default()
        };
        let conn = SheetsConnector::new(&cfg).unwrap();
        assert_eq!(conn.read_token().unwrap(), "secret");

        let cfg = StoreConfig {
            credentials: CredentialSource::Env("SURVEYSTORE_TEST_UNSET_TOKEN_VAR".into()),
            ..cfg
        };
        let conn = SheetsConnector::new(&cfg).unwrap();
        assert!(matches!(conn.read_token(), Err(StoreError::Auth(_))));

        let cfg = StoreConfig {
            credentials: CredentialSource::ServiceAccount(
                "/nonexistent/surveystore-sa.json".into(),
            ),
            ..cfg
        };
        let conn = SheetsConnector::new(&cfg).unwrap();
        let err = conn.read_token().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("surveystore-sa.json"));
    }
}

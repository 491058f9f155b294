//! Remote spreadsheet HTTP client.
//!
//! Blocking reqwest client (no Tokio runtime required). One request per
//! call: retries, backoff and quota are the engine's job.

use std::sync::Arc;
use std::time::Duration;

use gridrelay_protocol::{
    BatchUpdateRequest, BatchUpdateResponse, RemoteError, RemoteErrorKind, SheetsApi, Spreadsheet,
    SpreadsheetQuery, ValueRange, ValueRenderOption,
};
use reqwest::blocking::{RequestBuilder, Response};
use reqwest::Url;
use serde::de::DeserializeOwned;

use crate::auth::{load_auth, CredentialProvider, SavedCredentials};

pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com/v4";

/// Fields requested for metadata reads; keeps replies small.
const METADATA_FIELDS: &str = "spreadsheetId,properties.title,sheets.properties,\
sheets.conditionalFormats,sheets.bandedRanges,namedRanges";
const GRID_FIELDS: &str = "sheets.data.startRow,sheets.data.startColumn,\
sheets.data.rowData.values(userEnteredValue,userEnteredFormat)";

/// Error type for client setup.
#[derive(Debug)]
pub enum ClientError {
    /// No usable credentials
    NotAuthenticated,
    /// Bad API base URL or HTTP client setup
    Config(String),
    /// Credential file I/O
    Io(String),
    /// Credential file parsing
    Parse(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotAuthenticated => {
                write!(f, "Not authenticated: no saved credentials or token")
            }
            ClientError::Config(msg) => write!(f, "Client configuration error: {}", msg),
            ClientError::Io(msg) => write!(f, "I/O error: {}", msg),
            ClientError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

/// Spreadsheet API client (blocking).
#[derive(Clone)]
pub struct SheetsHttpClient {
    http: reqwest::blocking::Client,
    api_base: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl SheetsHttpClient {
    pub fn new(
        api_base: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(format!("gridrelay/{}", env!("CARGO_PKG_VERSION")))
            // Outer bound only; the engine applies its own per-call timeout.
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to create HTTP client: {}", e)))?;
        let api_base = Url::parse(api_base.trim_end_matches('/'))
            .map_err(|e| ClientError::Config(format!("Invalid API base '{}': {}", api_base, e)))?;
        if api_base.cannot_be_a_base() {
            return Err(ClientError::Config(format!("Invalid API base '{}'", api_base)));
        }
        Ok(Self { http, api_base, credentials })
    }

    /// Client using ~/.config/gridrelay/auth.json, read per request.
    pub fn from_saved_auth() -> Result<Self, ClientError> {
        let creds = load_auth()?;
        let base = creds.api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self::new(&base, Arc::new(SavedCredentials::default_location()?))
    }

    pub fn api_base(&self) -> &str {
        self.api_base.as_str()
    }

    // ── URLs ────────────────────────────────────────────────────────

    /// `{base}/spreadsheets/{segments...}`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.api_base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| {
                    RemoteError::transport(format!("Invalid API base '{}'", self.api_base))
                })?;
            path.pop_if_empty().push("spreadsheets");
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    // ── Transport ───────────────────────────────────────────────────

    fn send<T: DeserializeOwned>(
        &self,
        what: &str,
        request: RequestBuilder,
    ) -> Result<T, RemoteError> {
        let token = self.credentials.token().map_err(|e| {
            RemoteError::new(
                RemoteErrorKind::Unauthorized,
                format!("No credentials for {}: {}", what, e),
            )
        })?;
        let response = request
            .bearer_auth(token)
            .send()
            .map_err(|e| RemoteError::transport(format!("{} failed: {}", what, e)))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let err = status_error(status, response);
            log::debug!("{} -> HTTP {}: {}", what, status, err.message);
            return Err(err);
        }

        let text = response
            .text()
            .map_err(|e| {
                RemoteError::transport(format!("Failed to read {} response: {}", what, e))
            })?;
        serde_json::from_str(&text).map_err(|e| {
            RemoteError::malformed(format!(
                "Failed to parse {} response: {} (body: {})",
                what,
                e,
                text.chars().take(200).collect::<String>()
            ))
        })
    }
}

impl SheetsApi for SheetsHttpClient {
    fn get_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        render: ValueRenderOption,
    ) -> Result<ValueRange, RemoteError> {
        let url = self.url(&[spreadsheet_id, "values", range])?;
        let request = self
            .http
            .get(url)
            .query(&[("valueRenderOption", render.as_str()), ("majorDimension", "ROWS")]);
        self.send("values.get", request)
    }

    fn get_spreadsheet(
        &self,
        spreadsheet_id: &str,
        query: &SpreadsheetQuery,
    ) -> Result<Spreadsheet, RemoteError> {
        let url = self.url(&[spreadsheet_id])?;
        let fields = if query.include_grid_data {
            format!("{},{}", METADATA_FIELDS, GRID_FIELDS)
        } else {
            METADATA_FIELDS.to_string()
        };
        let mut params: Vec<(&str, &str)> = vec![
            ("includeGridData", if query.include_grid_data { "true" } else { "false" }),
            ("fields", fields.as_str()),
        ];
        params.extend(query.ranges.iter().map(|r| ("ranges", r.as_str())));
        let request = self.http.get(url).query(&params);
        self.send("spreadsheets.get", request)
    }

    fn batch_update(
        &self,
        spreadsheet_id: &str,
        body: &BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse, RemoteError> {
        let segment = format!("{}:batchUpdate", spreadsheet_id);
        let url = self.url(&[segment.as_str()])?;
        let request = self.http.post(url).json(body);
        self.send("spreadsheets.batchUpdate", request)
    }
}

// ── Free functions ──────────────────────────────────────────────────

/// Classify a failed response, keeping the remote's message and any
/// Retry-After hint.
fn status_error(status: u16, response: Response) -> RemoteError {
    let retry_after_ms = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().unwrap_or_default();
    RemoteError::from_status(status, error_message(&body, status)).with_retry_after(retry_after_ms)
}

/// Retry-After in seconds (fractions allowed), as milliseconds.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0).round() as u64)
}

/// `error.message` of a JSON error body, else the raw body.
pub fn error_message(body: &str, status: u16) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    if let Some(msg) = parsed.as_ref().and_then(|v| v["error"]["message"].as_str()) {
        return msg.to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status)
    } else {
        trimmed.chars().take(500).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    #[test]
    fn test_urls_are_encoded_per_segment() {
        let token = Arc::new(StaticToken::new("t"));
        let client = SheetsHttpClient::new("https://example.test/v4/", token).unwrap();
        let url = client.url(&["abc", "values", "'Q3 Budget'!A1:B2"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/v4/spreadsheets/abc/values/'Q3%20Budget'!A1:B2"
        );
        let url = client.url(&["abc:batchUpdate"]).unwrap();
        assert_eq!(url.as_str(), "https://example.test/v4/spreadsheets/abc:batchUpdate");
    }

    #[test]
    fn test_invalid_base_rejected() {
        let token = Arc::new(StaticToken::new("t"));
        let err = SheetsHttpClient::new("not a url", token).err().unwrap();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("3"), Some(3000));
        assert_eq!(parse_retry_after(" 0.5 "), Some(500));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error":{"code":400,"message":"Invalid requests[0].updateCells",
            "status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(error_message(body, 400), "Invalid requests[0].updateCells");
        assert_eq!(error_message("", 502), "HTTP 502");
        assert_eq!(error_message("Bad Gateway", 502), "Bad Gateway");
    }
}

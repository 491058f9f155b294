use std::sync::Arc;

use gridrelay_client::{
    save_auth_to, AuthCredentials, SavedCredentials, SheetsHttpClient, StaticToken,
};
use gridrelay_protocol::{
    BatchUpdateRequest, DeleteSheetRequest, RemoteErrorKind, Request, SheetsApi, SpreadsheetQuery,
    ValueRenderOption,
};
use httpmock::prelude::*;
use serde_json::json;

fn client(server: &MockServer) -> SheetsHttpClient {
    SheetsHttpClient::new(&server.base_url(), Arc::new(StaticToken::new("tok"))).unwrap()
}

// ── Endpoints ───────────────────────────────────────────────────────

#[test]
fn test_get_values_sends_token_and_render_option() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/spreadsheets/abc/values/Sheet1!A1:B2")
            .query_param("valueRenderOption", "FORMULA")
            .query_param("majorDimension", "ROWS")
            .header("authorization", "Bearer tok");
        then.status(200).json_body(json!({
            "range": "Sheet1!A1:B2",
            "majorDimension": "ROWS",
            "values": [["a", 1], ["b", "=A1"]]
        }));
    });

    let values = client(&server)
        .get_values("abc", "Sheet1!A1:B2", ValueRenderOption::Formula)
        .unwrap();

    mock.assert();
    assert_eq!(values.range, "Sheet1!A1:B2");
    assert_eq!(values.values.len(), 2);
    assert_eq!(values.values[1][1], json!("=A1"));
}

#[test]
fn test_get_spreadsheet_metadata_and_grid() {
    let server = MockServer::start();
    let metadata = server.mock(|when, then| {
        when.method(GET)
            .path("/spreadsheets/abc")
            .query_param("includeGridData", "false")
            .query_param_exists("fields")
            .query_param_missing("ranges");
        then.status(200).json_body(json!({
            "spreadsheetId": "abc",
            "properties": { "title": "Budget" },
            "sheets": [
                { "properties": { "sheetId": 0, "title": "Sheet1", "index": 0,
                  "gridProperties": { "rowCount": 1000, "columnCount": 26 } } }
            ]
        }));
    });
    let grid = server.mock(|when, then| {
        when.method(GET)
            .path("/spreadsheets/abc")
            .query_param("includeGridData", "true")
            .query_param("ranges", "Sheet1!A1:C3");
        then.status(200).json_body(json!({ "spreadsheetId": "abc", "sheets": [] }));
    });

    let api = client(&server);
    let book = api.get_spreadsheet("abc", &SpreadsheetQuery::metadata()).unwrap();
    assert_eq!(book.spreadsheet_id, "abc");
    assert_eq!(book.properties.title, "Budget");
    assert_eq!(book.sheets[0].properties.title.as_deref(), Some("Sheet1"));

    api.get_spreadsheet("abc", &SpreadsheetQuery::grid(vec!["Sheet1!A1:C3".into()]))
        .unwrap();

    metadata.assert();
    grid.assert();
}

#[test]
fn test_batch_update_posts_json_body() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/spreadsheets/abc:batchUpdate")
            .header("authorization", "Bearer tok")
            .json_body(json!({ "requests": [ { "deleteSheet": { "sheetId": 7 } } ] }));
        then.status(200).json_body(json!({ "spreadsheetId": "abc", "replies": [ {} ] }));
    });

    let body = BatchUpdateRequest {
        requests: vec![Request::DeleteSheet(DeleteSheetRequest { sheet_id: 7 })],
    };
    let reply = client(&server).batch_update("abc", &body).unwrap();

    mock.assert();
    assert_eq!(reply.spreadsheet_id, "abc");
    assert_eq!(reply.replies, vec![json!({})]);
}

// ── Status classification ───────────────────────────────────────────

#[test]
fn test_status_codes_are_classified() {
    let cases = [
        (400, RemoteErrorKind::BadRequest),
        (401, RemoteErrorKind::Unauthorized),
        (403, RemoteErrorKind::Forbidden),
        (404, RemoteErrorKind::NotFound),
        (413, RemoteErrorKind::PayloadTooLarge),
        (503, RemoteErrorKind::Server),
    ];

    for (status, kind) in cases {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/spreadsheets/abc");
            then.status(status).json_body(json!({
                "error": { "code": status, "message": format!("failure {}", status) }
            }));
        });

        let err = client(&server)
            .get_spreadsheet("abc", &SpreadsheetQuery::metadata())
            .unwrap_err();
        assert_eq!(err.kind, kind, "status {}", status);
        assert_eq!(err.status, Some(status));
        assert_eq!(err.message, format!("failure {}", status));
        assert_eq!(err.retry_after_ms, None);
    }
}

#[test]
fn test_rate_limit_carries_retry_after() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/spreadsheets/abc:batchUpdate");
        then.status(429)
            .header("retry-after", "2")
            .json_body(json!({ "error": { "code": 429, "message": "Quota exceeded" } }));
    });

    let err = client(&server)
        .batch_update("abc", &BatchUpdateRequest { requests: vec![] })
        .unwrap_err();

    assert_eq!(err.kind, RemoteErrorKind::RateLimited);
    assert_eq!(err.retry_after_ms, Some(2000));
    assert_eq!(err.message, "Quota exceeded");
    assert!(err.is_retryable());
}

#[test]
fn test_plain_text_error_body_kept() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/spreadsheets/abc");
        then.status(502).body("upstream connect error");
    });

    let err = client(&server)
        .get_spreadsheet("abc", &SpreadsheetQuery::metadata())
        .unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Server);
    assert_eq!(err.message, "upstream connect error");
}

#[test]
fn test_malformed_success_body() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/spreadsheets/abc/values/A1");
        then.status(200).body("<html>captive portal</html>");
    });

    let err = client(&server)
        .get_values("abc", "A1", ValueRenderOption::FormattedValue)
        .unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Malformed);
    assert!(err.message.contains("captive portal"), "message: {}", err.message);
}

// ── Credentials ─────────────────────────────────────────────────────

#[test]
fn test_missing_credentials_never_send() {
    // No mock registered: a request that got through would come back 404.
    let server = MockServer::start();
    let dir = tempfile::tempdir().unwrap();
    let provider = SavedCredentials::at(dir.path().join("auth.json"));
    let api = SheetsHttpClient::new(&server.base_url(), Arc::new(provider)).unwrap();

    let err = api.get_spreadsheet("abc", &SpreadsheetQuery::metadata()).unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Unauthorized);
    assert_eq!(err.status, None);
}

#[test]
fn test_saved_token_is_used() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/spreadsheets/abc")
            .header("authorization", "Bearer from-disk");
        then.status(200).json_body(json!({ "spreadsheetId": "abc" }));
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auth.json");
    save_auth_to(&path, &AuthCredentials::new("from-disk")).unwrap();
    let provider = Arc::new(SavedCredentials::at(&path));
    let api = SheetsHttpClient::new(&server.base_url(), provider).unwrap();

    api.get_spreadsheet("abc", &SpreadsheetQuery::metadata()).unwrap();
    mock.assert();
}

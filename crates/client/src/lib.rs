//! Remote spreadsheet API client.
//!
//! Implements [`gridrelay_protocol::SheetsApi`] over HTTPS with bearer-token
//! auth: the values endpoint, spreadsheet metadata, and batchUpdate.
//!
//! No retries, no quota, no caching. The engine owns those.

mod auth;
mod client;

pub use auth::{
    auth_file_path, delete_auth, load_auth, load_auth_from, save_auth, save_auth_to,
    AuthCredentials, CredentialProvider, SavedCredentials, StaticToken,
};
pub use client::{error_message, parse_retry_after, ClientError, SheetsHttpClient, DEFAULT_API_BASE};

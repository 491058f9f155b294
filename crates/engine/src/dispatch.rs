//! Dispatcher: one remote call under admission, timeout and retry.
//!
//! Every attempt first takes a token from the quota bucket, then runs the
//! blocking remote call on smol's blocking pool raced against a timer.
//! Transport failures, 5xx and remote 429 are retried with exponential
//! backoff and jitter; a server Retry-After longer than the backoff wins.
//! A timeout is final: the call may still land remotely, so a blind retry
//! could apply a batch twice.

use std::sync::Arc;
use std::time::Duration;

use gridrelay_config::DispatchConfig;
use gridrelay_core::{CoreError, ErrorCode, Result, SpreadsheetId};
use gridrelay_protocol::{
    BatchUpdateRequest, BatchUpdateResponse, RemoteError, RemoteErrorKind, SheetsApi, Spreadsheet,
    SpreadsheetQuery, ValueRange, ValueRenderOption,
};
use rand::Rng;
use smol::Timer;

use crate::quota::{BucketKind, QuotaManager};

pub struct Dispatcher {
    api: Arc<dyn SheetsApi>,
    quota: Arc<QuotaManager>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(api: Arc<dyn SheetsApi>, quota: Arc<QuotaManager>, config: DispatchConfig) -> Self {
        Self { api, quota, config }
    }

    pub fn batch_limit(&self) -> usize {
        self.config.batch_limit_bytes
    }

    pub async fn get_values(
        &self,
        spreadsheet_id: &SpreadsheetId,
        range: &str,
        render: ValueRenderOption,
    ) -> Result<ValueRange> {
        let id = spreadsheet_id.to_string();
        let range = range.to_string();
        self.call(BucketKind::Read, "values.get", move |api| api.get_values(&id, &range, render))
            .await
    }

    pub async fn get_spreadsheet(
        &self,
        spreadsheet_id: &SpreadsheetId,
        query: SpreadsheetQuery,
    ) -> Result<Spreadsheet> {
        let id = spreadsheet_id.to_string();
        self.call(BucketKind::Read, "spreadsheets.get", move |api| api.get_spreadsheet(&id, &query))
            .await
    }

    pub async fn batch_update(
        &self,
        spreadsheet_id: &SpreadsheetId,
        body: BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse> {
        let id = spreadsheet_id.to_string();
        self.call(BucketKind::Write, "batchUpdate", move |api| api.batch_update(&id, &body))
            .await
    }

    async fn call<T, F>(&self, bucket: BucketKind, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn SheetsApi) -> std::result::Result<T, RemoteError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut attempt = 1;
        loop {
            self.quota.acquire(bucket, 1).await?;

            let api = self.api.clone();
            let call = f.clone();
            let task = smol::unblock(move || call(api.as_ref()));
            let outcome = smol::future::or(async { Some(task.await) }, async {
                Timer::after(timeout).await;
                None
            })
            .await;

            let err = match outcome {
                None => {
                    log::warn!("{} timed out after {}ms", what, self.config.timeout_ms);
                    return Err(CoreError::timeout(self.config.timeout_ms));
                }
                Some(Ok(value)) => return Ok(value),
                Some(Err(err)) => err,
            };

            if !err.is_retryable() || attempt >= self.config.max_attempts {
                if attempt > 1 {
                    log::warn!("{} failed after {} attempts: {}", what, attempt, err);
                }
                return Err(classify(&err));
            }
            let pause = self.backoff(attempt, err.retry_after_ms);
            log::warn!(
                "{} attempt {}/{} failed ({}); retrying in {}ms",
                what,
                attempt,
                self.config.max_attempts,
                err,
                pause.as_millis()
            );
            Timer::after(pause).await;
            attempt += 1;
        }
    }

    /// Equal jitter: half the exponential step, plus a random share of the
    /// other half.
    fn backoff(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        let step = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << (attempt - 1).min(20))
            .min(self.config.max_backoff_ms);
        let half = step / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=half);
        Duration::from_millis(retry_after_ms.map_or(jittered, |server| server.max(jittered)))
    }
}

/// Map a remote failure onto the error taxonomy.
pub fn classify(err: &RemoteError) -> CoreError {
    let code = match err.kind {
        RemoteErrorKind::BadRequest => ErrorCode::Validation,
        RemoteErrorKind::Unauthorized => ErrorCode::AuthExpired,
        RemoteErrorKind::Forbidden => ErrorCode::PermissionDenied,
        RemoteErrorKind::NotFound => ErrorCode::NotFound,
        RemoteErrorKind::PayloadTooLarge => ErrorCode::PayloadTooLarge,
        RemoteErrorKind::RateLimited => ErrorCode::RateLimitExceeded,
        RemoteErrorKind::Transport | RemoteErrorKind::Server | RemoteErrorKind::Malformed => {
            ErrorCode::Internal
        }
    };
    CoreError {
        retry_after_ms: err.retry_after_ms,
        ..CoreError::new(code, format!("Remote error: {}", err))
    }
}

//! Recovers server-generated files after a stream ends without a `done` frame.
//!
//! File generation can finish on the server even when the connection that
//! asked for it broke. The listing endpoint is the side channel that tells us.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::client::BackendClient;
use crate::error::ClientError;
use crate::protocol::{ArtifactRecord, ArtifactReference};

pub const DEFAULT_RECOVERY_WINDOW: Duration = Duration::from_secs(120);

// Tolerated clock skew for artifacts stamped slightly in the future.
const MAX_FUTURE_SKEW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ArtifactRecoveryClient {
    client: BackendClient,
}

impl ArtifactRecoveryClient {
    pub fn new(client: BackendClient) -> Self {
        Self { client }
    }

    /// Artifacts created within `window` of now, newest first.
    pub async fn recover(&self, window: Duration) -> Result<Vec<ArtifactReference>, ClientError> {
        let records = self.client.list_artifacts().await?;
        let recovered = select_recent(records, window, Utc::now());
        tracing::info!(
            count = recovered.len(),
            window_secs = window.as_secs(),
            "artifact recovery finished"
        );
        Ok(recovered)
    }
}

pub(crate) fn select_recent(
    records: Vec<ArtifactRecord>,
    window: Duration,
    now: DateTime<Utc>,
) -> Vec<ArtifactReference> {
    let earliest = chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let latest = chrono::Duration::from_std(MAX_FUTURE_SKEW)
        .ok()
        .and_then(|skew| now.checked_add_signed(skew))
        .unwrap_or(now);

    let mut recent: Vec<(DateTime<Utc>, ArtifactRecord)> = records
        .into_iter()
        .filter_map(|record| record.created_at.map(|created| (created, record)))
        .filter(|(created, _)| *created >= earliest && *created <= latest)
        .collect();
    recent.sort_by(|a, b| b.0.cmp(&a.0));

    recent
        .into_iter()
        .map(|(_, record)| ArtifactReference::from(record))
        .collect()
}

/// User-facing text for a response rebuilt from recovered artifacts.
pub fn recovery_message(artifacts: &[ArtifactReference]) -> String {
    let names: Vec<&str> = artifacts
        .iter()
        .map(|artifact| {
            if !artifact.title.is_empty() {
                artifact.title.as_str()
            } else if !artifact.file_name.is_empty() {
                artifact.file_name.as_str()
            } else {
                artifact.id.as_str()
            }
        })
        .collect();

    match names.len() {
        0 => "The connection dropped before the response finished.".to_string(),
        1 => format!(
            "The connection dropped, but your file finished generating: {}",
            names[0]
        ),
        n => format!(
            "The connection dropped, but {} files finished generating: {}",
            n,
            names.join(", ")
        ),
    }
}

// sensor-rollup scheduler - CSV ingest
//
// Licensed under AGPL-3.0. See LICENSE file for details.

//! Loads raw per-minute samples from CSV into the in-memory store.
//!
//! Expected layout, one sample per line:
//!
//! ```text
//! sensor_id,container_id,measuring_at,value
//! 1,10,1700000040,21.375
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use sensor_rollup::{ContainerId, MemoryStore, RollupError, SensorId, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const EXPECTED_HEADER: [&str; 4] = ["sensor_id", "container_id", "measuring_at", "value"];

/// One CSV line
#[derive(Debug, Deserialize)]
struct CsvRow {
    sensor_id: SensorId,
    container_id: ContainerId,
    measuring_at: Timestamp,
    value: String,
}

/// Summary of a loaded dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetInfo {
    pub sensor_count: usize,
    pub sample_count: usize,
    pub first_at: Timestamp,
    pub last_at: Timestamp,
}

/// Read `path` and insert every sample into `store`.
///
/// Sensors are registered on first sight with the container of that line.
pub fn load_csv(path: &Path, store: &MemoryStore) -> Result<DatasetInfo, IngestError> {
    if !path.exists() {
        return Err(IngestError::FileNotFound(path.display().to_string()));
    }

    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let header: Vec<&str> = headers.iter().map(str::trim).collect();
    if header != EXPECTED_HEADER {
        return Err(IngestError::InvalidFormat(format!(
            "expected header '{}', got '{}'",
            EXPECTED_HEADER.join(","),
            header.join(",")
        )));
    }

    let mut sensors = BTreeSet::new();
    let mut sample_count = 0;
    let mut first_at = Timestamp::MAX;
    let mut last_at = Timestamp::MIN;

    for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row?;
        let value = BigDecimal::from_str(row.value.trim()).map_err(|_| {
            IngestError::InvalidFormat(format!(
                "line {}: invalid value '{}'",
                line + 2,
                row.value
            ))
        })?;

        if sensors.insert(row.sensor_id) {
            debug!(
                "registering sensor {} in container {}",
                row.sensor_id, row.container_id
            );
            store.add_sensor(row.sensor_id, row.container_id);
        }
        store.insert_raw(row.sensor_id, row.measuring_at, value)?;

        sample_count += 1;
        first_at = first_at.min(row.measuring_at);
        last_at = last_at.max(row.measuring_at);
    }

    if sample_count == 0 {
        return Err(IngestError::EmptyDataset);
    }

    info!(
        "Loaded {} samples for {} sensors from {}",
        sample_count,
        sensors.len(),
        path.display()
    );
    Ok(DatasetInfo {
        sensor_count: sensors.len(),
        sample_count,
        first_at,
        last_at,
    })
}

/// Ingest errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Empty dataset")]
    EmptyDataset,

    #[error("Store rejected sample: {0}")]
    Store(#[from] RollupError),
}

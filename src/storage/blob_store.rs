//! Named JSON documents and CSV exports under one module directory.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::types::{self, Fidelity, PricePoint};

/// Progress documents are stored as `{timestamp, data}`.
#[derive(Debug, Serialize, Deserialize)]
struct ProgressEnvelope<T> {
    timestamp: String,
    data: T,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Creates the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Pretty-printed JSON, written to a temp file in the same directory and
    /// renamed over the target so readers never see a partial document.
    pub fn save_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.path(name);
        let json = serde_json::to_vec_pretty(value)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;

        debug!(path = %path.display(), bytes = json.len(), "Saved JSON");
        Ok(path)
    }

    /// `Ok(None)` when the document does not exist.
    pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save_progress<T: Serialize>(&self, name: &str, data: &T) -> Result<PathBuf> {
        self.save_json(
            name,
            &ProgressEnvelope {
                timestamp: types::now_iso(),
                data,
            },
        )
    }

    pub fn load_progress<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        Ok(self
            .load_json::<ProgressEnvelope<T>>(name)?
            .map(|env| env.data))
    }

    /// Returns whether a file was removed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_price_history_csv(
        &self,
        market_id: &str,
        fidelity: Fidelity,
        points: &[PricePoint],
    ) -> Result<PathBuf> {
        let path = self.path(&format!("market_{}_{fidelity}_history.csv", file_component(market_id)?));
        let mut wtr = csv::Writer::from_path(&path)?;
        wtr.write_record(["datetime", "timestamp", "price", "market_id", "fidelity"])?;
        for p in points {
            let datetime = Utc
                .timestamp_opt(p.timestamp, 0)
                .single()
                .map(types::iso)
                .unwrap_or_default();
            wtr.write_record([
                datetime,
                p.timestamp.to_string(),
                p.price.to_string(),
                market_id.to_string(),
                fidelity.minutes().to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(path)
    }
}

/// An id used inside a file name must stay inside the module directory.
fn file_component(id: &str) -> Result<&str> {
    if id.is_empty() || id.contains(&['/', '\\'][..]) || id.contains("..") {
        return Err(AppError::InvalidName(id.to_string()));
    }
    Ok(id)
}

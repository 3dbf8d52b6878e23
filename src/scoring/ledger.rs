// =============================================================================
// Weight Ledger: append-only JSON-lines persistence for WeightSet versions
// =============================================================================
//
// One line per committed version: `{"tenant": "...", "weights": {...}}`.
// Lines are only ever appended; replay order is file order.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::scoring::weights::WeightSet;
use crate::types::TenantId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub tenant: TenantId,
    pub weights: WeightSet,
}

pub struct WeightLedger {
    path: PathBuf,
    /// Serialises appends from different tenants' writers.
    append_lock: Mutex<()>,
}

impl WeightLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk.
    pub fn append(&self, record: &LedgerRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialise ledger record")?;

        let _guard = self.append_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open weight ledger {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to weight ledger {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed to sync weight ledger {}", self.path.display()))?;
        Ok(())
    }

    /// Read every record in file order. A missing file is an empty ledger.
    pub fn load(&self) -> Result<Vec<LedgerRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read weight ledger {}", self.path.display()))?;

        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord = serde_json::from_str(line).with_context(|| {
                format!("corrupt weight ledger {} at line {}", self.path.display(), idx + 1)
            })?;
            records.push(record);
        }

        info!(path = %self.path.display(), records = records.len(), "weight ledger loaded");
        Ok(records)
    }
}

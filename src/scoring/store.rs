// =============================================================================
// Weight Store: per-tenant arena of WeightSet versions
// =============================================================================
//
// Each tenant owns an append-only arena of `Arc<WeightSet>` plus an atomic
// index of the latest committed version.
//
// Thread safety:
//   - Readers load the latest index and clone the `Arc`; they never wait on a
//     weight computation, only on the brief push of a finished version.
//   - Writers hold the tenant's single-writer async mutex for the whole
//     read-compute-commit cycle, so two cycles cannot interleave.
//   - Writer acquisition uses `try_lock` with exponential backoff; exhausting
//     the retries yields `EngineError::WriterBusy`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::scoring::ledger::{LedgerRecord, WeightLedger};
use crate::scoring::weights::WeightSet;
use crate::types::TenantId;

struct TenantSlot {
    versions: RwLock<Vec<Arc<WeightSet>>>,
    latest: AtomicUsize,
    writer: Arc<Mutex<()>>,
}

impl TenantSlot {
    fn new(initial: WeightSet) -> Self {
        Self {
            versions: RwLock::new(vec![Arc::new(initial)]),
            latest: AtomicUsize::new(0),
            writer: Arc::new(Mutex::new(())),
        }
    }

    fn latest(&self) -> Arc<WeightSet> {
        let idx = self.latest.load(Ordering::Acquire);
        self.versions.read()[idx].clone()
    }

    fn push(&self, next: WeightSet) -> Arc<WeightSet> {
        let next = Arc::new(next);
        let mut versions = self.versions.write();
        versions.push(next.clone());
        self.latest.store(versions.len() - 1, Ordering::Release);
        next
    }
}

/// Retry policy for writer acquisition.
#[derive(Debug, Clone, Copy)]
pub struct WriterRetry {
    pub attempts: u32,
    pub base_delay_ms: u64,
}

pub struct WeightStore {
    tenants: RwLock<HashMap<TenantId, Arc<TenantSlot>>>,
    ledger: Option<WeightLedger>,
}

impl WeightStore {
    /// An in-memory store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            ledger: None,
        }
    }

    /// Open a store backed by `ledger`, replaying every recorded version.
    /// Records that do not extend their tenant's history by exactly one
    /// version are skipped with a warning.
    pub fn open(ledger: WeightLedger) -> Result<Self> {
        let records = ledger.load()?;
        let mut tenants: HashMap<TenantId, Arc<TenantSlot>> = HashMap::new();

        for LedgerRecord { tenant, weights } in records {
            match tenants.get(&tenant) {
                None => {
                    tenants.insert(tenant, Arc::new(TenantSlot::new(weights)));
                }
                Some(slot) => {
                    let current = slot.latest().version();
                    if weights.version() != current + 1 {
                        warn!(
                            tenant = %tenant,
                            expected = current + 1,
                            found = weights.version(),
                            "skipping out-of-order ledger record"
                        );
                        continue;
                    }
                    slot.push(weights);
                }
            }
        }

        info!(tenants = tenants.len(), "weight store replayed from ledger");
        Ok(Self {
            tenants: RwLock::new(tenants),
            ledger: Some(ledger),
        })
    }

    /// Register `initial` for a tenant with no history. Returns the tenant's
    /// latest version either way.
    pub fn seed(&self, tenant: &str, initial: WeightSet) -> Result<Arc<WeightSet>, EngineError> {
        if let Some(existing) = self.latest(tenant) {
            return Ok(existing);
        }
        let mut tenants = self.tenants.write();
        if let Some(slot) = tenants.get(tenant) {
            return Ok(slot.latest());
        }
        self.persist(tenant, &initial)?;
        let slot = Arc::new(TenantSlot::new(initial));
        let latest = slot.latest();
        tenants.insert(tenant.to_string(), slot);
        info!(tenant = %tenant, version = latest.version(), "weight set seeded");
        Ok(latest)
    }

    /// The authoritative WeightSet for new scoring.
    pub fn latest(&self, tenant: &str) -> Option<Arc<WeightSet>> {
        let slot = self.tenants.read().get(tenant).cloned()?;
        Some(slot.latest())
    }

    /// Every committed version, oldest first.
    pub fn history(&self, tenant: &str) -> Vec<Arc<WeightSet>> {
        self.tenants
            .read()
            .get(tenant)
            .map(|slot| slot.versions.read().clone())
            .unwrap_or_default()
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.tenants.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Acquire the tenant's single writer, retrying with exponential backoff.
    pub async fn writer(&self, tenant: &str, retry: WriterRetry) -> Result<WeightWriter<'_>, EngineError> {
        let slot = self
            .tenants
            .read()
            .get(tenant)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("tenant `{tenant}`")))?;

        let attempts = retry.attempts.max(1);
        for attempt in 0..attempts {
            match slot.writer.clone().try_lock_owned() {
                Ok(guard) => {
                    return Ok(WeightWriter {
                        store: self,
                        tenant: tenant.to_string(),
                        slot,
                        _guard: guard,
                    });
                }
                Err(_) => {
                    let delay = retry.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
                    debug!(tenant = %tenant, attempt, delay_ms = delay, "weight writer busy, backing off");
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        }

        warn!(tenant = %tenant, attempts, "weight writer still busy after retries");
        Err(EngineError::WriterBusy {
            tenant: tenant.to_string(),
        })
    }

    fn persist(&self, tenant: &str, weights: &WeightSet) -> Result<(), EngineError> {
        if let Some(ledger) = &self.ledger {
            ledger
                .append(&LedgerRecord {
                    tenant: tenant.to_string(),
                    weights: weights.clone(),
                })
                .map_err(|e| EngineError::Ledger(format!("{e:#}")))?;
        }
        Ok(())
    }
}

/// Exclusive write access to one tenant's weights. Dropping it releases the
/// tenant's writer lock.
pub struct WeightWriter<'a> {
    store: &'a WeightStore,
    tenant: TenantId,
    slot: Arc<TenantSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl WeightWriter<'_> {
    /// The latest committed version, read under the writer lock.
    pub fn current(&self) -> Arc<WeightSet> {
        self.slot.latest()
    }

    /// Persist and publish `next`. It must extend the history by exactly one
    /// version.
    pub fn commit(&self, next: WeightSet) -> Result<Arc<WeightSet>, EngineError> {
        let current = self.slot.latest();
        if next.version() != current.version() + 1 {
            return Err(EngineError::WeightUpdateAborted(format!(
                "version {} does not follow {}",
                next.version(),
                current.version()
            )));
        }
        self.store.persist(&self.tenant, &next)?;
        let published = self.slot.push(next);
        info!(
            tenant = %self.tenant,
            version = published.version(),
            "weight set committed"
        );
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::WeightDefaults;
    use crate::types::SignalKey;
    use chrono::Utc;
    use std::collections::BTreeMap;

    const RETRY: WriterRetry = WriterRetry {
        attempts: 3,
        base_delay_ms: 1,
    };

    fn initial() -> WeightSet {
        WeightSet::initial(&WeightDefaults::default(), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn commit_publishes_new_version_and_keeps_history() {
        let store = WeightStore::in_memory();
        store.seed("north", initial()).unwrap();

        let writer = store.writer("north", RETRY).await.unwrap();
        let current = writer.current();
        let next = current
            .successor(
                BTreeMap::from([(SignalKey::Aiv, 0.5), (SignalKey::Ati, 0.5)]),
                Utc::now(),
                0,
            )
            .unwrap();
        writer.commit(next).unwrap();
        drop(writer);

        assert_eq!(store.latest("north").unwrap().version(), 2);
        let history = store.history("north");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version(), 1);
        assert_eq!(history[0].coefficients().len(), 5);
    }

    #[tokio::test]
    async fn stale_commit_is_rejected() {
        let store = WeightStore::in_memory();
        let v1 = store.seed("north", initial()).unwrap();
        let writer = store.writer("north", RETRY).await.unwrap();
        let v2 = v1.successor(v1.coefficients().clone(), Utc::now(), 0).unwrap();
        writer.commit(v2.clone()).unwrap();
        let err = writer.commit(v2).unwrap_err();
        assert_eq!(err.kind(), "weight_update_aborted");
    }

    #[tokio::test]
    async fn second_writer_backs_off_then_fails() {
        let store = WeightStore::in_memory();
        store.seed("north", initial()).unwrap();
        let _held = store.writer("north", RETRY).await.unwrap();
        let err = store.writer("north", RETRY).await.err().unwrap();
        assert_eq!(err.kind(), "writer_busy");
    }

    #[tokio::test]
    async fn readers_see_latest_while_writer_is_held() {
        let store = WeightStore::in_memory();
        store.seed("north", initial()).unwrap();
        let _held = store.writer("north", RETRY).await.unwrap();
        assert_eq!(store.latest("north").unwrap().version(), 1);
    }

    #[test]
    fn seeding_twice_keeps_the_first() {
        let store = WeightStore::in_memory();
        store.seed("north", initial()).unwrap();
        let other = WeightSet::new(
            1,
            BTreeMap::from([(SignalKey::Aiv, 1.0)]),
            Utc::now(),
            14,
            0.1,
        )
        .unwrap();
        let latest = store.seed("north", other).unwrap();
        assert_eq!(latest.coefficients().len(), 5);
        assert!(store.latest("south").is_none());
        assert_eq!(store.tenants(), vec!["north".to_string()]);
    }

    #[tokio::test]
    async fn ledger_replay_restores_versions() {
        let dir = std::env::temp_dir().join(format!("pulse-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("weights.jsonl");

        {
            let store = WeightStore::open(WeightLedger::new(&path)).unwrap();
            let v1 = store.seed("north", initial()).unwrap();
            let writer = store.writer("north", RETRY).await.unwrap();
            writer
                .commit(v1.successor(v1.coefficients().clone(), Utc::now(), 2).unwrap())
                .unwrap();
        }

        let reopened = WeightStore::open(WeightLedger::new(&path)).unwrap();
        let latest = reopened.latest("north").unwrap();
        assert_eq!(latest.version(), 2);
        assert_eq!(latest.stable_cycles(), 2);
        assert_eq!(reopened.history("north").len(), 2);
        std::fs::remove_dir_all(dir).ok();
    }
}

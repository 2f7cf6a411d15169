//! In-process index used by tests and local runs.
//!
//! Transactions are serialised by a writer lock; each one works on a
//! snapshot taken at `begin` and swaps it in on `commit`. Pool-level writes
//! issued while a transaction is open are overwritten by its commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;

use super::{epoch, Database, Index, Transaction, WindowLock};
use crate::error::{Error, Result};
use crate::models::pdv::validate_reward;
use crate::models::{PdvDelta, PdvMessageMeta, PdvMeta, Profile, ProfileParams, RewardsQueueItem};

#[derive(Debug, Clone, Default)]
struct State {
    height: Option<u64>,
    profiles: BTreeMap<String, Profile>,
    pdv: BTreeMap<(String, u64), PdvMeta>,
    distributed_at: Option<DateTime<Utc>>,
    rewards_queue: BTreeMap<String, RewardsQueueItem>,
}

impl State {
    fn watermark(&self) -> DateTime<Utc> {
        self.distributed_at.unwrap_or_else(epoch)
    }

    fn pending(&self) -> impl Iterator<Item = &PdvMeta> {
        let watermark = self.watermark();
        self.pdv
            .values()
            .filter(move |m| m.reward > Decimal::ZERO && m.created_at > watermark)
    }

    fn get_height(&self) -> Result<u64> {
        self.height.ok_or(Error::NotFound)
    }

    fn set_height(&mut self, height: u64) -> Result<()> {
        self.height = Some(height);
        Ok(())
    }

    fn get_profile(&self, address: &str) -> Result<Profile> {
        self.profiles.get(address).cloned().ok_or(Error::NotFound)
    }

    fn get_profiles(&self, addresses: &[String]) -> Result<Vec<Profile>> {
        let mut found: Vec<Profile> = addresses
            .iter()
            .filter_map(|a| self.profiles.get(a).cloned())
            .collect();
        found.sort_by(|a, b| a.address.cmp(&b.address));
        found.dedup_by(|a, b| a.address == b.address);
        Ok(found)
    }

    fn set_profile(&mut self, params: &ProfileParams) -> Result<()> {
        if params.address.is_empty() {
            return Err(Error::invalid("empty address"));
        }
        let now = Utc::now();
        let (banned, created_at) = self
            .profiles
            .get(&params.address)
            .map(|p| (p.banned, p.created_at))
            .unwrap_or((false, now));

        self.profiles.insert(
            params.address.clone(),
            Profile {
                address: params.address.clone(),
                first_name: params.first_name.clone(),
                last_name: params.last_name.clone(),
                bio: params.bio.clone(),
                avatar: params.avatar.clone(),
                gender: params.gender.clone(),
                birthday: params.birthday,
                banned,
                updated_at: now,
                created_at,
            },
        );
        Ok(())
    }

    fn set_profile_banned(&mut self, address: &str, banned: bool) -> Result<()> {
        let profile = self.profiles.get_mut(address).ok_or(Error::NotFound)?;
        profile.banned = banned;
        profile.updated_at = Utc::now();
        Ok(())
    }

    fn delete_profile(&mut self, address: &str) -> Result<()> {
        self.profiles.remove(address);
        Ok(())
    }

    fn set_pdv_meta(
        &mut self,
        address: &str,
        id: u64,
        tx: &str,
        device: &str,
        meta: &PdvMessageMeta,
    ) -> Result<()> {
        validate_reward(meta.reward)?;
        let key = (address.to_string(), id);
        if self.pdv.contains_key(&key) {
            return Err(Error::AlreadyExists);
        }
        self.pdv.insert(
            key,
            PdvMeta {
                address: address.to_string(),
                id,
                tx: tx.to_string(),
                device: device.to_string(),
                reward: meta.reward,
                object_types: meta.object_types.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn get_pdv_meta(&self, address: &str, id: u64) -> Result<PdvMeta> {
        self.pdv
            .get(&(address.to_string(), id))
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn list_pdv(&self, address: &str, from: u64, limit: u64) -> Result<Vec<u64>> {
        Ok(self
            .pdv
            .keys()
            .filter(|(a, _)| a == address)
            .map(|(_, id)| *id)
            .rev()
            .skip(from as usize)
            .take(limit as usize)
            .collect())
    }

    fn delete_pdv(&mut self, address: &str) -> Result<()> {
        self.pdv.retain(|(a, _), _| a != address);
        Ok(())
    }

    fn get_pdv_delta(&self, address: &str) -> Result<Decimal> {
        Ok(self
            .pending()
            .filter(|m| m.address == address)
            .map(|m| m.reward)
            .sum())
    }

    fn get_pdv_total_delta(&self) -> Result<Decimal> {
        Ok(self.pending().map(|m| m.reward).sum())
    }

    fn get_pdv_delta_list(&self, until: DateTime<Utc>) -> Result<Vec<PdvDelta>> {
        let mut deltas: BTreeMap<&str, Decimal> = BTreeMap::new();
        for meta in self.pending().filter(|m| m.created_at <= until) {
            *deltas.entry(meta.address.as_str()).or_default() += meta.reward;
        }
        Ok(deltas
            .into_iter()
            .map(|(address, delta)| PdvDelta {
                address: address.to_string(),
                delta,
            })
            .collect())
    }

    fn get_pdv_rewards_distributed_date(&self) -> Result<DateTime<Utc>> {
        Ok(self.watermark())
    }

    fn set_pdv_rewards_distributed_date(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.distributed_at = Some(at);
        Ok(())
    }

    fn create_rewards_queue_item(&mut self, address: &str, reward: u64) -> Result<()> {
        if reward == 0 || reward > i64::MAX as u64 {
            return Err(Error::invalid(format!("rewards queue item {} out of range", reward)));
        }
        if self.rewards_queue.contains_key(address) {
            return Err(Error::AlreadyExists);
        }
        self.rewards_queue.insert(
            address.to_string(),
            RewardsQueueItem {
                address: address.to_string(),
                reward,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn get_rewards_queue_item_list(&self) -> Result<Vec<RewardsQueueItem>> {
        Ok(self.rewards_queue.values().cloned().collect())
    }

    fn delete_rewards_queue_item(&mut self, address: &str) -> Result<()> {
        self.rewards_queue.remove(address);
        Ok(())
    }
}

/// Injected failures, shared by the pool handle and its transactions.
#[derive(Default)]
struct Faults {
    commits: AtomicUsize,
    ops: Mutex<HashMap<&'static str, usize>>,
}

impl Faults {
    fn check(&self, op: &'static str) -> Result<()> {
        let mut ops = self.ops.lock();
        match ops.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(Error::transient(format!("memory index: injected {} failure", op)))
            }
            _ => Ok(()),
        }
    }

    fn check_commit(&self) -> Result<()> {
        let pending = self.commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.commits.store(pending - 1, Ordering::SeqCst);
            return Err(Error::transient("memory index: injected commit failure"));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryIndex {
    state: Arc<Mutex<State>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    faults: Arc<Faults>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail and roll back.
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls of `op` (e.g. `"get_pdv_meta"`) fail transiently,
    /// whether issued on the pool or inside a transaction.
    pub fn fail_next(&self, op: &'static str, n: usize) {
        self.faults.ops.lock().insert(op, n);
    }

    /// Number of stored meta rows.
    pub fn pdv_count(&self) -> usize {
        self.state.lock().pdv.len()
    }

    fn cell(&self) -> &Mutex<State> {
        &self.state
    }
}

pub struct MemoryTx {
    shared: Arc<Mutex<State>>,
    working: Mutex<State>,
    faults: Arc<Faults>,
    _writer: OwnedMutexGuard<()>,
}

impl MemoryTx {
    fn cell(&self) -> &Mutex<State> {
        &self.working
    }
}

/// Both handles run the same operations against their own state cell.
macro_rules! memory_index_ops {
    ($handle:ty) => {
        #[async_trait]
        impl Index for $handle {
            async fn get_height(&self) -> Result<u64> {
                self.faults.check("get_height")?;
                self.cell().lock().get_height()
            }

            async fn set_height(&self, height: u64) -> Result<()> {
                self.faults.check("set_height")?;
                self.cell().lock().set_height(height)
            }

            async fn get_profile(&self, address: &str) -> Result<Profile> {
                self.faults.check("get_profile")?;
                self.cell().lock().get_profile(address)
            }

            async fn get_profiles(&self, addresses: &[String]) -> Result<Vec<Profile>> {
                self.faults.check("get_profiles")?;
                self.cell().lock().get_profiles(addresses)
            }

            async fn set_profile(&self, params: &ProfileParams) -> Result<()> {
                self.faults.check("set_profile")?;
                self.cell().lock().set_profile(params)
            }

            async fn set_profile_banned(&self, address: &str, banned: bool) -> Result<()> {
                self.faults.check("set_profile_banned")?;
                self.cell().lock().set_profile_banned(address, banned)
            }

            async fn delete_profile(&self, address: &str) -> Result<()> {
                self.faults.check("delete_profile")?;
                self.cell().lock().delete_profile(address)
            }

            async fn set_pdv_meta(
                &self,
                address: &str,
                id: u64,
                tx: &str,
                device: &str,
                meta: &PdvMessageMeta,
            ) -> Result<()> {
                self.faults.check("set_pdv_meta")?;
                self.cell().lock().set_pdv_meta(address, id, tx, device, meta)
            }

            async fn get_pdv_meta(&self, address: &str, id: u64) -> Result<PdvMeta> {
                self.faults.check("get_pdv_meta")?;
                self.cell().lock().get_pdv_meta(address, id)
            }

            async fn list_pdv(&self, address: &str, from: u64, limit: u64) -> Result<Vec<u64>> {
                self.faults.check("list_pdv")?;
                self.cell().lock().list_pdv(address, from, limit)
            }

            async fn delete_pdv(&self, address: &str) -> Result<()> {
                self.faults.check("delete_pdv")?;
                self.cell().lock().delete_pdv(address)
            }

            async fn get_pdv_delta(&self, address: &str) -> Result<Decimal> {
                self.faults.check("get_pdv_delta")?;
                self.cell().lock().get_pdv_delta(address)
            }

            async fn get_pdv_total_delta(&self) -> Result<Decimal> {
                self.faults.check("get_pdv_total_delta")?;
                self.cell().lock().get_pdv_total_delta()
            }

            async fn get_pdv_delta_list(&self, until: DateTime<Utc>) -> Result<Vec<PdvDelta>> {
                self.faults.check("get_pdv_delta_list")?;
                self.cell().lock().get_pdv_delta_list(until)
            }

            async fn get_pdv_rewards_distributed_date(&self) -> Result<DateTime<Utc>> {
                self.faults.check("get_pdv_rewards_distributed_date")?;
                self.cell().lock().get_pdv_rewards_distributed_date()
            }

            async fn set_pdv_rewards_distributed_date(&self, at: DateTime<Utc>) -> Result<()> {
                self.faults.check("set_pdv_rewards_distributed_date")?;
                self.cell().lock().set_pdv_rewards_distributed_date(at)
            }

            async fn create_rewards_queue_item(&self, address: &str, reward: u64) -> Result<()> {
                self.faults.check("create_rewards_queue_item")?;
                self.cell().lock().create_rewards_queue_item(address, reward)
            }

            async fn get_rewards_queue_item_list(&self) -> Result<Vec<RewardsQueueItem>> {
                self.faults.check("get_rewards_queue_item_list")?;
                self.cell().lock().get_rewards_queue_item_list()
            }

            async fn delete_rewards_queue_item(&self, address: &str) -> Result<()> {
                self.faults.check("delete_rewards_queue_item")?;
                self.cell().lock().delete_rewards_queue_item(address)
            }

            async fn ping(&self) -> Result<()> {
                self.faults.check("ping")
            }
        }
    };
}

memory_index_ops!(MemoryIndex);
memory_index_ops!(MemoryTx);

#[async_trait]
impl Database for MemoryIndex {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.faults.check("begin")?;
        let writer = self.writer.clone().lock_owned().await;
        let snapshot = self.state.lock().clone();
        Ok(Box::new(MemoryTx {
            shared: self.state.clone(),
            working: Mutex::new(snapshot),
            faults: self.faults.clone(),
            _writer: writer,
        }))
    }
}

impl Transaction for MemoryTx {
    // Transactions already run one at a time behind the writer lock
    fn lock_rewards_window(&self, _mode: WindowLock) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.faults.check("lock_rewards_window") })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let MemoryTx {
                shared,
                working,
                faults,
                _writer,
            } = *self;
            faults.check_commit()?;
            *shared.lock() = working.into_inner();
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn meta(reward: Decimal) -> PdvMessageMeta {
        PdvMessageMeta {
            object_types: BTreeMap::from([("cookie".to_string(), 1)]),
            reward,
        }
    }

    #[tokio::test]
    async fn test_duplicate_meta_already_exists() {
        let index = MemoryIndex::new();
        index.set_pdv_meta("a", 1, "T", "ios", &meta(dec!(1))).await.unwrap();

        let err = index.set_pdv_meta("a", 1, "T2", "ios", &meta(dec!(1))).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
        assert_eq!(index.get_pdv_meta("a", 1).await.unwrap().tx, "T");
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let index = MemoryIndex::new();
        {
            let tx = index.begin().await.unwrap();
            tx.set_height(7).await.unwrap();
            assert_eq!(tx.get_height().await.unwrap(), 7);
        }
        assert!(matches!(index.get_height().await, Err(Error::NotFound)));

        let tx = index.begin().await.unwrap();
        tx.set_height(8).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(index.get_height().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_failed_commit_discards_writes() {
        let index = MemoryIndex::new();
        index.fail_next_commits(1);

        let tx = index.begin().await.unwrap();
        tx.create_rewards_queue_item("a", 5).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert!(index.get_rewards_queue_item_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deltas_respect_watermark() {
        let index = MemoryIndex::new();
        index.set_pdv_meta("b", 1, "T", "", &meta(dec!(2))).await.unwrap();
        index.set_pdv_meta("a", 1, "T", "", &meta(dec!(1.5))).await.unwrap();
        index.set_pdv_meta("a", 2, "T", "", &meta(dec!(0.5))).await.unwrap();
        index.set_pdv_meta("c", 1, "", "", &meta(dec!(0))).await.unwrap();

        let list = index.get_pdv_delta_list(Utc::now()).await.unwrap();
        assert_eq!(
            list,
            vec![
                PdvDelta { address: "a".to_string(), delta: dec!(2.0) },
                PdvDelta { address: "b".to_string(), delta: dec!(2) },
            ]
        );
        assert_eq!(index.get_pdv_total_delta().await.unwrap(), dec!(4));
        assert_eq!(index.get_pdv_delta("a").await.unwrap(), dec!(2));

        index.set_pdv_rewards_distributed_date(Utc::now()).await.unwrap();
        assert_eq!(index.get_pdv_total_delta().await.unwrap(), Decimal::ZERO);
        assert!(index.get_pdv_delta_list(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delta_list_stops_at_cutoff() {
        let index = MemoryIndex::new();
        index.set_pdv_meta("a", 1, "T", "", &meta(dec!(1))).await.unwrap();
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        index.set_pdv_meta("b", 1, "T", "", &meta(dec!(3))).await.unwrap();

        let list = index.get_pdv_delta_list(cutoff).await.unwrap();
        assert_eq!(list, vec![PdvDelta { address: "a".to_string(), delta: dec!(1) }]);

        // Rows past the cutoff stay pending for the next window
        index.set_pdv_rewards_distributed_date(cutoff).await.unwrap();
        assert_eq!(index.get_pdv_total_delta().await.unwrap(), dec!(3));
    }

    #[tokio::test]
    async fn test_list_pdv_newest_first() {
        let index = MemoryIndex::new();
        for id in [3u64, 1, 10, 2] {
            index.set_pdv_meta("a", id, "", "", &meta(dec!(0))).await.unwrap();
        }
        index.set_pdv_meta("b", 99, "", "", &meta(dec!(0))).await.unwrap();

        assert_eq!(index.list_pdv("a", 0, 10).await.unwrap(), vec![10, 3, 2, 1]);
        assert_eq!(index.list_pdv("a", 1, 2).await.unwrap(), vec![3, 2]);

        index.delete_pdv("a").await.unwrap();
        assert!(index.list_pdv("a", 0, 10).await.unwrap().is_empty());
        assert_eq!(index.pdv_count(), 1);
    }

    #[tokio::test]
    async fn test_profile_upsert_keeps_ban() {
        let index = MemoryIndex::new();
        let mut params = ProfileParams {
            address: "a".to_string(),
            first_name: "Ann".to_string(),
            ..Default::default()
        };
        index.set_profile(&params).await.unwrap();
        index.set_profile_banned("a", true).await.unwrap();

        params.first_name = "Anna".to_string();
        index.set_profile(&params).await.unwrap();

        let profile = index.get_profile("a").await.unwrap();
        assert_eq!(profile.first_name, "Anna");
        assert!(profile.banned);
        assert!(matches!(index.set_profile_banned("zz", true).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_injected_op_failure() {
        let index = MemoryIndex::new();
        index.fail_next("get_pdv_meta", 1);
        assert!(matches!(index.get_pdv_meta("a", 1).await, Err(Error::Transient(_))));
        assert!(matches!(index.get_pdv_meta("a", 1).await, Err(Error::NotFound)));
    }
}

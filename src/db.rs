// src/db.rs - Embedded accounting store of the master
//
// Three column families:
//   address_info  address -> AddrInfo
//   pending       "pending" -> PendingState (confirmation queue + height)
//   shares        big-endian u64 sequence -> StoredShare
//
// Multi-key mutations are staged in a WriteBatch so that ledger GC,
// balance updates and queue rewrites commit atomically.
use crate::error::{PoolError, Result};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

pub const CF_ADDRESS_INFO: &str = "address_info";
pub const CF_PENDING: &str = "pending";
pub const CF_SHARES: &str = "shares";

const PENDING_KEY: &[u8] = b"pending";

/// Persistent per-address accounting record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddrInfo {
    /// Confirmed, withdrawable balance in atomic units
    pub balance: u64,
    /// Estimated balance of not-yet-confirmed rewards
    pub balance_pending: u64,
    /// Lifetime amount paid out
    pub paid: u64,
}

/// One accepted share aggregate in the PPLNS ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredShare {
    pub wallet: String,
    pub diff: u64,
    /// Unix seconds of acceptance
    pub time: u64,
}

/// A coinbase reward waiting for confirmations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTx {
    /// Chain height at which the reward matures
    pub unlock_height: u64,
    /// Hash of the block carrying the coinbase
    pub block_hash: [u8; 32],
    /// Reward split per address, atomic units
    pub amounts: BTreeMap<String, u64>,
}

impl PendingTx {
    pub fn total_amount(&self) -> u64 {
        self.amounts.values().sum()
    }
}

/// The whole confirmation queue plus the last processed topoheight,
/// stored under a single key and rewritten atomically
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingState {
    pub last_height: u64,
    pub queue: Vec<PendingTx>,
}

pub struct Store {
    db: DB,
    share_seq: AtomicU64,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_ADDRESS_INFO, CF_PENDING, CF_SHARES]
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        // prime the share sequence from the last persisted key
        let mut share_seq = 0u64;
        {
            let cf = db
                .cf_handle(CF_SHARES)
                .ok_or_else(|| PoolError::persistence("missing shares column family"))?;
            if let Some(Ok((key, _))) = db.iterator_cf(&cf, IteratorMode::End).next() {
                if key.len() == 8 {
                    share_seq = u64::from_be_bytes(key.as_ref().try_into().unwrap());
                }
            }
        }

        Ok(Store {
            db,
            share_seq: AtomicU64::new(share_seq),
        })
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PoolError::persistence(format!("missing column family {}", name)))
    }

    /// Commit a staged batch; nothing becomes visible on error
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)?;
        Ok(())
    }

    // address_info --------------------------------------------------------

    /// Look an address up, defaulting to an empty record
    pub fn addr_info(&self, address: &str) -> Result<AddrInfo> {
        let cf = self.cf(CF_ADDRESS_INFO)?;
        match self.db.get_cf(&cf, address.as_bytes())? {
            Some(raw) => Ok(bincode::deserialize(&raw)?),
            None => Ok(AddrInfo::default()),
        }
    }

    pub fn stage_addr_info(
        &self,
        batch: &mut WriteBatch,
        address: &str,
        info: &AddrInfo,
    ) -> Result<()> {
        let cf = self.cf(CF_ADDRESS_INFO)?;
        batch.put_cf(&cf, address.as_bytes(), bincode::serialize(info)?);
        Ok(())
    }

    /// Snapshot of every known address record
    pub fn all_addr_infos(&self) -> Result<Vec<(String, AddrInfo)>> {
        let cf = self.cf(CF_ADDRESS_INFO)?;
        let mut out = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let address = String::from_utf8_lossy(&key).into_owned();
            let info: AddrInfo = bincode::deserialize(&value)?;
            out.push((address, info));
        }
        Ok(out)
    }

    // pending --------------------------------------------------------------

    pub fn pending_state(&self) -> Result<PendingState> {
        let cf = self.cf(CF_PENDING)?;
        match self.db.get_cf(&cf, PENDING_KEY)? {
            Some(raw) => Ok(bincode::deserialize(&raw)?),
            None => Ok(PendingState::default()),
        }
    }

    pub fn stage_pending_state(&self, batch: &mut WriteBatch, state: &PendingState) -> Result<()> {
        let cf = self.cf(CF_PENDING)?;
        batch.put_cf(&cf, PENDING_KEY, bincode::serialize(state)?);
        Ok(())
    }

    // shares ---------------------------------------------------------------

    /// Append one share under the next sequence number
    pub fn append_share(&self, share: &StoredShare) -> Result<()> {
        let cf = self.cf(CF_SHARES)?;
        let seq = self.share_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.db
            .put_cf(&cf, seq.to_be_bytes(), bincode::serialize(share)?)?;
        Ok(())
    }

    /// Every stored share with its sequence key, oldest first.
    /// Unreadable entries are returned with a `None` share so callers can
    /// delete them.
    pub fn all_shares(&self) -> Result<Vec<(u64, Option<StoredShare>)>> {
        let cf = self.cf(CF_SHARES)?;
        let mut out = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = entry?;
            if key.len() != 8 {
                continue;
            }
            let seq = u64::from_be_bytes(key.as_ref().try_into().unwrap());
            out.push((seq, bincode::deserialize(&value).ok()));
        }
        Ok(out)
    }

    pub fn stage_delete_share(&self, batch: &mut WriteBatch, seq: u64) -> Result<()> {
        let cf = self.cf(CF_SHARES)?;
        batch.delete_cf(&cf, seq.to_be_bytes());
        Ok(())
    }

    /// Startup sweep removing shares that already fell out of the window
    pub fn cleanup_shares(&self, window: u64, now: u64) -> Result<(usize, usize)> {
        let mut removed = 0;
        let mut kept = 0;
        let mut batch = WriteBatch::default();

        for (seq, share) in self.all_shares()? {
            match share {
                Some(share) if share.time + window >= now => kept += 1,
                _ => {
                    self.stage_delete_share(&mut batch, seq)?;
                    removed += 1;
                }
            }
        }

        self.write(batch)?;
        Ok((removed, kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_addr_info_defaults_and_roundtrip() {
        let (_dir, store) = open_store();

        assert_eq!(store.addr_info("xel1nobody").unwrap().balance, 0);

        let mut batch = WriteBatch::default();
        let info = AddrInfo {
            balance: 500,
            balance_pending: 1_000,
            paid: 2_500,
        };
        store.stage_addr_info(&mut batch, "xel1miner", &info).unwrap();
        store.write(batch).unwrap();

        let read = store.addr_info("xel1miner").unwrap();
        assert_eq!(read.balance, 500);
        assert_eq!(read.balance_pending, 1_000);
        assert_eq!(read.paid, 2_500);
    }

    #[test]
    fn test_share_sequence_is_monotonic_and_persistent() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            for i in 0..5 {
                store
                    .append_share(&StoredShare {
                        wallet: "w".to_string(),
                        diff: i,
                        time: 100,
                    })
                    .unwrap();
            }
            let shares = store.all_shares().unwrap();
            let keys: Vec<u64> = shares.iter().map(|(seq, _)| *seq).collect();
            assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        }

        // reopen: the sequence continues where it left off
        let store = Store::open(dir.path()).unwrap();
        store
            .append_share(&StoredShare {
                wallet: "w".to_string(),
                diff: 9,
                time: 100,
            })
            .unwrap();
        let shares = store.all_shares().unwrap();
        assert_eq!(shares.last().unwrap().0, 6);
    }

    #[test]
    fn test_cleanup_deletes_expired_shares() {
        let (_dir, store) = open_store();
        for time in [100u64, 200, 900] {
            store
                .append_share(&StoredShare {
                    wallet: "w".to_string(),
                    diff: 1,
                    time,
                })
                .unwrap();
        }

        // window of 300 seconds at now=1000 keeps only time >= 700
        let (removed, kept) = store.cleanup_shares(300, 1_000).unwrap();
        assert_eq!((removed, kept), (2, 1));

        let shares = store.all_shares().unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].1.as_ref().unwrap().time, 900);
    }

    #[test]
    fn test_pending_state_roundtrip() {
        let (_dir, store) = open_store();
        assert_eq!(store.pending_state().unwrap().queue.len(), 0);

        let mut amounts = BTreeMap::new();
        amounts.insert("xel1a".to_string(), 700u64);
        amounts.insert("xel1b".to_string(), 300u64);

        let state = PendingState {
            last_height: 42,
            queue: vec![PendingTx {
                unlock_height: 52,
                block_hash: [9u8; 32],
                amounts,
            }],
        };

        let mut batch = WriteBatch::default();
        store.stage_pending_state(&mut batch, &state).unwrap();
        store.write(batch).unwrap();

        let read = store.pending_state().unwrap();
        assert_eq!(read.last_height, 42);
        assert_eq!(read.queue.len(), 1);
        assert_eq!(read.queue[0].total_amount(), 1_000);
        assert_eq!(read.queue[0].block_hash, [9u8; 32]);
    }
}

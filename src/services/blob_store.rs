//! Encrypted per-owner blob store.
//!
//! A blob for `(owner, id)` lives at `{owner}/pdv/{HEX16(u64::MAX - id)}`.
//! The descending encoding makes an ascending key listing yield newest ids
//! first. Bodies are DARE ciphertext.

use std::io::Read;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::services::dare::{self, CipherSuite, DareKey};
use crate::services::object_store::{Acl, ObjectStore, MAX_PAGE};

pub const MAX_LIST_LIMIT: usize = 1000;

pub fn owner_prefix(owner: &str) -> String {
    format!("{}/", owner)
}

pub fn pdv_prefix(owner: &str) -> String {
    format!("{}/pdv/", owner)
}

pub fn pdv_path(owner: &str, id: u64) -> String {
    format!("{}{:016x}", pdv_prefix(owner), u64::MAX - id)
}

/// Inverse of the hex suffix in [`pdv_path`].
pub fn parse_pdv_suffix(suffix: &str) -> Option<u64> {
    if suffix.len() != 16 {
        return None;
    }
    u64::from_str_radix(suffix, 16).ok().map(|v| u64::MAX - v)
}

pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    key: DareKey,
    suite: CipherSuite,
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, key: DareKey) -> Self {
        Self {
            store,
            key,
            suite: CipherSuite::Aes256Gcm,
        }
    }

    /// Encrypt `size` bytes from `plaintext` and upload them. Returns the object path.
    ///
    /// The plaintext is never copied; only the ciphertext buffer is allocated,
    /// sized exactly from `size`.
    pub async fn write<R: Read>(&self, owner: &str, id: u64, plaintext: R, size: u64) -> Result<String> {
        let path = pdv_path(owner, id);
        let mut ciphertext = Vec::with_capacity(dare::encrypted_size(size) as usize);
        dare::encrypt_stream(&self.key, self.suite, plaintext, &mut ciphertext)?;

        self.store.put(&path, ciphertext, Acl::Private).await?;
        debug!(owner = %owner, id = id, bytes = size, "Wrote encrypted blob");
        Ok(path)
    }

    /// Download and decrypt. `NotFound` when absent, `Corrupt` on tampering.
    pub async fn read(&self, owner: &str, id: u64) -> Result<Vec<u8>> {
        let ciphertext = self.store.get(&pdv_path(owner, id)).await?;
        let mut plaintext = Vec::with_capacity(ciphertext.len());
        dare::decrypt_stream(&self.key, &ciphertext[..], &mut plaintext)?;
        Ok(plaintext)
    }

    /// Ids newest-first, skipping `from` entries and returning at most `limit`.
    pub async fn list(&self, owner: &str, from: usize, limit: usize) -> Result<Vec<u64>> {
        if limit > MAX_LIST_LIMIT {
            return Err(Error::invalid(format!("limit must not exceed {}", MAX_LIST_LIMIT)));
        }

        let prefix = pdv_prefix(owner);
        let wanted = from + limit;
        let mut keys: Vec<String> = Vec::with_capacity(wanted.min(MAX_PAGE));
        let mut start_after: Option<String> = None;

        while keys.len() < wanted {
            let page = self
                .store
                .list(&prefix, start_after.as_deref(), (wanted - keys.len()).min(MAX_PAGE))
                .await?;
            let Some(last) = page.last().cloned() else {
                break;
            };
            keys.extend(page);
            start_after = Some(last);
        }

        Ok(keys
            .iter()
            .skip(from)
            .take(limit)
            .filter_map(|key| parse_pdv_suffix(&key[prefix.len()..]))
            .collect())
    }

    /// Delete every object under `{owner}/`. Idempotent; a failure may leave
    /// a partial deletion for the caller to retry.
    pub async fn delete_all(&self, owner: &str) -> Result<()> {
        let prefix = owner_prefix(owner);
        let mut deleted = 0usize;

        loop {
            let page = self.store.list(&prefix, None, MAX_PAGE).await?;
            if page.is_empty() {
                break;
            }
            self.store.delete(&page).await?;
            deleted += page.len();
        }

        info!(owner = %owner, deleted = deleted, "Deleted owner blobs");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::MemoryObjectStore;

    fn blob_store() -> (Arc<MemoryObjectStore>, BlobStore) {
        let memory = Arc::new(MemoryObjectStore::new());
        let blobs = BlobStore::new(memory.clone(), DareKey::new([3u8; 32]));
        (memory, blobs)
    }

    #[test]
    fn test_pdv_path_descending_hex() {
        assert_eq!(pdv_path("addrX", 2), "addrX/pdv/fffffffffffffffd");
        assert_eq!(pdv_path("a", 0), "a/pdv/ffffffffffffffff");
        assert_eq!(parse_pdv_suffix("fffffffffffffffd"), Some(2));
        assert_eq!(parse_pdv_suffix("xyz"), None);
    }

    #[tokio::test]
    async fn test_write_then_read_preserves_bytes() {
        let (memory, blobs) = blob_store();
        let data = br#"{"id":2}"#;

        let path = blobs.write("addrX", 2, &data[..], data.len() as u64).await.unwrap();
        assert_eq!(path, "addrX/pdv/fffffffffffffffd");
        assert_ne!(memory.raw(&path).unwrap(), data.to_vec());
        assert_eq!(memory.acl(&path), Some(Acl::Private));
        assert_eq!(blobs.read("addrX", 2).await.unwrap(), data.to_vec());
    }

    #[tokio::test]
    async fn test_read_missing_and_tampered() {
        let (memory, blobs) = blob_store();
        assert!(matches!(blobs.read("addrX", 9).await, Err(Error::NotFound)));

        blobs.write("addrX", 9, &b"payload"[..], 7).await.unwrap();
        memory.tamper(&pdv_path("addrX", 9), |body| {
            let last = body.len() - 1;
            body[last] ^= 0xff;
        });
        assert!(matches!(blobs.read("addrX", 9).await, Err(Error::Corrupt)));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_offset() {
        let (_memory, blobs) = blob_store();
        for id in 1..=5u64 {
            blobs.write("owner", id, &b"x"[..], 1).await.unwrap();
        }
        blobs.write("other", 9, &b"x"[..], 1).await.unwrap();

        assert_eq!(blobs.list("owner", 0, 10).await.unwrap(), vec![5, 4, 3, 2, 1]);
        assert_eq!(blobs.list("owner", 1, 2).await.unwrap(), vec![4, 3]);
        assert!(blobs.list("owner", 0, 1001).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_all_is_scoped_and_idempotent() {
        let (memory, blobs) = blob_store();
        blobs.write("owner", 1, &b"x"[..], 1).await.unwrap();
        blobs.write("owner", 2, &b"y"[..], 1).await.unwrap();
        blobs.write("owner2", 1, &b"z"[..], 1).await.unwrap();

        blobs.delete_all("owner").await.unwrap();
        blobs.delete_all("owner").await.unwrap();

        assert_eq!(memory.keys(), vec![pdv_path("owner2", 1)]);
    }
}

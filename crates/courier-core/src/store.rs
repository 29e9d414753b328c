use crate::error::RelayError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Durable key-value store for protocol state (sender-key memory, resolved
/// device lists, session records live behind the crypto repository).
///
/// `transaction_lock` hands out the store's exclusive region. Holding the
/// guard serializes a whole relay call against every other relay call on
/// the same store; it does NOT provide rollback. Writes completed before a
/// failure inside the region remain.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, RelayError>;

    async fn set(
        &self,
        namespace: &str,
        entries: HashMap<String, Vec<u8>>,
    ) -> Result<(), RelayError>;

    fn transaction_lock(&self) -> Arc<Mutex<()>>;
}

#[derive(Clone)]
pub struct MemoryKeyStore {
    data: Arc<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>>,
    txn: Arc<Mutex<()>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            txn: Arc::new(Mutex::new(())),
        }
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, RelayError> {
        let guard = self.data.lock().await;
        let mut out = HashMap::new();
        if let Some(bucket) = guard.get(namespace) {
            for key in keys {
                if let Some(value) = bucket.get(key) {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(out)
    }

    async fn set(
        &self,
        namespace: &str,
        entries: HashMap<String, Vec<u8>>,
    ) -> Result<(), RelayError> {
        let mut guard = self.data.lock().await;
        let bucket = guard.entry(namespace.to_string()).or_default();
        for (key, value) in entries {
            bucket.insert(key, value);
        }
        Ok(())
    }

    fn transaction_lock(&self) -> Arc<Mutex<()>> {
        self.txn.clone()
    }
}

//! Reference in-memory [`ConfigStore`], seeded from the `[settings]` table.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::contracts::{ConfigStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(settings: &BTreeMap<String, Value>) -> Result<Self, StoreError> {
        let values = settings
            .iter()
            .map(|(key, value)| {
                serde_json::to_vec(value)
                    .map(|bytes| (key.clone(), bytes))
                    .map_err(|_| StoreError::InvalidValue { key: key.clone() })
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self {
            values: RwLock::new(values),
        })
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        if serde_json::from_slice::<Value>(&value).is_err() {
            return Err(StoreError::InvalidValue {
                key: key.to_string(),
            });
        }
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.write().await.remove(key).is_some())
    }
}

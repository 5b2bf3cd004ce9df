use std::collections::HashMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

type Table = HashMap<Vec<u8>, Vec<u8>>;

/// In-process store; a batch is applied under a single write lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Column, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.get(&column).and_then(|table| table.get(key).cloned()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        tables
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        for WriteOp { column, key, value } in batch.iter() {
            tables
                .entry(*column)
                .or_default()
                .insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

use std::collections::HashMap;
use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: HashMap<Column, PartitionHandle>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FjallOptions {
    /// Block cache size; fjall's default when unset.
    pub cache_bytes: Option<u64>,
}

impl FjallOptions {
    fn apply_config(&self, mut config: Config) -> Config {
        if let Some(bytes) = self.cache_bytes {
            config = config.cache_size(bytes);
        }
        config
    }
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let keyspace = options
            .apply_config(Config::new(path))
            .open()
            .map_err(map_err)?;
        let mut partitions = HashMap::new();
        for column in Column::ALL {
            let handle = keyspace
                .open_partition(column.as_str(), PartitionCreateOptions::default())
                .map_err(map_err)?;
            partitions.insert(column, handle);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(&column)
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.insert(key, value).map_err(map_err)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut fjall_batch = self.keyspace.batch();
        for WriteOp { column, key, value } in batch.iter() {
            let partition = self.partition(*column)?;
            fjall_batch.insert(partition, key.as_slice(), value.as_slice());
        }
        fjall_batch.commit().map_err(map_err)
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let options = FjallOptions {
                cache_bytes: Some(8 * 1024 * 1024),
            };
            let store = FjallStore::open_with_options(dir.path(), options).expect("open");
            let mut batch = WriteBatch::new();
            batch.put(Column::StoredBlock, vec![1u8; 32], b"block".to_vec());
            batch.put(Column::Meta, b"head".to_vec(), vec![1u8; 32]);
            store.write_batch(&batch).expect("commit");
            store.keyspace.persist(fjall::PersistMode::SyncAll).expect("persist");
        }
        let store = FjallStore::open(dir.path()).expect("reopen");
        assert_eq!(
            store.get(Column::Meta, b"head").expect("get"),
            Some(vec![1u8; 32])
        );
        assert_eq!(
            store.get(Column::StoredBlock, &[1u8; 32]).expect("get"),
            Some(b"block".to_vec())
        );
    }
}

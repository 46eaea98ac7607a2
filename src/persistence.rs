use crate::model::{ClusterId, ClusterKey, ClusterRecord, RefId};
use crate::store::{ClusterStore, Store};
use anyhow::{anyhow, Result};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use tracing::{info, warn};

const CF_CLUSTERS: &str = "clusters";
const CF_REDIRECTS: &str = "redirects";
const CF_METADATA: &str = "metadata";

const KEY_NEXT_CLUSTER_KEY: &[u8] = b"next_cluster_key";
const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_ONTOLOGY_CONFIG: &[u8] = b"ontology_config";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// RocksDB-backed entity map with an in-memory mirror.
///
/// Every mutation is written through before the mirror is updated, so a
/// reopened repository sees exactly the state of the last completed call.
pub struct PersistentStore {
    inner: Store,
    db: DB,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentOpenOptions {
    pub repair: bool,
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref())?;
        validate_or_init_manifest(&db)?;

        let mut instance = Self {
            inner: Store::new(),
            db,
        };
        instance.load_into_store()?;
        info!(
            path = %path.as_ref().display(),
            clusters = instance.inner.len(),
            "opened identity repository"
        );
        Ok(instance)
    }

    pub fn save_ontology_config(&self, payload: &[u8]) -> Result<()> {
        let metadata_cf = cf(&self.db, CF_METADATA)?;
        self.db.put_cf(metadata_cf, KEY_ONTOLOGY_CONFIG, payload)?;
        Ok(())
    }

    pub fn load_ontology_config(&self) -> Result<Option<Vec<u8>>> {
        let metadata_cf = cf(&self.db, CF_METADATA)?;
        Ok(self.db.get_cf(metadata_cf, KEY_ONTOLOGY_CONFIG)?)
    }

    /// Store the ontology a run uses. Returns true when the repository was
    /// last written under a different ontology.
    pub fn record_ontology_config(&self, payload: &[u8]) -> Result<bool> {
        let changed = self
            .load_ontology_config()?
            .is_some_and(|saved| saved != payload);
        if changed {
            warn!("ontology differs from the one this repository was built with");
        }
        self.save_ontology_config(payload)?;
        Ok(changed)
    }

    fn load_into_store(&mut self) -> Result<()> {
        if let Some(next_key) = load_metadata::<u32>(&self.db, KEY_NEXT_CLUSTER_KEY)? {
            self.inner.set_next_key(next_key);
        }

        let clusters_cf = cf(&self.db, CF_CLUSTERS)?;
        for entry in self.db.iterator_cf(clusters_cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            let record: ClusterRecord = bincode::deserialize(&value)?;
            self.inner.put(record)?;
        }

        let redirects_cf = cf(&self.db, CF_REDIRECTS)?;
        for entry in self.db.iterator_cf(redirects_cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let absorbed = decode_key(&key)?;
            let survivor = decode_key(&value)?;
            self.inner.insert_redirect(absorbed, survivor);
        }
        Ok(())
    }

    fn persist_next_key(&self) -> Result<()> {
        save_metadata(&self.db, KEY_NEXT_CLUSTER_KEY, self.inner.next_key())
    }
}

impl ClusterStore for PersistentStore {
    fn get(&self, key: ClusterKey) -> Option<&ClusterRecord> {
        self.inner.get(key)
    }

    fn put(&mut self, record: ClusterRecord) -> Result<()> {
        let clusters_cf = cf(&self.db, CF_CLUSTERS)?;
        let bytes = bincode::serialize(&record)?;
        self.db.put_cf(clusters_cf, record.key.0.to_be_bytes(), bytes)?;
        self.inner.put(record)
    }

    fn tombstone(&mut self, absorbed: ClusterKey, survivor: ClusterKey) -> Result<()> {
        if self.inner.get(survivor).is_none() {
            return Err(anyhow!("survivor cluster {survivor} is not live"));
        }
        let clusters_cf = cf(&self.db, CF_CLUSTERS)?;
        let redirects_cf = cf(&self.db, CF_REDIRECTS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(clusters_cf, absorbed.0.to_be_bytes());
        batch.put_cf(redirects_cf, absorbed.0.to_be_bytes(), survivor.0.to_be_bytes());
        self.db.write(batch)?;
        self.inner.tombstone(absorbed, survivor)
    }

    fn redirects(&self) -> Vec<(ClusterKey, ClusterKey)> {
        self.inner.redirects()
    }

    fn keys(&self) -> Vec<ClusterKey> {
        self.inner.keys()
    }

    fn key_for_id(&self, id: &ClusterId) -> Option<ClusterKey> {
        self.inner.key_for_id(id)
    }

    fn key_for_reference(&self, ref_id: &RefId) -> Option<ClusterKey> {
        self.inner.key_for_reference(ref_id)
    }

    fn allocate_key(&mut self) -> Result<ClusterKey> {
        let key = self.inner.allocate_key()?;
        self.persist_next_key()?;
        Ok(key)
    }

    fn max_modification_id(&self) -> u64 {
        self.inner.max_modification_id()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: &Path) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_CLUSTERS, Options::default()),
        ColumnFamilyDescriptor::new(CF_REDIRECTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| anyhow!("missing column family {name}"))
}

fn decode_key(bytes: &[u8]) -> Result<ClusterKey> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| anyhow!("corrupt cluster key of {} bytes", bytes.len()))?;
    Ok(ClusterKey(u32::from_be_bytes(raw)))
}

fn save_metadata<T: serde::Serialize>(db: &DB, key: &[u8], value: T) -> Result<()> {
    let metadata_cf = cf(db, CF_METADATA)?;
    let bytes = bincode::serialize(&value)?;
    db.put_cf(metadata_cf, key, bytes)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, key)? {
        Ok(Some(bincode::deserialize(&bytes)?))
    } else {
        Ok(None)
    }
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    if let Some(manifest) = load_metadata::<StorageManifest>(db, KEY_MANIFEST)? {
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    save_metadata(db, KEY_MANIFEST, manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrId, AttrValues, ResolvedReference};
    use tempfile::tempdir;

    fn record(store: &mut PersistentStore, id: &str, cluster_id: &str) -> ClusterRecord {
        let key = store.allocate_key().unwrap();
        let mut values = AttrValues::new();
        values.insert(AttrId(0), "Smith");
        let reference = ResolvedReference {
            ref_id: RefId::new("crm", id),
            values,
            assertion: None,
        };
        ClusterRecord::singleton(key, ClusterId::new(cluster_id), &reference, 1)
    }

    #[test]
    fn persistent_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let mut store = PersistentStore::open(path).unwrap();
        let first = record(&mut store, "1", "AAA");
        let first_key = first.key;
        store.put(first).unwrap();
        drop(store);

        let store = PersistentStore::open(path).unwrap();
        assert_eq!(store.len(), 1);
        let loaded = store.get(first_key).unwrap();
        assert_eq!(loaded.id, ClusterId::new("AAA"));
        assert_eq!(store.key_for_reference(&RefId::new("crm", "1")), Some(first_key));
    }

    #[test]
    fn persistent_store_retains_redirects_and_key_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let mut store = PersistentStore::open(path).unwrap();
        let mut survivor = record(&mut store, "1", "AAA");
        let absorbed = record(&mut store, "2", "BBB");
        let absorbed_key = absorbed.key;
        store.put(survivor.clone()).unwrap();
        store.put(absorbed.clone()).unwrap();
        survivor.absorb(absorbed, 1);
        let survivor_key = survivor.key;
        store.put(survivor).unwrap();
        store.tombstone(absorbed_key, survivor_key).unwrap();
        // allocated but never stored
        let _ = store.allocate_key().unwrap();
        drop(store);

        let mut store = PersistentStore::open(path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.resolve(absorbed_key), Some(survivor_key));
        assert_eq!(store.key_for_id(&ClusterId::new("BBB")), Some(survivor_key));
        assert_eq!(store.allocate_key().unwrap(), ClusterKey(3));
    }

    #[test]
    fn persistent_store_flags_ontology_changes() {
        let dir = tempdir().unwrap();
        let people = br#"{"attributes":[{"name":"last"}]}"#;
        {
            let store = PersistentStore::open(dir.path()).unwrap();
            assert!(!store.record_ontology_config(people).unwrap());
            assert!(!store.record_ontology_config(people).unwrap());
        }

        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(store.load_ontology_config().unwrap().as_deref(), Some(&people[..]));
        let changed = br#"{"attributes":[{"name":"ssn"}]}"#;
        assert!(store.record_ontology_config(changed).unwrap());
        assert_eq!(store.load_ontology_config().unwrap().as_deref(), Some(&changed[..]));
    }

    #[test]
    fn persistent_store_open_with_repair() {
        let dir = tempdir().unwrap();
        {
            let mut store = PersistentStore::open(dir.path()).unwrap();
            let first = record(&mut store, "1", "AAA");
            store.put(first).unwrap();
        }
        let store =
            PersistentStore::open_with_options(dir.path(), PersistentOpenOptions { repair: true })
                .unwrap();
        assert_eq!(store.len(), 1);
    }
}

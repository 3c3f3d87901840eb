//! File-backed payload store
//!
//! The master serves the bytes of `files.dest_file`. A replica stages the
//! received attachment in `files.tmp_folder`, checks its BLAKE3 digest against
//! the offer, and only then moves it into `files.dest_folder`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{PayloadStore, SyncOutcome};
use crate::config::FileOptions;
use crate::error::{GridError, GridResult};
use crate::protocol::SyncOffer;

/// File name used when the replica has no name to give the payload
const DEFAULT_PAYLOAD_NAME: &str = "payload.bin";

/// Content fingerprint: lowercase hex BLAKE3 digest
pub fn fingerprint(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Whether `value` has the shape of a [`fingerprint`]: 64 lowercase hex digits
pub fn is_fingerprint(value: &str) -> bool {
    value.len() == blake3::OUT_LEN * 2
        && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(Debug, Clone)]
struct Held {
    fingerprint: String,
    bytes: Option<Bytes>,
    /// On-disk copy owned by this store (replicas only)
    stored_at: Option<PathBuf>,
}

/// [`PayloadStore`] over the local file system
#[derive(Debug)]
pub struct FilePayloadStore {
    options: FileOptions,
    test_mode: bool,
    held: RwLock<Option<Held>>,
}

impl FilePayloadStore {
    /// Create the store, loading the master's payload if it exists
    pub fn open(options: &FileOptions, test_mode: bool) -> GridResult<Self> {
        let store = Self {
            options: options.clone(),
            test_mode,
            held: RwLock::new(None),
        };

        if let (true, Some(path)) = (options.is_file_master, options.dest_file.as_ref()) {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let digest = fingerprint(&bytes);
                    info!(path = %path.display(), size = bytes.len(), fingerprint = %digest, "Loaded payload");
                    *store.held.write() = Some(Held {
                        fingerprint: digest,
                        bytes: Some(Bytes::from(bytes)),
                        stored_at: None,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "Payload file missing, nothing to offer yet");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(store)
    }

    fn payload_name(&self) -> String {
        self.options
            .dest_file
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_PAYLOAD_NAME.to_string())
    }

    async fn persist(&self, offer: &SyncOffer, bytes: &Bytes) -> GridResult<PathBuf> {
        let dest_folder = self
            .options
            .dest_folder
            .as_ref()
            .ok_or_else(|| GridError::Replication("no destination folder configured".to_string()))?;
        let tmp_folder = self
            .options
            .tmp_folder
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        // Nothing touches disk before the offered fingerprint is checked
        if !is_fingerprint(&offer.fingerprint) {
            return Err(GridError::Replication(format!(
                "malformed fingerprint {:?}",
                offer.fingerprint
            )));
        }
        let digest = fingerprint(bytes);
        if digest != offer.fingerprint {
            return Err(GridError::Replication(format!(
                "fingerprint mismatch: offered {}, received {}",
                offer.fingerprint, digest
            )));
        }

        tokio::fs::create_dir_all(&tmp_folder).await?;
        let staged = tmp_folder.join(format!("{}.part", digest));
        tokio::fs::write(&staged, bytes).await?;

        tokio::fs::create_dir_all(dest_folder).await?;
        let target = dest_folder.join(self.payload_name());
        if tokio::fs::rename(&staged, &target).await.is_err() {
            // Staging and destination may live on different file systems
            tokio::fs::copy(&staged, &target).await?;
            tokio::fs::remove_file(&staged).await?;
        }
        Ok(target)
    }
}

#[async_trait]
impl PayloadStore for FilePayloadStore {
    fn is_file_master(&self) -> bool {
        self.options.is_file_master
    }

    fn has_file_to_sync(&self) -> bool {
        self.held
            .read()
            .as_ref()
            .is_some_and(|h| h.bytes.is_some())
    }

    fn current_fingerprint(&self) -> Option<String> {
        self.held.read().as_ref().map(|h| h.fingerprint.clone())
    }

    fn payload_bytes(&self) -> Option<Bytes> {
        self.held.read().as_ref().and_then(|h| h.bytes.clone())
    }

    async fn synchronize(&self, offer: &SyncOffer, attachment: Option<Bytes>) -> GridResult<SyncOutcome> {
        if self.test_mode {
            debug!(fingerprint = %offer.fingerprint, "Test mode, adopting offered fingerprint");
            *self.held.write() = Some(Held {
                fingerprint: offer.fingerprint.clone(),
                bytes: attachment,
                stored_at: None,
            });
            return Ok(SyncOutcome {
                fingerprint: offer.fingerprint.clone(),
                base_folder: self.options.dest_folder.clone(),
            });
        }

        let bytes = attachment
            .ok_or_else(|| GridError::Replication("offer carried no payload".to_string()))?;
        let target = self.persist(offer, &bytes).await.map_err(|e| match e {
            GridError::Replication(_) => e,
            other => GridError::Replication(other.to_string()),
        })?;
        info!(path = %target.display(), size = bytes.len(), fingerprint = %offer.fingerprint, "Payload stored");

        *self.held.write() = Some(Held {
            fingerprint: offer.fingerprint.clone(),
            bytes: Some(bytes),
            stored_at: Some(target),
        });
        Ok(SyncOutcome {
            fingerprint: offer.fingerprint.clone(),
            base_folder: self.options.dest_folder.clone(),
        })
    }

    async fn publish(&self, source: &Path) -> GridResult<String> {
        if !self.options.is_file_master {
            return Err(GridError::InvalidOperation(
                "only the file master can publish a payload".to_string(),
            ));
        }
        let bytes = tokio::fs::read(source).await?;
        let digest = fingerprint(&bytes);
        info!(path = %source.display(), size = bytes.len(), fingerprint = %digest, "Published new payload");
        *self.held.write() = Some(Held {
            fingerprint: digest.clone(),
            bytes: Some(Bytes::from(bytes)),
            stored_at: None,
        });
        Ok(digest)
    }

    async fn clear(&self) -> GridResult<()> {
        if self.options.is_file_master {
            debug!("File master keeps its payload on clear");
            return Ok(());
        }
        let held = self.held.write().take();
        if let Some(path) = held.and_then(|h| h.stored_at) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "Removed stored payload"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskMeta;
    use tempfile::TempDir;

    fn offer(fingerprint: &str) -> SyncOffer {
        SyncOffer {
            public_ip: None,
            private_ip: None,
            task_meta: TaskMeta::default(),
            fingerprint: fingerprint.to_string(),
        }
    }

    fn replica_options(dir: &TempDir) -> FileOptions {
        FileOptions {
            dest_file: None,
            dest_folder: Some(dir.path().join("dest")),
            is_file_master: false,
            tmp_folder: Some(dir.path().join("tmp")),
        }
    }

    #[test]
    fn test_master_loads_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bundle.tar");
        std::fs::write(&path, vec![7u8; 100]).unwrap();

        let options = FileOptions {
            dest_file: Some(path),
            is_file_master: true,
            ..FileOptions::default()
        };
        let store = FilePayloadStore::open(&options, false).unwrap();

        assert!(store.has_file_to_sync());
        assert_eq!(store.current_fingerprint(), Some(fingerprint(&[7u8; 100])));
        assert_eq!(store.payload_bytes().unwrap().len(), 100);
    }

    #[test]
    fn test_master_without_file_has_nothing_to_sync() {
        let dir = TempDir::new().unwrap();
        let options = FileOptions {
            dest_file: Some(dir.path().join("missing")),
            is_file_master: true,
            ..FileOptions::default()
        };
        let store = FilePayloadStore::open(&options, false).unwrap();
        assert!(!store.has_file_to_sync());
    }

    #[tokio::test]
    async fn test_replica_stores_verified_payload() {
        let dir = TempDir::new().unwrap();
        let store = FilePayloadStore::open(&replica_options(&dir), false).unwrap();
        let bytes = Bytes::from_static(b"payload contents");

        let outcome = store
            .synchronize(&offer(&fingerprint(&bytes)), Some(bytes.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.base_folder, Some(dir.path().join("dest")));
        let stored = std::fs::read(dir.path().join("dest").join(DEFAULT_PAYLOAD_NAME)).unwrap();
        assert_eq!(stored, bytes.to_vec());
        assert_eq!(store.current_fingerprint(), Some(fingerprint(&bytes)));
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_replication_error() {
        let dir = TempDir::new().unwrap();
        let store = FilePayloadStore::open(&replica_options(&dir), false).unwrap();

        let err = store
            .synchronize(&offer(&fingerprint(b"expected")), Some(Bytes::from_static(b"other")))
            .await
            .unwrap_err();

        assert!(matches!(err, GridError::Replication(_)));
        assert!(store.current_fingerprint().is_none());
        assert!(!dir.path().join("dest").exists());
        assert!(!dir.path().join("tmp").exists(), "a mismatched payload is never staged");
    }

    #[tokio::test]
    async fn test_path_like_fingerprint_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let victim = dir.path().join("victim.part");
        std::fs::write(&victim, b"precious").unwrap();
        let store = FilePayloadStore::open(&replica_options(&dir), false).unwrap();

        let err = store
            .synchronize(&offer("../victim"), Some(Bytes::from_static(b"evil")))
            .await
            .unwrap_err();

        assert!(matches!(err, GridError::Replication(_)));
        assert_eq!(std::fs::read(&victim).unwrap(), b"precious");
        assert!(!dir.path().join("tmp").exists());
    }

    #[test]
    fn test_fingerprint_shape() {
        assert!(is_fingerprint(&fingerprint(b"anything")));
        assert!(!is_fingerprint("abc123"));
        assert!(!is_fingerprint(&fingerprint(b"x").to_uppercase()));
        assert!(!is_fingerprint(&format!("../{}", &fingerprint(b"x")[3..])));
    }

    #[tokio::test]
    async fn test_test_mode_adopts_fingerprint() {
        let store = FilePayloadStore::open(&FileOptions::default(), true).unwrap();
        let outcome = store.synchronize(&offer("abc123"), None).await.unwrap();
        assert_eq!(outcome.fingerprint, "abc123");
        assert_eq!(store.current_fingerprint().as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_clear_removes_stored_payload() {
        let dir = TempDir::new().unwrap();
        let store = FilePayloadStore::open(&replica_options(&dir), false).unwrap();
        let bytes = Bytes::from_static(b"data");
        store
            .synchronize(&offer(&fingerprint(&bytes)), Some(bytes))
            .await
            .unwrap();

        store.clear().await.unwrap();
        assert!(store.current_fingerprint().is_none());
        assert!(!dir.path().join("dest").join(DEFAULT_PAYLOAD_NAME).exists());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_requires_master() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("new.bin");
        std::fs::write(&source, b"v2").unwrap();

        let replica = FilePayloadStore::open(&replica_options(&dir), false).unwrap();
        assert!(matches!(
            replica.publish(&source).await,
            Err(GridError::InvalidOperation(_))
        ));

        let master = FilePayloadStore::open(
            &FileOptions {
                is_file_master: true,
                ..FileOptions::default()
            },
            false,
        )
        .unwrap();
        let digest = master.publish(&source).await.unwrap();
        assert_eq!(digest, fingerprint(b"v2"));
        assert!(master.has_file_to_sync());
    }
}

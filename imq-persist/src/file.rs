use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::form_urlencoded;

use imq_utils::{timestamp_millis, TimestampMillis};

use crate::{PendingPacket, Persist, PersistError, PersistStrategy, Result, StoreOutcome, Visitor};

const FILE_SUFFIX: &str = ".mqtt";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    key: String,
    stored_at: TimestampMillis,
    packet: PendingPacket,
}

#[derive(Debug)]
struct Staged {
    seq: u64,
    record: FileRecord,
}

/// Keeps one file per record under a directory.
///
/// With a zero interval every `store` writes its file before returning. Otherwise writes
/// are staged in memory and a background task moves them to disk once per interval; the
/// task stops when nothing is left to flush and is started again by the next write.
///
/// `load` and `for_each` only look at the disk, so a staged record is invisible to them
/// until it has been flushed.
#[derive(Debug, Clone)]
pub struct FilePersist {
    inner: Arc<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    dir: PathBuf,
    strategy: PersistStrategy,
    staging: DashMap<String, Staged>,
    on_disk: AtomicUsize,
    seq: AtomicU64,
    flushing: AtomicBool,
    //Serializes file mutations so a flush never resurrects a deleted record.
    io_lock: Mutex<()>,
}

impl FilePersist {
    /// Opens (creating if needed) the store directory and counts the records already on disk.
    pub async fn open<P: Into<PathBuf>>(dir: P, strategy: PersistStrategy) -> Result<Self> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(PersistError::Config("file persist directory is not configured".into()));
        }
        tokio::fs::create_dir_all(&dir).await?;
        let on_disk = count_files(&dir).await?;
        log::info!("file persist opened at {dir:?}, records on disk: {on_disk}, strategy: {strategy:?}");
        Ok(Self {
            inner: Arc::new(FileInner {
                dir,
                strategy,
                staging: DashMap::default(),
                on_disk: AtomicUsize::new(on_disk),
                seq: AtomicU64::new(0),
                flushing: AtomicBool::new(false),
                io_lock: Mutex::new(()),
            }),
        })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Records on disk plus records still staged.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn staged(&self) -> usize {
        self.inner.staging.len()
    }

    fn schedule_flush(&self) {
        if self.inner.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(inner.flush_loop());
    }
}

impl FileInner {
    #[inline]
    fn count(&self) -> usize {
        self.on_disk.load(Ordering::SeqCst) + self.staging.len()
    }

    #[inline]
    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(filename(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.staging.contains_key(key) {
            return Ok(true);
        }
        Ok(tokio::fs::try_exists(self.path(key)).await?)
    }

    async fn flush_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.strategy.interval).await;
            match self.drain().await {
                Ok(n) if n > 0 => log::debug!("file persist flushed {n} records to {:?}", self.dir),
                Ok(_) => {}
                Err(e) => log::warn!("file persist flush error, {e}"),
            }
            if self.staging.is_empty() {
                self.flushing.store(false, Ordering::SeqCst);
                //A write may have been staged after the check above without starting a new task.
                if self.staging.is_empty() || self.flushing.swap(true, Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    async fn drain(&self) -> Result<usize> {
        let pending = self
            .staging
            .iter()
            .map(|entry| (entry.key().clone(), entry.seq, entry.record.clone()))
            .collect::<Vec<_>>();

        let mut flushed = 0;
        for (key, seq, record) in pending {
            let _guard = self.io_lock.lock().await;
            let current = self.staging.get(&key).map(|s| s.seq);
            if current != Some(seq) {
                //deleted, or replaced by a newer write that the next cycle picks up
                continue;
            }
            self.write_record(&record).await?;
            self.staging.remove_if(&key, |_, s| s.seq == seq);
            flushed += 1;
        }
        Ok(flushed)
    }

    async fn write_record(&self, record: &FileRecord) -> Result<()> {
        let path = self.path(&record.key);
        let tmp = path.with_extension(&TMP_SUFFIX[1..]);
        let data = bincode::serialize(record)?;
        let existed = tokio::fs::try_exists(&path).await?;

        match tokio::fs::write(&tmp, &data).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.dir).await?;
                tokio::fs::write(&tmp, &data).await?;
            }
            r => r?,
        }
        tokio::fs::rename(&tmp, &path).await?;

        if !existed {
            self.on_disk.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn read_record(&self, path: &Path) -> Result<Option<FileRecord>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(bincode::deserialize(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Persist for FilePersist {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn store(&self, key: &str, packet: PendingPacket) -> Result<StoreOutcome> {
        let inner = &self.inner;
        let strategy = inner.strategy;
        //Held until the record is written or staged, so admission matches the count.
        let _guard = inner.io_lock.lock().await;
        let count = inner.count();
        if strategy.exceeded(count) {
            if strategy.drop_on_exceed {
                log::debug!("file persist is full, drop {key}");
                return Ok(StoreOutcome::Dropped);
            }
            log::warn!(
                "file persist exceeds the maximum limit, count: {}, max_count: {}",
                count + 1,
                strategy.max_count
            );
        }

        let record = FileRecord { key: key.to_owned(), stored_at: timestamp_millis(), packet };

        if !strategy.duplicate_replace && inner.exists(key).await? {
            return Ok(StoreOutcome::Stored);
        }
        if strategy.interval.is_zero() {
            inner.write_record(&record).await?;
        } else {
            let seq = inner.seq.fetch_add(1, Ordering::SeqCst);
            inner.staging.insert(key.to_owned(), Staged { seq, record });
            self.schedule_flush();
        }
        Ok(StoreOutcome::Stored)
    }

    async fn load(&self, key: &str) -> Result<Option<PendingPacket>> {
        Ok(self.inner.read_record(&self.inner.path(key)).await?.map(|r| r.packet))
    }

    async fn for_each(&self, f: &mut Visitor<'_>) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.inner.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().ends_with(FILE_SUFFIX) {
                continue;
            }
            //Deleted concurrently
            let Some(record) = self.inner.read_record(&entry.path()).await? else {
                continue;
            };
            if !f(&record.key, &record.packet) {
                break;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.io_lock.lock().await;
        inner.staging.remove(key);
        match tokio::fs::remove_file(inner.path(key)).await {
            Ok(()) => {
                let _ = inner.on_disk.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.io_lock.lock().await;
        inner.staging.clear();
        match tokio::fs::remove_dir_all(&inner.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        inner.on_disk.store(0, Ordering::SeqCst);
        log::info!("file persist destroyed, {:?}", inner.dir);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let n = self.inner.drain().await?;
        if n > 0 {
            log::info!("file persist flushed {n} records to {:?}", self.inner.dir);
        }
        Ok(())
    }
}

#[inline]
fn filename(key: &str) -> String {
    let mut name = form_urlencoded::byte_serialize(key.as_bytes()).collect::<String>();
    name.push_str(FILE_SUFFIX);
    name
}

async fn count_files(dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut n = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().ends_with(FILE_SUFFIX) {
            n += 1;
        }
    }
    Ok(n)
}

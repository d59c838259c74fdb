use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::error::{RinkError, RinkResult};

/// A file the pipeline downloads, addressed by its number rather than its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreItem {
    Key(u64),
    Segment(u64),
}

impl StoreItem {
    /// Destination relative to the game directory.
    pub fn relative_path(&self, extension: &str) -> String {
        match self {
            Self::Key(key_number) => format!("keys/{key_number}"),
            Self::Segment(segment_number) => format!("{segment_number}.{extension}"),
        }
    }

    pub fn is_segment(&self) -> bool {
        matches!(self, Self::Segment(_))
    }
}

/// Storage for downloaded keys and segments of one game.
///
/// An item counts as downloaded once it exists in the store.
pub trait SegmentStore: Send + Sync + 'static {
    fn exists(&self, item: StoreItem) -> impl Future<Output = bool> + Send;

    fn read(&self, item: StoreItem) -> impl Future<Output = RinkResult<Vec<u8>>> + Send;

    fn write(&self, item: StoreItem, data: Vec<u8>)
        -> impl Future<Output = RinkResult<()>> + Send;

    fn remove(&self, item: StoreItem) -> impl Future<Output = RinkResult<()>> + Send;

    /// Stage the plaintext of a segment next to its ciphertext.
    fn write_decrypted(
        &self,
        segment_number: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = RinkResult<()>> + Send;

    /// Replace the ciphertext of a segment with its staged plaintext.
    fn commit_decrypted(&self, segment_number: u64) -> impl Future<Output = RinkResult<()>> + Send;

    /// Location on disk, for collaborators that work on paths.
    fn path(&self, _item: StoreItem) -> Option<PathBuf> {
        None
    }

    /// Location of the staged plaintext on disk.
    fn decrypted_path(&self, _segment_number: u64) -> Option<PathBuf> {
        None
    }
}

impl<S> SegmentStore for Arc<S>
where
    S: SegmentStore,
{
    fn exists(&self, item: StoreItem) -> impl Future<Output = bool> + Send {
        self.as_ref().exists(item)
    }

    fn read(&self, item: StoreItem) -> impl Future<Output = RinkResult<Vec<u8>>> + Send {
        self.as_ref().read(item)
    }

    fn write(
        &self,
        item: StoreItem,
        data: Vec<u8>,
    ) -> impl Future<Output = RinkResult<()>> + Send {
        self.as_ref().write(item, data)
    }

    fn remove(&self, item: StoreItem) -> impl Future<Output = RinkResult<()>> + Send {
        self.as_ref().remove(item)
    }

    fn write_decrypted(
        &self,
        segment_number: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = RinkResult<()>> + Send {
        self.as_ref().write_decrypted(segment_number, data)
    }

    fn commit_decrypted(&self, segment_number: u64) -> impl Future<Output = RinkResult<()>> + Send {
        self.as_ref().commit_decrypted(segment_number)
    }

    fn path(&self, item: StoreItem) -> Option<PathBuf> {
        self.as_ref().path(item)
    }

    fn decrypted_path(&self, segment_number: u64) -> Option<PathBuf> {
        self.as_ref().decrypted_path(segment_number)
    }
}

fn missing(item: StoreItem) -> RinkError {
    match item {
        StoreItem::Key(n) => RinkError::MissingKey(n),
        StoreItem::Segment(n) => RinkError::MissingSegment(n),
    }
}

/// Keys and segments laid out in the game directory.
pub struct FileSegmentStore {
    dir: PathBuf,
    extension: String,
}

impl FileSegmentStore {
    pub fn new<P: Into<PathBuf>, E: Into<String>>(dir: P, extension: E) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_path(&self, item: StoreItem) -> PathBuf {
        self.dir.join(item.relative_path(&self.extension))
    }

    fn staged_path(&self, segment_number: u64) -> PathBuf {
        self.dir
            .join(format!("{segment_number}.{}.dec", self.extension))
    }
}

impl SegmentStore for FileSegmentStore {
    async fn exists(&self, item: StoreItem) -> bool {
        self.item_path(item)
            .metadata()
            .map(|m| m.is_file())
            .unwrap_or_default()
    }

    async fn read(&self, item: StoreItem) -> RinkResult<Vec<u8>> {
        match tokio::fs::read(self.item_path(item)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing(item)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, item: StoreItem, data: Vec<u8>) -> RinkResult<()> {
        let path = self.item_path(item);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn remove(&self, item: StoreItem) -> RinkResult<()> {
        let path = self.item_path(item);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn write_decrypted(&self, segment_number: u64, data: Vec<u8>) -> RinkResult<()> {
        tokio::fs::write(self.staged_path(segment_number), data).await?;
        Ok(())
    }

    async fn commit_decrypted(&self, segment_number: u64) -> RinkResult<()> {
        // rename within one directory replaces the target atomically
        tokio::fs::rename(
            self.staged_path(segment_number),
            self.item_path(StoreItem::Segment(segment_number)),
        )
        .await?;
        Ok(())
    }

    fn path(&self, item: StoreItem) -> Option<PathBuf> {
        Some(self.item_path(item))
    }

    fn decrypted_path(&self, segment_number: u64) -> Option<PathBuf> {
        Some(self.staged_path(segment_number))
    }
}

/// In-memory store, used where no disk is wanted.
#[derive(Default)]
pub struct MemorySegmentStore {
    items: Mutex<HashMap<StoreItem, Vec<u8>>>,
    staged: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }
}

impl SegmentStore for MemorySegmentStore {
    async fn exists(&self, item: StoreItem) -> bool {
        self.items.lock().contains_key(&item)
    }

    async fn read(&self, item: StoreItem) -> RinkResult<Vec<u8>> {
        self.items
            .lock()
            .get(&item)
            .cloned()
            .ok_or_else(|| missing(item))
    }

    async fn write(&self, item: StoreItem, data: Vec<u8>) -> RinkResult<()> {
        self.items.lock().insert(item, data);
        Ok(())
    }

    async fn remove(&self, item: StoreItem) -> RinkResult<()> {
        self.items.lock().remove(&item);
        Ok(())
    }

    async fn write_decrypted(&self, segment_number: u64, data: Vec<u8>) -> RinkResult<()> {
        self.staged.lock().insert(segment_number, data);
        Ok(())
    }

    async fn commit_decrypted(&self, segment_number: u64) -> RinkResult<()> {
        let data = self
            .staged
            .lock()
            .remove(&segment_number)
            .ok_or(RinkError::MissingSegment(segment_number))?;
        self.items
            .lock()
            .insert(StoreItem::Segment(segment_number), data);
        Ok(())
    }
}

use std::{future::Future, num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    assemble::AssemblyList,
    config::PipelineConfig,
    error::{RinkError, RinkResult},
    hls::SegmentPlanEntry,
    process::ExternalCommand,
    store::{SegmentStore, StoreItem},
};

/// AES-128 key bytes of one `EXT-X-KEY` directive.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    key_number: u64,
    bytes: [u8; 16],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_number", &self.key_number)
            .finish_non_exhaustive()
    }
}

impl EncryptionKey {
    pub fn new(key_number: u64, bytes: Vec<u8>) -> RinkResult<Self> {
        if bytes.is_empty() {
            return Err(RinkError::KeyMaterial {
                key_number,
                reason: "key file is empty".to_string(),
            });
        }
        let len = bytes.len();
        let bytes = bytes.try_into().map_err(|_| RinkError::KeyMaterial {
            key_number,
            reason: format!("expected 16 bytes, got {len}"),
        })?;
        Ok(Self { key_number, bytes })
    }

    pub fn key_number(&self) -> u64 {
        self.key_number
    }

    pub fn bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

/// Big-endian IV bytes from a hex string, with or without a `0x` prefix.
pub fn parse_iv(iv: &str) -> RinkResult<[u8; 16]> {
    let digits = iv
        .strip_prefix("0x")
        .or_else(|| iv.strip_prefix("0X"))
        .unwrap_or(iv);
    if digits.is_empty() || digits.len() > 32 {
        return Err(RinkError::InvalidIv(iv.to_string()));
    }
    let value =
        u128::from_str_radix(digits, 16).map_err(|_| RinkError::InvalidIv(iv.to_string()))?;
    Ok(value.to_be_bytes())
}

/// Decrypts one stored segment into its staged plaintext.
pub trait SegmentCipher: Send + Sync + 'static {
    fn decrypt_segment<S: SegmentStore>(
        &self,
        store: &S,
        segment_number: u64,
        key: &EncryptionKey,
        iv: [u8; 16],
    ) -> impl Future<Output = RinkResult<()>> + Send;
}

impl<C> SegmentCipher for Arc<C>
where
    C: SegmentCipher,
{
    fn decrypt_segment<S: SegmentStore>(
        &self,
        store: &S,
        segment_number: u64,
        key: &EncryptionKey,
        iv: [u8; 16],
    ) -> impl Future<Output = RinkResult<()>> + Send {
        self.as_ref().decrypt_segment(store, segment_number, key, iv)
    }
}

/// AES-128-CBC with PKCS#7 padding, in-process.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes128Cipher;

impl Aes128Cipher {
    pub fn decrypt(key: &EncryptionKey, iv: &[u8; 16], data: &[u8]) -> RinkResult<Vec<u8>> {
        let decryptor = cbc::Decryptor::<aes::Aes128>::new(key.bytes().into(), iv.into());
        Ok(decryptor.decrypt_padded_vec_mut::<Pkcs7>(data)?)
    }
}

impl SegmentCipher for Aes128Cipher {
    async fn decrypt_segment<S: SegmentStore>(
        &self,
        store: &S,
        segment_number: u64,
        key: &EncryptionKey,
        iv: [u8; 16],
    ) -> RinkResult<()> {
        let data = store.read(StoreItem::Segment(segment_number)).await?;
        let key = key.clone();
        let plain = tokio::task::spawn_blocking(move || Aes128Cipher::decrypt(&key, &iv, &data))
            .await?
            .map_err(|e| RinkError::Decode {
                segment_number,
                reason: e.to_string(),
            })?;
        store.write_decrypted(segment_number, plain).await
    }
}

/// `openssl enc -aes-128-cbc -d` on the files of a disk-backed store.
#[derive(Debug, Clone)]
pub struct OpensslCipher {
    program: PathBuf,
    timeout: Duration,
}

impl OpensslCipher {
    pub fn new<P: Into<PathBuf>>(program: P, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.programs.openssl, config.command_timeout())
    }

    pub fn command(
        &self,
        input: &std::path::Path,
        output: &std::path::Path,
        key: &EncryptionKey,
        iv: &[u8; 16],
    ) -> ExternalCommand {
        ExternalCommand::new(&self.program)
            .args(["enc", "-aes-128-cbc", "-d", "-in"])
            .arg(input)
            .arg("-out")
            .arg(output)
            .arg("-K")
            .arg(key.to_hex())
            .arg("-iv")
            .arg(hex::encode(iv))
            .timeout(self.timeout)
    }
}

impl SegmentCipher for OpensslCipher {
    async fn decrypt_segment<S: SegmentStore>(
        &self,
        store: &S,
        segment_number: u64,
        key: &EncryptionKey,
        iv: [u8; 16],
    ) -> RinkResult<()> {
        let item = StoreItem::Segment(segment_number);
        let (Some(input), Some(output)) = (store.path(item), store.decrypted_path(segment_number))
        else {
            return Err(RinkError::Decode {
                segment_number,
                reason: "openssl needs a store on disk".to_string(),
            });
        };
        if !store.exists(item).await {
            return Err(RinkError::MissingSegment(segment_number));
        }

        let output = self.command(&input, &output, key, &iv).output().await?;
        if !output.success() {
            return Err(RinkError::Decode {
                segment_number,
                reason: output.diagnostics(),
            });
        }
        Ok(())
    }
}

/// Decrypts every segment of a plan, one task per key group.
pub struct KeyGroupDecryptor<C, S> {
    cipher: Arc<C>,
    store: Arc<S>,
    extension: String,
    parallelism: usize,
}

impl<C, S> KeyGroupDecryptor<C, S>
where
    C: SegmentCipher,
    S: SegmentStore,
{
    pub fn new<E: Into<String>>(cipher: Arc<C>, store: Arc<S>, extension: E) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            cipher,
            store,
            extension: extension.into(),
            parallelism,
        }
    }

    pub fn with_parallelism(mut self, parallelism: NonZeroUsize) -> Self {
        self.parallelism = parallelism.get();
        self
    }

    async fn decrypt_group(
        cipher: &C,
        store: &S,
        key_number: u64,
        entries: &[SegmentPlanEntry],
    ) -> RinkResult<()> {
        if key_number == 0 {
            tracing::debug!("{} segment(s) before the first key are clear.", entries.len());
            return Ok(());
        }

        let key = EncryptionKey::new(key_number, store.read(StoreItem::Key(key_number)).await?)?;
        for entry in entries {
            let iv = parse_iv(&entry.iv)?;
            cipher
                .decrypt_segment(store, entry.segment_number, &key, iv)
                .await?;
            store.commit_decrypted(entry.segment_number).await?;
        }
        tracing::debug!("Key group {key_number}: {} segment(s) decrypted.", entries.len());
        Ok(())
    }

    /// Decrypt all `entries` in place.
    ///
    /// Every group runs to completion even when a sibling fails; the first
    /// failure is returned afterwards.
    pub async fn decrypt_all(&self, entries: &[SegmentPlanEntry]) -> RinkResult<AssemblyList> {
        let groups: Vec<Vec<SegmentPlanEntry>> = entries
            .chunk_by(|a, b| a.key_number == b.key_number)
            .map(<[SegmentPlanEntry]>::to_vec)
            .collect();
        tracing::info!(
            "Decrypting {} segment(s) in {} key group(s) with {} thread(s).",
            entries.len(),
            groups.len(),
            self.parallelism
        );

        let permits = Arc::new(Semaphore::new(self.parallelism.max(1)));
        let mut tasks = JoinSet::new();
        for group in groups {
            let permits = permits.clone();
            let cipher = self.cipher.clone();
            let store = self.store.clone();
            tasks.spawn(async move {
                let key_number = group[0].key_number;
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|e| RinkError::IOError(std::io::Error::other(e)))?;
                Self::decrypt_group(&cipher, &store, key_number, &group).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(RinkError::from).and_then(|r| r);
            if let Err(e) = result {
                tracing::error!("Decryption failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        AssemblyList::new(
            entries.iter().map(|e| e.segment_number).collect(),
            self.extension.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, store::MemorySegmentStore};
    use aes::cipher::BlockEncryptMut;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn encrypt(key: &[u8; 16], iv: &[u8; 16], plain: &[u8]) -> Vec<u8> {
        cbc::Encryptor::<aes::Aes128>::new(key.into(), iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain)
    }

    fn entry(key_number: u64, segment_number: u64, iv: &str) -> SegmentPlanEntry {
        SegmentPlanEntry {
            key_number,
            segment_number,
            iv: iv.to_string(),
        }
    }

    #[test]
    fn test_parse_iv() {
        let mut expected = [0u8; 16];
        expected[15] = 1;
        assert_eq!(parse_iv("00000000000000000000000000000001").unwrap(), expected);
        assert_eq!(parse_iv("0x1").unwrap(), expected);
        assert!(matches!(parse_iv("xyz"), Err(RinkError::InvalidIv(_))));
        assert!(matches!(parse_iv(""), Err(RinkError::InvalidIv(_))));
        assert!(parse_iv(&"f".repeat(33)).is_err());
    }

    #[test]
    fn test_key_material() {
        let err = EncryptionKey::new(3, Vec::new()).unwrap_err();
        assert!(matches!(err, RinkError::KeyMaterial { key_number: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::ExternalProgram);
        assert!(EncryptionKey::new(3, vec![0; 15]).is_err());

        let key = EncryptionKey::new(1, KEY.to_vec()).unwrap();
        assert_eq!(key.to_hex(), "30313233343536373839616263646566");
        assert!(!format!("{key:?}").contains("30313233"));
    }

    #[test]
    fn test_decrypt_is_idempotent() {
        let key = EncryptionKey::new(1, KEY.to_vec()).unwrap();
        let iv = parse_iv("ABCDEF00000000000000000000000002").unwrap();
        let data = encrypt(&KEY, &iv, b"transport stream payload");

        let first = Aes128Cipher::decrypt(&key, &iv, &data).unwrap();
        let second = Aes128Cipher::decrypt(&key, &iv, &data).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, b"transport stream payload");
    }

    async fn seeded_store(plan: &[SegmentPlanEntry]) -> RinkResult<Arc<MemorySegmentStore>> {
        let store = Arc::new(MemorySegmentStore::new());
        store.write(StoreItem::Key(1), KEY.to_vec()).await?;
        store.write(StoreItem::Key(2), b"fedcba9876543210".to_vec()).await?;
        for entry in plan {
            let plain = format!("segment {}", entry.segment_number).into_bytes();
            let data = match entry.key_number {
                0 => plain,
                1 => encrypt(&KEY, &parse_iv(&entry.iv)?, &plain),
                _ => encrypt(b"fedcba9876543210", &parse_iv(&entry.iv)?, &plain),
            };
            store.write(StoreItem::Segment(entry.segment_number), data).await?;
        }
        Ok(store)
    }

    #[tokio::test]
    async fn test_decrypt_all_groups() -> RinkResult<()> {
        let plan = vec![
            entry(0, 1, "0"),
            entry(1, 2, "01"),
            entry(1, 3, "01"),
            entry(2, 4, "02"),
            entry(2, 5, "02"),
        ];
        let store = seeded_store(&plan).await?;

        let decryptor = KeyGroupDecryptor::new(Arc::new(Aes128Cipher), store.clone(), "ts")
            .with_parallelism(NonZeroUsize::new(2).unwrap());
        let list = decryptor.decrypt_all(&plan).await?;

        assert_eq!(
            list.lines(),
            vec!["file 1.ts", "file 2.ts", "file 3.ts", "file 4.ts", "file 5.ts"]
        );
        for n in 1..=5u64 {
            assert_eq!(
                store.read(StoreItem::Segment(n)).await?,
                format!("segment {n}").into_bytes()
            );
        }
        assert_eq!(store.staged_len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_group_does_not_stop_siblings() -> RinkResult<()> {
        let plan = vec![entry(1, 1, "01"), entry(2, 2, "02")];
        let store = seeded_store(&plan).await?;
        // not a whole number of blocks
        store.write(StoreItem::Segment(1), vec![0u8; 15]).await?;

        let decryptor = KeyGroupDecryptor::new(Arc::new(Aes128Cipher), store.clone(), "ts");
        let err = decryptor.decrypt_all(&plan).await.unwrap_err();

        assert!(matches!(err, RinkError::Decode { segment_number: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(store.read(StoreItem::Segment(2)).await?, b"segment 2");
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_key_file() -> RinkResult<()> {
        let plan = vec![entry(1, 1, "01")];
        let store = seeded_store(&plan).await?;
        store.write(StoreItem::Key(1), Vec::new()).await?;

        let decryptor = KeyGroupDecryptor::new(Arc::new(Aes128Cipher), store, "ts");
        let err = decryptor.decrypt_all(&plan).await.unwrap_err();
        assert!(matches!(err, RinkError::KeyMaterial { key_number: 1, .. }));
        Ok(())
    }

    #[test]
    fn test_openssl_command() {
        let cipher = OpensslCipher::new("openssl", Duration::from_secs(60));
        let key = EncryptionKey::new(1, KEY.to_vec()).unwrap();
        let iv = parse_iv("01").unwrap();
        let command = cipher.command(
            std::path::Path::new("/data/7/1.ts"),
            std::path::Path::new("/data/7/1.ts.dec"),
            &key,
            &iv,
        );
        let args: Vec<_> = command
            .get_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "enc",
                "-aes-128-cbc",
                "-d",
                "-in",
                "/data/7/1.ts",
                "-out",
                "/data/7/1.ts.dec",
                "-K",
                "30313233343536373839616263646566",
                "-iv",
                "00000000000000000000000000000001"
            ]
        );
    }

    #[tokio::test]
    async fn test_openssl_needs_disk_store() {
        let store = MemorySegmentStore::new();
        let key = EncryptionKey::new(1, KEY.to_vec()).unwrap();
        let err = OpensslCipher::new("openssl", Duration::from_secs(60))
            .decrypt_segment(&store, 1, &key, [0; 16])
            .await
            .unwrap_err();
        assert!(matches!(err, RinkError::Decode { segment_number: 1, .. }));
    }
}

//! File assembler (C8, spec §4.8): allocate/resume the output file, track
//! received chunk indices, write at the correct offset, and verify the
//! finished file against its expected digest.
//!
//! Per §9's open question, the incremental digest is never updated at
//! arrival order — chunks land concurrently from multiple peers and
//! arrival order has no relation to index order. This walks the completed
//! set in ascending index order, hashing each newly-contiguous prefix as it
//! becomes available, and falls back to a full re-read on completion for
//! any gap left by out-of-order delivery.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::{Error, Result};

/// Tracks one download's output file: which chunks have landed, and the
/// incremental digest over the longest complete prefix.
pub struct Assembler {
    path: PathBuf,
    file: File,
    chunk_size: u64,
    total_bytes: u64,
    total_chunks: u64,
    completed: BTreeSet<u64>,
    /// Index of the next chunk the prefix hasher expects; everything before
    /// it has already been folded into `prefix_hasher`.
    next_prefix_index: u64,
    prefix_hasher: Sha256,
}

impl Assembler {
    /// Open `path` for a fresh download, or resume if `resume` is true and
    /// the file already exists with a size that's a whole multiple of
    /// `chunk_size` (the only state resumable without a manifest).
    pub async fn open(
        path: impl AsRef<Path>,
        total_bytes: u64,
        chunk_size: u64,
        total_chunks: u64,
        resume: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let existing_len = if resume {
            tokio::fs::metadata(&path).await.ok().map(|m| m.len())
        } else {
            None
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(existing_len.is_none())
            .open(&path)
            .await?;
        file.set_len(total_bytes).await?;

        let mut completed = BTreeSet::new();
        let mut prefix_hasher = Sha256::new();
        let mut next_prefix_index = 0;

        if let Some(len) = existing_len {
            let whole_chunks = (len / chunk_size).min(total_chunks);
            if whole_chunks > 0 {
                let mut reader = File::open(&path).await?;
                let mut buf = vec![0u8; chunk_size as usize];
                for idx in 0..whole_chunks {
                    let n = reader.read(&mut buf).await?;
                    prefix_hasher.update(&buf[..n]);
                    completed.insert(idx);
                }
                next_prefix_index = whole_chunks;
            }
        }

        Ok(Self {
            path,
            file,
            chunk_size,
            total_bytes,
            total_chunks,
            completed,
            next_prefix_index,
            prefix_hasher,
        })
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.len() as u64
    }

    pub fn is_chunk_complete(&self, index: u64) -> bool {
        self.completed.contains(&index)
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() as u64 == self.total_chunks
    }

    pub fn bytes_received(&self) -> u64 {
        self.completed
            .iter()
            .map(|&idx| self.chunk_byte_len(idx))
            .sum()
    }

    fn chunk_byte_len(&self, index: u64) -> u64 {
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_bytes);
        end.saturating_sub(start)
    }

    /// Write `data` at `index`'s offset. Idempotent: re-delivering an
    /// already-completed index is accepted and ignored for bookkeeping but
    /// still re-written (harmless — same bytes expected).
    pub async fn write_chunk(&mut self, index: u64, data: &[u8]) -> Result<()> {
        if index >= self.total_chunks {
            return Err(Error::Validation(format!(
                "chunk index {index} out of range ({} total)",
                self.total_chunks
            )));
        }
        let expected_len = self.chunk_byte_len(index);
        if data.len() as u64 != expected_len {
            return Err(Error::Validation(format!(
                "chunk {index} expected {expected_len} bytes, got {}",
                data.len()
            )));
        }
        let offset = index * self.chunk_size;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.completed.insert(index);
        self.advance_prefix_digest().await?;
        Ok(())
    }

    /// Fold any newly-contiguous run starting at `next_prefix_index` into the
    /// incremental digest, re-reading those bytes back from disk (simplest
    /// correct approach: avoids buffering out-of-order chunk bytes in
    /// memory against possibly-concurrent writers at other offsets).
    async fn advance_prefix_digest(&mut self) -> Result<()> {
        while self.completed.contains(&self.next_prefix_index) {
            let idx = self.next_prefix_index;
            let len = self.chunk_byte_len(idx) as usize;
            let mut buf = vec![0u8; len];
            self.file.seek(SeekFrom::Start(idx * self.chunk_size)).await?;
            self.file.read_exact(&mut buf).await?;
            self.prefix_hasher.update(&buf);
            self.next_prefix_index += 1;
        }
        Ok(())
    }

    /// Flush, verify against `expected_digest`, and close. On success,
    /// returns the verified path. On mismatch, deletes the output file and
    /// returns `integrity_error` (spec §4.8, §4.9 digest-mismatch policy).
    pub async fn finalize(mut self, expected_digest: &str) -> Result<PathBuf> {
        self.file.flush().await?;

        let actual = if self.next_prefix_index == self.total_chunks {
            hex::encode(self.prefix_hasher.finalize())
        } else {
            self.rehash_whole_file().await?
        };

        if !actual.eq_ignore_ascii_case(expected_digest) {
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(Error::IntegrityError {
                expected: expected_digest.to_string(),
                actual,
            });
        }
        Ok(self.path)
    }

    /// Abort the download: discard the file handle and delete the partial
    /// output (spec §4.9 cancellation policy).
    pub async fn discard(self) {
        drop(self.file);
        let _ = tokio::fs::remove_file(&self.path).await;
    }

    async fn rehash_whole_file(&mut self) -> Result<String> {
        let mut reader = File::open(&self.path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 1 << 16];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest as _, Sha256 as Sha256Hasher};

    fn digest_of(data: &[u8]) -> String {
        let mut h = Sha256Hasher::new();
        h.update(data);
        hex::encode(h.finalize())
    }

    #[tokio::test]
    async fn writes_in_order_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let data = b"hello world, this is a test file!!".to_vec();
        let chunk_size = 10u64;
        let total_chunks = (data.len() as u64).div_ceil(chunk_size);

        let mut asm = Assembler::open(&path, data.len() as u64, chunk_size, total_chunks, false)
            .await
            .unwrap();
        for i in 0..total_chunks {
            let start = (i * chunk_size) as usize;
            let end = ((i + 1) * chunk_size).min(data.len() as u64) as usize;
            asm.write_chunk(i, &data[start..end]).await.unwrap();
        }
        assert!(asm.is_complete());
        let digest = digest_of(&data);
        let result_path = asm.finalize(&digest).await.unwrap();
        let on_disk = tokio::fs::read(&result_path).await.unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn out_of_order_writes_still_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let data = b"0123456789abcdefghijklmnopqrstuvwxyz".to_vec();
        let chunk_size = 5u64;
        let total_chunks = (data.len() as u64).div_ceil(chunk_size);

        let mut asm = Assembler::open(&path, data.len() as u64, chunk_size, total_chunks, false)
            .await
            .unwrap();
        let mut order: Vec<u64> = (0..total_chunks).collect();
        order.reverse();
        for i in order {
            let start = (i * chunk_size) as usize;
            let end = ((i + 1) * chunk_size).min(data.len() as u64) as usize;
            asm.write_chunk(i, &data[start..end]).await.unwrap();
        }
        let digest = digest_of(&data);
        let result_path = asm.finalize(&digest).await.unwrap();
        let on_disk = tokio::fs::read(&result_path).await.unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn digest_mismatch_deletes_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let data = b"corrupt me please".to_vec();
        let chunk_size = 6u64;
        let total_chunks = (data.len() as u64).div_ceil(chunk_size);

        let mut asm = Assembler::open(&path, data.len() as u64, chunk_size, total_chunks, false)
            .await
            .unwrap();
        for i in 0..total_chunks {
            let start = (i * chunk_size) as usize;
            let end = ((i + 1) * chunk_size).min(data.len() as u64) as usize;
            asm.write_chunk(i, &data[start..end]).await.unwrap();
        }
        let result = asm.finalize("0000000000000000000000000000000000000000000000000000000000000000").await;
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn zero_byte_file_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        let asm = Assembler::open(&path, 0, 1000, 0, false).await.unwrap();
        assert!(asm.is_complete());
        let digest = digest_of(b"");
        let result_path = asm.finalize(&digest).await.unwrap();
        assert_eq!(tokio::fs::metadata(&result_path).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn resume_recognizes_existing_whole_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.bin");
        let data = b"abcdefghijklmnopqrst".to_vec();
        let chunk_size = 5u64;
        let total_chunks = (data.len() as u64).div_ceil(chunk_size);

        {
            let mut asm =
                Assembler::open(&path, data.len() as u64, chunk_size, total_chunks, false)
                    .await
                    .unwrap();
            asm.write_chunk(0, &data[0..5]).await.unwrap();
            asm.write_chunk(1, &data[5..10]).await.unwrap();
            asm.file.flush().await.unwrap();
        }

        let resumed = Assembler::open(&path, data.len() as u64, chunk_size, total_chunks, true)
            .await
            .unwrap();
        assert_eq!(resumed.completed_count(), 2);
    }
}

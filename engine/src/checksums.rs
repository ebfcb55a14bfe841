//! Integrity checks for transferred data.
//!
//! Files are hashed in fixed-size reads. A directory hashes to the digest of
//! the sorted set of its per-file digests, so the same tree on both ends of a
//! transfer yields the same value regardless of walk order.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;

use tracing::debug;

use crate::error::EngineError;
use crate::fs_ops;

/// Directories with more files than this are hashed on several threads.
const PARALLEL_THRESHOLD: usize = 100;

const READ_BUFFER_LEN: usize = 65536;

/// Digest used for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    /// MD5 (the agent's historical default)
    #[default]
    Md5,
    /// SHA-256
    Sha256,
    /// BLAKE3, the fastest of the three on large trees
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!("unknown checksum algorithm '{}'", other)),
        }
    }
}

/// Lowercase hex digest tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// `md5:5d41...` style, as printed by the CLI.
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Incremental checksum computation
pub trait ChecksumHasher: Send {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> ChecksumValue;
}

struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.context.compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Blake3, digest.to_hex().to_string())
    }
}

pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Checksum of one in-memory buffer.
pub fn checksum_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> ChecksumValue {
    let mut hasher = create_hasher(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Streaming digest of one file.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    let read_error = |e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; READ_BUFFER_LEN];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        }
    }
    Ok(hasher.finalize())
}

/// Checksum of a directory tree.
///
/// Each regular file is hashed, duplicate digests collapse, and the sorted
/// hex digests are concatenated and hashed again. File names do not
/// contribute, so two trees holding the same contents under different names
/// match.
pub fn directory_checksum(
    root: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    let files = fs_ops::list_files(root)?;
    debug!(root = %root.display(), files = files.len(), %algorithm, "hashing directory");

    let digests = if files.len() > PARALLEL_THRESHOLD {
        digest_files_parallel(&files, algorithm)?
    } else {
        digest_files(&files, algorithm)?
    };

    let joined: String = digests.into_iter().collect();
    Ok(checksum_bytes(joined.as_bytes(), algorithm))
}

fn digest_files(files: &[PathBuf], algorithm: ChecksumAlgorithm) -> Result<BTreeSet<String>, EngineError> {
    files
        .iter()
        .map(|path| compute_file_checksum(path, algorithm).map(|value| value.hex))
        .collect()
}

fn digest_files_parallel(
    files: &[PathBuf],
    algorithm: ChecksumAlgorithm,
) -> Result<BTreeSet<String>, EngineError> {
    let workers = thread::available_parallelism().map(usize::from).unwrap_or(4);
    let chunk_len = files.len().div_ceil(workers).max(1);

    thread::scope(|scope| {
        let handles: Vec<_> = files
            .chunks(chunk_len)
            .map(|chunk| scope.spawn(move || digest_files(chunk, algorithm)))
            .collect();

        let mut digests = BTreeSet::new();
        for handle in handles {
            match handle.join() {
                Ok(chunk) => digests.extend(chunk?),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        Ok::<_, EngineError>(digests)
    })
}

/// Checksum of a file, or of a directory tree.
pub fn compute_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<ChecksumValue, EngineError> {
    let metadata = std::fs::metadata(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    if metadata.is_dir() {
        directory_checksum(path, algorithm)
    } else {
        compute_file_checksum(path, algorithm)
    }
}

/// Compare source and destination checksums after a transfer.
///
/// Returns the source checksum and whether the destination matched it.
pub fn verify_transfer(
    source: &Path,
    destination: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<(ChecksumValue, bool), EngineError> {
    let expected = compute_checksum(source, algorithm)?;
    let actual = compute_checksum(destination, algorithm)?;
    let matches = expected.hex() == actual.hex();
    debug!(
        source = %source.display(),
        destination = %destination.display(),
        expected = %expected,
        actual = %actual,
        matches,
        "verified transfer"
    );
    Ok((expected, matches))
}

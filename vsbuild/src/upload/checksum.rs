//! Checksum verification of downloaded media.

use crate::errors::{BuildError, BuildResult};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
    /// MD5.
    Md5,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
            Self::Md5 => write!(f, "md5"),
        }
    }
}

/// An expected checksum, or none.
///
/// Parsed from `sha256:<hex>`, `sha512:<hex>`, `md5:<hex>`, `none`, or a
/// bare hex digest whose length identifies the algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Checksum {
    /// Skip verification.
    #[default]
    None,
    /// Verify against a digest.
    Digest {
        /// Algorithm.
        algorithm: ChecksumAlgorithm,
        /// Lowercase hex digest.
        expected: String,
    },
}

impl FromStr for Checksum {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(Self::None);
        }

        let (algorithm, hex_digest) = match s.split_once(':') {
            Some(("sha256", d)) => (ChecksumAlgorithm::Sha256, d),
            Some(("sha512", d)) => (ChecksumAlgorithm::Sha512, d),
            Some(("md5", d)) => (ChecksumAlgorithm::Md5, d),
            Some((other, _)) => {
                return Err(BuildError::Validation(format!(
                    "unsupported checksum type '{other}'"
                )))
            }
            None => match s.len() {
                64 => (ChecksumAlgorithm::Sha256, s),
                128 => (ChecksumAlgorithm::Sha512, s),
                32 => (ChecksumAlgorithm::Md5, s),
                _ => {
                    return Err(BuildError::Validation(format!(
                        "cannot infer checksum type of '{s}'"
                    )))
                }
            },
        };

        if hex::decode(hex_digest).is_err() {
            return Err(BuildError::Validation(format!(
                "checksum '{hex_digest}' is not hexadecimal"
            )));
        }

        Ok(Self::Digest {
            algorithm,
            expected: hex_digest.to_ascii_lowercase(),
        })
    }
}

impl Checksum {
    /// Verifies `path`. Blocking; call from `spawn_blocking` for large files.
    pub fn verify(&self, path: &Path) -> BuildResult<()> {
        let Self::Digest {
            algorithm,
            expected,
        } = self
        else {
            return Ok(());
        };

        let actual = file_digest(path, *algorithm)?;
        if &actual == expected {
            Ok(())
        } else {
            Err(BuildError::Checksum {
                path: PathBuf::from(path),
                expected: expected.clone(),
                actual,
            })
        }
    }
}

/// Hex digest of a file.
pub fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> BuildResult<String> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => digest_with::<Sha256>(path),
        ChecksumAlgorithm::Sha512 => digest_with::<Sha512>(path),
        ChecksumAlgorithm::Md5 => digest_with::<Md5>(path),
    }
}

fn digest_with<D: Digest>(path: &Path) -> BuildResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a string, used to name cache entries.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_parse_forms() {
        assert_eq!("none".parse::<Checksum>().unwrap(), Checksum::None);
        assert!(matches!(
            format!("sha256:{HELLO_SHA256}").parse::<Checksum>().unwrap(),
            Checksum::Digest { algorithm: ChecksumAlgorithm::Sha256, .. }
        ));
        assert!(matches!(
            HELLO_SHA256.parse::<Checksum>().unwrap(),
            Checksum::Digest { algorithm: ChecksumAlgorithm::Sha256, .. }
        ));
        assert!("crc32:abcd".parse::<Checksum>().is_err());
        assert!("sha256:xyz".parse::<Checksum>().is_err());
    }

    #[test]
    fn test_verify_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();

        let good: Checksum = format!("sha256:{HELLO_SHA256}").parse().unwrap();
        good.verify(file.path()).unwrap();

        let bad: Checksum = format!("sha256:{}", "0".repeat(64)).parse().unwrap();
        let err = bad.verify(file.path()).unwrap_err();
        assert!(matches!(err, BuildError::Checksum { .. }));
    }

    #[test]
    fn test_md5() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert_eq!(
            file_digest(file.path(), ChecksumAlgorithm::Md5).unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[test]
    fn test_sha256_hex_of_url() {
        assert_eq!(sha256_hex("hello"), HELLO_SHA256);
    }
}

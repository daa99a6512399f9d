use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumType::Md5 => write!(f, "md5"),
            ChecksumType::Sha1 => write!(f, "sha1"),
            ChecksumType::Sha256 => write!(f, "sha256"),
            ChecksumType::Sha512 => write!(f, "sha512"),
        }
    }
}

impl FromStr for ChecksumType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumType::Md5),
            "sha1" => Ok(ChecksumType::Sha1),
            "sha256" => Ok(ChecksumType::Sha256),
            "sha512" => Ok(ChecksumType::Sha512),
            _ => Err(Error::UnsupportedChecksum {
                algorithm: s.to_string(),
            }),
        }
    }
}

/// An expected checksum in `type:hash` form, as found in source descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumSpec {
    pub algorithm: String,
    pub expected: String,
}

impl ChecksumSpec {
    pub fn parse(value: &str) -> Result<Self> {
        let (algorithm, expected) = value.split_once(':').ok_or_else(|| Error::InvalidChecksum {
            value: value.to_string(),
        })?;
        if algorithm.is_empty() || expected.is_empty() {
            return Err(Error::InvalidChecksum {
                value: value.to_string(),
            });
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            expected: expected.to_string(),
        })
    }

    pub fn checksum_type(&self) -> Result<ChecksumType> {
        self.algorithm.parse()
    }
}

impl fmt::Display for ChecksumSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.expected)
    }
}

pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Fails with `ChecksumMismatch` unless the file hashes to `expected`.
    pub async fn verify_file(file_path: &Path, algorithm: &str, expected: &str) -> Result<()> {
        let checksum_type: ChecksumType = algorithm.parse()?;
        info!("Checking hash {} for {:?}", checksum_type, file_path);

        let actual = Self::calculate_checksum(file_path, checksum_type).await?;
        if actual.to_lowercase() == expected.to_lowercase() {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch {
                algorithm: checksum_type.to_string(),
                expected: expected.to_string(),
                actual,
            })
        }
    }

    pub async fn calculate_checksum(
        file_path: &Path,
        checksum_type: ChecksumType,
    ) -> Result<String> {
        let file = File::open(file_path).await?;

        let mut reader = BufReader::new(file);
        let mut buffer = [0; 8192];

        match checksum_type {
            ChecksumType::Sha256 => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                loop {
                    let bytes_read = reader.read(&mut buffer).await?;
                    if bytes_read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..bytes_read]);
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
            ChecksumType::Sha512 => {
                use sha2::{Digest, Sha512};
                let mut hasher = Sha512::new();
                loop {
                    let bytes_read = reader.read(&mut buffer).await?;
                    if bytes_read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..bytes_read]);
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
            ChecksumType::Md5 => {
                let mut context = md5::Context::new();
                loop {
                    let bytes_read = reader.read(&mut buffer).await?;
                    if bytes_read == 0 {
                        break;
                    }
                    context.consume(&buffer[..bytes_read]);
                }
                let digest = context.finalize();
                Ok(format!("{:x}", digest))
            }
            ChecksumType::Sha1 => {
                use sha1::{Digest, Sha1};
                let mut hasher = Sha1::new();
                loop {
                    let bytes_read = reader.read(&mut buffer).await?;
                    if bytes_read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..bytes_read]);
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("hello")
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_parse_spec() {
        let spec = ChecksumSpec::parse("sha256:deadbeef").unwrap();
        assert_eq!(spec.algorithm, "sha256");
        assert_eq!(spec.expected, "deadbeef");
        assert_eq!(spec.checksum_type().unwrap(), ChecksumType::Sha256);
        assert_eq!(spec.to_string(), "sha256:deadbeef");

        assert!(matches!(
            ChecksumSpec::parse("deadbeef"),
            Err(Error::InvalidChecksum { .. })
        ));
        assert!(matches!(
            ChecksumSpec::parse(":deadbeef"),
            Err(Error::InvalidChecksum { .. })
        ));
        assert!(matches!(
            ChecksumSpec::parse("crc32:00").unwrap().checksum_type(),
            Err(Error::UnsupportedChecksum { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        tokio_test::assert_ok!(ChecksumVerifier::verify_file(&path, "sha256", HELLO_SHA256).await);
        tokio_test::assert_ok!(
            ChecksumVerifier::verify_file(&path, "SHA256", &HELLO_SHA256.to_uppercase()).await
        );

        let mismatch = ChecksumVerifier::verify_file(&path, "sha256", "deadbeef").await;
        match mismatch {
            Err(Error::ChecksumMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, "deadbeef");
                assert_eq!(actual, HELLO_SHA256);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_algorithms() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(
            ChecksumVerifier::calculate_checksum(&path, ChecksumType::Md5)
                .await
                .unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            ChecksumVerifier::calculate_checksum(&path, ChecksumType::Sha1)
                .await
                .unwrap(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = ChecksumVerifier::verify_file(&dir.path().join("nope"), "md5", "00").await;
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}

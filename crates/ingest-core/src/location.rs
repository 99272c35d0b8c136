//! Object locations and source descriptors.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cloud providers the engine can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Amazon S3 (`s3://`).
    Aws,
    /// Google Cloud Storage (`gs://`).
    Gcs,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Gcs, Provider::Aws];

    pub fn scheme(self) -> &'static str {
        match self {
            Provider::Aws => "s3",
            Provider::Gcs => "gs",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "s3" => Some(Provider::Aws),
            "gs" | "gcs" => Some(Provider::Gcs),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// `scheme://bucket/key`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    pub provider: Provider,
    pub bucket: String,
    pub key: String,
}

impl ObjectUri {
    pub fn new(provider: Provider, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            provider,
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::Location(format!("'{uri}' has no scheme")))?;
        let provider = Provider::from_scheme(scheme)
            .ok_or_else(|| Error::Location(format!("unsupported scheme '{scheme}' in '{uri}'")))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| Error::Location(format!("'{uri}' has no object key")))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(Error::Location(format!(
                "'{uri}' must name both a bucket and a key"
            )));
        }
        Ok(Self::new(provider, bucket, key))
    }

    /// Last key segment.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.provider.scheme(), self.bucket, self.key)
    }
}

/// Where a row's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Local(PathBuf),
    Remote(ObjectUri),
}

impl Source {
    /// Classify an `input_file_path`. Anything carrying a known scheme is remote;
    /// relative local paths are resolved against `root` when one is given.
    pub fn classify(input: &str, root: Option<&Path>) -> Result<Self> {
        if let Some((scheme, _)) = input.split_once("://") {
            if Provider::from_scheme(scheme).is_some() {
                return ObjectUri::parse(input).map(Source::Remote);
            }
            if scheme != "file" {
                return Err(Error::Location(format!(
                    "unsupported scheme '{scheme}' in '{input}'"
                )));
            }
        }
        let raw = input.strip_prefix("file://").unwrap_or(input);
        let path = Path::new(raw);
        let resolved = match root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        };
        Ok(Source::Local(resolved))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Local(_) => SourceKind::Local,
            Source::Remote(uri) => match uri.provider {
                Provider::Aws => SourceKind::Aws,
                Provider::Gcs => SourceKind::Gcs,
            },
        }
    }
}

/// Origin kind of a row's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Aws,
    Gcs,
}

/// Final path component of a local path or object key.
pub fn basename(input: &str) -> &str {
    input
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_object_uris() {
        let uri = ObjectUri::parse("s3://bucket/abc-2/uuid/file.bam").unwrap();
        assert_eq!(uri.provider, Provider::Aws);
        assert_eq!(uri.bucket, "bucket");
        assert_eq!(uri.key, "abc-2/uuid/file.bam");
        assert_eq!(uri.file_name(), "file.bam");
        assert_eq!(uri.to_string(), "s3://bucket/abc-2/uuid/file.bam");

        let gcs = ObjectUri::parse("gcs://b/k").unwrap();
        assert_eq!(gcs.provider, Provider::Gcs);
        assert_eq!(gcs.to_string(), "gs://b/k");
    }

    #[test]
    fn rejects_incomplete_uris() {
        assert!(ObjectUri::parse("s3://bucket").is_err());
        assert!(ObjectUri::parse("s3:///key").is_err());
        assert!(ObjectUri::parse("ftp://host/file").is_err());
        assert!(ObjectUri::parse("plain/path").is_err());
    }

    #[test]
    fn classifies_sources() {
        let root = Path::new("/data");
        assert_eq!(
            Source::classify("sub/a.txt", Some(root)).unwrap(),
            Source::Local(PathBuf::from("/data/sub/a.txt"))
        );
        assert_eq!(
            Source::classify("/abs/a.txt", Some(root)).unwrap(),
            Source::Local(PathBuf::from("/abs/a.txt"))
        );
        assert_eq!(
            Source::classify("file:///abs/a.txt", None).unwrap(),
            Source::Local(PathBuf::from("/abs/a.txt"))
        );
        let remote = Source::classify("gs://b/dir/x", Some(root)).unwrap();
        assert_eq!(remote.kind(), SourceKind::Gcs);
        assert!(Source::classify("http://host/x", None).is_err());
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("a/b/c.dcm"), "c.dcm");
        assert_eq!(basename("c.dcm"), "c.dcm");
        assert_eq!(basename("s3://b/k/x.bam"), "x.bam");
        assert_eq!(basename("dir/stack/"), "stack");
    }
}

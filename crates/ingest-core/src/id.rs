//! Strongly-typed identifiers used across the engine.
//!
//! `RowId` indexes the manifest store. `Identifier` is the minted, globally
//! unique (guid, DRS uri) pair attached to each row at most once.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(RowId);

impl RowId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// `guid` and `ga4gh_drs_uri` columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub guid: String,
    pub uri: String,
}

/// Identifier-minting seam. `mint` is called at most once per row; `derive`
/// rebuilds the identifier a previous run embedded in a destination path.
pub trait IdentifierMinter: Send + Sync {
    fn mint(&self) -> Identifier;

    fn derive(&self, remote_path: &str) -> Option<Identifier>;

    /// Key segment under which the object for `id` is stored.
    fn key_segment(&self, id: &Identifier) -> String;
}

/// Data-repository-service identifiers: `guid = "{authority}/{uuid}"`.
#[derive(Debug, Clone)]
pub struct DrsMinter {
    authority: String,
}

pub const DEFAULT_AUTHORITY: &str = "dg.4503";

impl Default for DrsMinter {
    fn default() -> Self {
        Self::new(DEFAULT_AUTHORITY)
    }
}

impl DrsMinter {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }

    pub fn from_segment(&self, segment: &str) -> Identifier {
        let authority = &self.authority;
        Identifier {
            guid: format!("{authority}/{segment}"),
            uri: format!("drs://{authority}:{authority}%2F{segment}"),
        }
    }
}

impl IdentifierMinter for DrsMinter {
    fn mint(&self) -> Identifier {
        self.from_segment(&Uuid::new_v4().to_string())
    }

    // `scheme://bucket/digest/segment/file` splits on '/' into
    // ["scheme:", "", bucket, digest, segment, file...].
    fn derive(&self, remote_path: &str) -> Option<Identifier> {
        let segments: Vec<&str> = remote_path.split('/').collect();
        if segments.len() < 6 || !segments[0].ends_with(':') || !segments[1].is_empty() {
            return None;
        }
        let segment = segments[4];
        if segment.is_empty() {
            return None;
        }
        Some(self.from_segment(segment))
    }

    fn key_segment(&self, id: &Identifier) -> String {
        let prefix = format!("{}/", self.authority);
        id.guid
            .strip_prefix(&prefix)
            .unwrap_or(&id.guid)
            .replace('/', "_")
    }
}

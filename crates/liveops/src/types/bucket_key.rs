use serde::{Deserialize, Serialize};
use std::fmt;

/// Addresses one work-queue bucket: `(prefix, optional segment, bucket)`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BucketKey {
    pub prefix: String,
    pub segment: Option<String>,
    pub bucket: u32,
}

impl BucketKey {
    pub fn new(prefix: impl Into<String>, segment: Option<&str>, bucket: u32) -> Self {
        Self {
            prefix: prefix.into(),
            segment: segment.map(str::to_string),
            bucket,
        }
    }

    /// The store list key backing this bucket.
    pub fn store_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.segment {
            Some(segment) => write!(f, "{}:{}:bucket-queue:{}", self.prefix, segment, self.bucket),
            None => write!(f, "{}:bucket-queue:{}", self.prefix, self.bucket),
        }
    }
}

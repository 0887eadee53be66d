//! Object filter and deepen specifications shared by server and client.

use wharf_hash::ObjectId;

/// A partial-clone filter, parsed from a single `filter ` line and applied
/// lazily during pack generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSpec {
    /// `blob:none`: omit all blobs.
    BlobNone,
    /// `blob:limit=<n>`: omit blobs larger than `n` bytes.
    BlobLimit(u64),
    /// `tree:<depth>`: omit trees and blobs below the given depth.
    TreeDepth(u64),
    /// `sparse:oid=<oid>`: use a sparse-checkout specification blob.
    SparseOid(String),
}

impl FilterSpec {
    /// Parse the argument of a `filter ` line.
    pub fn parse(spec: &str) -> Result<Self, FilterParseError> {
        if spec == "blob:none" {
            return Ok(FilterSpec::BlobNone);
        }
        if let Some(limit) = spec.strip_prefix("blob:limit=") {
            let bytes = parse_size(limit).ok_or_else(|| FilterParseError::new(spec))?;
            return Ok(FilterSpec::BlobLimit(bytes));
        }
        if let Some(depth) = spec.strip_prefix("tree:") {
            let depth = depth.parse().map_err(|_| FilterParseError::new(spec))?;
            return Ok(FilterSpec::TreeDepth(depth));
        }
        if let Some(oid) = spec.strip_prefix("sparse:oid=") {
            if oid.is_empty() {
                return Err(FilterParseError::new(spec));
            }
            return Ok(FilterSpec::SparseOid(oid.to_owned()));
        }
        Err(FilterParseError::new(spec))
    }
}

/// Parse a size with an optional `k`/`m`/`g` suffix, as `blob:limit` allows.
fn parse_size(input: &str) -> Option<u64> {
    if input.is_empty() {
        return None;
    }
    let (digits, multiplier) = match input.as_bytes().last() {
        Some(b'k') => (&input[..input.len() - 1], 1024),
        Some(b'm') => (&input[..input.len() - 1], 1024 * 1024),
        Some(b'g') => (&input[..input.len() - 1], 1024 * 1024 * 1024),
        _ => (input, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// The error returned for an unrecognised filter specification.
#[derive(Debug, thiserror::Error)]
#[error("invalid filter specification '{spec}'")]
pub struct FilterParseError {
    /// The rejected input.
    pub spec: String,
}

impl FilterParseError {
    fn new(spec: &str) -> Self {
        Self { spec: spec.to_owned() }
    }
}

/// History-trimming parameters of a fetch request.
///
/// At most one of `depth` and `since` may be set, and `not` excludes
/// `depth`; violations are protocol errors raised by the request parser.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeepenSpec {
    /// Maximum history depth; 0 means unlimited.
    pub depth: u32,
    /// Cut history before this unix timestamp; 0 means none.
    pub since: i64,
    /// Exclude history reachable from these refs.
    pub not: Vec<String>,
    /// Commits the client already has as shallow boundaries.
    pub client_shallow: Vec<ObjectId>,
}

impl DeepenSpec {
    /// Whether any trimming was requested.
    pub fn is_active(&self) -> bool {
        self.depth > 0 || self.since > 0 || !self.not.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_variants() {
        assert_eq!(FilterSpec::parse("blob:none").unwrap(), FilterSpec::BlobNone);
        assert_eq!(FilterSpec::parse("blob:limit=1024").unwrap(), FilterSpec::BlobLimit(1024));
        assert_eq!(FilterSpec::parse("blob:limit=1k").unwrap(), FilterSpec::BlobLimit(1024));
        assert_eq!(FilterSpec::parse("tree:2").unwrap(), FilterSpec::TreeDepth(2));
        assert_eq!(
            FilterSpec::parse("sparse:oid=deadbeef").unwrap(),
            FilterSpec::SparseOid("deadbeef".into())
        );
    }

    #[test]
    fn rejects_unknown_specs() {
        for bad in ["blob:", "tree:x", "blob:limit=", "object:type=tag", ""] {
            assert!(FilterSpec::parse(bad).is_err(), "{bad} should be rejected");
        }
    }
}

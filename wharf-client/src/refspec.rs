//! Reference mapping specifications.

use crate::error::{Error, Result};

/// One `[+]<src>:<dst>` mapping, with a single `*` wildcard per side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSpec {
    /// Update the destination even when it is not a fast-forward.
    pub force: bool,
    /// The source pattern, e.g. `refs/heads/*`.
    pub src: String,
    /// The destination pattern, e.g. `refs/remotes/origin/*`.
    pub dst: String,
}

impl RefSpec {
    /// Parse a refspec of the form `[+]<src>[:<dst>]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (force, rest) = match spec.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let (src, dst) = match rest.split_once(':') {
            Some((src, dst)) => (src, dst),
            None => (rest, rest),
        };
        if src.is_empty() && dst.is_empty() {
            return Err(Error::InvalidRefSpec(spec.to_owned()));
        }
        let wildcards = |s: &str| s.matches('*').count();
        if wildcards(src) > 1 || wildcards(dst) > 1 || wildcards(src) != wildcards(dst) {
            return Err(Error::InvalidRefSpec(spec.to_owned()));
        }
        Ok(Self {
            force,
            src: src.to_owned(),
            dst: dst.to_owned(),
        })
    }

    /// Whether `name` matches the source side.
    pub fn matches_src(&self, name: &str) -> bool {
        Self::matches(&self.src, name)
    }

    /// Map a matching source name to its destination name.
    pub fn destination(&self, name: &str) -> Option<String> {
        if !self.matches_src(name) {
            return None;
        }
        match self.src.split_once('*') {
            None => Some(self.dst.clone()),
            Some((prefix, _suffix)) => {
                let captured = &name[prefix.len()..name.len() - (self.src.len() - prefix.len() - 1)];
                Some(self.dst.replacen('*', captured, 1))
            }
        }
    }

    fn matches(pattern: &str, name: &str) -> bool {
        match pattern.split_once('*') {
            None => pattern == name,
            Some((prefix, suffix)) => {
                name.len() >= prefix.len() + suffix.len()
                    && name.starts_with(prefix)
                    && name.ends_with(suffix)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_force_and_sides() {
        let spec = RefSpec::parse("+refs/heads/*:refs/remotes/origin/*").unwrap();
        assert!(spec.force);
        assert_eq!(spec.src, "refs/heads/*");
        assert_eq!(spec.dst, "refs/remotes/origin/*");

        let plain = RefSpec::parse("refs/heads/main").unwrap();
        assert!(!plain.force);
        assert_eq!(plain.src, plain.dst);
    }

    #[test]
    fn wildcard_mapping() {
        let spec = RefSpec::parse("refs/heads/*:refs/remotes/origin/*").unwrap();
        assert_eq!(
            spec.destination("refs/heads/feature/x").as_deref(),
            Some("refs/remotes/origin/feature/x")
        );
        assert!(spec.destination("refs/tags/v1").is_none());
    }

    #[test]
    fn exact_mapping() {
        let spec = RefSpec::parse("refs/heads/main:refs/heads/mirror").unwrap();
        assert_eq!(spec.destination("refs/heads/main").as_deref(), Some("refs/heads/mirror"));
        assert!(spec.destination("refs/heads/dev").is_none());
    }

    #[test]
    fn rejects_asymmetric_wildcards() {
        assert!(RefSpec::parse("refs/heads/*:refs/remotes/origin/main").is_err());
        assert!(RefSpec::parse("refs/*/x*:refs/*/y*").is_err());
        assert!(RefSpec::parse(":").is_err());
    }
}

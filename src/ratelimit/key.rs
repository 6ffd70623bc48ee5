//! Bucket key generation.

/// What a bucket counts against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// All traffic from the caller
    Global,
    /// Traffic from the caller to a single request path
    Path(String),
}

/// A key that uniquely identifies a token bucket.
///
/// Composed of the caller identity (usually the client address) and the
/// scope being limited.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The caller this bucket belongs to
    pub identity: String,
    /// The scope this bucket limits
    pub scope: Scope,
}

impl BucketKey {
    /// Key for the caller's overall traffic ceiling.
    pub fn global(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            scope: Scope::Global,
        }
    }

    /// Key for the caller's traffic to one path.
    pub fn path(identity: &str, path: &str) -> Self {
        Self {
            identity: identity.to_string(),
            scope: Scope::Path(path.to_string()),
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Scope::Global => write!(f, "{}:global", self.identity),
            Scope::Path(path) => write!(f, "{}:{}", self.identity, path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_display() {
        assert_eq!(BucketKey::global("10.0.0.1").to_string(), "10.0.0.1:global");
        assert_eq!(
            BucketKey::path("10.0.0.1", "/api/v1/auth/login").to_string(),
            "10.0.0.1:/api/v1/auth/login"
        );
    }

    #[test]
    fn test_global_and_path_keys_differ() {
        assert_ne!(BucketKey::global("a"), BucketKey::path("a", "global"));
        assert_eq!(BucketKey::path("a", "/x"), BucketKey::path("a", "/x"));
    }
}

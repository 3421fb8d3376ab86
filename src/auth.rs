use std::sync::Arc;

/// Shared-key authenticator.
///
/// One key for the whole deployment, presented by clients via the socket
/// `auth` message or a `Bearer` header on the HTTP shim. Richer schemes
/// (per-user tokens) layer outside the core; everything in here only needs
/// `is_authorized`.
#[derive(Clone)]
pub struct Authenticator {
    key: Arc<str>,
}

impl Authenticator {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self { key: key.into() }
    }

    /// Compare the presented credential against the configured key without
    /// short-circuiting on the first mismatched byte.
    pub fn is_authorized(&self, presented: &str) -> bool {
        let expected = self.key.as_bytes();
        let got = presented.as_bytes();
        if expected.len() != got.len() {
            return false;
        }
        expected
            .iter()
            .zip(got.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_key() {
        let auth = Authenticator::new("s3cret");
        assert!(auth.is_authorized("s3cret"));
    }

    #[test]
    fn rejects_wrong_key() {
        let auth = Authenticator::new("s3cret");
        assert!(!auth.is_authorized("s3cres"));
        assert!(!auth.is_authorized(""));
    }

    #[test]
    fn rejects_prefix_and_suffix() {
        let auth = Authenticator::new("s3cret");
        assert!(!auth.is_authorized("s3cre"));
        assert!(!auth.is_authorized("s3cret "));
    }
}

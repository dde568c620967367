//! Window key generation.

/// Builds the store key that holds a subject's bucket ring.
///
/// Keys have the form `namespace:action:subject`, or `action:subject` when
/// no namespace is configured. Separator characters inside the parts are not
/// escaped, so `("a:b", "c")` and `("a", "b:c")` produce the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    /// Create a key builder for one action, optionally under a namespace.
    pub fn new(namespace: Option<&str>, action: &str) -> Self {
        let prefix = match namespace {
            Some(ns) => format!("{}:{}", ns, action),
            None => action.to_string(),
        };
        Self { prefix }
    }

    /// The window key for a subject.
    pub fn key(&self, subject: &str) -> String {
        format!("{}:{}", self.prefix, subject)
    }
}

impl std::fmt::Display for KeyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix)
    }
}

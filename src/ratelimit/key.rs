//! Store key derivation.

/// Identifies the subject/action pair being limited.
///
/// The store key is `{subject}_{action}`, optionally prefixed with
/// `{namespace}:`. Backslashes and underscores inside either part are
/// escaped, so distinct pairs never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// Who is acting, e.g. a user id
    pub subject: String,
    /// What they are doing, e.g. `create-order`
    pub action: String,
}

impl LimiterKey {
    /// Create a new key.
    pub fn new(subject: &str, action: &str) -> Self {
        Self {
            subject: subject.to_string(),
            action: action.to_string(),
        }
    }

    /// The store key without a namespace.
    pub fn to_store_key(&self) -> String {
        format!("{}_{}", escape(&self.subject), escape(&self.action))
    }

    /// The store key under an optional namespace.
    pub fn to_namespaced_key(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}:{}", ns, self.to_store_key()),
            None => self.to_store_key(),
        }
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

fn escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        if c == '\\' || c == '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

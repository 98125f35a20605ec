/// Separator between the components of a composite fingerprint.
const FINGERPRINT_SEPARATOR: &str = "|";

/// The two de-duplication signals derived from a request. Either one, when
/// non-empty, is enough to prove prior viewing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorIdentity {
    /// The first-party cookie id, or empty when the request carried none.
    pub visitor_id: String,
    /// Device fingerprint and/or source address joined with a stable
    /// separator; empty when both were absent. Opaque to everything above
    /// this function.
    pub composite_fingerprint: String,
}

impl VisitorIdentity {
    pub fn is_anonymous(&self) -> bool {
        self.visitor_id.is_empty() && self.composite_fingerprint.is_empty()
    }

    /// The identity string annotations are attributed to: the fingerprint
    /// when present, otherwise the cookie id.
    pub fn author_fingerprint(&self) -> &str {
        if self.composite_fingerprint.is_empty() {
            &self.visitor_id
        } else {
            &self.composite_fingerprint
        }
    }
}

/// Derive a visitor identity from the raw request signals. Pure; issuing a
/// fresh cookie id on first contact is the HTTP layer's job.
pub fn resolve(
    cookie_id: Option<&str>,
    device_fingerprint: Option<&str>,
    source_addr: Option<&str>,
) -> VisitorIdentity {
    let visitor_id = cookie_id.unwrap_or("").trim().to_string();

    let composite_fingerprint = [device_fingerprint, source_addr]
        .iter()
        .filter_map(|part| part.map(str::trim))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(FINGERPRINT_SEPARATOR);

    VisitorIdentity {
        visitor_id,
        composite_fingerprint,
    }
}

//! Namespace scoping for relay records.

use tracing::debug;

use crate::record::LogRecord;

/// Namespace assumed for records that do not carry one.
pub const ROOT_NAMESPACE: &str = "/";

/// Routing decision for an inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Deliver,
    Drop,
}

/// Normalize a namespace name: empty means root, and names always start with `/`.
pub fn normalize_namespace(name: &str) -> String {
    if name.is_empty() {
        ROOT_NAMESPACE.to_string()
    } else if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

/// Namespace a record belongs to, defaulting to the root namespace.
pub fn record_namespace(record: &LogRecord) -> &str {
    record.namespace.as_deref().unwrap_or(ROOT_NAMESPACE)
}

/// Binds records to the namespace of one adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRouter {
    namespace: String,
}

impl NamespaceRouter {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: normalize_namespace(namespace),
        }
    }

    /// Namespace stamped on outbound records.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn route(&self, record: &LogRecord) -> Route {
        let namespace = record_namespace(record);
        if namespace == self.namespace {
            Route::Deliver
        } else {
            debug!(
                id = %record.id,
                record_namespace = %namespace,
                namespace = %self.namespace,
                "Ignoring record for different namespace"
            );
            Route::Drop
        }
    }
}

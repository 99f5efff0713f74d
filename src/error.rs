//! Errors surfaced from a reconcile pass.
//!
//! The variants follow how the controller reacts to them: `NotFound` is an
//! expected, transient absence retried after a short fixed delay, everything
//! else goes through per-key exponential backoff.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// A dependent object that another agent has yet to create.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// More than one membership carries the correlation labels of a registration.
    #[error(
        "found {count} ManagedClusters correlated to RegisteredCluster {namespace}/{name}, expected at most one"
    )]
    DuplicateMembership {
        namespace: String,
        name: String,
        count: usize,
    },

    /// No hub binding serves the registration's namespace.
    #[error("no hub cluster available for namespace {namespace}")]
    NoHub { namespace: String },

    /// An object lacks a field the controller requires.
    #[error("{kind} {name} is missing {field}")]
    MissingField {
        kind: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("template {file}: {message}")]
    Template { file: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(
        kind: &'static str,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn template(file: impl Into<String>, message: impl ToString) -> Self {
        Self::Template {
            file: file.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error is an absence that resolves without intervention.
    ///
    /// Raw API 404s are not: expected absences are looked up with `get_opt` and
    /// surface as [`Error::NotFound`], so any other 404 means a missing resource
    /// type or a wrong endpoint.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Whether a raw kube error is a 404 from the API server.
pub fn is_kube_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

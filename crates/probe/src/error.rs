//! Construction-time errors.
//!
//! Runtime failures never surface here; they become records with an
//! appropriate status instead.

use thiserror::Error;

use crate::resource::ResourceError;

/// Error raised while turning an address into a prober or an alerter.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid target address: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("missing scheme in target address: {0}")]
    MissingScheme(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing target host")]
    MissingHost,

    #[error("port number required")]
    MissingPort,

    #[error("missing file path")]
    MissingFile,

    #[error("missing command")]
    MissingCommand,

    #[error("missing username")]
    MissingUsername,

    #[error("password or identityfile is required")]
    MissingCredential,

    #[error("unsupported DNS record type: {0}")]
    UnsupportedDnsType(String),

    #[error("DNS record type conflicts: scheme requires {scheme} but query requires {query}")]
    ConflictingDnsType { scheme: String, query: String },

    #[error("invalid {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("{0}")]
    Resource(#[from] ResourceError),

    #[error("failed to prepare HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("line {line}: {text:?}: {error}")]
    InvalidLine {
        line: usize,
        text: String,
        #[source]
        error: Box<ProbeError>,
    },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ProbeError>),
}

impl ProbeError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ProbeError::InvalidParameter { key: key.into(), reason: reason.into() }
    }

    /// Flatten into the list of underlying errors.
    pub fn into_vec(self) -> Vec<ProbeError> {
        match self {
            ProbeError::Multiple(errors) => errors,
            other => vec![other],
        }
    }
}

fn join_errors(errors: &[ProbeError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
}

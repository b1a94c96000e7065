use thiserror::Error;

use crate::message::Genid;

/// Errors surfaced by a single route-table operation.
///
/// `Contained` errors drop only the peer that caused them; `Fatal` errors
/// indicate a broken pipeline invariant and are not recoverable in place.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("wire error: {0}")]
    Wire(#[from] bgp_packet::CorruptMessage),

    #[error("missing well-known mandatory attribute {0}")]
    MissingWellKnown(&'static str),

    #[error("malformed AS_PATH")]
    MalformedAsPath,

    #[error("bogus next-hop")]
    BogusNexthop,

    #[error("decision invariant violated: {0}")]
    DecisionInvariant(String),

    #[error("prefix already present in trie")]
    DuplicateInsert,

    #[error("prefix not present in trie")]
    NotFound,

    #[error("stale genid {got}, current is {current}")]
    StaleGenid { got: Genid, current: Genid },

    #[error("downstream table reported a failure: {0}")]
    AddFailure(String),
}

impl CoreError {
    /// True when this error should only tear down the peer that produced it.
    pub fn is_contained(&self) -> bool {
        !matches!(self, CoreError::DecisionInvariant(_) | CoreError::AddFailure(_))
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

use thiserror::Error;

/// Error taxonomy for the core pipeline. Binaries convert these to
/// `anyhow::Error` at the edges; ingest-path errors are logged and
/// swallowed rather than propagated (see `collect::queue`).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("lex error: {0}")]
    LexError(String),

    #[error("syntax error: {0}")]
    SyntaxError(String),

    #[error("eval error: {0}")]
    EvalError(String),

    #[error("split mismatch: expected {expected} fields, got {got}")]
    SplitMismatch { expected: usize, got: usize },

    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("WAL write failed: {0}")]
    WalWrite(#[source] std::io::Error),

    #[error("sink delivery failed on '{sink}': {source}")]
    SinkDelivery {
        sink: String,
        #[source]
        source: std::io::Error,
    },

    #[error("consolidation failed: {0}")]
    Consolidation(String),

    #[error("ingest protocol error: {0}")]
    IngestProtocol(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_include_the_offending_detail() {
        assert_eq!(CoreError::LexError("bad token".into()).to_string(), "lex error: bad token");
        assert_eq!(
            CoreError::SplitMismatch { expected: 3, got: 2 }.to_string(),
            "split mismatch: expected 3 fields, got 2"
        );
        assert_eq!(
            CoreError::InvalidSource("nope".into()).to_string(),
            "invalid source: nope"
        );
    }
}

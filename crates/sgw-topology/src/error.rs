use crate::snapshot::TopologyVersion;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// The snapshot failed its consistency checks and was never built.
    #[error("Malformed topology: {0}")]
    Malformed(String),

    /// A publisher was handed a snapshot that does not move the version forward.
    #[error("Out-of-order topology: {attempted} does not follow {current}")]
    OutOfOrder {
        current: TopologyVersion,
        attempted: TopologyVersion,
    },

    #[error("Unknown bucket: {0}")]
    UnknownBucket(String),
}

impl TopologyError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        TopologyError::Malformed(msg.into())
    }
}

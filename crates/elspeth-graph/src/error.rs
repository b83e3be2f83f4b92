//! Structural/configuration errors found while building or validating a
//! graph. Detected at build time; fatal, no run started.

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph contains a cycle reachable from node '{0}'")]
    Cycle(String),

    #[error("expected exactly one source node, found {0}")]
    SourceCount(usize),

    #[error("node '{0}' has no outgoing edge and is not a sink")]
    DanglingTerminal(String),

    #[error("route target '{0}' does not resolve to an existing sink, 'continue', or 'fork'")]
    UnknownRouteTarget(String),

    #[error("fork node '{0}' has an outgoing edge with no branch label")]
    UnlabelledForkEdge(String),

    #[error("fork node '{0}' has duplicate branch label '{1}'")]
    DuplicateForkLabel(String, String),

    #[error("coalesce node '{0}' has fewer than 2 distinct inbound branches")]
    InsufficientCoalesceFanIn(String),

    #[error("edge {0} -> {1} is schema-incompatible: consumer requires field '{2}' that producer does not supply")]
    SchemaIncompatibleEdge(String, String, String),

    #[error("edge references unknown node '{0}'")]
    UnknownNode(String),

    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),
}

//! Work items: plain data describing where a token re-enters the row
//! processor after an aggregation flush produces new output rows. No
//! coroutine state is stored across flushes — a flush's continuation is
//! just a `WorkItem` pushed back onto the processor's queue. Node ids are
//! used for `start_node`/`coalesce_at_node` rather than numeric step
//! indices, since the underlying graph is a DAG, not a linear list.

use elspeth_core::token::Token;

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub token: Token,
    /// Node id the token resumes processing at.
    pub start_node: String,
    /// If this token is itself a fork branch still awaiting a coalesce,
    /// the coalesce node id and the branch label it carries. Set when a
    /// work item is produced from a fork edge that targets a coalesce.
    pub coalesce_at_node: Option<String>,
    pub coalesce_branch: Option<String>,
}

impl WorkItem {
    pub fn new(token: Token, start_node: impl Into<String>) -> Self {
        WorkItem { token, start_node: start_node.into(), coalesce_at_node: None, coalesce_branch: None }
    }

    pub fn at_coalesce(token: Token, coalesce_node: impl Into<String>, branch: impl Into<String>) -> Self {
        let node = coalesce_node.into();
        WorkItem {
            token,
            start_node: node.clone(),
            coalesce_at_node: Some(node),
            coalesce_branch: Some(branch.into()),
        }
    }
}

//! Group membership views as delivered by the group layer.

use super::gtid::Gtid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewStatus {
    /// This node belongs to the primary component and may make progress.
    Primary,
    /// Minority partition or disconnected.
    NonPrimary,
}

/// A configuration change in the totally-ordered stream.
#[derive(Clone, Debug)]
pub struct ViewInfo {
    /// Monotone view number, assigned by the group layer.
    pub view_id: i64,
    pub status: ViewStatus,
    /// Group state at the moment of the view.
    pub state_id: Gtid,
    /// True when this node's state lags the group state.
    pub state_gap: bool,
    /// Member names in group order.
    pub members: Vec<String>,
    /// This node's index into `members`.
    pub my_index: usize,
}

impl ViewInfo {
    pub fn is_primary(&self) -> bool {
        self.status == ViewStatus::Primary
    }
}

use super::NodeAddr;
use super::TransactionId;
use super::ZoneDescription;
use serde::Deserialize;
use serde::Serialize;
use stars_core::Seq;

/// The closed set of overlay wire messages.
///
/// Transactional messages carry a `tx` identifier; `0` marks a message
/// outside any transaction. At a dual-role node the `for_rn` / `from_rn`
/// flags say which role a message is addressed to or answered by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    /// Administrative order to join the network through `target`.
    InsertCommand { target: NodeAddr },
    /// A node asks to enter the tree.
    Insert { tx: TransactionId, who: NodeAddr, for_rn: bool },
    /// Bootstrap of a freshly recruited interior node.
    InitStructNode { tx: TransactionId, father: Option<NodeAddr>, level: u32, children: Vec<NodeAddr> },
    /// A splitting or leaving child hands its father a new sibling.
    NewChild { tx: TransactionId, child: NodeAddr, seq: Seq, replace: bool },
    /// Reparent order from a node's current father.
    NewFather { tx: TransactionId, father: Option<NodeAddr>, for_rn: bool },
    /// Offer of an idle interior node.
    NewStrNode { tx: TransactionId, who_offers: NodeAddr },
    /// Request for an idle interior node, routed by reserve capacity.
    StrNodeNeeded { tx: TransactionId, who_needs: NodeAddr },
    /// Child-to-father zone report, gated by `seq`.
    UpdateZone { tx: TransactionId, zone: ZoneDescription, seq: Seq },
    /// Participant is ready to commit.
    Ack { tx: TransactionId, for_rn: bool, from_rn: bool },
    /// Participant refuses the transaction.
    Nack { tx: TransactionId, for_rn: bool, from_rn: bool },
    /// Driver decision: apply the staged changes.
    Commit { tx: TransactionId, for_rn: bool },
    /// Driver decision (or mismatch report): revert the staged changes.
    Rollback { tx: TransactionId, for_rn: bool },
    /// Administrative order to evacuate and leave the tree.
    LeaveCommand,
}

impl Msg {
    /// The transaction this message belongs to; `0` outside transactions.
    pub fn tx(&self) -> TransactionId {
        match self {
            Msg::InsertCommand { .. } | Msg::LeaveCommand => 0,
            Msg::Insert { tx, .. }
            | Msg::InitStructNode { tx, .. }
            | Msg::NewChild { tx, .. }
            | Msg::NewFather { tx, .. }
            | Msg::NewStrNode { tx, .. }
            | Msg::StrNodeNeeded { tx, .. }
            | Msg::UpdateZone { tx, .. }
            | Msg::Ack { tx, .. }
            | Msg::Nack { tx, .. }
            | Msg::Commit { tx, .. }
            | Msg::Rollback { tx, .. } => *tx,
        }
    }
}

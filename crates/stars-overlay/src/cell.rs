use super::NodeAddr;
use super::ZoneDescription;
use serde::Deserialize;
use serde::Serialize;
use stars_core::Seq;

/// The pending side of a child slot while a transaction is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pending {
    link: Option<NodeAddr>,
    zone: Option<ZoneDescription>,
}

/// A two-valued child slot of an interior node.
///
/// Outside a transaction only the stable side exists. A transaction stages
/// its effect on the pending side, so commit and rollback are mechanical:
/// an addition has no stable link yet, a deletion has no pending link, and
/// a link change carries both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneCell {
    link: Option<NodeAddr>,
    zone: Option<ZoneDescription>,
    seq: Seq,
    pending: Option<Pending>,
}

impl ZoneCell {
    /// A slot added by the open transaction; it has no zone information
    /// until its child reports.
    pub fn added(link: NodeAddr) -> Self {
        Self { link: None, zone: None, seq: 0, pending: Some(Pending { link: Some(link), zone: None }) }
    }

    /// The stable link of this slot.
    pub fn link(&self) -> Option<NodeAddr> {
        self.link
    }

    /// The link the slot will carry if the open transaction commits.
    pub fn new_link(&self) -> Option<NodeAddr> {
        self.pending.as_ref().and_then(|p| p.link)
    }

    pub fn zone(&self) -> Option<&ZoneDescription> {
        self.zone.as_ref()
    }

    pub fn zone_mut(&mut self) -> Option<&mut ZoneDescription> {
        self.zone.as_mut()
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn changing(&self) -> bool {
        self.pending.is_some()
    }

    /// An addition becomes a live slot on commit and disappears on rollback.
    pub fn is_addition(&self) -> bool {
        self.link.is_none() && self.pending.is_some()
    }

    /// A deletion disappears on commit and survives on rollback.
    pub fn is_deletion(&self) -> bool {
        self.link.is_some() && self.pending.as_ref().map(|p| p.link.is_none()).unwrap_or(false)
    }

    /// Stage a link replacement, carrying the current zone over.
    pub fn stage_link(&mut self, link: NodeAddr) {
        self.pending = Some(Pending { link: Some(link), zone: self.zone });
    }

    /// Stage the removal of this slot.
    pub fn stage_removal(&mut self) {
        self.pending = Some(Pending { link: None, zone: None });
    }

    /// Stage a zone overwrite on the pending side (or drop stale stable
    /// information when `zone` is `None`).
    pub fn stage_zone(&mut self, zone: Option<ZoneDescription>) {
        match &mut self.pending {
            Some(pending) => pending.zone = zone,
            None => {
                self.pending = Some(Pending { link: self.link, zone });
            }
        }
    }

    /// Whether an update from `src` belongs to this slot.
    pub fn comes_from(&self, src: NodeAddr) -> bool {
        self.link == Some(src) || self.pending.as_ref().map(|p| p.link == Some(src)).unwrap_or(false)
    }

    /// Sequence gate: accept only strictly newer updates.
    pub fn test_and_set(&mut self, seq: Seq) -> bool {
        if seq > self.seq {
            self.seq = seq;
            true
        } else {
            false
        }
    }

    /// Route an accepted zone update to the side `src` currently owns. When
    /// both sides carry the same link the pending side wins, so the update
    /// can still be rolled back.
    pub fn set_zone_from(&mut self, src: NodeAddr, zone: ZoneDescription) {
        match &mut self.pending {
            None => {
                if self.link == Some(src) {
                    self.zone = Some(zone);
                }
            }
            Some(pending) => {
                if pending.link == Some(src) {
                    pending.zone = Some(zone);
                } else if self.link == Some(src) {
                    self.zone = Some(zone);
                }
            }
        }
    }

    /// Apply the pending side. Deletions must be removed by the caller.
    pub fn commit(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.link = pending.link;
            self.zone = pending.zone;
        }
    }

    /// Discard the pending side. Additions must be removed by the caller.
    pub fn rollback(&mut self) {
        self.pending = None;
    }
}

impl std::fmt::Display for ZoneCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = |l: Option<NodeAddr>| l.map(|a| a.to_string()).unwrap_or_else(|| "-".into());
        write!(f, "c={}", link(self.link))?;
        if let Some(pending) = &self.pending {
            write!(f, "/{}", link(pending.link))?;
        }
        write!(f, " seq={}", self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(link: u32, zone: ZoneDescription) -> ZoneCell {
        let mut cell = ZoneCell::added(NodeAddr::from(link));
        cell.commit();
        cell.set_zone_from(NodeAddr::from(link), zone);
        cell
    }

    #[test]
    fn addition_lives_on_commit_and_dies_on_rollback() {
        let mut cell = ZoneCell::added(NodeAddr::from(5));
        assert!(cell.is_addition());
        let mut dropped = cell.clone();
        cell.commit();
        assert_eq!(cell.link(), Some(NodeAddr::from(5)));
        assert!(!cell.changing());
        dropped.rollback();
        assert!(dropped.link().is_none());
    }

    #[test]
    fn rollback_restores_the_stable_side() {
        let zone = ZoneDescription::leaf(NodeAddr::from(5), true);
        let mut cell = committed(5, zone);
        let before = cell.clone();
        cell.stage_link(NodeAddr::from(9));
        cell.set_zone_from(NodeAddr::from(9), ZoneDescription::leaf(NodeAddr::from(9), false));
        cell.rollback();
        assert_eq!(cell, before);
    }

    #[test]
    fn deletion_is_marked_not_applied() {
        let mut cell = committed(5, ZoneDescription::leaf(NodeAddr::from(5), true));
        cell.stage_removal();
        assert!(cell.is_deletion());
        assert_eq!(cell.link(), Some(NodeAddr::from(5)));
    }

    #[test]
    fn sequence_gate_drops_stale_updates() {
        let mut cell = committed(5, ZoneDescription::leaf(NodeAddr::from(5), true));
        assert!(cell.test_and_set(3));
        assert!(!cell.test_and_set(3));
        assert!(!cell.test_and_set(2));
        assert!(cell.test_and_set(4));
    }

    #[test]
    fn updates_during_a_change_go_to_the_pending_side() {
        let mut cell = committed(5, ZoneDescription::leaf(NodeAddr::from(5), true));
        cell.stage_link(NodeAddr::from(5));
        let newer = ZoneDescription::leaf(NodeAddr::from(5), false);
        cell.set_zone_from(NodeAddr::from(5), newer);
        // The stable side still holds the old zone for rollback.
        assert_eq!(cell.zone().expect("stable zone").available_str_nodes(), 1);
        cell.commit();
        assert_eq!(cell.zone().expect("committed zone").available_str_nodes(), 0);
    }
}

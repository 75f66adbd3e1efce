use super::NodeAddr;
use serde::Deserialize;
use serde::Serialize;
use stars_core::Duration;

/// Transaction identifier; `0` is reserved for "no transaction".
pub type TransactionId = u64;

/// The reserved null transaction id.
pub const NULL_TRANSACTION: TransactionId = 0;

/// A fresh uniform-random nonzero transaction id.
pub fn random_id() -> TransactionId {
    use rand::Rng;
    let mut rng = rand::rng();
    loop {
        let id: u64 = rng.random();
        if id != NULL_TRANSACTION {
            return id;
        }
    }
}

/// One transaction participant: an address plus its role flag (`true` for
/// the leaf role at that address).
pub type Member = (NodeAddr, bool);

/// Per-endpoint state of one two-phase-commit round.
///
/// Both roles carry one: participants only track the id and the driver,
/// while the driver also tracks which members have acknowledged and how
/// long to wait before giving up on the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    id: TransactionId,
    driver: NodeAddr,
    no_ack: Vec<Member>,
    ack: Vec<Member>,
    attempts: u32,
}

impl Transaction {
    pub fn new(id: TransactionId, driver: NodeAddr) -> Self {
        assert!(id != NULL_TRANSACTION, "null transaction id");
        Self { id, driver, no_ack: Vec::new(), ack: Vec::new(), attempts: 0 }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn driver(&self) -> NodeAddr {
        self.driver
    }

    /// Register a member whose acknowledgement is required to commit.
    pub fn expect(&mut self, member: Member) {
        if !self.no_ack.contains(&member) {
            self.no_ack.push(member);
        }
    }

    /// Record a member's acknowledgement; true once every member has acked.
    pub fn acked(&mut self, member: Member) -> bool {
        if let Some(at) = self.no_ack.iter().position(|m| *m == member) {
            self.no_ack.remove(at);
            if !self.ack.contains(&member) {
                self.ack.push(member);
            }
        }
        self.no_ack.is_empty()
    }

    pub fn all_acked(&self) -> bool {
        self.no_ack.is_empty()
    }

    /// Members that have acknowledged; rollback only reaches these, the
    /// rest learn of the abort when their late ack is answered.
    pub fn acked_members(&self) -> &[Member] {
        &self.ack
    }

    /// Forget outstanding members when aborting.
    pub fn abort(&mut self) -> Vec<Member> {
        self.no_ack.clear();
        std::mem::take(&mut self.ack)
    }

    /// Timeout for the next wait, doubling per attempt up to a minute so an
    /// unlucky first offer does not stall a split for the full interval.
    pub fn backoff(&mut self) -> Duration {
        let exp = self.attempts.min(2);
        self.attempts += 1;
        Duration::from_secs(15.0 * (1 << exp) as f64)
    }
}

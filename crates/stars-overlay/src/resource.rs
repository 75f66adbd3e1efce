use super::*;
use stars_core::Seq;
use std::collections::VecDeque;

/// Externally visible state of the leaf role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RnStatus {
    Offline,
    Online,
    StartIn,
    StartOut,
    InitFather,
    ChangeFather,
}

/// The leaf role of an overlay node.
///
/// Tracks the current father link, takes part in insert and father-change
/// transactions as negotiated by its neighborhood, and reports its leaf
/// zone upward with strictly increasing sequence numbers. Messages that
/// cannot be served while a transaction is open are delayed and replayed on
/// commit or rollback.
#[derive(Debug)]
pub struct ResourceNode {
    local: NodeAddr,
    father: Option<NodeAddr>,
    new_father: Option<NodeAddr>,
    seq: Seq,
    tx: TransactionId,
    available_str_nodes: bool,
    delayed: VecDeque<(NodeAddr, Msg)>,
    broker: EventBroker,
}

impl ResourceNode {
    pub fn new(local: NodeAddr) -> Self {
        Self {
            local,
            father: None,
            new_father: None,
            seq: 1,
            tx: NULL_TRANSACTION,
            available_str_nodes: true,
            delayed: VecDeque::new(),
            broker: EventBroker::default(),
        }
    }

    pub fn local(&self) -> NodeAddr {
        self.local
    }

    pub fn father(&self) -> Option<NodeAddr> {
        self.father
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn tx(&self) -> TransactionId {
        self.tx
    }

    pub fn delayed(&self) -> usize {
        self.delayed.len()
    }

    pub fn delayed_messages(&self) -> impl Iterator<Item = &(NodeAddr, Msg)> {
        self.delayed.iter()
    }

    pub fn broker(&mut self) -> &mut EventBroker {
        &mut self.broker
    }

    pub fn status(&self) -> RnStatus {
        match (self.father, self.new_father, self.tx) {
            (None, None, NULL_TRANSACTION) => RnStatus::Offline,
            (Some(_), None, NULL_TRANSACTION) => RnStatus::Online,
            (None, None, _) => RnStatus::StartIn,
            (Some(_), None, _) => RnStatus::StartOut,
            (None, Some(_), _) => RnStatus::InitFather,
            (Some(_), Some(_), _) => RnStatus::ChangeFather,
        }
    }

    /// The co-located interior node's availability toggled; report upward
    /// unless a transaction is open.
    pub fn availability_changed(&mut self, available: bool, net: &mut dyn Network) {
        self.available_str_nodes = available;
        self.broker.fire(NodeEvent::AvailabilityChanged { available });
        if self.tx == NULL_TRANSACTION {
            self.notify_father(net);
        }
    }

    fn notify_father(&mut self, net: &mut dyn Network) {
        if let Some(father) = self.father {
            log::debug!("[{}] rn reporting zone to father {}", self.local, father);
            let zone = ZoneDescription::leaf(self.local, self.available_str_nodes);
            net.send(father, Msg::UpdateZone { tx: NULL_TRANSACTION, zone, seq: self.seq });
            self.seq += 1;
        }
    }

    fn commit(&mut self, net: &mut dyn Network) {
        log::info!("[{}] rn committing changes", self.local);
        self.tx = NULL_TRANSACTION;
        if self.father.is_none() || self.father != self.new_father {
            self.father = self.new_father.take();
            self.seq = 1;
            self.notify_father(net);
            self.broker.fire(NodeEvent::FatherChanged { ok: true });
        } else {
            self.new_father = None;
        }
        self.handle_delayed(net);
    }

    fn rollback(&mut self, net: &mut dyn Network) {
        log::info!("[{}] rn rolling back changes", self.local);
        self.tx = NULL_TRANSACTION;
        self.new_father = None;
        self.broker.fire(NodeEvent::FatherChanged { ok: false });
        self.handle_delayed(net);
    }

    fn handle_delayed(&mut self, net: &mut dyn Network) {
        while self.tx == NULL_TRANSACTION {
            let Some((src, msg)) = self.delayed.pop_front() else { break };
            self.dispatch(src, &msg, true, net);
        }
    }

    /// Process one message addressed to this endpoint.
    pub fn handle(&mut self, src: NodeAddr, msg: &Msg, net: &mut dyn Network) {
        self.dispatch(src, msg, false, net);
    }

    fn dispatch(&mut self, src: NodeAddr, msg: &Msg, replay: bool, net: &mut dyn Network) {
        match msg {
            Msg::InsertCommand { target } => {
                if self.father.is_none() {
                    self.broker.fire(NodeEvent::FatherChanging);
                    self.tx = tx::random_id();
                    log::info!("[{}] rn joining through {} with transaction {}", self.local, target, self.tx);
                    net.send(
                        *target,
                        Msg::Insert { tx: self.tx, who: self.local, for_rn: *target != self.local },
                    );
                }
            }
            Msg::Insert { who, for_rn, .. } => {
                if !*for_rn {
                    return;
                }
                log::info!("[{}] rn handling insert of {} from {}", self.local, who, src);
                if self.tx != NULL_TRANSACTION {
                    log::debug!("[{}] rn in a transaction, delaying", self.local);
                    self.delayed.push_back((src, msg.clone()));
                } else if let Some(father) = self.father {
                    // Relay into the tree through our own father.
                    net.send(father, Msg::Insert { tx: msg.tx(), who: *who, for_rn: false });
                } else {
                    log::info!("[{}] rn offline and not the target, ignoring", self.local);
                }
            }
            Msg::NewFather { tx, father, for_rn } => {
                if !*for_rn {
                    return;
                }
                log::info!("[{}] rn handling new father from {}", self.local, src);
                if self.tx != NULL_TRANSACTION {
                    log::debug!("[{}] rn in a transaction, delaying", self.local);
                    self.delayed.push_back((src, msg.clone()));
                } else if self.father == Some(src) {
                    self.broker.fire(NodeEvent::FatherChanging);
                    self.new_father = *father;
                    self.tx = *tx;
                    net.send(src, Msg::Ack { tx: *tx, for_rn: false, from_rn: true });
                } else {
                    log::info!("[{}] rn: sender is not my father, discarding", self.local);
                }
            }
            Msg::Ack { tx, for_rn, .. } => {
                if !*for_rn {
                    return;
                }
                if self.tx != NULL_TRANSACTION && *tx == self.tx {
                    self.new_father = Some(src);
                    self.commit(net);
                    log::debug!("[{}] rn new father set to {}", self.local, src);
                    net.send(src, Msg::Commit { tx: *tx, for_rn: false });
                } else {
                    log::info!("[{}] rn ack with wrong transaction, discarding", self.local);
                }
            }
            Msg::Nack { tx, for_rn, .. } => {
                if !*for_rn {
                    return;
                }
                if self.tx != NULL_TRANSACTION && *tx == self.tx {
                    self.rollback(net);
                    log::debug!("[{}] rn giving up insertion", self.local);
                } else {
                    log::info!("[{}] rn nack with wrong transaction, discarding", self.local);
                }
            }
            Msg::Commit { tx, for_rn } => {
                if !*for_rn {
                    return;
                }
                if self.tx != NULL_TRANSACTION && *tx == self.tx {
                    self.commit(net);
                } else {
                    log::info!("[{}] rn commit with wrong transaction, discarding", self.local);
                }
            }
            Msg::Rollback { tx, for_rn } => {
                if !*for_rn {
                    return;
                }
                if self.tx != NULL_TRANSACTION && *tx == self.tx {
                    self.rollback(net);
                } else {
                    log::info!("[{}] rn rollback with wrong transaction, discarding", self.local);
                }
            }
            _ => {
                let _ = replay;
            }
        }
    }
}

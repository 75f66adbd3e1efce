//! End-to-end exercises of the overlay protocol on an in-memory bus.
//!
//! Every peer carries both roles. Delivery is FIFO per (source,
//! destination) pair and fully deterministic; timers are recorded but only
//! fire when a test asks them to.

use stars_core::Duration;
use stars_overlay::*;
use std::collections::BTreeMap;
use std::collections::VecDeque;

/// Sends of one handler invocation, stamped with the sender.
struct Outbox {
    from: NodeAddr,
    sent: Vec<(NodeAddr, NodeAddr, Msg)>,
    next_timer: u64,
}

impl Network for Outbox {
    fn send(&mut self, to: NodeAddr, msg: Msg) {
        self.sent.push((self.from, to, msg));
    }
    fn set_timer(&mut self, _delay: Duration) -> TimerId {
        self.next_timer += 1;
        self.next_timer
    }
    fn cancel_timer(&mut self, _timer: TimerId) {}
}

struct Peer {
    rn: ResourceNode,
    sn: StructureNode,
}

struct Sim {
    peers: BTreeMap<NodeAddr, Peer>,
    queue: VecDeque<(NodeAddr, NodeAddr, Msg)>,
    timer_counter: u64,
    /// Last update sequence seen per (child, father) link.
    seqs: BTreeMap<(NodeAddr, NodeAddr), u64>,
    seq_violations: usize,
}

impl Sim {
    fn new(addrs: &[u32], fanout: usize) -> Self {
        let peers = addrs
            .iter()
            .map(|&a| {
                let addr = NodeAddr::from(a);
                (addr, Peer { rn: ResourceNode::new(addr), sn: StructureNode::new(addr, fanout) })
            })
            .collect();
        Self {
            peers,
            queue: VecDeque::new(),
            timer_counter: 0,
            seqs: BTreeMap::new(),
            seq_violations: 0,
        }
    }

    /// Inject an administrative command at a peer.
    fn command(&mut self, at: u32, msg: Msg) {
        let addr = NodeAddr::from(at);
        self.queue.push_back((addr, addr, msg));
    }

    /// Deliver messages until the network is quiet.
    fn run(&mut self) {
        for _ in 0..10_000 {
            let Some((src, dst, msg)) = self.queue.pop_front() else { return };
            if let Msg::UpdateZone { seq, .. } = &msg {
                // Strictly increasing per link; a reset to 1 marks a new
                // father epoch.
                let last = self.seqs.get(&(src, dst)).copied().unwrap_or(0);
                if *seq <= last && *seq != 1 {
                    self.seq_violations += 1;
                }
                self.seqs.insert((src, dst), *seq);
            }
            let mut out = Outbox { from: dst, sent: Vec::new(), next_timer: self.timer_counter };
            let peer = self.peers.get_mut(&dst).expect("message to unknown peer");
            peer.sn.handle(src, &msg, &mut out);
            peer.rn.handle(src, &msg, &mut out);
            self.timer_counter = out.next_timer;
            self.queue.extend(out.sent);
        }
        panic!("network failed to quiesce");
    }

    fn rn(&self, at: u32) -> &ResourceNode {
        &self.peers[&NodeAddr::from(at)].rn
    }

    fn sn(&self, at: u32) -> &StructureNode {
        &self.peers[&NodeAddr::from(at)].sn
    }

    fn insert(&mut self, who: u32, through: u32) {
        self.command(who, Msg::InsertCommand { target: NodeAddr::from(through) });
        self.run();
    }

    fn child_links(&self, at: u32) -> Vec<NodeAddr> {
        self.sn(at).children().iter().filter_map(|c| c.link()).collect()
    }
}

fn addr(n: u32) -> NodeAddr {
    NodeAddr::from(n)
}

#[test]
fn singleton_insertion_creates_the_tree() {
    let mut sim = Sim::new(&[10], 2);
    sim.insert(10, 10);

    assert_eq!(sim.rn(10).father(), Some(addr(10)));
    assert_eq!(sim.sn(10).state(), SnState::Online);
    assert_eq!(sim.sn(10).level(), 0);
    let children = sim.sn(10).children();
    assert_eq!(children.len(), 1);
    let zone = children[0].zone().expect("the leaf reported its zone");
    assert_eq!(zone.min_addr(), addr(10));
    assert_eq!(zone.max_addr(), addr(10));
    assert_eq!(zone.available_str_nodes(), 1);
    assert_eq!(sim.seq_violations, 0);
}

#[test]
fn fourth_leaf_splits_the_root() {
    let mut sim = Sim::new(&[0, 1, 2, 3], 2);
    for leaf in 0..4 {
        sim.insert(leaf, 0);
    }

    // One new root one level up, over the old router and the recruited one.
    assert_eq!(sim.sn(1).state(), SnState::Online);
    assert_eq!(sim.sn(1).level(), 1);
    assert_eq!(sim.sn(1).father(), None);
    let mut root_children = sim.child_links(1);
    root_children.sort();
    assert_eq!(root_children, vec![addr(0), addr(2)]);
    let root_zone = sim.sn(1).zone().expect("root aggregates the whole tree");
    assert_eq!(root_zone.min_addr(), addr(0));
    assert_eq!(root_zone.max_addr(), addr(3));

    // Two level-0 routers holding two leaves each.
    assert_eq!(sim.sn(0).state(), SnState::Online);
    assert_eq!(sim.sn(0).level(), 0);
    assert_eq!(sim.sn(0).father(), Some(addr(1)));
    assert_eq!(sim.child_links(0), vec![addr(2), addr(3)]);
    assert_eq!(sim.sn(2).state(), SnState::Online);
    assert_eq!(sim.sn(2).level(), 0);
    assert_eq!(sim.sn(2).father(), Some(addr(1)));
    assert_eq!(sim.child_links(2), vec![addr(0), addr(1)]);
    assert_eq!(sim.sn(3).state(), SnState::Offline);

    // Every leaf points at the router that owns its zone.
    assert_eq!(sim.rn(0).father(), Some(addr(2)));
    assert_eq!(sim.rn(1).father(), Some(addr(2)));
    assert_eq!(sim.rn(2).father(), Some(addr(0)));
    assert_eq!(sim.rn(3).father(), Some(addr(0)));
    assert_eq!(sim.seq_violations, 0);
}

#[test]
fn later_leaves_route_into_the_split_tree() {
    let mut sim = Sim::new(&[0, 1, 2, 3, 7], 2);
    for leaf in 0..4 {
        sim.insert(leaf, 0);
    }
    sim.insert(7, 0);

    // Address 7 is nearest the upper zone, owned by the old router.
    assert_eq!(sim.rn(7).father(), Some(addr(0)));
    assert!(sim.child_links(0).contains(&addr(7)));
    let root_zone = sim.sn(1).zone().expect("root aggregates the whole tree");
    assert_eq!(root_zone.max_addr(), addr(7));
    assert_eq!(sim.seq_violations, 0);
}

#[test]
fn every_leaf_keeps_exactly_one_father() {
    let mut sim = Sim::new(&[0, 1, 2, 3, 4, 5], 2);
    for leaf in 0..6 {
        sim.insert(leaf, 0);
    }
    let mut routed = 0;
    for leaf in 0..6 {
        let father = sim.rn(leaf).father().expect("every leaf is online");
        let owner = sim.peers[&father].sn.children();
        assert!(
            owner.iter().any(|c| c.link() == Some(addr(leaf))),
            "leaf {} points at {} which does not own it",
            leaf,
            father
        );
        routed += 1;
    }
    assert_eq!(routed, 6);
    assert_eq!(sim.seq_violations, 0);
}

#[test]
fn updates_flow_to_the_root_after_restructuring() {
    let mut sim = Sim::new(&[0, 1, 2, 3], 2);
    for leaf in 0..4 {
        sim.insert(leaf, 0);
    }
    // A leaf toggles its availability; the change propagates to the root.
    let before = sim.sn(1).zone().expect("root zone").available_str_nodes();
    {
        let mut out = Outbox { from: addr(3), sent: Vec::new(), next_timer: sim.timer_counter };
        let peer = sim.peers.get_mut(&addr(3)).expect("peer 3");
        peer.rn.availability_changed(false, &mut out);
        sim.queue.extend(out.sent);
    }
    sim.run();
    let after = sim.sn(1).zone().expect("root zone").available_str_nodes();
    assert_eq!(after, before - 1);
    assert_eq!(sim.seq_violations, 0);
}

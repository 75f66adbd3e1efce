use super::*;
use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

/// Frozen state of one peer's two roles, for diagnostics and cold restarts.
///
/// A checkpoint of the whole tree is the breadth-first sequence of these
/// records; nothing in the protocol requires one to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerCheckpoint {
    pub addr: NodeAddr,
    pub leaf: LeafCheckpoint,
    pub interior: InteriorCheckpoint,
}

/// Frozen leaf role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafCheckpoint {
    pub father: Option<NodeAddr>,
    pub seq: stars_core::Seq,
    pub tx: TransactionId,
    pub delayed: Vec<(NodeAddr, Msg)>,
}

/// Frozen interior role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteriorCheckpoint {
    pub state: String,
    pub level: u32,
    pub father: Option<NodeAddr>,
    pub seq: stars_core::Seq,
    pub children: Vec<ZoneCell>,
    pub tx: TransactionId,
    pub delayed: Vec<(NodeAddr, Msg)>,
}

impl ResourceNode {
    pub fn checkpoint(&self) -> LeafCheckpoint {
        LeafCheckpoint {
            father: self.father(),
            seq: self.seq(),
            tx: self.tx(),
            delayed: self.delayed_messages().cloned().collect(),
        }
    }
}

impl StructureNode {
    pub fn checkpoint(&self) -> InteriorCheckpoint {
        InteriorCheckpoint {
            state: format!("{:?}", self.state()),
            level: self.level(),
            father: self.father(),
            seq: self.seq(),
            children: self.children().to_vec(),
            tx: self.tx(),
            delayed: self.delayed_messages().cloned().collect(),
        }
    }
}

/// Serialize a sequence of peer checkpoints, one JSON document per line.
/// The caller supplies peers in breadth-first tree order.
pub fn write_checkpoint<'a, W: std::io::Write>(
    mut out: W,
    peers: impl Iterator<Item = &'a PeerCheckpoint>,
) -> anyhow::Result<()> {
    for peer in peers {
        let line = serde_json::to_string(peer).context("encoding peer checkpoint")?;
        writeln!(out, "{}", line).context("writing peer checkpoint")?;
    }
    Ok(())
}

/// Parse a checkpoint produced by [`write_checkpoint`].
pub fn read_checkpoint(input: &str) -> anyhow::Result<Vec<PeerCheckpoint>> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("decoding peer checkpoint"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stars_core::Duration;

    struct Sink;
    impl Network for Sink {
        fn send(&mut self, _: NodeAddr, _: Msg) {}
        fn set_timer(&mut self, _: Duration) -> TimerId {
            0
        }
        fn cancel_timer(&mut self, _: TimerId) {}
    }

    #[test]
    fn checkpoints_round_trip() {
        let mut net = Sink;
        let addr = NodeAddr::from(10);
        let mut rn = ResourceNode::new(addr);
        let mut sn = StructureNode::new(addr, 2);
        rn.handle(addr, &Msg::InsertCommand { target: addr }, &mut net);
        sn.handle(addr, &Msg::Insert { tx: rn.tx(), who: addr, for_rn: false }, &mut net);

        let peer = PeerCheckpoint {
            addr,
            leaf: rn.checkpoint(),
            interior: sn.checkpoint(),
        };
        let mut encoded = Vec::new();
        write_checkpoint(&mut encoded, std::iter::once(&peer)).expect("encode");
        let text = String::from_utf8(encoded).expect("utf8 checkpoint");
        let decoded = read_checkpoint(&text).expect("decode");
        assert_eq!(decoded, vec![peer]);
        assert_eq!(decoded[0].interior.state, "AddChild");
    }

    #[test]
    fn delayed_messages_survive_the_checkpoint() {
        let mut net = Sink;
        let addr = NodeAddr::from(10);
        let mut sn = StructureNode::new(addr, 2);
        sn.handle(addr, &Msg::Insert { tx: 5, who: addr, for_rn: false }, &mut net);
        // A second insert knocks during the open transaction.
        sn.handle(NodeAddr::from(11), &Msg::Insert { tx: 6, who: NodeAddr::from(11), for_rn: false }, &mut net);
        let frozen = sn.checkpoint();
        assert_eq!(frozen.delayed.len(), 1);
        assert_eq!(frozen.tx, 5);
    }
}

use super::Msg;
use super::NodeAddr;
use stars_core::Duration;

/// Handle of an armed timer.
pub type TimerId = u64;

/// The transport the overlay endpoints drive.
///
/// Handlers run to completion and never block: everything an endpoint does
/// to the outside world goes through this trait, and everything the world
/// does to an endpoint arrives as a message or a timer expiry. Delivery
/// between one ordered pair of nodes is FIFO; nothing is assumed across
/// senders.
pub trait Network {
    /// Queue a message for delivery.
    fn send(&mut self, to: NodeAddr, msg: Msg);

    /// Arm a timer; its expiry is delivered back to the local endpoint as a
    /// [`timer_expired`](crate::StructureNode::timer_expired) call.
    fn set_timer(&mut self, delay: Duration) -> TimerId;

    /// Disarm a timer. A cancelled timer never fires.
    fn cancel_timer(&mut self, timer: TimerId);
}

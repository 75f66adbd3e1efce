/// Events an overlay endpoint publishes to its observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// A father change is about to be negotiated.
    FatherChanging,
    /// A father change committed (`ok`) or rolled back.
    FatherChanged { ok: bool },
    /// The co-located interior node became busy or free.
    AvailabilityChanged { available: bool },
    /// A structural transaction started staging changes.
    StartChanges,
    /// A structural transaction committed (`ok`) or rolled back.
    CommitChanges { ok: bool },
}

/// Handle of one subscription, for explicit unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Subscription broker decoupling endpoints from their observers.
///
/// Listeners are plain closures owned by the broker; nothing holds a
/// pointer back into a foreign lifetime.
#[derive(Default)]
pub struct EventBroker {
    subscribers: Vec<(ObserverId, Box<dyn FnMut(&NodeEvent)>)>,
    next: u64,
}

impl EventBroker {
    pub fn subscribe(&mut self, listener: Box<dyn FnMut(&NodeEvent)>) -> ObserverId {
        let id = ObserverId(self.next);
        self.next += 1;
        self.subscribers.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) {
        self.subscribers.retain(|(sid, _)| *sid != id);
    }

    pub fn fire(&mut self, event: NodeEvent) {
        for (_, listener) in self.subscribers.iter_mut() {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for EventBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroker")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn subscribers_receive_fired_events() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut broker = EventBroker::default();
        broker.subscribe(Box::new(move |e| sink.borrow_mut().push(*e)));
        broker.fire(NodeEvent::FatherChanging);
        broker.fire(NodeEvent::FatherChanged { ok: true });
        assert_eq!(
            &*seen.borrow(),
            &[NodeEvent::FatherChanging, NodeEvent::FatherChanged { ok: true }]
        );
    }

    #[test]
    fn unsubscription_is_explicit() {
        let seen = Rc::new(RefCell::new(0));
        let sink = seen.clone();
        let mut broker = EventBroker::default();
        let id = broker.subscribe(Box::new(move |_| *sink.borrow_mut() += 1));
        broker.fire(NodeEvent::StartChanges);
        broker.unsubscribe(id);
        broker.fire(NodeEvent::StartChanges);
        assert_eq!(*seen.borrow(), 1);
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use futures::channel::mpsc::UnboundedSender;
use log::{debug, warn};

use crate::device::types::Event;

/// Receives relayed events. Returning the event back signals that the
/// listener is gone; the relay then detaches it and buffers the event.
pub trait EventListener: Send {
    fn deliver(&mut self, event: Event) -> Result<(), Event>;
}

impl EventListener for UnboundedSender<Event> {
    fn deliver(&mut self, event: Event) -> Result<(), Event> {
        self.unbounded_send(event).map_err(|err| err.into_inner())
    }
}

struct RelayInner {
    listener: Option<Box<dyn EventListener>>,
    buffer: VecDeque<Event>,
    capacity: usize,
    dropped: usize,
}

impl RelayInner {
    fn push(&mut self, event: Event) {
        if self.buffer.len() >= self.capacity {
            match self.buffer.pop_front() {
                Some(oldest) => warn!("Event buffer is full, dropping {:?}", oldest),
                None => warn!("Event buffer has no capacity, dropping {:?}", event),
            }
            self.dropped += 1;
            if self.capacity == 0 {
                return;
            }
        }
        self.buffer.push_back(event);
    }

    fn deliver(&mut self, event: Event) -> bool {
        let Some(listener) = self.listener.as_mut() else {
            self.push(event);
            return false;
        };

        match listener.deliver(event) {
            Ok(()) => true,
            Err(event) => {
                debug!("Listener went away, buffering events");
                self.listener = None;
                self.push(event);
                false
            },
        }
    }

    fn flush(&mut self) {
        if self.dropped > 0 {
            let overflow = Event::Overflow { dropped: self.dropped };
            let Some(listener) = self.listener.as_mut() else { return };
            if listener.deliver(overflow).is_err() {
                self.listener = None;
                return;
            }
            self.dropped = 0;
        }

        while let Some(event) = self.buffer.pop_front() {
            let Some(listener) = self.listener.as_mut() else {
                self.buffer.push_front(event);
                return;
            };

            if let Err(event) = listener.deliver(event) {
                self.listener = None;
                self.buffer.push_front(event);
                return;
            }
        }
    }
}

/// Ordered delivery of events to at most one listener, buffering while
/// none is attached.
#[derive(Clone)]
pub struct EventRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl EventRelay {
    pub fn new(capacity: usize) -> Self {
        EventRelay {
            inner: Arc::new(Mutex::new(RelayInner {
                listener: None,
                buffer: VecDeque::new(),
                capacity,
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the current listener and flushes everything buffered so far.
    pub fn attach<L: EventListener + 'static>(&self, listener: L) {
        let mut inner = self.lock();
        if inner.listener.is_some() {
            debug!("Replacing attached listener");
        }
        inner.listener = Some(Box::new(listener));
        inner.flush();
    }

    pub fn detach(&self) {
        self.lock().listener = None;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().listener.is_some()
    }

    pub fn emit(&self, event: Event) {
        self.lock().deliver(event);
    }

    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::unbounded;

    fn discovered(name: &str) -> Event {
        Event::DeviceDiscovered { name: name.to_string(), rssi: -60 }
    }

    struct Collector(Arc<Mutex<Vec<Event>>>);

    impl EventListener for Collector {
        fn deliver(&mut self, event: Event) -> Result<(), Event> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn collector() -> (Arc<Mutex<Vec<Event>>>, Collector) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (events.clone(), Collector(events))
    }

    #[test]
    fn buffered_events_flush_in_order_on_attach() {
        let relay = EventRelay::new(8);
        relay.emit(discovered("E1"));
        relay.emit(discovered("E2"));
        assert_eq!(relay.buffered(), 2);

        let (events, listener) = collector();
        relay.attach(listener);
        relay.emit(discovered("E3"));

        assert_eq!(*events.lock().unwrap(), vec![discovered("E1"), discovered("E2"), discovered("E3")]);
        assert_eq!(relay.buffered(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_reports() {
        let relay = EventRelay::new(2);
        relay.emit(discovered("a"));
        relay.emit(discovered("b"));
        relay.emit(discovered("c"));

        let (events, listener) = collector();
        relay.attach(listener);

        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::Overflow { dropped: 1 }, discovered("b"), discovered("c")],
        );
    }

    #[test]
    fn detach_keeps_buffering() {
        let relay = EventRelay::new(8);
        let (first, listener) = collector();
        relay.attach(listener);
        relay.emit(discovered("live"));
        relay.detach();
        assert!(!relay.is_attached());

        relay.emit(discovered("later"));
        assert_eq!(relay.buffered(), 1);

        let (second, listener) = collector();
        relay.attach(listener);
        assert_eq!(*first.lock().unwrap(), vec![discovered("live")]);
        assert_eq!(*second.lock().unwrap(), vec![discovered("later")]);
    }

    #[test]
    fn closed_channel_listener_is_detached() {
        let relay = EventRelay::new(8);
        let (sender, receiver) = unbounded();
        relay.attach(sender);
        drop(receiver);

        relay.emit(discovered("lost?"));
        assert!(!relay.is_attached());
        assert_eq!(relay.buffered(), 1);

        let (events, listener) = collector();
        relay.attach(listener);
        assert_eq!(*events.lock().unwrap(), vec![discovered("lost?")]);
    }
}

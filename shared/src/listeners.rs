//! Subscriber lists for change notifications.
//!
//! One `Listeners<A>` exists per notification type. Emitting calls every
//! subscriber synchronously, in subscription order, on the caller's thread.

use std::fmt;

pub type ListenerId = u64;

type Callback<A> = Box<dyn FnMut(&A) + Send>;

pub struct Listeners<A> {
    subscribers: Vec<(ListenerId, Callback<A>)>,
    next_id: ListenerId,
}

impl<A> Listeners<A> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&A) + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Returns false if the listener was not subscribed.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(listener_id, _)| *listener_id != id);
        self.subscribers.len() != before
    }

    pub fn emit(&mut self, args: &A) {
        for (_, callback) in self.subscribers.iter_mut() {
            callback(args);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<A> Default for Listeners<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Listeners<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_emit_reaches_every_subscriber_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners: Listeners<u32> = Listeners::new();

        let first = Arc::clone(&seen);
        listeners.subscribe(move |value| first.lock().unwrap().push(("first", *value)));
        let second = Arc::clone(&seen);
        listeners.subscribe(move |value| second.lock().unwrap().push(("second", *value)));

        listeners.emit(&7);

        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_unsubscribe() {
        let count = Arc::new(Mutex::new(0));
        let mut listeners: Listeners<()> = Listeners::default();

        let counter = Arc::clone(&count);
        let id = listeners.subscribe(move |_| *counter.lock().unwrap() += 1);
        assert_eq!(listeners.len(), 1);

        assert!(listeners.unsubscribe(id));
        assert!(!listeners.unsubscribe(id));
        assert!(listeners.is_empty());

        listeners.emit(&());
        assert_eq!(*count.lock().unwrap(), 0);
    }
}

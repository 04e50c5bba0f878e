//! Authority-owned values mirrored to a set of observers.

use crate::ObserverId;
use std::collections::BTreeMap;

/// A value written only by the authority and delivered to every registered
/// observer.
///
/// The field remembers the last value handed out for each observer, so a
/// write that does not change the value produces no delivery, and a value is
/// handed out to a given observer once per real change. New observers are
/// owed the current value.
#[derive(Debug, Clone)]
pub struct ReplicatedField<T> {
    value: T,
    delivered: BTreeMap<ObserverId, Option<T>>,
}

impl<T: Clone + PartialEq> ReplicatedField<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            delivered: BTreeMap::new(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Writes a new authoritative value. Returns false for a no-op write.
    pub fn set(&mut self, value: T) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        true
    }

    pub fn add_observer(&mut self, observer: ObserverId) {
        self.delivered.entry(observer).or_insert(None);
    }

    pub fn remove_observer(&mut self, observer: ObserverId) -> bool {
        self.delivered.remove(&observer).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_pending(&self, observer: ObserverId) -> bool {
        match self.delivered.get(&observer) {
            Some(Some(last)) => *last != self.value,
            Some(None) => true,
            None => false,
        }
    }

    /// Returns the observers that have not yet been handed the current value,
    /// in ascending id order, and records the value as delivered to them.
    pub fn take_pending(&mut self) -> Vec<ObserverId> {
        let mut pending = Vec::new();
        for (observer, last) in self.delivered.iter_mut() {
            if last.as_ref() != Some(&self.value) {
                *last = Some(self.value.clone());
                pending.push(*observer);
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_observer_is_owed_current_value() {
        let mut field = ReplicatedField::new(5u32);
        field.add_observer(1);

        assert!(field.is_pending(1));
        assert_eq!(field.take_pending(), vec![1]);
        assert!(!field.is_pending(1));
        assert!(field.take_pending().is_empty());
    }

    #[test]
    fn test_noop_write_delivers_nothing() {
        let mut field = ReplicatedField::new(5u32);
        field.add_observer(1);
        field.take_pending();

        assert!(!field.set(5));
        assert!(field.take_pending().is_empty());
    }

    #[test]
    fn test_change_delivered_once_per_observer() {
        let mut field = ReplicatedField::new(false);
        field.add_observer(2);
        field.add_observer(1);
        field.take_pending();

        assert!(field.set(true));
        assert_eq!(field.take_pending(), vec![1, 2]);
        assert!(field.take_pending().is_empty());
    }

    #[test]
    fn test_change_and_revert_before_delivery_is_not_sent() {
        let mut field = ReplicatedField::new(10u32);
        field.add_observer(1);
        field.take_pending();

        field.set(9);
        field.set(10);

        assert!(!field.is_pending(1));
        assert!(field.take_pending().is_empty());
    }

    #[test]
    fn test_removed_observer() {
        let mut field = ReplicatedField::new(0u32);
        field.add_observer(1);
        field.add_observer(2);
        assert!(field.remove_observer(1));
        assert!(!field.remove_observer(1));
        assert_eq!(field.observer_count(), 1);

        field.set(3);
        assert_eq!(field.take_pending(), vec![2]);
        assert!(!field.is_pending(1));
    }
}

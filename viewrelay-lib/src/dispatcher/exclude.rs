use std::collections::{HashSet, VecDeque};

use crate::proxy::ProxyKey;

/// Proxies a job has seen fail, capped in size.
///
/// When full, the oldest exclusion is forgotten so a long job can come back
/// to a proxy that recovered in the meantime.
#[derive(Debug, Clone)]
pub(crate) struct ExcludeSet {
    order: VecDeque<ProxyKey>,
    members: HashSet<ProxyKey>,
    capacity: usize,
}

impl ExcludeSet {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Exclude `key`, dropping the oldest exclusion if at capacity
    pub(crate) fn push(&mut self, key: ProxyKey) {
        if self.capacity == 0 || self.members.contains(&key) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
    }

    pub(crate) const fn as_set(&self) -> &HashSet<ProxyKey> {
        &self.members
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(n: u16) -> ProxyKey {
        ProxyKey::new("10.0.0.1", n)
    }

    #[test]
    fn test_oldest_exclusion_is_forgotten() {
        let mut excluded = ExcludeSet::new(2);
        excluded.push(key(1));
        excluded.push(key(2));
        excluded.push(key(3));

        assert_eq!(excluded.len(), 2);
        assert!(!excluded.as_set().contains(&key(1)));
        assert!(excluded.as_set().contains(&key(2)));
        assert!(excluded.as_set().contains(&key(3)));
    }

    #[test]
    fn test_duplicates_do_not_take_a_slot() {
        let mut excluded = ExcludeSet::new(2);
        excluded.push(key(1));
        excluded.push(key(1));
        excluded.push(key(2));

        assert_eq!(excluded.len(), 2);
        assert!(excluded.as_set().contains(&key(1)));
    }

    #[test]
    fn test_zero_capacity_excludes_nothing() {
        let mut excluded = ExcludeSet::new(0);
        excluded.push(key(1));
        assert!(excluded.is_empty());
    }
}

use std::collections::{btree_map, BTreeMap};

/// Map handing out increasing ids; iteration follows creation order.
#[derive(Debug)]
pub(crate) struct IdMap<K, T> {
    inner: BTreeMap<K, T>,
    cursor: usize,
}

impl<K: Ord + Copy + From<usize>, T> IdMap<K, T> {
    pub fn new() -> Self {
        IdMap {
            inner: BTreeMap::new(),
            cursor: 0,
        }
    }

    pub fn insert(&mut self, item: T) -> K {
        let id = K::from(self.cursor);
        self.inner.insert(id, item);
        self.cursor += 1;
        id
    }

    pub fn remove(&mut self, id: K) -> Option<T> {
        self.inner.remove(&id)
    }

    pub fn get(&self, id: K) -> Option<&T> {
        self.inner.get(&id)
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        self.inner.get_mut(&id)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, T> {
        self.inner.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, K, T> {
        self.inner.iter_mut()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Id(usize);

    impl From<usize> for Id {
        fn from(v: usize) -> Self {
            Id(v)
        }
    }

    #[test]
    fn ids_are_never_reused() {
        let mut map: IdMap<Id, &str> = IdMap::new();
        let a = map.insert("a");
        let b = map.insert("b");
        assert_eq!(map.remove(a), Some("a"));
        let c = map.insert("c");
        assert_ne!(a, c);
        let ids: Vec<Id> = map.iter().map(|(&id, _)| id).collect();
        assert_eq!(ids, vec![b, c]);
        assert!(map.get(a).is_none());
    }
}

//! Ordered map: a height-balanced binary search tree whose elements are
//! also threaded on a doubly linked list in key order.
//!
//! Elements live in an index arena. Keys are compared with a caller-supplied
//! function so the map can order by tree content without owning the heap.
//! The list threading gives O(1) first/last and ordered iteration without
//! walking the tree.

use std::cmp::Ordering;

#[derive(Debug, Clone)]
struct MapEl<K, V> {
    key: K,
    value: V,
    left: Option<usize>,
    right: Option<usize>,
    height: i32,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Height-balanced ordered map.
#[derive(Debug, Clone)]
pub struct Map<K, V> {
    els: Vec<Option<MapEl<K, V>>>,
    free: Vec<usize>,
    root: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K, V> Default for Map<K, V> {
    fn default() -> Self {
        Self {
            els: Vec::new(),
            free: Vec::new(),
            root: None,
            head: None,
            tail: None,
            len: 0,
        }
    }
}

#[derive(Default)]
struct Neighbours {
    pred: Option<usize>,
    succ: Option<usize>,
}

impl<K, V> Map<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn el(&self, i: usize) -> &MapEl<K, V> {
        match &self.els[i] {
            Some(el) => el,
            None => unreachable!("map element {i} is vacant"),
        }
    }

    fn el_mut(&mut self, i: usize) -> &mut MapEl<K, V> {
        match &mut self.els[i] {
            Some(el) => el,
            None => unreachable!("map element {i} is vacant"),
        }
    }

    fn height(&self, i: Option<usize>) -> i32 {
        i.map(|i| self.el(i).height).unwrap_or(0)
    }

    fn update(&mut self, i: usize) {
        let h = 1 + self.height(self.el(i).left).max(self.height(self.el(i).right));
        self.el_mut(i).height = h;
    }

    fn rotate_right(&mut self, i: usize) -> usize {
        let Some(l) = self.el(i).left else { return i };
        self.el_mut(i).left = self.el(l).right;
        self.el_mut(l).right = Some(i);
        self.update(i);
        self.update(l);
        l
    }

    fn rotate_left(&mut self, i: usize) -> usize {
        let Some(r) = self.el(i).right else { return i };
        self.el_mut(i).right = self.el(r).left;
        self.el_mut(r).left = Some(i);
        self.update(i);
        self.update(r);
        r
    }

    fn rebalance(&mut self, i: usize) -> usize {
        self.update(i);
        let (left, right) = (self.el(i).left, self.el(i).right);
        let balance = self.height(left) - self.height(right);
        if balance > 1 {
            if let Some(l) = left {
                if self.height(self.el(l).left) < self.height(self.el(l).right) {
                    let l = self.rotate_left(l);
                    self.el_mut(i).left = Some(l);
                }
            }
            return self.rotate_right(i);
        }
        if balance < -1 {
            if let Some(r) = right {
                if self.height(self.el(r).right) < self.height(self.el(r).left) {
                    let r = self.rotate_right(r);
                    self.el_mut(i).right = Some(r);
                }
            }
            return self.rotate_left(i);
        }
        i
    }

    fn new_el(&mut self, key: K, value: V) -> usize {
        let el = MapEl {
            key,
            value,
            left: None,
            right: None,
            height: 1,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(i) => {
                self.els[i] = Some(el);
                i
            }
            None => {
                self.els.push(Some(el));
                self.els.len() - 1
            }
        }
    }

    fn insert_rec(
        &mut self,
        at: Option<usize>,
        new: usize,
        cmp: &impl Fn(&K, &K) -> Ordering,
        around: &mut Neighbours,
    ) -> Result<usize, usize> {
        let Some(n) = at else { return Ok(new) };
        match cmp(&self.el(new).key, &self.el(n).key) {
            Ordering::Equal => Err(n),
            Ordering::Less => {
                around.succ = Some(n);
                let l = self.insert_rec(self.el(n).left, new, cmp, around)?;
                self.el_mut(n).left = Some(l);
                Ok(self.rebalance(n))
            }
            Ordering::Greater => {
                around.pred = Some(n);
                let r = self.insert_rec(self.el(n).right, new, cmp, around)?;
                self.el_mut(n).right = Some(r);
                Ok(self.rebalance(n))
            }
        }
    }

    fn find_el(&self, key: &K, cmp: impl Fn(&K, &K) -> Ordering) -> Option<usize> {
        let mut at = self.root;
        while let Some(n) = at {
            at = match cmp(key, &self.el(n).key) {
                Ordering::Equal => return Some(n),
                Ordering::Less => self.el(n).left,
                Ordering::Greater => self.el(n).right,
            };
        }
        None
    }

    fn remove_min(&mut self, n: usize) -> (Option<usize>, usize) {
        match self.el(n).left {
            None => (self.el(n).right, n),
            Some(l) => {
                let (rest, min) = self.remove_min(l);
                self.el_mut(n).left = rest;
                (Some(self.rebalance(n)), min)
            }
        }
    }

    fn remove_rec(
        &mut self,
        at: Option<usize>,
        key: &K,
        cmp: &impl Fn(&K, &K) -> Ordering,
    ) -> (Option<usize>, Option<usize>) {
        let Some(n) = at else { return (None, None) };
        match cmp(key, &self.el(n).key) {
            Ordering::Less => {
                let (l, removed) = self.remove_rec(self.el(n).left, key, cmp);
                self.el_mut(n).left = l;
                (Some(self.rebalance(n)), removed)
            }
            Ordering::Greater => {
                let (r, removed) = self.remove_rec(self.el(n).right, key, cmp);
                self.el_mut(n).right = r;
                (Some(self.rebalance(n)), removed)
            }
            Ordering::Equal => {
                let replacement = match (self.el(n).left, self.el(n).right) {
                    (None, None) => None,
                    (Some(l), None) => Some(l),
                    (None, Some(r)) => Some(r),
                    (Some(l), Some(r)) => {
                        let (rest, min) = self.remove_min(r);
                        self.el_mut(min).left = Some(l);
                        self.el_mut(min).right = rest;
                        Some(self.rebalance(min))
                    }
                };
                (replacement, Some(n))
            }
        }
    }

    fn unlink(&mut self, n: usize) -> (K, V) {
        let (prev, next) = (self.el(n).prev, self.el(n).next);
        match prev {
            Some(p) => self.el_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(s) => self.el_mut(s).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        self.free.push(n);
        match self.els[n].take() {
            Some(el) => (el.key, el.value),
            None => unreachable!("map element {n} is vacant"),
        }
    }

    /// Insert a new binding. An existing key rejects the insert and hands
    /// the pair back.
    pub fn insert(
        &mut self,
        key: K,
        value: V,
        cmp: impl Fn(&K, &K) -> Ordering,
    ) -> Result<(), (K, V)> {
        let new = self.new_el(key, value);
        let mut around = Neighbours::default();
        match self.insert_rec(self.root, new, &cmp, &mut around) {
            Ok(root) => {
                self.root = Some(root);
                let el = self.el_mut(new);
                el.prev = around.pred;
                el.next = around.succ;
                match around.pred {
                    Some(p) => self.el_mut(p).next = Some(new),
                    None => self.head = Some(new),
                }
                match around.succ {
                    Some(s) => self.el_mut(s).prev = Some(new),
                    None => self.tail = Some(new),
                }
                self.len += 1;
                Ok(())
            }
            Err(_) => {
                self.free.push(new);
                match self.els[new].take() {
                    Some(el) => Err((el.key, el.value)),
                    None => unreachable!("map element {new} is vacant"),
                }
            }
        }
    }

    /// Bind `key` to `value`. If the key was present its value is replaced
    /// and the passed key plus the previous value are returned.
    pub fn store(
        &mut self,
        key: K,
        value: V,
        cmp: impl Fn(&K, &K) -> Ordering,
    ) -> Option<(K, V)> {
        match self.find_el(&key, &cmp) {
            Some(n) => {
                let old = std::mem::replace(&mut self.el_mut(n).value, value);
                Some((key, old))
            }
            None => {
                // The key is known to be absent, so insert cannot reject.
                let _ = self.insert(key, value, cmp);
                None
            }
        }
    }

    /// Remove the binding for `key`, returning the stored key and value.
    pub fn remove(&mut self, key: &K, cmp: impl Fn(&K, &K) -> Ordering) -> Option<(K, V)> {
        let (root, removed) = self.remove_rec(self.root, key, &cmp);
        self.root = root;
        removed.map(|n| self.unlink(n))
    }

    /// Undo a successful [`Map::insert`].
    pub fn uninsert(&mut self, key: &K, cmp: impl Fn(&K, &K) -> Ordering) -> Option<(K, V)> {
        self.remove(key, cmp)
    }

    /// Undo a [`Map::store`]. With a previous value the binding is restored
    /// and the displaced value returned; without one the binding is removed
    /// and both halves returned.
    pub fn unstore(
        &mut self,
        key: &K,
        previous: Option<V>,
        cmp: impl Fn(&K, &K) -> Ordering,
    ) -> (Option<K>, Option<V>) {
        match previous {
            Some(prev) => match self.find_el(key, &cmp) {
                Some(n) => (None, Some(std::mem::replace(&mut self.el_mut(n).value, prev))),
                None => (None, Some(prev)),
            },
            None => match self.remove(key, cmp) {
                Some((k, v)) => (Some(k), Some(v)),
                None => (None, None),
            },
        }
    }

    /// Undo a [`Map::remove`] by reinserting the removed pair.
    pub fn unremove(&mut self, key: K, value: V, cmp: impl Fn(&K, &K) -> Ordering) -> Result<(), (K, V)> {
        self.insert(key, value, cmp)
    }

    pub fn find(&self, key: &K, cmp: impl Fn(&K, &K) -> Ordering) -> Option<&V> {
        self.find_el(key, cmp).map(|n| &self.el(n).value)
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        self.head.map(|n| (&self.el(n).key, &self.el(n).value))
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        self.tail.map(|n| (&self.el(n).key, &self.el(n).value))
    }

    /// Iterate in key order along the threaded list.
    pub fn iter(&self) -> MapIter<'_, K, V> {
        MapIter {
            map: self,
            at: self.head,
        }
    }

    #[cfg(test)]
    fn check_balanced(&self, at: Option<usize>) -> i32 {
        let Some(n) = at else { return 0 };
        let l = self.check_balanced(self.el(n).left);
        let r = self.check_balanced(self.el(n).right);
        assert!((l - r).abs() <= 1, "unbalanced at {n}");
        assert_eq!(self.el(n).height, 1 + l.max(r));
        1 + l.max(r)
    }
}

pub struct MapIter<'a, K, V> {
    map: &'a Map<K, V>,
    at: Option<usize>,
}

impl<'a, K, V> Iterator for MapIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.at?;
        let el = self.map.el(n);
        self.at = el.next;
        Some((&el.key, &el.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn ord(a: &i32, b: &i32) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut map = Map::new();
        assert!(map.insert(1, "a", ord).is_ok());
        assert_eq!(map.insert(1, "b", ord), Err((1, "b")));
        assert_eq!(map.find(&1, ord), Some(&"a"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn store_returns_previous() {
        let mut map = Map::new();
        assert_eq!(map.store(3, 30, ord), None);
        assert_eq!(map.store(3, 31, ord), Some((3, 30)));
        assert_eq!(map.find(&3, ord), Some(&31));
    }

    #[test]
    fn unstore_reverses_store() {
        let mut map = Map::new();
        map.insert(1, 10, ord).unwrap();
        let (_, prev) = map.store(1, 11, ord).unwrap();
        assert_eq!(map.unstore(&1, Some(prev), ord), (None, Some(11)));
        assert_eq!(map.find(&1, ord), Some(&10));

        assert_eq!(map.store(2, 20, ord), None);
        assert_eq!(map.unstore(&2, None, ord), (Some(2), Some(20)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_then_unremove() {
        let mut map = Map::new();
        for k in [5, 1, 9] {
            map.insert(k, k * 10, ord).unwrap();
        }
        let (k, v) = map.remove(&5, ord).unwrap();
        assert_eq!(map.remove(&5, ord), None);
        map.unremove(k, v, ord).unwrap();
        let keys: Vec<_> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 5, 9]);
    }

    #[test]
    fn ordered_list_tracks_ends() {
        let mut map = Map::new();
        for k in [4, 2, 8, 6] {
            map.insert(k, (), ord).unwrap();
        }
        assert_eq!(map.first().map(|(k, _)| *k), Some(2));
        assert_eq!(map.last().map(|(k, _)| *k), Some(8));
        map.uninsert(&8, ord);
        assert_eq!(map.last().map(|(k, _)| *k), Some(6));
    }

    proptest! {
        /// The map agrees with BTreeMap under any mix of operations and stays balanced.
        #[test]
        fn matches_btreemap(ops in prop::collection::vec((0u8..3, 0i32..40, any::<i32>()), 0..200)) {
            let mut map = Map::new();
            let mut model = BTreeMap::new();
            for (op, key, value) in ops {
                match op {
                    0 => {
                        let inserted = map.insert(key, value, ord).is_ok();
                        prop_assert_eq!(inserted, !model.contains_key(&key));
                        model.entry(key).or_insert(value);
                    }
                    1 => {
                        let prev = map.store(key, value, ord).map(|(_, v)| v);
                        prop_assert_eq!(prev, model.insert(key, value));
                    }
                    _ => {
                        let removed = map.remove(&key, ord);
                        prop_assert_eq!(removed, model.remove_entry(&key));
                    }
                }
                prop_assert_eq!(map.len(), model.len());
            }
            map.check_balanced(map.root);
            let ours: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
            let theirs: Vec<_> = model.into_iter().collect();
            prop_assert_eq!(ours, theirs);
        }
    }
}

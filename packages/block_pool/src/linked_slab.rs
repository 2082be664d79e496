/// Identifies a node stored in a [`LinkedSlab`].
///
/// Keys are stable for the lifetime of the node: a node never moves within the slab,
/// so a key remains valid until the node is removed. After removal the slot may be
/// reused and the same key may refer to a different node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct NodeKey(usize);

impl NodeKey {
    /// Packs the key into a plain integer so it can be stored in out-of-band
    /// locations such as an allocation header.
    #[must_use]
    pub(crate) fn as_usize(self) -> usize {
        self.0
    }

    /// Reconstructs a key previously packed with [`NodeKey::as_usize()`].
    #[must_use]
    pub(crate) fn from_usize(value: usize) -> Self {
        Self(value)
    }
}

/// Linkage of an occupied slot into at most one [`ListHead`].
#[derive(Clone, Copy, Debug)]
struct Links {
    prev: Option<NodeKey>,
    next: Option<NodeKey>,
}

impl Links {
    fn detached() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, links: Links },

    /// Part of the free-slot stack; holds the index of the next vacant slot, if any.
    Vacant { next_free: Option<usize> },
}

/// A slab of nodes that can be threaded into doubly-linked lists.
///
/// Nodes are stored in a growable vector of slots with a free-slot stack, so node
/// storage is reused without per-node heap allocation. Every occupied slot carries
/// `prev`/`next` linkage, and one or more [`ListHead`] values thread subsets of the
/// nodes into ordered lists. All list operations are O(1): push at either end, pop
/// at either end, and removal of an arbitrary node by key.
///
/// A node belongs to at most one list at a time. The slab does not track which list
/// a node is in; that is the caller's bookkeeping, as it would be with an intrusive
/// list.
#[derive(Debug)]
pub(crate) struct LinkedSlab<T> {
    slots: Vec<Slot<T>>,

    /// Head of the free-slot stack. `None` means every slot is occupied and the
    /// next insertion grows the vector.
    first_free: Option<usize>,

    /// Number of occupied slots. Tracked explicitly to avoid scanning.
    len: usize,
}

impl<T> LinkedSlab<T> {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            first_free: None,
            len: 0,
        }
    }

    /// The number of occupied nodes across all lists, including detached nodes.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Inserts a value as a detached node (not a member of any list) and returns its key.
    #[must_use]
    pub(crate) fn insert(&mut self, value: T) -> NodeKey {
        let slot = Slot::Occupied {
            value,
            links: Links::detached(),
        };

        let index = if let Some(index) = self.first_free {
            let vacant = self
                .slots
                .get_mut(index)
                .expect("free-slot stack only ever holds indexes of existing slots");

            self.first_free = match *vacant {
                Slot::Vacant { next_free } => next_free,
                Slot::Occupied { .. } => {
                    panic!("free-slot stack pointed at an occupied slot {index}")
                }
            };

            *vacant = slot;
            index
        } else {
            self.slots.push(slot);

            // Cannot wrap because we just pushed, so the length is at least 1.
            self.slots.len().wrapping_sub(1)
        };

        // Cannot overflow before running out of memory for the slots themselves.
        self.len = self.len.wrapping_add(1);

        NodeKey(index)
    }

    /// Removes a node and returns its value, making the slot available for reuse.
    ///
    /// The node must be detached (not a member of any list); unlink it via its
    /// [`ListHead`] first.
    ///
    /// # Panics
    ///
    /// Panics if the key does not refer to an occupied slot or if the node is still
    /// linked into a list.
    pub(crate) fn remove(&mut self, key: NodeKey) -> T {
        let slot = self
            .slots
            .get_mut(key.0)
            .expect("node key does not refer to an existing slot");

        let replacement = Slot::Vacant {
            next_free: self.first_free,
        };

        match std::mem::replace(slot, replacement) {
            Slot::Occupied { value, links } => {
                assert!(
                    links.prev.is_none() && links.next.is_none(),
                    "removed node {} while it was still linked into a list",
                    key.0
                );

                self.first_free = Some(key.0);

                // Cannot wrap because we just removed a node, so len is at least 1.
                self.len = self.len.wrapping_sub(1);

                value
            }
            Slot::Vacant { .. } => panic!("node key {} refers to a vacant slot", key.0),
        }
    }

    /// Returns a shared reference to the value of an occupied node.
    ///
    /// # Panics
    ///
    /// Panics if the key does not refer to an occupied slot.
    #[must_use]
    pub(crate) fn get(&self, key: NodeKey) -> &T {
        match self.slots.get(key.0) {
            Some(Slot::Occupied { value, .. }) => value,
            _ => panic!("node key {} does not refer to an occupied slot", key.0),
        }
    }

    /// Returns an exclusive reference to the value of an occupied node.
    ///
    /// # Panics
    ///
    /// Panics if the key does not refer to an occupied slot.
    #[must_use]
    pub(crate) fn get_mut(&mut self, key: NodeKey) -> &mut T {
        match self.slots.get_mut(key.0) {
            Some(Slot::Occupied { value, .. }) => value,
            _ => panic!("node key {} does not refer to an occupied slot", key.0),
        }
    }

    fn links(&self, key: NodeKey) -> Links {
        match self.slots.get(key.0) {
            Some(Slot::Occupied { links, .. }) => *links,
            _ => panic!("node key {} does not refer to an occupied slot", key.0),
        }
    }

    fn links_mut(&mut self, key: NodeKey) -> &mut Links {
        match self.slots.get_mut(key.0) {
            Some(Slot::Occupied { links, .. }) => links,
            _ => panic!("node key {} does not refer to an occupied slot", key.0),
        }
    }
}

/// Header of one doubly-linked list threaded through a [`LinkedSlab`].
///
/// Invariants: `len` equals the number of nodes reachable from `head`; `head` and
/// `tail` are `None` exactly when `len == 0`.
///
/// All operations take the slab holding the nodes as a parameter. Using a `ListHead`
/// with a slab other than the one its nodes live in will panic or corrupt list
/// ordering, so each header must stay paired with one slab.
#[derive(Debug)]
pub(crate) struct ListHead {
    head: Option<NodeKey>,
    tail: Option<NodeKey>,
    len: usize,
}

impl ListHead {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// The number of nodes in this list.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first node of the list, without removing it.
    #[must_use]
    pub(crate) fn front(&self) -> Option<NodeKey> {
        self.head
    }

    /// Appends a detached node to the back of the list.
    pub(crate) fn push_back<T>(&mut self, slab: &mut LinkedSlab<T>, key: NodeKey) {
        let links = slab.links_mut(key);
        debug_assert!(
            links.prev.is_none() && links.next.is_none(),
            "pushed a node that is already linked into a list"
        );
        links.prev = self.tail;
        links.next = None;

        if let Some(tail) = self.tail {
            slab.links_mut(tail).next = Some(key);
        } else {
            self.head = Some(key);
        }

        self.tail = Some(key);

        // Cannot overflow before the slab runs out of memory for the nodes.
        self.len = self.len.wrapping_add(1);
    }

    /// Detaches and returns the first node of the list.
    pub(crate) fn pop_front<T>(&mut self, slab: &mut LinkedSlab<T>) -> Option<NodeKey> {
        let key = self.head?;
        self.unlink(slab, key);
        Some(key)
    }

    /// Detaches and returns the last node of the list.
    pub(crate) fn pop_back<T>(&mut self, slab: &mut LinkedSlab<T>) -> Option<NodeKey> {
        let key = self.tail?;
        self.unlink(slab, key);
        Some(key)
    }

    /// Detaches an arbitrary node from the list. The node remains in the slab.
    ///
    /// # Panics
    ///
    /// Panics (in debug builds, where linkage can be cheaply cross-checked) if the
    /// node is not a member of this list.
    pub(crate) fn unlink<T>(&mut self, slab: &mut LinkedSlab<T>, key: NodeKey) {
        #[cfg(debug_assertions)]
        assert!(self.contains(slab, key), "unlinked a node from another list");

        let links = slab.links(key);

        match links.prev {
            Some(prev) => slab.links_mut(prev).next = links.next,
            None => self.head = links.next,
        }

        match links.next {
            Some(next) => slab.links_mut(next).prev = links.prev,
            None => self.tail = links.prev,
        }

        *slab.links_mut(key) = Links::detached();

        // Cannot wrap: the membership invariant guarantees the list is non-empty here.
        self.len = self.len.wrapping_sub(1);
    }

    #[cfg(debug_assertions)]
    fn contains<T>(&self, slab: &LinkedSlab<T>, key: NodeKey) -> bool {
        let mut cursor = self.head;

        while let Some(current) = cursor {
            if current == key {
                return true;
            }

            cursor = slab.links(current).next;
        }

        false
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn drain_front(list: &mut ListHead, slab: &mut LinkedSlab<u32>) -> Vec<u32> {
        let mut values = Vec::new();

        while let Some(key) = list.pop_front(slab) {
            values.push(slab.remove(key));
        }

        values
    }

    #[test]
    fn insert_and_remove_round_trip() {
        let mut slab = LinkedSlab::new();

        let key = slab.insert(42_u32);
        assert_eq!(slab.len(), 1);
        assert_eq!(*slab.get(key), 42);

        *slab.get_mut(key) = 43;
        assert_eq!(slab.remove(key), 43);
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn vacated_slots_are_reused() {
        let mut slab = LinkedSlab::new();

        let first = slab.insert(1_u32);
        let second = slab.insert(2_u32);

        assert_eq!(slab.remove(first), 1);

        // The freed slot is reused before the vector grows.
        let third = slab.insert(3_u32);
        assert_eq!(third.as_usize(), first.as_usize());

        assert_eq!(slab.remove(second), 2);
        assert_eq!(slab.remove(third), 3);
    }

    #[test]
    fn key_round_trips_through_usize() {
        let mut slab = LinkedSlab::new();

        let key = slab.insert(7_u32);
        let reconstructed = NodeKey::from_usize(key.as_usize());

        assert_eq!(*slab.get(reconstructed), 7);
    }

    #[test]
    fn push_back_preserves_fifo_order() {
        let mut slab = LinkedSlab::new();
        let mut list = ListHead::new();

        for value in [1_u32, 2, 3] {
            let key = slab.insert(value);
            list.push_back(&mut slab, key);
        }

        assert_eq!(list.len(), 3);
        assert!(!list.is_empty());
        assert_eq!(drain_front(&mut list, &mut slab), vec![1, 2, 3]);
        assert!(list.is_empty());
    }

    #[test]
    fn pop_back_takes_newest() {
        let mut slab = LinkedSlab::new();
        let mut list = ListHead::new();

        for value in [1_u32, 2, 3] {
            let key = slab.insert(value);
            list.push_back(&mut slab, key);
        }

        let key = list.pop_back(&mut slab).unwrap();
        assert_eq!(slab.remove(key), 3);
        assert_eq!(drain_front(&mut list, &mut slab), vec![1, 2]);
    }

    #[test]
    fn unlink_middle_node_bridges_neighbors() {
        let mut slab = LinkedSlab::new();
        let mut list = ListHead::new();

        let keys: Vec<_> = [1_u32, 2, 3]
            .into_iter()
            .map(|value| {
                let key = slab.insert(value);
                list.push_back(&mut slab, key);
                key
            })
            .collect();

        list.unlink(&mut slab, keys[1]);
        assert_eq!(slab.remove(keys[1]), 2);

        assert_eq!(list.len(), 2);
        assert_eq!(drain_front(&mut list, &mut slab), vec![1, 3]);
    }

    #[test]
    fn unlink_only_node_empties_list() {
        let mut slab = LinkedSlab::new();
        let mut list = ListHead::new();

        let key = slab.insert(9_u32);
        list.push_back(&mut slab, key);

        list.unlink(&mut slab, key);

        assert!(list.is_empty());
        assert!(list.front().is_none());
        assert_eq!(slab.remove(key), 9);
    }

    #[test]
    fn node_can_move_between_lists() {
        let mut slab = LinkedSlab::new();
        let mut first = ListHead::new();
        let mut second = ListHead::new();

        let key = slab.insert(5_u32);
        first.push_back(&mut slab, key);

        first.unlink(&mut slab, key);
        second.push_back(&mut slab, key);

        assert!(first.is_empty());
        assert_eq!(second.len(), 1);
        assert_eq!(second.front(), Some(key));
    }

    #[test]
    fn front_observes_without_detaching() {
        let mut slab = LinkedSlab::new();
        let mut list = ListHead::new();

        let key = slab.insert(8_u32);
        list.push_back(&mut slab, key);

        assert_eq!(list.front(), Some(key));
        assert_eq!(list.len(), 1);
    }

    #[test]
    #[should_panic]
    fn remove_linked_node_panics() {
        let mut slab = LinkedSlab::new();
        let mut list = ListHead::new();

        let key = slab.insert(1_u32);
        list.push_back(&mut slab, key);

        // Still linked, so this must be rejected.
        drop(slab.remove(key));
    }

    #[test]
    #[should_panic]
    fn get_vacant_slot_panics() {
        let mut slab = LinkedSlab::new();

        let key = slab.insert(1_u32);
        drop(slab.remove(key));

        let _value = slab.get(key);
    }
}

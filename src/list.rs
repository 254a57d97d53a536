use crate::{
    backing::{Backing, Link},
    errors::{RegionError, Result},
    rbtree::FreeNode,
};

/// Doubly linked list of free blocks sorted by address. It threads the same
/// [`FreeNode`] structs that make up the red-black tree, through their `prev`
/// and `next` links, so a free block's physical neighbours that are also
/// free can be found in O(1) once the block itself is in the list:
///
/// ```text
///          head
///           |
///           v
///   +------+------+-------+------+------+---------+------+-------+
///   | Used | Free | Used  | Used | Free |  Used   | Free | Used  |
///   +------+------+-------+------+------+---------+------+-------+
///             |  ^                |  ^               ^
///             |  +----------------+  |               |
///             +--------------------->+               |
///                                    +-------------->+
/// ```
///
/// Inserting at an arbitrary address has to walk the list from the head,
/// inserting next to a known node doesn't.
#[derive(Debug)]
pub(crate) struct AddressList {
    head: Link,
}

impl AddressList {
    pub const fn new() -> Self {
        Self { head: Link::NIL }
    }

    pub fn clear(&mut self) {
        self.head = Link::NIL;
    }

    /// Last node below `offset` and first node at or above it.
    pub fn neighbours(&self, backing: &Backing, offset: usize) -> (Link, Link) {
        let mut previous = Link::NIL;
        let mut current = self.head;

        while let Some(at) = current.get() {
            if at >= offset {
                break;
            }
            previous = current;
            current = FreeNode::load(backing, at).next;
        }

        (previous, current)
    }

    /// Inserts the node at `at` in address order.
    pub fn insert(&mut self, backing: &mut Backing, at: usize) {
        let (previous, _) = self.neighbours(backing, at);
        self.insert_after(backing, previous, at);
    }

    /// Inserts the node at `at` right after `previous`, or at the head if
    /// `previous` is nil. The caller is responsible for keeping address order.
    pub fn insert_after(&mut self, backing: &mut Backing, previous: Link, at: usize) {
        let next = match previous.get() {
            None => self.head,
            Some(p) => FreeNode::load(backing, p).next,
        };

        FreeNode::update(backing, at, |node| {
            node.prev = previous;
            node.next = next;
        });

        match previous.get() {
            None => self.head = Link::to(at),
            Some(p) => FreeNode::update(backing, p, |node| node.next = Link::to(at)),
        }

        if let Some(n) = next.get() {
            FreeNode::update(backing, n, |node| node.prev = Link::to(at));
        }
    }

    /// Removes the node at `at` from the list.
    pub fn unlink(&mut self, backing: &mut Backing, at: usize) {
        let node = FreeNode::load(backing, at);

        match node.prev.get() {
            None => self.head = node.next,
            Some(p) => FreeNode::update(backing, p, |prev| prev.next = node.next),
        }

        if let Some(n) = node.next.get() {
            FreeNode::update(backing, n, |next| next.prev = node.prev);
        }
    }

    /// Node offsets in address order.
    pub fn iter<'a>(&self, backing: &'a Backing) -> impl Iterator<Item = usize> + 'a {
        let mut current = self.head;

        core::iter::from_fn(move || {
            let at = current.get()?;
            current = FreeNode::load(backing, at).next;
            Some(at)
        })
    }

    /// Checks that links agree in both directions, addresses strictly
    /// increase and nodes don't overlap. Returns the number of nodes.
    pub fn validate(&self, backing: &Backing) -> Result<usize> {
        let mut previous = Link::NIL;
        let mut previous_end = 0;
        let mut count = 0;

        for at in self.iter(backing) {
            let node = FreeNode::load(backing, at);

            if node.prev != previous {
                return Err(RegionError::Corrupted("list node doesn't point back to its predecessor"));
            }

            if !previous.is_nil() && at < previous_end {
                return Err(RegionError::Corrupted("list isn't sorted by address or nodes overlap"));
            }

            previous = Link::to(at);
            previous_end = at + node.size();
            count += 1;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::rbtree::NODE_SIZE;

    fn node_at(backing: &mut Backing, slot: usize) -> usize {
        let at = slot * NODE_SIZE;
        backing.write(at, FreeNode::new(NODE_SIZE));
        at
    }

    #[test]
    fn keeps_address_order() {
        let mut memory = std::vec![0u8; 8 * NODE_SIZE];
        let mut backing = Backing::from(&mut memory[..]);
        let mut list = AddressList::new();

        for slot in [5, 1, 7, 0, 3] {
            let at = node_at(&mut backing, slot);
            list.insert(&mut backing, at);
        }

        let slots: Vec<_> = list.iter(&backing).map(|at| at / NODE_SIZE).collect();
        assert_eq!(slots, [0, 1, 3, 5, 7]);
        assert_eq!(list.validate(&backing), Ok(5));

        assert_eq!(
            list.neighbours(&backing, 4 * NODE_SIZE),
            (Link::to(3 * NODE_SIZE), Link::to(5 * NODE_SIZE))
        );
    }

    #[test]
    fn insert_after_and_unlink() {
        let mut memory = std::vec![0u8; 8 * NODE_SIZE];
        let mut backing = Backing::from(&mut memory[..]);
        let mut list = AddressList::new();

        let first = node_at(&mut backing, 0);
        let last = node_at(&mut backing, 6);
        list.insert(&mut backing, first);
        list.insert(&mut backing, last);

        let middle = node_at(&mut backing, 2);
        list.insert_after(&mut backing, Link::to(first), middle);
        assert_eq!(list.iter(&backing).collect::<Vec<_>>(), [first, middle, last]);

        list.unlink(&mut backing, first);
        assert_eq!(list.iter(&backing).collect::<Vec<_>>(), [middle, last]);
        assert_eq!(list.validate(&backing), Ok(2));

        list.unlink(&mut backing, last);
        list.unlink(&mut backing, middle);
        assert_eq!(list.iter(&backing).count(), 0);
    }

    #[test]
    fn detects_broken_back_link() {
        let mut memory = std::vec![0u8; 4 * NODE_SIZE];
        let mut backing = Backing::from(&mut memory[..]);
        let mut list = AddressList::new();

        for slot in 0..3 {
            let at = node_at(&mut backing, slot);
            list.insert(&mut backing, at);
        }

        FreeNode::update(&mut backing, 2 * NODE_SIZE, |node| node.prev = Link::NIL);
        assert!(list.validate(&backing).is_err());
    }
}

//! Red-black tree of free blocks used by [`crate::BestFitAllocator`]. Nodes
//! live inside the free blocks themselves and point to each other with
//! [`Link`] offsets. [`Link::NIL`] plays the role of the black sentinel leaf,
//! so there's no shared sentinel node to keep up to date.
//!
//! Nodes are ordered by `(size, offset)`. Equal sizes are ordered by address,
//! so best fit searches pick the lowest address among equally good blocks.
//!
//! The same node also holds the `prev` and `next` links of
//! [`crate::list::AddressList`], which are never touched here.

use core::{fmt, mem};

use crate::{
    backing::{Backing, Link, Pod},
    errors::{RegionError, Result},
};

pub(crate) const LEFT: usize = 0;
pub(crate) const RIGHT: usize = 1;

const RED_BIT: usize = 1 << (usize::BITS - 1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
}

/// In-band node of a free block:
///
/// ```text
///   +----------------+----------+----------+--------+--------+--------+----------+
///   | color|size    | left     | right    | parent |  prev  |  next  |  unused  |
///   +----------------+----------+----------+--------+--------+--------+----------+
///   <------------------------ red-black tree ------><- address list ->
/// ```
#[derive(Clone, Copy, Debug)]
pub(crate) struct FreeNode {
    /// Block size, color in the most significant bit.
    meta: usize,
    pub children: [Link; 2],
    pub parent: Link,
    pub prev: Link,
    pub next: Link,
}

unsafe impl Pod for FreeNode {}

/// A free block must be able to hold its node.
pub(crate) const NODE_SIZE: usize = mem::size_of::<FreeNode>();

impl FreeNode {
    /// Red unlinked node for a free block of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            meta: size | RED_BIT,
            children: [Link::NIL; 2],
            parent: Link::NIL,
            prev: Link::NIL,
            next: Link::NIL,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.meta & !RED_BIT
    }

    #[inline]
    pub fn set_size(&mut self, size: usize) {
        self.meta = (self.meta & RED_BIT) | size;
    }

    #[inline]
    pub fn color(&self) -> Color {
        if self.meta & RED_BIT != 0 {
            Color::Red
        } else {
            Color::Black
        }
    }

    #[inline]
    pub fn set_color(&mut self, color: Color) {
        match color {
            Color::Red => self.meta |= RED_BIT,
            Color::Black => self.meta &= !RED_BIT,
        }
    }

    #[inline]
    pub fn load(backing: &Backing, at: usize) -> Self {
        backing.read(at)
    }

    /// Read, modify, write.
    #[inline]
    pub fn update(backing: &mut Backing, at: usize, f: impl FnOnce(&mut Self)) {
        let mut node = Self::load(backing, at);
        f(&mut node);
        backing.write(at, node);
    }
}

fn color(backing: &Backing, link: Link) -> Color {
    link.get()
        .map_or(Color::Black, |at| FreeNode::load(backing, at).color())
}

fn set_color(backing: &mut Backing, link: Link, color: Color) {
    if let Some(at) = link.get() {
        FreeNode::update(backing, at, |node| node.set_color(color));
    }
}

fn child(backing: &Backing, at: usize, dir: usize) -> Link {
    FreeNode::load(backing, at).children[dir]
}

fn set_child(backing: &mut Backing, at: usize, dir: usize, child: Link) {
    FreeNode::update(backing, at, |node| node.children[dir] = child);
}

fn parent(backing: &Backing, at: usize) -> Link {
    FreeNode::load(backing, at).parent
}

fn set_parent(backing: &mut Backing, link: Link, parent: Link) {
    if let Some(at) = link.get() {
        FreeNode::update(backing, at, |node| node.parent = parent);
    }
}

fn key(backing: &Backing, at: usize) -> (usize, usize) {
    (FreeNode::load(backing, at).size(), at)
}

#[derive(Debug)]
pub(crate) struct RbTree {
    root: Link,
    len: usize,
}

impl RbTree {
    pub const fn new() -> Self {
        Self {
            root: Link::NIL,
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.root = Link::NIL;
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Makes `new` take the place of `old` as a child of `parent`, or as the
    /// root if `parent` is nil.
    fn replace_child(&mut self, backing: &mut Backing, parent: Link, old: usize, new: Link) {
        match parent.get() {
            None => self.root = new,
            Some(p) => {
                let dir = if child(backing, p, LEFT) == Link::to(old) {
                    LEFT
                } else {
                    RIGHT
                };
                set_child(backing, p, dir, new);
            }
        }
    }

    /// Rotates the subtree rooted at `x`. `dir == LEFT` is a left rotation:
    ///
    /// ```text
    ///       x                 y
    ///      / \               / \
    ///     a   y     --->    x   c
    ///        / \           / \
    ///       b   c         a   b
    /// ```
    ///
    /// `dir == RIGHT` is the mirror image.
    fn rotate(&mut self, backing: &mut Backing, x: usize, dir: usize) {
        let y = child(backing, x, 1 - dir).offset();
        let inner = child(backing, y, dir);

        set_child(backing, x, 1 - dir, inner);
        set_parent(backing, inner, Link::to(x));

        let x_parent = parent(backing, x);
        set_parent(backing, Link::to(y), x_parent);
        self.replace_child(backing, x_parent, x, Link::to(y));

        set_child(backing, y, dir, Link::to(x));
        set_parent(backing, Link::to(x), Link::to(y));
    }

    /// Adds the node at `at` to the tree. Its size must be set already, the
    /// tree links are overwritten and list links are left alone.
    pub fn insert(&mut self, backing: &mut Backing, at: usize) {
        let new_key = key(backing, at);

        let mut parent = Link::NIL;
        let mut current = self.root;
        let mut dir = LEFT;

        while let Some(offset) = current.get() {
            parent = current;
            dir = if new_key < key(backing, offset) {
                LEFT
            } else {
                RIGHT
            };
            current = child(backing, offset, dir);
        }

        FreeNode::update(backing, at, |node| {
            node.children = [Link::NIL; 2];
            node.parent = parent;
            node.set_color(Color::Red);
        });

        match parent.get() {
            None => self.root = Link::to(at),
            Some(p) => set_child(backing, p, dir, Link::to(at)),
        }

        self.len += 1;
        self.fix_insert(backing, at);
    }

    fn fix_insert(&mut self, backing: &mut Backing, mut node: usize) {
        while color(backing, parent(backing, node)) == Color::Red {
            // A red node is never the root, so the grandparent exists.
            let mut parent_at = parent(backing, node).offset();
            let grandparent = parent(backing, parent_at).offset();

            let dir = if child(backing, grandparent, LEFT) == Link::to(parent_at) {
                LEFT
            } else {
                RIGHT
            };
            let uncle = child(backing, grandparent, 1 - dir);

            if color(backing, uncle) == Color::Red {
                set_color(backing, Link::to(parent_at), Color::Black);
                set_color(backing, uncle, Color::Black);
                set_color(backing, Link::to(grandparent), Color::Red);
                node = grandparent;
                continue;
            }

            // Inner grandchild, rotate it to the outside first.
            if child(backing, parent_at, 1 - dir) == Link::to(node) {
                node = parent_at;
                self.rotate(backing, node, dir);
                parent_at = parent(backing, node).offset();
            }

            set_color(backing, Link::to(parent_at), Color::Black);
            set_color(backing, Link::to(grandparent), Color::Red);
            self.rotate(backing, grandparent, 1 - dir);
        }

        set_color(backing, self.root, Color::Black);
    }

    /// Puts `v` where `u` was in relation to `u`'s parent.
    fn transplant(&mut self, backing: &mut Backing, u: usize, v: Link) {
        let u_parent = parent(backing, u);
        self.replace_child(backing, u_parent, u, v);
        set_parent(backing, v, u_parent);
    }

    fn minimum(backing: &Backing, mut at: usize) -> usize {
        while let Some(left) = child(backing, at, LEFT).get() {
            at = left;
        }
        at
    }

    /// Removes the node at `at` from the tree. Its list links are left alone.
    pub fn remove(&mut self, backing: &mut Backing, at: usize) {
        let node = FreeNode::load(backing, at);
        let mut removed_color = node.color();

        let x;
        let x_parent;

        if node.children[LEFT].is_nil() {
            x = node.children[RIGHT];
            x_parent = node.parent;
            self.transplant(backing, at, x);
        } else if node.children[RIGHT].is_nil() {
            x = node.children[LEFT];
            x_parent = node.parent;
            self.transplant(backing, at, x);
        } else {
            let successor = Self::minimum(backing, node.children[RIGHT].offset());
            let successor_node = FreeNode::load(backing, successor);
            removed_color = successor_node.color();
            x = successor_node.children[RIGHT];

            if successor_node.parent == Link::to(at) {
                x_parent = Link::to(successor);
            } else {
                x_parent = successor_node.parent;
                self.transplant(backing, successor, x);
                set_child(backing, successor, RIGHT, node.children[RIGHT]);
                set_parent(backing, node.children[RIGHT], Link::to(successor));
            }

            self.transplant(backing, at, Link::to(successor));
            set_child(backing, successor, LEFT, node.children[LEFT]);
            set_parent(backing, node.children[LEFT], Link::to(successor));
            set_color(backing, Link::to(successor), node.color());
        }

        self.len -= 1;

        if removed_color == Color::Black {
            self.fix_remove(backing, x, x_parent);
        }
    }

    /// `x` carries an extra black. `parent` is its parent, needed because `x`
    /// may be nil.
    fn fix_remove(&mut self, backing: &mut Backing, mut x: Link, mut parent_link: Link) {
        while x != self.root && color(backing, x) == Color::Black {
            let p = parent_link.offset();
            let dir = if child(backing, p, LEFT) == x {
                LEFT
            } else {
                RIGHT
            };

            // x is doubly black, so its sibling can't be a leaf.
            let mut sibling = child(backing, p, 1 - dir).offset();

            if color(backing, Link::to(sibling)) == Color::Red {
                set_color(backing, Link::to(sibling), Color::Black);
                set_color(backing, Link::to(p), Color::Red);
                self.rotate(backing, p, dir);
                sibling = child(backing, p, 1 - dir).offset();
            }

            let nephews = FreeNode::load(backing, sibling).children;

            if color(backing, nephews[LEFT]) == Color::Black
                && color(backing, nephews[RIGHT]) == Color::Black
            {
                set_color(backing, Link::to(sibling), Color::Red);
                x = Link::to(p);
                parent_link = parent(backing, p);
                continue;
            }

            if color(backing, nephews[1 - dir]) == Color::Black {
                set_color(backing, nephews[dir], Color::Black);
                set_color(backing, Link::to(sibling), Color::Red);
                self.rotate(backing, sibling, 1 - dir);
                sibling = child(backing, p, 1 - dir).offset();
            }

            let parent_color = color(backing, Link::to(p));
            set_color(backing, Link::to(sibling), parent_color);
            set_color(backing, Link::to(p), Color::Black);
            set_color(backing, child(backing, sibling, 1 - dir), Color::Black);
            self.rotate(backing, p, dir);

            x = self.root;
            parent_link = Link::NIL;
        }

        set_color(backing, x, Color::Black);
    }

    /// Smallest node, by `(size, offset)`, that is at least `min_size` bytes
    /// and for which `fits(offset, size)` holds. Nodes are visited in order
    /// starting from the lower bound of `min_size`, so whether a node fits may
    /// depend on its address and not only on its size. `fits` must hold for
    /// every node above some size, otherwise the walk may reach the end of the
    /// tree.
    pub fn best_fit(
        &self,
        backing: &Backing,
        min_size: usize,
        fits: impl Fn(usize, usize) -> bool,
    ) -> Option<usize> {
        let mut at = self.lower_bound(backing, min_size)?;

        loop {
            if fits(at, FreeNode::load(backing, at).size()) {
                return Some(at);
            }
            at = Self::successor(backing, at)?;
        }
    }

    /// First node in order whose size is at least `min_size`.
    fn lower_bound(&self, backing: &Backing, min_size: usize) -> Option<usize> {
        let mut found = None;
        let mut current = self.root;

        while let Some(at) = current.get() {
            let node = FreeNode::load(backing, at);

            if node.size() >= min_size {
                found = Some(at);
                current = node.children[LEFT];
            } else {
                current = node.children[RIGHT];
            }
        }

        found
    }

    /// Next node in `(size, offset)` order.
    fn successor(backing: &Backing, at: usize) -> Option<usize> {
        if let Some(right) = child(backing, at, RIGHT).get() {
            return Some(Self::minimum(backing, right));
        }

        let mut current = at;
        let mut up = parent(backing, at);

        while let Some(p) = up.get() {
            if child(backing, p, LEFT) == Link::to(current) {
                return Some(p);
            }
            current = p;
            up = parent(backing, p);
        }

        None
    }

    /// Checks every red-black property plus parent links and ordering.
    /// Returns the number of nodes.
    pub fn validate(&self, backing: &Backing) -> Result<usize> {
        let Some(root) = self.root.get() else {
            return if self.len == 0 {
                Ok(0)
            } else {
                Err(RegionError::Corrupted("tree is empty but counts nodes"))
            };
        };

        let node = FreeNode::load(backing, root);

        if node.color() == Color::Red {
            return Err(RegionError::Corrupted("root is red"));
        }

        if !node.parent.is_nil() {
            return Err(RegionError::Corrupted("root has a parent"));
        }

        let mut previous = None;
        let mut count = 0;
        Self::check_subtree(backing, root, &mut previous, &mut count)?;

        if count != self.len {
            return Err(RegionError::Corrupted("tree node count is out of date"));
        }

        Ok(count)
    }

    /// Returns the black height of the subtree at `at`, walking it in order.
    fn check_subtree(
        backing: &Backing,
        at: usize,
        previous: &mut Option<(usize, usize)>,
        count: &mut usize,
    ) -> Result<usize> {
        let node = FreeNode::load(backing, at);
        let mut heights = [1; 2];

        for dir in [LEFT, RIGHT] {
            let Some(child_at) = node.children[dir].get() else {
                if dir == RIGHT {
                    Self::visit(node.size(), at, previous, count)?;
                }
                continue;
            };

            let child_node = FreeNode::load(backing, child_at);

            if child_node.parent != Link::to(at) {
                return Err(RegionError::Corrupted("child doesn't point back to its parent"));
            }

            if node.color() == Color::Red && child_node.color() == Color::Red {
                return Err(RegionError::Corrupted("red node with red child"));
            }

            if dir == RIGHT {
                Self::visit(node.size(), at, previous, count)?;
            }

            heights[dir] = Self::check_subtree(backing, child_at, previous, count)?;
        }

        if heights[LEFT] != heights[RIGHT] {
            return Err(RegionError::Corrupted("black heights differ"));
        }

        Ok(heights[LEFT] + usize::from(node.color() == Color::Black))
    }

    fn visit(
        size: usize,
        at: usize,
        previous: &mut Option<(usize, usize)>,
        count: &mut usize,
    ) -> Result<()> {
        if previous.is_some_and(|key| key > (size, at)) {
            return Err(RegionError::Corrupted("in-order walk isn't sorted"));
        }

        *previous = Some((size, at));
        *count += 1;

        Ok(())
    }

    /// Renders the tree sideways, right subtree on top.
    pub fn dump<'a>(&'a self, backing: &'a Backing) -> TreeDump<'a> {
        TreeDump {
            tree: self,
            backing,
        }
    }
}

/// See [`RbTree::dump`].
pub(crate) struct TreeDump<'a> {
    tree: &'a RbTree,
    backing: &'a Backing<'a>,
}

impl TreeDump<'_> {
    fn write_subtree(&self, f: &mut fmt::Formatter<'_>, link: Link, depth: usize) -> fmt::Result {
        let Some(at) = link.get() else {
            return Ok(());
        };

        let node = FreeNode::load(self.backing, at);

        self.write_subtree(f, node.children[RIGHT], depth + 1)?;

        let color = match node.color() {
            Color::Red => 'R',
            Color::Black => 'B',
        };
        writeln!(f, "{:indent$}{color} {}", "", node.size(), indent = depth * 4)?;

        self.write_subtree(f, node.children[LEFT], depth + 1)
    }
}

impl fmt::Display for TreeDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_subtree(f, self.tree.root, 0)
    }
}

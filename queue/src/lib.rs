//! A FIFO queue of handles that also supports removal from any position.
//!
//! This is the only container the thread runtime uses: the ready queue and
//! every wait queue are `Queue`s of thread handles. Nodes are stored in an
//! arena and link to their neighbours by slot index rather than by pointer,
//! so unlinking a node never leaves a neighbour pointing at freed memory.
//! Vacated slots go on a free list and are handed out again by the next
//! `enqueue`, which means a dequeue followed by an enqueue does not touch the
//! allocator.
//!
//! Items are treated as opaque handles. `delete` and `contains` locate an
//! item with `PartialEq`, so handle types should implement equality as
//! identity (two handles are equal when they refer to the same object).

use core::{fmt, iter::FusedIterator, mem};
use thiserror::Error;

/// Error type for queue operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Dequeue from a queue with no elements
    #[error("queue is empty")]
    Empty,
    /// No element of the queue matches the requested item
    #[error("item is not in the queue")]
    NotFound,
    /// Node storage could not be grown
    #[error("could not allocate a queue node")]
    AllocFailed,
}

type NodeIndex = usize;

/// Names one element of a [`Queue`] for as long as it stays queued.
///
/// A position outlives the element it names without becoming unsafe to use:
/// once the element is removed, lookups through it return `None`, even if
/// the storage has since been reused by a later `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    index: NodeIndex,
    generation: u32,
}

struct Node<T> {
    item: T,
    prev: Option<NodeIndex>,
    next: Option<NodeIndex>,
}

enum Entry<T> {
    Occupied(Node<T>),
    Vacant { next_free: Option<NodeIndex> },
}

struct Slot<T> {
    // Bumped every time the slot is vacated, so a saved index can tell
    // whether it still names the node it was taken from.
    generation: u32,
    entry: Entry<T>,
}

pub struct Queue<T> {
    slots: Vec<Slot<T>>,
    free: Option<NodeIndex>,
    front: Option<NodeIndex>,
    rear: Option<NodeIndex>,
    len: usize,
}

impl<T> Queue<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            front: None,
            rear: None,
            len: 0,
        }
    }

    /// Creates an empty queue with room for `capacity` nodes before the node
    /// arena has to grow.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Releases the queue's own storage.
    ///
    /// A queue that still holds elements is handed back unchanged, the same
    /// way `Rc::try_unwrap` hands back a shared `Rc`.
    pub fn destroy(self) -> Result<(), Self> {
        if self.len > 0 {
            return Err(self);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The element that the next `dequeue` would return.
    pub fn front(&self) -> Option<&T> {
        self.front.map(|index| &self.node(index).item)
    }

    /// Appends `item` at the rear.
    pub fn enqueue(&mut self, item: T) -> Result<(), QueueError> {
        let index = self.alloc_node(Node {
            item,
            prev: self.rear,
            next: None,
        })?;

        match self.rear {
            Some(rear) => self.node_mut(rear).next = Some(index),
            None => self.front = Some(index),
        }
        self.rear = Some(index);
        self.len += 1;
        Ok(())
    }

    /// Removes and returns the front element.
    pub fn dequeue(&mut self) -> Result<T, QueueError> {
        let front = self.front.ok_or(QueueError::Empty)?;
        Ok(self.unlink(front))
    }

    /// Removes the first element equal to `item`, keeping the order of the
    /// remaining elements.
    pub fn delete(&mut self, item: &T) -> Result<T, QueueError>
    where
        T: PartialEq,
    {
        let index = self.find(item).ok_or(QueueError::NotFound)?;
        Ok(self.unlink(index))
    }

    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.find(item).is_some()
    }

    /// Calls `visit` on every element from front to rear.
    ///
    /// The visitor receives the queue itself and may `delete` the element it
    /// is visiting; the successor has already been recorded by then. If the
    /// visitor removes that successor instead, the traversal stops there.
    pub fn iterate<F>(&mut self, mut visit: F)
    where
        T: Clone,
        F: FnMut(&mut Self, &T),
    {
        let mut cursor = self.first();
        while let Some(at) = cursor {
            let Some(item) = self.get(at).cloned() else {
                break;
            };
            let next = self.next_position(at);

            visit(self, &item);

            cursor = next.filter(|&next| self.get(next).is_some());
        }
    }

    /// The position of the front element.
    pub fn first(&self) -> Option<Position> {
        self.front.map(|index| self.position_of(index))
    }

    /// The element at `at`, or `None` once that element has left the queue.
    pub fn get(&self, at: Position) -> Option<&T> {
        let slot = self.slots.get(at.index)?;
        match &slot.entry {
            Entry::Occupied(node) if slot.generation == at.generation => Some(&node.item),
            _ => None,
        }
    }

    /// The position of the element behind the one at `at`.
    pub fn next_position(&self, at: Position) -> Option<Position> {
        self.get(at)?;
        self.node(at.index).next.map(|next| self.position_of(next))
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.front,
            remaining: self.len,
        }
    }

    fn find(&self, item: &T) -> Option<NodeIndex>
    where
        T: PartialEq,
    {
        let mut cursor = self.front;
        while let Some(index) = cursor {
            let node = self.node(index);
            if node.item == *item {
                return Some(index);
            }
            cursor = node.next;
        }
        None
    }

    /// Detaches the node at `index` from its neighbours and frees its slot.
    fn unlink(&mut self, index: NodeIndex) -> T {
        let node = self.release(index);

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.front = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.rear = node.prev,
        }
        self.len -= 1;

        node.item
    }

    fn alloc_node(&mut self, node: Node<T>) -> Result<NodeIndex, QueueError> {
        if let Some(index) = self.free {
            let slot = &mut self.slots[index];
            self.free = match slot.entry {
                Entry::Vacant { next_free } => next_free,
                Entry::Occupied(_) => panic!("free list points at occupied node {index}"),
            };
            slot.entry = Entry::Occupied(node);
            return Ok(index);
        }

        self.slots
            .try_reserve(1)
            .map_err(|_| QueueError::AllocFailed)?;
        self.slots.push(Slot {
            generation: 0,
            entry: Entry::Occupied(node),
        });
        Ok(self.slots.len() - 1)
    }

    fn release(&mut self, index: NodeIndex) -> Node<T> {
        let slot = &mut self.slots[index];
        let entry = mem::replace(
            &mut slot.entry,
            Entry::Vacant {
                next_free: self.free,
            },
        );
        slot.generation = slot.generation.wrapping_add(1);
        self.free = Some(index);

        match entry {
            Entry::Occupied(node) => node,
            Entry::Vacant { .. } => panic!("queue node {index} released twice"),
        }
    }

    fn position_of(&self, index: NodeIndex) -> Position {
        Position {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn node(&self, index: NodeIndex) -> &Node<T> {
        match &self.slots[index].entry {
            Entry::Occupied(node) => node,
            Entry::Vacant { .. } => panic!("dangling queue link to node {index}"),
        }
    }

    fn node_mut(&mut self, index: NodeIndex) -> &mut Node<T> {
        match &mut self.slots[index].entry {
            Entry::Occupied(node) => node,
            Entry::Vacant { .. } => panic!("dangling queue link to node {index}"),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a Queue<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

/// Front-to-rear iterator over the elements of a [`Queue`].
pub struct Iter<'a, T> {
    queue: &'a Queue<T>,
    cursor: Option<NodeIndex>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let node = self.queue.node(self.cursor?);
        self.cursor = node.next;
        self.remaining -= 1;
        Some(&node.item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
impl<T> FusedIterator for Iter<'_, T> {}

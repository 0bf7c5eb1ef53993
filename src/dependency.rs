use crate::path::TaskPath;
use crate::task::Task;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Depth bound of the completion table. Dependencies on deeper paths are
/// clamped to their depth-`MAX_DEPTH` ancestor; completions of deeper paths
/// are dropped. Callers must not rely on paths beyond this cut-off.
pub(crate) const MAX_DEPTH: usize = 6;

/// One cell per node of a perfect binary tree of depth `MAX_DEPTH`, plus the
/// unused slot 0 (the root lives at index 1, children of `i` at `2i`/`2i+1`).
const NUM_ENTRIES: usize = 1 << (MAX_DEPTH + 1);

/// Tag bit marking a cell as complete. Waiter nodes are heap allocated and
/// thus at least word aligned, so bit 0 is never set on a real pointer.
const DONE_TAG: usize = 0x1;

/// Intrusive waiter list node. Owned by the cell it is linked into until
/// `mark_complete` detaches the whole list in a single swap.
struct Waiter {
    task: Arc<Task>,
    next: usize,
}

/// Path-indexed completion table with per-cell waiter lists.
///
/// Each cell is a single atomic word holding either the head of a lock-free
/// waiter list (possibly null) or the tagged done sentinel. Cells move
/// monotonically from list to done, never back. Completion of a cell
/// propagates to both children within the bound, so a dependency on any
/// descendant path is satisfied by an ancestor finishing.
pub(crate) struct DependencyManager {
    cells: Box<[AtomicUsize; NUM_ENTRIES]>,
}

impl DependencyManager {
    pub(crate) fn new() -> Self {
        DependencyManager {
            cells: Box::new([const { AtomicUsize::new(0) }; NUM_ENTRIES]),
        }
    }

    /// Folds a path into its cell index, clamping over-deep paths onto their
    /// bounded ancestor.
    fn index_of(path: TaskPath) -> usize {
        let mut pos = 1;
        for bit in path.bits() {
            pos = pos * 2 + bit as usize;
            if pos >= NUM_ENTRIES {
                return pos / 2;
            }
        }
        pos
    }

    fn is_done(encoded: usize) -> bool {
        encoded & DONE_TAG != 0
    }

    /// Registers `task` as waiting on `path`. If the cell is already (or
    /// becomes, mid-insert) complete, the waiter is not linked and the
    /// dependency is signalled on the spot.
    pub(crate) fn add_dependency(&self, task: Arc<Task>, path: TaskPath) {
        let cell = &self.cells[Self::index_of(path)];

        let head = cell.load(Ordering::Acquire);
        if Self::is_done(head) {
            task.dependency_done();
            return;
        }

        let node = Box::into_raw(Box::new(Waiter { task, next: head }));
        let mut expected = head;
        loop {
            match cell.compare_exchange_weak(
                expected,
                node as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => {
                    if Self::is_done(current) {
                        // Lost the race against completion. Reclaim the node
                        // and signal directly.
                        let node = unsafe { Box::from_raw(node) };
                        node.task.dependency_done();
                        return;
                    }
                    expected = current;
                    // Safety: the node is not yet published, this thread is
                    // its only owner.
                    unsafe { (*node).next = current };
                }
            }
        }
    }

    /// Marks `path` complete, draining and signalling its waiter list, then
    /// propagates completion into both child cells. Paths beyond the depth
    /// bound are ignored. Repeated calls are no-ops: the swap hands the
    /// waiter list to exactly one caller.
    pub(crate) fn mark_complete(&self, path: TaskPath) {
        if path.len() > MAX_DEPTH {
            return;
        }

        let pos = Self::index_of(path);
        let old = self.cells[pos].swap(DONE_TAG, Ordering::AcqRel);
        if Self::is_done(old) {
            return;
        }

        let mut cur = old;
        while cur != 0 {
            // Safety: the swap above detached the list, this thread is its
            // sole owner and each node is visited exactly once.
            let node = unsafe { Box::from_raw(cur as *mut Waiter) };
            node.task.dependency_done();
            cur = node.next;
        }

        // The lower half of the table holds the inner nodes; leaves have no
        // in-bound children to propagate into.
        if pos >= NUM_ENTRIES / 2 {
            return;
        }
        self.mark_complete(path.left());
        self.mark_complete(path.right());
    }

    pub(crate) fn is_complete(&self, path: TaskPath) -> bool {
        Self::is_done(self.cells[Self::index_of(path)].load(Ordering::Acquire))
    }
}

impl Drop for DependencyManager {
    fn drop(&mut self) {
        // Free waiter lists of cells that never completed. No concurrency
        // here, drop has exclusive access.
        for cell in self.cells.iter_mut() {
            let mut cur = *cell.get_mut();
            while cur != 0 && !Self::is_done(cur) {
                let node = unsafe { Box::from_raw(cur as *mut Waiter) };
                cur = node.next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_clamps_to_bounded_ancestor() {
        let mut path = TaskPath::root();
        for _ in 0..MAX_DEPTH {
            path = path.left();
        }
        let bounded = DependencyManager::index_of(path);
        // one step past the bound maps onto the same cell's subtree clamp
        assert_eq!(DependencyManager::index_of(path.left()), bounded);
        assert_eq!(DependencyManager::index_of(path.right()), bounded);
    }

    #[test]
    fn test_completion_is_monotone_and_propagates() {
        let mgr = DependencyManager::new();
        let p = TaskPath::root().left();
        assert!(!mgr.is_complete(p));

        mgr.mark_complete(p);
        assert!(mgr.is_complete(p));
        // descendants are covered by the ancestor's completion
        assert!(mgr.is_complete(p.left()));
        assert!(mgr.is_complete(p.right().right()));
        // the sibling subtree is untouched
        assert!(!mgr.is_complete(TaskPath::root().right()));
        // and the root is not implied by a child
        assert!(!mgr.is_complete(TaskPath::root()));
    }

    #[test]
    fn test_mark_complete_beyond_bound_is_ignored() {
        let mgr = DependencyManager::new();
        let mut deep = TaskPath::root();
        for _ in 0..=MAX_DEPTH {
            deep = deep.left();
        }
        mgr.mark_complete(deep);
        // the clamped cell must not have been marked
        assert!(!mgr.is_complete(TaskPath::root()));
        let mut bounded = TaskPath::root();
        for _ in 0..MAX_DEPTH {
            bounded = bounded.left();
        }
        assert!(!mgr.is_complete(bounded));
    }

    #[test]
    fn test_deep_queries_read_the_clamped_cell() {
        let mgr = DependencyManager::new();
        mgr.mark_complete(TaskPath::root());
        let mut deep = TaskPath::root();
        for _ in 0..(MAX_DEPTH + 3) {
            deep = deep.right();
        }
        assert!(mgr.is_complete(deep));
    }
}

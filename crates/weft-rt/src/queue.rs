// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ready queues.
//!
//! Per-thread work-stealing queue plus a plain FIFO used as the runtime's
//! injection queue and as each scheduler's remote inbox. All operations
//! are O(1) pointer moves under a spin lock, except `steal`, which walks
//! past pinned entries. Nothing done under these locks can suspend a fiber.
use std::collections::VecDeque;
use std::sync::Arc;

use crate::fiber::{Fiber, Link};

/// Per-thread ready queue.
///
/// The owning scheduler pushes at the tail and pops at the head (oldest
/// first, so co-resident fibers round-robin). Other threads steal the
/// first entry that is not pinned to this thread.
#[derive(Default)]
pub(crate) struct WorkStealingQueue {
    deque: spin::Mutex<VecDeque<Arc<Fiber>>>,
}

impl WorkStealingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail. Owner thread only.
    pub fn push(&self, fiber: Arc<Fiber>) {
        let mut q = self.deque.lock();
        fiber.link(Link::Ready);
        q.push_back(fiber);
    }

    /// Remove the oldest entry. Owner thread only.
    pub fn pop(&self) -> Option<Arc<Fiber>> {
        let mut q = self.deque.lock();
        let fiber = q.pop_front()?;
        fiber.unlink(Link::Ready);
        Some(fiber)
    }

    /// Take the first unpinned entry, wherever it sits. Called by peers.
    pub fn steal(&self) -> Option<Arc<Fiber>> {
        let mut q = self.deque.lock();
        let idx = q.iter().position(|f| !f.is_pinned())?;
        let fiber = q.remove(idx)?;
        fiber.unlink(Link::Ready);
        Some(fiber)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.deque.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.deque.lock().is_empty()
    }

    /// Unlink and return every entry, oldest first.
    pub(crate) fn drain_all(&self) -> Vec<Arc<Fiber>> {
        let drained: Vec<_> = self.deque.lock().drain(..).collect();
        for fiber in &drained {
            fiber.unlink(Link::Ready);
        }
        drained
    }
}

/// Multi-producer FIFO. Fibers in it count as ready.
#[derive(Default)]
pub(crate) struct InjectorQueue {
    queue: spin::Mutex<VecDeque<Arc<Fiber>>>,
}

impl InjectorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, fiber: Arc<Fiber>) {
        let mut q = self.queue.lock();
        fiber.link(Link::Ready);
        q.push_back(fiber);
    }

    /// Pop one fiber from the front.
    pub fn pop(&self) -> Option<Arc<Fiber>> {
        let mut q = self.queue.lock();
        let fiber = q.pop_front()?;
        fiber.unlink(Link::Ready);
        Some(fiber)
    }

    /// Unlink and take everything at once.
    pub fn pop_all(&self) -> Vec<Arc<Fiber>> {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        for fiber in &drained {
            fiber.unlink(Link::Ready);
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<Arc<Fiber>> {
        self.queue.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::tests::idle_fiber;
    use crate::fiber::{FiberId, TerminatedQueue};
    use crate::scheduler::Peer;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn ids(fibers: &[Arc<Fiber>]) -> Vec<FiberId> {
        fibers.iter().map(|f| f.id()).collect()
    }

    #[test]
    fn pop_is_fifo() {
        let q = WorkStealingQueue::new();
        let fibers: Vec<_> = (0..8).map(|_| idle_fiber(false)).collect();
        for f in &fibers {
            q.push(f.clone());
        }
        assert_eq!(q.len(), 8);
        let popped: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(ids(&popped), ids(&fibers));
        assert!(q.is_empty());
        assert!(fibers.iter().all(|f| f.link_state() == Link::Unlinked));
    }

    #[test]
    fn steal_skips_pinned_entries() {
        let q = WorkStealingQueue::new();
        let seq = [
            idle_fiber(true),
            idle_fiber(false),
            idle_fiber(true),
            idle_fiber(false),
        ];
        for f in &seq {
            q.push(f.clone());
        }

        let stolen = q.steal().unwrap();
        assert_eq!(stolen.id(), seq[1].id());
        assert_eq!(stolen.link_state(), Link::Unlinked);
        assert_eq!(q.len(), 3);

        // Remaining order is untouched.
        let rest: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(ids(&rest), vec![seq[0].id(), seq[2].id(), seq[3].id()]);
    }

    #[test]
    fn steal_from_all_pinned_or_empty_finds_nothing() {
        let q = WorkStealingQueue::new();
        assert!(q.steal().is_none());
        let pinned = idle_fiber(true);
        q.push(pinned.clone());
        assert!(q.steal().is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap().id(), pinned.id());
    }

    #[test]
    fn steal_takes_tail_entry() {
        let q = WorkStealingQueue::new();
        let pinned = idle_fiber(true);
        let free = idle_fiber(false);
        q.push(pinned.clone());
        q.push(free.clone());
        assert_eq!(q.steal().unwrap().id(), free.id());
        // Tail was fixed up: a new push lands after the pinned head.
        let next = idle_fiber(false);
        q.push(next.clone());
        assert_eq!(ids(&q.drain_all()), vec![pinned.id(), next.id()]);
    }

    #[test]
    fn concurrent_pop_and_steal_lose_nothing() {
        const M: usize = 2000;
        const THIEVES: usize = 4;
        let q = Arc::new(WorkStealingQueue::new());
        let fibers: Vec<_> = (0..M).map(|_| idle_fiber(false)).collect();
        for f in &fibers {
            q.push(f.clone());
        }

        let barrier = Arc::new(Barrier::new(THIEVES + 1));
        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let q = q.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut got = Vec::new();
                    while let Some(f) = q.steal() {
                        got.push(f.id());
                    }
                    got
                })
            })
            .collect();

        barrier.wait();
        let mut all: Vec<FiberId> = std::iter::from_fn(|| q.pop()).map(|f| f.id()).collect();
        for t in thieves {
            all.extend(t.join().unwrap());
        }

        assert_eq!(all.len(), M);
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), M);
        assert!(fibers.iter().all(|f| f.link_state() == Link::Unlinked));
    }

    #[test]
    fn injector_is_fifo() {
        let q = InjectorQueue::new();
        let a = idle_fiber(false);
        let b = idle_fiber(true);
        q.push(a.clone());
        q.push(b.clone());
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().id(), a.id());
        assert_eq!(ids(&q.pop_all()), vec![b.id()]);
        assert!(q.is_empty());
    }

    /// Where the model believes each fiber is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Place {
        Free,
        Ready,
        Waiting,
        Inbox,
        Terminated,
    }

    fn expected_link(place: Place) -> Link {
        match place {
            Place::Free => Link::Unlinked,
            Place::Ready | Place::Inbox => Link::Ready,
            Place::Waiting => Link::Wait,
            Place::Terminated => Link::Terminated,
        }
    }

    #[test]
    fn randomized_membership_stays_exclusive() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let peer = Peer::detached(0);
        let q = WorkStealingQueue::new();
        let terminated = TerminatedQueue::default();
        let fibers: Vec<_> = (0..12).map(|i| idle_fiber(i % 3 == 0)).collect();
        for f in &fibers {
            f.attach_scheduler(&peer);
        }
        let mut place = vec![Place::Free; fibers.len()];
        let index_of = |f: &Arc<Fiber>| fibers.iter().position(|g| g.id() == f.id()).unwrap();

        for _ in 0..5000 {
            let i = rng.gen_range(0..fibers.len());
            match rng.gen_range(0..7) {
                0 if place[i] == Place::Free => {
                    q.push(fibers[i].clone());
                    place[i] = Place::Ready;
                }
                1 => {
                    if let Some(f) = q.pop() {
                        place[index_of(&f)] = Place::Free;
                    }
                }
                2 => {
                    if let Some(f) = q.steal() {
                        assert!(!f.is_pinned());
                        place[index_of(&f)] = Place::Free;
                    }
                }
                3 => {
                    let target = rng.gen_range(0..fibers.len());
                    if target != i && place[i] == Place::Free && place[target] == Place::Free {
                        // Finished targets hand the waiter straight back.
                        if fibers[target].add_waiter(fibers[i].clone()).is_ok() {
                            place[i] = Place::Waiting;
                        }
                    }
                }
                4 if place[i] == Place::Free => {
                    fibers[i].mark_terminated(&terminated);
                    place[i] = Place::Terminated;
                    for f in peer.inbox_snapshot() {
                        let j = index_of(&f);
                        if place[j] == Place::Waiting {
                            place[j] = Place::Inbox;
                        }
                    }
                }
                5 => {
                    for f in peer.take_inbox() {
                        place[index_of(&f)] = Place::Free;
                    }
                }
                6 => {
                    for f in terminated.drain() {
                        let j = index_of(&f);
                        place[j] = Place::Free;
                        assert!(f.is_finished());
                    }
                }
                _ => {}
            }

            for (f, p) in fibers.iter().zip(&place) {
                assert_eq!(f.link_state(), expected_link(*p), "{:?} expected {:?}", f, p);
            }
            let queued = place.iter().filter(|p| **p == Place::Ready).count();
            assert_eq!(q.len(), queued);
        }

        // Tear down so no control block is dropped while linked or waited
        // on. Wait edges only ever point at fibers that were free, so the
        // chains are acyclic and this settles.
        q.drain_all();
        loop {
            peer.take_inbox();
            terminated.drain();
            let blocked: Vec<_> = fibers
                .iter()
                .filter(|f| f.waiter_count() > 0 && f.link_state() == Link::Unlinked)
                .collect();
            if blocked.is_empty() {
                break;
            }
            for f in blocked {
                f.mark_terminated(&terminated);
            }
        }
        assert!(fibers.iter().all(|f| f.waiter_count() == 0));
    }
}

use parking_lot::Mutex;

use crate::common::types::FrameId;

#[derive(Clone, Copy, Default)]
struct LruNode {
    prev: Option<FrameId>,
    next: Option<FrameId>,
    in_list: bool,
}

struct LruInner {
    // Doubly-linked order list over a dense node array: head is the most
    // recently unpinned frame, the victim comes off the tail.
    nodes: Vec<LruNode>,
    head: Option<FrameId>,
    tail: Option<FrameId>,
    size: usize,
    capacity: usize,
}

/// LRU replacement policy over unpinned frames. All operations are O(1) and
/// serialized by the replacer's own latch.
pub struct LruReplacer {
    inner: Mutex<LruInner>,
}

impl LruReplacer {
    pub fn new(num_pages: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                nodes: vec![LruNode::default(); num_pages],
                head: None,
                tail: None,
                size: 0,
                capacity: num_pages,
            }),
        }
    }

    /// Remove and return the least recently unpinned frame.
    pub fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let frame_id = inner.tail?;
        inner.unlink(frame_id);
        Some(frame_id)
    }

    /// A pinner took the frame: it is no longer an eviction candidate.
    /// No-op if the frame is not in the replacer.
    pub fn pin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.nodes[frame_id as usize].in_list {
            inner.unlink(frame_id);
        }
    }

    /// The frame's pin count dropped to zero: insert it as most recently
    /// used. No-op if already present or the replacer is at capacity.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.nodes[frame_id as usize].in_list || inner.size == inner.capacity {
            return;
        }
        inner.push_front(frame_id);
    }

    /// Number of eviction candidates.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }
}

impl LruInner {
    fn push_front(&mut self, frame_id: FrameId) {
        let old_head = self.head;
        self.nodes[frame_id as usize] = LruNode {
            prev: None,
            next: old_head,
            in_list: true,
        };
        match old_head {
            Some(h) => self.nodes[h as usize].prev = Some(frame_id),
            None => self.tail = Some(frame_id),
        }
        self.head = Some(frame_id);
        self.size += 1;
    }

    fn unlink(&mut self, frame_id: FrameId) {
        let node = self.nodes[frame_id as usize];
        match node.prev {
            Some(p) => self.nodes[p as usize].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.nodes[n as usize].prev = node.prev,
            None => self.tail = node.prev,
        }
        self.nodes[frame_id as usize] = LruNode::default();
        self.size -= 1;
    }
}

//! Refcounted, growable byte buffer and its per-loop pooled allocator
//! (original §3 `IOBuffer`, §4.4).
//!
//! Modeled on the teacher's [`circular_buffer::CircularBuffer`] cursor
//! invariants (`position <= limit <= capacity`), but backed by a plain
//! `Vec<u8>` rather than a double-mapped ring: frames are bounded and
//! copied once into a socket's outbound queue, so the mmap trick the
//! teacher uses for its infinite receive stream buys nothing here.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A single-threaded pooled allocator. Every buffer it vends must be
/// released on the same loop that allocated it (§4.4 contract).
pub struct Allocator {
    free_list: RefCell<Vec<Vec<u8>>>,
    default_capacity: usize,
    max_pooled: usize,
}

impl Allocator {
    /// Creates a new allocator; `default_capacity` sizes buffers allocated
    /// with [`Allocator::allocate`] with no explicit size.
    pub fn new(default_capacity: usize) -> Rc<Self> {
        Rc::new(Allocator {
            free_list: RefCell::new(Vec::new()),
            default_capacity,
            max_pooled: 256,
        })
    }

    /// Allocates a buffer with refcount 1, sized at least `n` bytes.
    pub fn allocate(self: &Rc<Self>, n: usize) -> IoBuffer {
        let want = n.max(self.default_capacity);
        let mut storage = self
            .free_list
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(want));
        if storage.capacity() < want {
            storage.reserve(want - storage.capacity());
        }
        storage.clear();
        storage.resize(storage.capacity(), 0);

        IoBuffer(Rc::new(Inner {
            data: RefCell::new(storage),
            position: Cell::new(0),
            limit: Cell::new(0),
            refcount: Cell::new(1),
            allocator: Some(Rc::clone(self)),
        }))
    }

    fn recycle(&self, mut storage: Vec<u8>) {
        if self.free_list.borrow().len() < self.max_pooled {
            storage.clear();
            self.free_list.borrow_mut().push(storage);
        }
    }

    /// Number of buffers currently idle in the free list; exposed for tests
    /// asserting the acquire/release quiescence invariant (original §8).
    pub fn pooled_count(&self) -> usize {
        self.free_list.borrow().len()
    }
}

struct Inner {
    data: RefCell<Vec<u8>>,
    position: Cell<usize>,
    limit: Cell<usize>,
    refcount: Cell<usize>,
    allocator: Option<Rc<Allocator>>,
}

/// A reference-counted byte container with cursor-based primitive I/O.
///
/// `acquire()`/`release()` are the only mutators of the refcount; every
/// `acquire()` must be paired with exactly one `release()` on the same
/// allocator thread (original §3, §5 invariants).
pub struct IoBuffer(Rc<Inner>);

impl IoBuffer {
    /// Allocates an unpooled standalone buffer (no back-reference allocator);
    /// `release()` simply drops its storage.
    pub fn with_capacity(n: usize) -> Self {
        IoBuffer(Rc::new(Inner {
            data: RefCell::new(vec![0; n]),
            position: Cell::new(0),
            limit: Cell::new(0),
            refcount: Cell::new(1),
            allocator: None,
        }))
    }

    /// Increments the refcount and returns a new handle to the same storage.
    pub fn acquire(&self) -> IoBuffer {
        self.0.refcount.set(self.0.refcount.get() + 1);
        IoBuffer(Rc::clone(&self.0))
    }

    /// Decrements the refcount; at zero, returns the storage to its
    /// allocator's free list (or simply drops it if unpooled).
    pub fn release(self) {
        let remaining = self.0.refcount.get() - 1;
        self.0.refcount.set(remaining);
        if remaining == 0 {
            if let Some(allocator) = self.0.allocator.as_ref() {
                let storage = std::mem::take(&mut *self.0.data.borrow_mut());
                allocator.recycle(storage);
            }
        }
    }

    /// Current refcount; exercised by tests, not part of normal control flow.
    pub fn refcount(&self) -> usize {
        self.0.refcount.get()
    }

    pub fn position(&self) -> usize {
        self.0.position.get()
    }

    pub fn set_position(&self, position: usize) {
        assert!(position <= self.0.limit.get());
        self.0.position.set(position);
    }

    pub fn limit(&self) -> usize {
        self.0.limit.get()
    }

    pub fn set_limit(&self, limit: usize) {
        assert!(limit <= self.capacity());
        self.0.limit.set(limit);
        if self.0.position.get() > limit {
            self.0.position.set(limit);
        }
    }

    pub fn capacity(&self) -> usize {
        self.0.data.borrow().len()
    }

    pub fn remaining(&self) -> usize {
        self.0.limit.get() - self.0.position.get()
    }

    /// Switches from write mode to read mode: `limit = position`, `position = 0`.
    pub fn flip(&self) {
        self.0.limit.set(self.0.position.get());
        self.0.position.set(0);
    }

    /// Resets both cursors to the start of the buffer.
    pub fn clear(&self) {
        self.0.position.set(0);
        self.0.limit.set(self.capacity());
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        let pos = self.0.position.get();
        assert!(pos + bytes.len() <= self.capacity());
        self.0.data.borrow_mut()[pos..pos + bytes.len()].copy_from_slice(bytes);
        self.0.position.set(pos + bytes.len());
    }

    pub fn write_i32(&self, value: i32) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_i64(&self, value: i64) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn read_bytes(&self, len: usize) -> Vec<u8> {
        let pos = self.0.position.get();
        assert!(pos + len <= self.0.limit.get());
        let out = self.0.data.borrow()[pos..pos + len].to_vec();
        self.0.position.set(pos + len);
        out
    }

    pub fn read_i32(&self) -> i32 {
        i32::from_be_bytes(self.read_bytes(4).try_into().unwrap())
    }

    pub fn read_i64(&self) -> i64 {
        i64::from_be_bytes(self.read_bytes(8).try_into().unwrap())
    }

    /// Overwrites 4 bytes at an absolute offset without moving `position`
    /// (used by [`crate::frame::construct_complete`] to patch the size prefix).
    pub fn patch_i32(&self, offset: usize, value: i32) {
        self.0.data.borrow_mut()[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Borrows the writable tail of the buffer, from `position` to `limit`,
    /// for a socket to copy freshly-read bytes into.
    pub fn with_uninit_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let pos = self.0.position.get();
        let limit = self.0.limit.get();
        f(&mut self.0.data.borrow_mut()[pos..limit])
    }

    /// Borrows the readable range, from `position` to `limit`.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let pos = self.0.position.get();
        let limit = self.0.limit.get();
        f(&self.0.data.borrow()[pos..limit])
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("position", &self.position())
            .field("limit", &self.limit())
            .field("capacity", &self.capacity())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/*!
 * Cycle-scoped region allocator
 *
 * Small allocations bump-allocate out of a chain of fixed-size arena
 * blocks and are never freed individually; the whole pool is destroyed
 * when its configuration cycle ends. Allocations at or above the page
 * size bypass the arena and sit on a separate list whose entries can be
 * released one by one.
 */

use std::alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::cell::RefCell;
use std::cmp;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Alignment of every pointer handed out by a pool
pub const POOL_ALIGNMENT: usize = 16;

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n <= 0 {
            4096
        } else {
            n as usize
        }
    })
}

struct Block {
    ptr: NonNull<u8>,
    size: usize,
    /// Bump offset of the next free byte
    last: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, POOL_ALIGNMENT).expect("arena block layout");
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));
        Self {
            ptr,
            size,
            last: 0,
        }
    }
}

struct LargeBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

struct PoolInner {
    blocks: Vec<Block>,
    /// Vacated entries stay as None and are reused by the next large
    /// allocation; the list never compacts (cycle lifetime bounds the waste)
    large: Vec<Option<LargeBlock>>,
    block_size: usize,
    small_limit: usize,
}

/// Region allocator tied to a configuration cycle
pub struct Pool {
    inner: RefCell<PoolInner>,
}

impl Pool {
    /// Create a pool whose arena blocks are `size` bytes each
    pub fn create(size: usize) -> Self {
        let size = cmp::max(size, POOL_ALIGNMENT);
        Self {
            inner: RefCell::new(PoolInner {
                blocks: vec![Block::new(size)],
                large: Vec::new(),
                block_size: size,
                small_limit: cmp::min(page_size() - 1, size),
            }),
        }
    }

    /// Allocate `n` bytes aligned to [`POOL_ALIGNMENT`].
    ///
    /// The memory stays valid until the pool is dropped; small allocations
    /// cannot be returned earlier.
    pub fn alloc(&self, n: usize) -> NonNull<u8> {
        let n = cmp::max(n, 1);
        let mut inner = self.inner.borrow_mut();

        if n <= inner.small_limit {
            return inner.alloc_small(n);
        }
        inner.alloc_large(n, false)
    }

    /// Same as [`alloc`](Self::alloc) with the block zero-filled
    pub fn alloc_zeroed(&self, n: usize) -> NonNull<u8> {
        let n = cmp::max(n, 1);
        let mut inner = self.inner.borrow_mut();

        if n <= inner.small_limit {
            let p = inner.alloc_small(n);
            unsafe { std::ptr::write_bytes(p.as_ptr(), 0, n) };
            return p;
        }
        inner.alloc_large(n, true)
    }

    /// Release one large allocation. Pointers the pool does not know about
    /// are declined and reported.
    pub fn free_large(&self, ptr: NonNull<u8>) -> bool {
        let mut inner = self.inner.borrow_mut();
        for slot in inner.large.iter_mut() {
            if let Some(l) = slot {
                if l.ptr == ptr {
                    unsafe { dealloc(l.ptr.as_ptr(), l.layout) };
                    *slot = None;
                    return true;
                }
            }
        }
        false
    }

    /// Try to grow an allocation in place: succeeds only when `tail` is the
    /// pool's current bump edge and the block has `bytes` to spare. Used by
    /// [`PoolVec`](crate::core::array::PoolVec) to extend without copying.
    pub(crate) fn extend_in_place(&self, tail: *const u8, bytes: usize) -> bool {
        let mut inner = self.inner.borrow_mut();
        for block in inner.blocks.iter_mut() {
            let edge = unsafe { block.ptr.as_ptr().add(block.last) };
            if edge.cast_const() == tail {
                if block.last + bytes <= block.size {
                    block.last += bytes;
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Number of arena blocks currently chained
    pub fn block_count(&self) -> usize {
        self.inner.borrow().blocks.len()
    }

    /// Number of live large allocations
    pub fn large_count(&self) -> usize {
        self.inner
            .borrow()
            .large
            .iter()
            .filter(|l| l.is_some())
            .count()
    }
}

impl PoolInner {
    fn alloc_small(&mut self, n: usize) -> NonNull<u8> {
        for block in self.blocks.iter_mut() {
            let aligned = align_up(block.last, POOL_ALIGNMENT);
            if aligned <= block.size && block.size - aligned >= n {
                block.last = aligned + n;
                return unsafe { NonNull::new_unchecked(block.ptr.as_ptr().add(aligned)) };
            }
        }

        // Every block is exhausted: chain a new one sized like the head
        let mut block = Block::new(self.block_size);
        block.last = n;
        let p = block.ptr;
        self.blocks.push(block);
        p
    }

    fn alloc_large(&mut self, n: usize, zeroed: bool) -> NonNull<u8> {
        let layout = Layout::from_size_align(n, POOL_ALIGNMENT).expect("large block layout");
        let raw = unsafe {
            if zeroed {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        let ptr = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));

        // Reuse a vacated entry when one exists
        for slot in self.large.iter_mut() {
            if slot.is_none() {
                *slot = Some(LargeBlock { ptr, layout });
                return ptr;
            }
        }
        self.large.push(Some(LargeBlock { ptr, layout }));
        ptr
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for slot in self.large.drain(..) {
            if let Some(l) = slot {
                unsafe { dealloc(l.ptr.as_ptr(), l.layout) };
            }
        }
        for block in self.blocks.drain(..) {
            let layout =
                Layout::from_size_align(block.size, POOL_ALIGNMENT).expect("arena block layout");
            unsafe { dealloc(block.ptr.as_ptr(), layout) };
        }
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

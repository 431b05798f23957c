// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Per-request bump allocator.
//!
//! A growable sequence of fixed-size chunks. Allocation bumps an offset
//! within the current chunk; when a chunk is exhausted a new one is pushed.
//! Nothing is ever freed individually — the whole arena is reclaimed at once
//! when it is dropped. Values handed out borrow the arena's lifetime and
//! must not outlive it.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;
use std::mem::size_of;
use std::ptr::NonNull;

/// Default chunk size; large enough that a typical request (headers +
/// handful of small allocations) fits in one chunk.
const DEFAULT_CHUNK_SIZE: usize = 4096;

struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated with `layout` by `alloc` in `Chunk::new`
        // and is never freed anywhere else.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl Chunk {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, 16).expect("arena chunk layout");
        // SAFETY: layout has non-zero size (len > 0 is enforced by callers).
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, layout, len }
    }
}

/// A bump allocator bound to one request's lifetime.
///
/// Not `Sync`: an arena is used from exactly one reactor thread for the
/// duration of one request, matching the reactor's single-threaded
/// per-connection ownership model.
pub struct MonotonicArena {
    chunks: std::cell::RefCell<Vec<Chunk>>,
    /// Offset into the *last* chunk in `chunks`.
    offset: Cell<usize>,
    chunk_size: usize,
}

impl std::fmt::Debug for MonotonicArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicArena")
            .field("chunks", &self.chunks.borrow().len())
            .field("offset", &self.offset.get())
            .finish()
    }
}

impl Default for MonotonicArena {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicArena {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: std::cell::RefCell::new(Vec::new()),
            offset: Cell::new(0),
            chunk_size: chunk_size.max(size_of::<usize>()),
        }
    }

    /// Total bytes currently reserved across all chunks.
    pub fn reserved_bytes(&self) -> usize {
        self.chunks.borrow().iter().map(|c| c.len).sum()
    }

    /// Allocate space for one `T`, writing `value` into it, and return a
    /// mutable reference borrowed from the arena.
    pub fn alloc<T>(&self, value: T) -> &mut T {
        let layout = Layout::new::<T>();
        let ptr = self.alloc_layout(layout).cast::<T>();
        // SAFETY: `ptr` is valid for writes of `size_of::<T>()` bytes and
        // properly aligned per `alloc_layout`; nothing else observes this
        // memory until after the write completes.
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Copy a `&str` into the arena and return a borrowed `&str` slice.
    pub fn alloc_str<'a>(&'a self, s: &str) -> &'a str {
        let bytes = self.alloc_slice_copy(s.as_bytes());
        // SAFETY: `bytes` is a verbatim copy of a valid UTF-8 `&str`.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    /// Copy a byte slice into the arena.
    pub fn alloc_slice_copy<'a>(&'a self, src: &[u8]) -> &'a [u8] {
        if src.is_empty() {
            return &[];
        }
        let layout = Layout::array::<u8>(src.len()).expect("arena slice layout");
        let ptr = self.alloc_layout(layout);
        // SAFETY: `ptr` is valid for `src.len()` bytes per `alloc_layout`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            std::slice::from_raw_parts(ptr.as_ptr(), src.len())
        }
    }

    fn alloc_layout(&self, layout: Layout) -> NonNull<u8> {
        let mut chunks = self.chunks.borrow_mut();

        if let Some(chunk) = chunks.last() {
            let offset = self.offset.get();
            let base = chunk.ptr.as_ptr() as usize;
            let aligned = align_up(base + offset, layout.align()) - base;
            if aligned + layout.size() <= chunk.len {
                self.offset.set(aligned + layout.size());
                // SAFETY: `aligned` is within `[0, chunk.len)` and the
                // requested size fits before `chunk.len`, checked above.
                return unsafe { NonNull::new_unchecked(chunk.ptr.as_ptr().add(aligned)) };
            }
        }

        // Current chunk (if any) doesn't have room; grow.
        let needed = layout.size().max(layout.align());
        let new_len = self.chunk_size.max(needed.next_power_of_two());
        let chunk = Chunk::new(new_len);
        let base = chunk.ptr.as_ptr() as usize;
        let aligned = align_up(base, layout.align()) - base;
        debug_assert!(aligned + layout.size() <= chunk.len);
        self.offset.set(aligned + layout.size());
        chunks.push(chunk);
        // SAFETY: chunk was just allocated with room for `layout` at
        // `aligned`, verified above.
        unsafe { NonNull::new_unchecked(chunks.last().unwrap().ptr.as_ptr().add(aligned)) }
    }
}

fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumps_within_one_chunk() {
        let arena = MonotonicArena::new();
        let a = arena.alloc(1u32);
        let b = arena.alloc(2u32);
        assert_eq!(*a, 1);
        assert_eq!(*b, 2);
        assert_eq!(arena.reserved_bytes(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn grows_a_new_chunk_when_full() {
        let arena = MonotonicArena::with_chunk_size(64);
        for i in 0..100u32 {
            let v = arena.alloc(i);
            assert_eq!(*v, i);
        }
        assert!(arena.chunks.borrow().len() > 1);
    }

    #[test]
    fn alloc_str_round_trips() {
        let arena = MonotonicArena::new();
        let s = arena.alloc_str("hello world");
        assert_eq!(s, "hello world");
    }

    #[test]
    fn alloc_slice_copy_empty_is_static() {
        let arena = MonotonicArena::new();
        let s = arena.alloc_slice_copy(&[]);
        assert!(s.is_empty());
    }
}

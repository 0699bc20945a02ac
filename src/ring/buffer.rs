// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fixed-size, single-producer single-consumer bytes ring, backed by named
//! shared memory (§4.5, §3).
//!
//! Layout: four `u64` header words (`read_cursor`, `write_cursor`,
//! `read_index`, `write_index`) followed by `capacity` bytes of data.
//! Cursors are monotonic byte counters; indices are the corresponding
//! modulo-`capacity` positions. Only the producer advances
//! `write_cursor`/`write_index`; only the consumer advances
//! `read_cursor`/`read_index`. The cursor words are the linearization
//! point: the producer publishes with a `Release` store, the consumer
//! observes with an `Acquire` load, and that ordering alone is enough to
//! guarantee the consumer never observes a torn write — the data bytes
//! themselves need no atomics.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use shared_memory::{Shmem, ShmemConf};

const HEADER_WORDS: usize = 4;
const HEADER_LEN: usize = HEADER_WORDS * std::mem::size_of::<u64>();

#[repr(C)]
struct Header {
    read_cursor: AtomicU64,
    write_cursor: AtomicU64,
    read_index: AtomicU64,
    write_index: AtomicU64,
}

/// A lock-free single-producer single-consumer byte ring over a named
/// shared-memory segment.
///
/// # Safety / threading
/// At most one thread/process may call the producer methods
/// ([`RingBuffer::write`], [`RingBuffer::fill`], [`RingBuffer::commit_write`])
/// and at most one may call the consumer methods
/// ([`RingBuffer::read`], [`RingBuffer::peek`]) — this is a contract, not
/// something the type enforces, exactly as in the source design.
pub struct RingBuffer {
    shmem: Shmem,
    capacity: u64,
}

// Shmem's raw pointer is the only !Send/!Sync part, and it points at memory
// this type's own API already serializes correctly between a single
// producer and a single consumer (§5 "no locks; cursor ordering ...
// guarantee correctness").
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a new shared-memory segment of exactly
    /// `HEADER_LEN + capacity` bytes named `name`, zeroing the header. Fails
    /// if a segment with that name already exists.
    pub fn create(name: &str, capacity: u64) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(HEADER_LEN + capacity as usize)
            .flink(name)
            .create()
            .with_context(|| format!("failed to create shared ring {name:?}"))?;

        let ring = Self { shmem, capacity };
        let header = ring.header();
        header.read_cursor.store(0, Ordering::Relaxed);
        header.write_cursor.store(0, Ordering::Relaxed);
        header.read_index.store(0, Ordering::Relaxed);
        header.write_index.store(0, Ordering::Relaxed);
        Ok(ring)
    }

    /// Attaches to an existing shared-memory segment named `name`. Does
    /// *not* reinitialize the header — the creator's cursors are preserved.
    pub fn open(name: &str, capacity: u64) -> Result<Self> {
        let shmem = ShmemConf::new()
            .flink(name)
            .open()
            .with_context(|| format!("failed to open shared ring {name:?}"))?;

        if shmem.len() != HEADER_LEN + capacity as usize {
            bail!(
                "ring {name:?} size mismatch: expected {}, found {}",
                HEADER_LEN + capacity as usize,
                shmem.len()
            );
        }

        Ok(Self { shmem, capacity })
    }

    fn header(&self) -> &Header {
        // SAFETY: the segment is always at least HEADER_LEN bytes (enforced
        // at construction) and Header's layout is four naturally-aligned
        // AtomicU64 words.
        unsafe { &*(self.shmem.as_ptr() as *const Header) }
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: offset is within the segment by construction.
        unsafe { self.shmem.as_ptr().add(HEADER_LEN) }
    }

    /// Total data capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes available to read.
    pub fn readable(&self) -> u64 {
        let h = self.header();
        h.write_cursor.load(Ordering::Acquire) - h.read_cursor.load(Ordering::Relaxed)
    }

    /// Bytes available to write.
    pub fn writable(&self) -> u64 {
        let h = self.header();
        self.capacity
            - (h.write_cursor.load(Ordering::Relaxed) - h.read_cursor.load(Ordering::Acquire))
    }

    /// Copies `n` bytes into `src` at `write_index + offset` (mod
    /// capacity), without advancing the write cursor. Caller must have
    /// already checked enough capacity is reserved via [`Self::writable`].
    /// Used to stage a header then a body before a single [`Self::commit_write`].
    pub fn fill(&self, src: &[u8], offset: u64) {
        let h = self.header();
        let start = (h.write_index.load(Ordering::Relaxed) + offset) % self.capacity;
        self.copy_in(src, start);
    }

    /// Advances the write cursor/index by `n` bytes after one or more
    /// [`Self::fill`] calls. This store is the linearization point the
    /// consumer's `readable()`/`read()` observe.
    pub fn commit_write(&self, n: u64) {
        let h = self.header();
        let next_index = (h.write_index.load(Ordering::Relaxed) + n) % self.capacity;
        h.write_index.store(next_index, Ordering::Relaxed);
        h.write_cursor.fetch_add(n, Ordering::Release);
    }

    /// Writes `n` bytes from `src` (`src.len() == n`). Fails soft (returns
    /// `false`, writes nothing) if `n > writable()`.
    pub fn write(&self, src: &[u8]) -> bool {
        let n = src.len() as u64;
        if n > self.writable() {
            return false;
        }
        if n == 0 {
            return true;
        }
        self.fill(src, 0);
        self.commit_write(n);
        true
    }

    fn copy_in(&self, src: &[u8], start: u64) {
        let n = src.len() as u64;
        let data = self.data_ptr();
        let cap = self.capacity;
        let first_len = (cap - start).min(n);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(start as usize), first_len as usize);
            if first_len < n {
                let rest = n - first_len;
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first_len as usize),
                    data,
                    rest as usize,
                );
            }
        }
    }

    fn copy_out(&self, dst: &mut [u8], start: u64) {
        let n = dst.len() as u64;
        let data = self.data_ptr();
        let cap = self.capacity;
        let first_len = (cap - start).min(n);
        unsafe {
            std::ptr::copy_nonoverlapping(data.add(start as usize), dst.as_mut_ptr(), first_len as usize);
            if first_len < n {
                let rest = n - first_len;
                std::ptr::copy_nonoverlapping(
                    data,
                    dst.as_mut_ptr().add(first_len as usize),
                    rest as usize,
                );
            }
        }
    }

    /// Reads `dst.len()` bytes at `read_index + offset` (mod capacity)
    /// without advancing the read cursor.
    pub fn peek(&self, dst: &mut [u8], offset: u64) -> bool {
        let n = dst.len() as u64;
        if n > self.readable() {
            return false;
        }
        let h = self.header();
        let start = (h.read_index.load(Ordering::Relaxed) + offset) % self.capacity;
        self.copy_out(dst, start);
        true
    }

    /// Advances the read cursor/index by `n` bytes.
    pub fn commit_read(&self, n: u64) {
        let h = self.header();
        let next_index = (h.read_index.load(Ordering::Relaxed) + n) % self.capacity;
        h.read_index.store(next_index, Ordering::Relaxed);
        h.read_cursor.fetch_add(n, Ordering::Release);
    }

    /// Reads `dst.len()` bytes, advancing the read cursor. Fails soft
    /// (returns `false`, consumes nothing) if not enough data is
    /// available.
    pub fn read(&self, dst: &mut [u8]) -> bool {
        if !self.peek(dst, 0) {
            return false;
        }
        self.commit_read(dst.len() as u64);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!(
            "/gatemesh-ring-test-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        )
    }

    #[test]
    fn write_then_read_roundtrip() {
        let name = unique_name("basic");
        let ring = RingBuffer::create(&name, 64).expect("create");
        assert_eq!(ring.readable(), 0);
        assert_eq!(ring.writable(), 64);

        assert!(ring.write(b"hello"));
        assert_eq!(ring.readable(), 5);
        assert_eq!(ring.writable(), 59);

        let mut buf = [0u8; 5];
        assert!(ring.read(&mut buf));
        assert_eq!(&buf, b"hello");
        assert_eq!(ring.readable(), 0);
        assert_eq!(ring.writable(), 64);
    }

    #[test]
    fn write_fails_soft_when_over_capacity() {
        let name = unique_name("overflow");
        let ring = RingBuffer::create(&name, 8).expect("create");
        assert!(!ring.write(b"123456789"));
        assert_eq!(ring.readable(), 0);
    }

    #[test]
    fn exact_boundary_write_succeeds_one_byte_over_fails() {
        let name = unique_name("boundary");
        let ring = RingBuffer::create(&name, 16).expect("create");
        let exact = vec![0u8; 16];
        assert!(ring.write(&exact));
        let mut out = vec![0u8; 16];
        assert!(ring.read(&mut out));

        let over = vec![0u8; 17];
        assert!(!ring.write(&over));
    }

    #[test]
    fn wrap_around_scenario_from_spec() {
        // capacity 16: write 12 bytes {0..11}, read all 12, write 10 bytes
        // {12..21}; indices must have wrapped producer-side (write_index
        // crosses 16 -> 0).
        let name = unique_name("wrap");
        let ring = RingBuffer::create(&name, 16).expect("create");

        let first: Vec<u8> = (0..12).collect();
        assert!(ring.write(&first));
        let mut read_back = vec![0u8; 12];
        assert!(ring.read(&mut read_back));
        assert_eq!(read_back, first);

        let second: Vec<u8> = (12..22).collect();
        assert!(ring.write(&second));
        let mut read_back2 = vec![0u8; 10];
        assert!(ring.read(&mut read_back2));
        assert_eq!(read_back2, second);
    }

    #[test]
    fn fill_and_commit_stage_a_frame() {
        let name = unique_name("fill");
        let ring = RingBuffer::create(&name, 32).expect("create");
        let header = 4u32.to_le_bytes();
        let body = b"data";
        ring.fill(&header, 0);
        ring.fill(body, 4);
        ring.commit_write(8);

        let mut out = [0u8; 8];
        assert!(ring.read(&mut out));
        assert_eq!(&out[0..4], &header);
        assert_eq!(&out[4..8], body);
    }

    #[test]
    fn attach_by_name_shares_state() {
        let name = unique_name("attach");
        let producer = RingBuffer::create(&name, 32).expect("create");
        let consumer = RingBuffer::open(&name, 32).expect("open");

        assert!(producer.write(b"shared"));
        let mut out = [0u8; 6];
        assert!(consumer.read(&mut out));
        assert_eq!(&out, b"shared");
    }
}

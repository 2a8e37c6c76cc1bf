#![forbid(unsafe_code)]
//! First-fit chunk allocator over the segment's allocator space.
//!
//! Every byte of allocator space belongs to exactly one chunk, except a
//! prefix shorter than a chunk header that a split could not turn into a
//! chunk of its own (see [`AllocatorStats::lost`]). Chunks are threaded on
//! two address-ordered lists stored inside their headers: the list of all
//! chunks and the list of free chunks. No two free chunks are ever
//! memory-adjacent.
//!
//! Allocation scans the free list in address order and splits the first
//! chunk that can hold an aligned block. Remainders too small for a header
//! of their own are absorbed by the neighbouring chunk. Freeing marks the
//! chunk free, threads it back into the free list and merges it with free
//! neighbours.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::primitives::op::Op;
use crate::primitives::seg::{SegBytes, SegWrite, Segment, SEG_HDR_ALLOC, SEG_HDR_LEN};
use crate::primitives::tx::{Credit, Region, Tx};
use crate::types::{align_up, fatal, intact, Result, SegAddr, StoreError};

mod chunk;
mod header;
mod stats;

pub use chunk::{ChunkHeader, Links, ListKind, CHUNK_HDR_LEN, CHUNK_MAGIC0, CHUNK_MAGIC1};
pub use header::{AllocHeader, ListHead, ALLOC_HDR_LEN, ALLOC_MAGIC};
pub use stats::{AllocatorStats, CallStats};

/// Smallest supported alignment shift; payload sizes are rounded to it.
pub const ALLOC_SHIFT_MIN: u32 = 3;
/// Largest supported alignment shift.
pub const ALLOC_SHIFT_MAX: u32 = 24;

/// Allocator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorOptions {
    /// Walk both lists before and after every call.
    pub check_invariants: bool,
    /// Requests up to this size are counted in the small call class.
    pub stats_boundary: u64,
    /// Emit a stats snapshot every this many calls; zero disables it.
    pub stats_print_interval: u64,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            check_invariants: cfg!(debug_assertions),
            stats_boundary: 512,
            stats_print_interval: 100_000,
        }
    }
}

/// Allocator operation kinds for credit calculation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocOp {
    /// [`Allocator::create`].
    Create,
    /// [`Allocator::destroy`].
    Destroy,
    /// [`Allocator::alloc_aligned`].
    Alloc,
    /// [`Allocator::free_aligned`].
    Free,
}

/// Region occupied by the allocator header inside the segment header.
pub fn header_region() -> Region {
    Region::new(SegAddr(SEG_HDR_ALLOC.start as u64), ALLOC_HDR_LEN)
}

/// Chunk allocator bound to one segment.
pub struct Allocator {
    seg: Arc<Segment>,
    options: AllocatorOptions,
    /// Serialises every call; counts calls since the last stats print.
    lock: Mutex<u64>,
}

impl Allocator {
    /// Binds an allocator handle to `seg`. Does not touch the segment.
    pub fn init(seg: Arc<Segment>, options: AllocatorOptions) -> Self {
        Self {
            seg,
            options,
            lock: Mutex::new(0),
        }
    }

    /// Releases the handle.
    pub fn fini(self) {
        tracing::trace!(target: "segstore::alloc", "allocator handle released");
    }

    /// Segment the allocator lives in.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.seg
    }

    /// Options in effect.
    pub fn options(&self) -> &AllocatorOptions {
        &self.options
    }

    /// Reports whether the segment carries a created allocator.
    pub fn is_created(&self) -> bool {
        let pin = self.seg.pin_read();
        AllocHeader::is_created(pin.bytes(header_region().addr, ALLOC_HDR_LEN))
    }

    /// Credit needed by one call of `op` for a `size`-byte block aligned to `1 << shift`.
    ///
    /// Any accepted alignment costs the same: it only moves where the block
    /// lands inside a free chunk. A shift above [`ALLOC_SHIFT_MAX`] is
    /// rejected before anything is touched and needs no credit. `shift` is
    /// ignored for every op but [`AllocOp::Alloc`].
    pub fn credit(op: AllocOp, size: u64, shift: u32) -> Credit {
        let chunk = Credit::region(CHUNK_HDR_LEN);
        let head = Credit::region(ALLOC_HDR_LEN);
        match op {
            AllocOp::Create | AllocOp::Destroy => chunk + head,
            AllocOp::Alloc if shift > ALLOC_SHIFT_MAX => Credit::ZERO,
            AllocOp::Alloc => {
                let payload = align_up(size.max(1), ALLOC_SHIFT_MIN) + CHUNK_HDR_LEN;
                (chunk * 7) + head + Credit::region(payload)
            }
            AllocOp::Free => (chunk * 8) + head,
        }
    }

    /// Creates the allocator: one free chunk spanning the whole space.
    pub fn create(&self, tx: Option<&Tx>) -> Op<()> {
        Op::run("alloc.create", || {
            let _guard = self.lock.lock();
            let space_addr = SegAddr(SEG_HDR_LEN as u64);
            let space_size = self.seg.size() - SEG_HDR_LEN as u64;
            if space_size <= CHUNK_HDR_LEN {
                return Err(StoreError::Invalid("segment too small for allocator"));
            }
            let mut pin = self.seg.pin_write();
            if AllocHeader::is_created(pin.bytes(header_region().addr, ALLOC_HDR_LEN)) {
                drop(pin);
                fatal("allocator created twice");
            }
            let mut ctx = Ctx::new(&mut pin, AllocHeader::new(space_addr, space_size));
            ctx.add_after(None, space_addr, space_size - CHUNK_HDR_LEN, true);
            ctx.commit(tx);
            drop(pin);
            tracing::debug!(
                target: "segstore::alloc",
                space_addr = %space_addr,
                space_size,
                "allocator created"
            );
            self.post_check();
            Ok(())
        })
    }

    /// Destroys the allocator; exactly one free chunk must remain.
    pub fn destroy(&self, tx: Option<&Tx>) -> Op<()> {
        Op::run("alloc.destroy", || {
            let _guard = self.lock.lock();
            self.pre_check();
            let mut pin = self.seg.pin_write();
            let header = load_header(&pin);
            if header.chunks_nr != 1 || header.free_chunks_nr != 1 {
                drop(pin);
                fatal("allocator destroyed with live allocations");
            }
            pin.zero(header_region().addr, ALLOC_HDR_LEN);
            drop(pin);
            if let Some(tx) = tx {
                tx.capture(header_region());
            }
            tracing::debug!(target: "segstore::alloc", "allocator destroyed");
            Ok(())
        })
    }

    /// Allocates `size` bytes whose address is a multiple of `1 << shift`.
    ///
    /// With a transaction the payload is zeroed and captured.
    pub fn alloc_aligned(&self, tx: Option<&Tx>, size: u64, shift: u32) -> Op<SegAddr> {
        Op::run("alloc.alloc", || {
            if shift > ALLOC_SHIFT_MAX {
                return Err(StoreError::Invalid("alignment shift too large"));
            }
            if size > self.seg.size() {
                return Err(StoreError::NoSpace { requested: size });
            }
            let shift = shift.max(ALLOC_SHIFT_MIN);
            let size = align_up(size.max(1), ALLOC_SHIFT_MIN);
            let mut calls = self.lock.lock();
            self.pre_check();
            let mut pin = self.seg.pin_write();
            let header = load_header(&pin);
            let mut ctx = Ctx::new(&mut pin, header);

            let mut iter_nr = 0u64;
            let mut found = None;
            let mut cursor = ctx.hdr.free_list.head;
            while let Some(addr) = cursor {
                iter_nr += 1;
                let c = ctx.get(addr);
                let mem = align_up(c.payload().get(), shift);
                if mem + size <= c.end() {
                    found = Some(ctx.split(addr, SegAddr(mem - CHUNK_HDR_LEN), size));
                    break;
                }
                cursor = c.free_links.next;
            }

            let boundary = self.options.stats_boundary;
            let outcome = match found {
                Some(new) => {
                    let chunk = ctx.get(new);
                    ctx.stats_class(size, boundary).record_alloc(chunk.size);
                    ctx.hdr.total.record_alloc(chunk.size);
                    ctx.commit(tx);
                    if let Some(tx) = tx {
                        pin.zero(chunk.payload(), chunk.size);
                        tx.capture(Region::new(chunk.payload(), chunk.size));
                    }
                    tracing::debug!(
                        target: "segstore::alloc",
                        size,
                        shift,
                        iter_nr,
                        ptr = %chunk.payload(),
                        chunk_size = chunk.size,
                        "alloc"
                    );
                    Ok(chunk.payload())
                }
                None => {
                    ctx.stats_class(size, boundary).record_failure(size);
                    ctx.hdr.total.record_failure(size);
                    ctx.commit(tx);
                    tracing::warn!(target: "segstore::alloc", size, shift, iter_nr, "allocator out of space");
                    Err(StoreError::NoSpace { requested: size })
                }
            };
            drop(pin);
            if outcome.is_err() {
                self.stats_locked().emit_tracing();
            }
            self.tick(&mut calls);
            self.post_check();
            outcome
        })
    }

    /// Allocates `size` bytes with the minimum alignment.
    pub fn alloc(&self, tx: Option<&Tx>, size: u64) -> Op<SegAddr> {
        self.alloc_aligned(tx, size, ALLOC_SHIFT_MIN)
    }

    /// Returns the block at `ptr` to the allocator. `None` is a no-op.
    ///
    /// Freeing a pointer that does not designate an allocated block is fatal.
    pub fn free_aligned(&self, tx: Option<&Tx>, ptr: Option<SegAddr>) -> Op<()> {
        Op::run("alloc.free", || {
            let Some(ptr) = ptr else {
                return Ok(());
            };
            let mut calls = self.lock.lock();
            self.pre_check();
            let mut pin = self.seg.pin_write();
            let header = load_header(&pin);
            if ptr.get() < header.space_addr.get() + CHUNK_HDR_LEN || ptr.get() >= header.space_end() {
                drop(pin);
                fatal("free of a pointer outside allocator space");
            }
            let mut ctx = Ctx::new(&mut pin, header);
            let addr = SegAddr(ptr.get() - CHUNK_HDR_LEN);
            let c = ctx.get(addr);
            if c.free {
                drop(ctx);
                drop(pin);
                fatal("double free");
            }
            let size = c.size;
            ctx.account_remove(&c);
            ctx.update(addr, |c| c.free = true);
            let freed = ctx.get(addr);
            ctx.account_add(&freed);
            ctx.free_list_insert(addr);
            let boundary = self.options.stats_boundary;
            ctx.stats_class(size, boundary).record_free(size);
            ctx.hdr.total.record_free(size);

            let merged = match c.all.prev {
                Some(prev) if ctx.try_merge(prev, addr) => prev,
                _ => addr,
            };
            if let Some(next) = ctx.get(merged).all.next {
                ctx.try_merge(merged, next);
            }
            ctx.commit(tx);
            drop(pin);
            tracing::debug!(target: "segstore::alloc", ptr = %ptr, size, "free");
            self.tick(&mut calls);
            self.post_check();
            Ok(())
        })
    }

    /// Frees `ptr`; see [`Allocator::free_aligned`].
    pub fn free(&self, tx: Option<&Tx>, ptr: Option<SegAddr>) -> Op<()> {
        self.free_aligned(tx, ptr)
    }

    /// Payload size of the allocated block at `ptr`.
    pub fn payload_size(&self, ptr: SegAddr) -> Result<u64> {
        let _guard = self.lock.lock();
        let pin = self.seg.pin_read();
        if ptr.get() < SEG_HDR_LEN as u64 + CHUNK_HDR_LEN || !self.seg.contains(ptr, 0) {
            return Err(StoreError::Invalid("pointer outside allocator space"));
        }
        let addr = SegAddr(ptr.get() - CHUNK_HDR_LEN);
        let chunk = ChunkHeader::decode(addr, pin.bytes(addr, CHUNK_HDR_LEN))?;
        if chunk.free {
            return Err(StoreError::Invalid("pointer designates a free chunk"));
        }
        Ok(chunk.size)
    }

    /// Current usage and call counters.
    pub fn stats(&self) -> AllocatorStats {
        let _guard = self.lock.lock();
        self.stats_locked()
    }

    /// Walks both lists and reports the first violated invariant.
    pub fn check(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let pin = self.seg.pin_read();
        check_space(&pin)
    }

    fn stats_locked(&self) -> AllocatorStats {
        let pin = self.seg.pin_read();
        let header = load_header(&pin);
        AllocatorStats {
            space_size: header.space_size,
            chunk_overhead: CHUNK_HDR_LEN,
            chunks_nr: header.chunks_nr,
            free_chunks_nr: header.free_chunks_nr,
            used: header.used,
            free: header.free,
            lost: header.lost,
            stats_boundary: self.options.stats_boundary,
            total: header.total,
            small: header.small,
            large: header.large,
        }
    }

    fn tick(&self, calls: &mut u64) {
        *calls += 1;
        let interval = self.options.stats_print_interval;
        if interval != 0 && *calls >= interval {
            *calls = 0;
            self.stats_locked().emit_tracing();
        }
    }

    fn pre_check(&self) {
        if self.options.check_invariants {
            let pin = self.seg.pin_read();
            intact(check_space(&pin), "allocator invariant violated on entry");
        }
    }

    fn post_check(&self) {
        if self.options.check_invariants {
            let pin = self.seg.pin_read();
            intact(check_space(&pin), "allocator invariant violated on exit");
        }
    }
}

fn load_header<P: SegBytes>(pin: &P) -> AllocHeader {
    let region = header_region();
    intact(
        AllocHeader::decode(pin.bytes_at(region.addr, region.len)),
        "allocator header damaged",
    )
}

/// Per-call working set: decoded headers plus the set of headers to write back.
struct Ctx<'p, 'a> {
    pin: &'p mut SegWrite<'a>,
    hdr: AllocHeader,
    chunks: BTreeMap<SegAddr, ChunkHeader>,
    dirty: BTreeSet<SegAddr>,
}

impl<'p, 'a> Ctx<'p, 'a> {
    fn new(pin: &'p mut SegWrite<'a>, hdr: AllocHeader) -> Self {
        Self {
            pin,
            hdr,
            chunks: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    fn get(&mut self, addr: SegAddr) -> ChunkHeader {
        if let Some(chunk) = self.chunks.get(&addr) {
            return *chunk;
        }
        if addr.get() < self.hdr.space_addr.get() || addr.get() + CHUNK_HDR_LEN > self.hdr.space_end() {
            fatal("chunk address outside allocator space");
        }
        let chunk = intact(
            ChunkHeader::decode(addr, self.pin.bytes(addr, CHUNK_HDR_LEN)),
            "chunk header damaged",
        );
        self.chunks.insert(addr, chunk);
        chunk
    }

    fn update(&mut self, addr: SegAddr, f: impl FnOnce(&mut ChunkHeader)) {
        let mut chunk = self.get(addr);
        f(&mut chunk);
        self.chunks.insert(addr, chunk);
        self.dirty.insert(addr);
    }

    fn put(&mut self, chunk: ChunkHeader) {
        self.chunks.insert(chunk.addr, chunk);
        self.dirty.insert(chunk.addr);
    }

    fn forget(&mut self, addr: SegAddr) {
        self.chunks.remove(&addr);
        self.dirty.remove(&addr);
    }

    fn stats_class(&mut self, size: u64, boundary: u64) -> &mut CallStats {
        if size <= boundary {
            &mut self.hdr.small
        } else {
            &mut self.hdr.large
        }
    }

    fn account_add(&mut self, c: &ChunkHeader) {
        self.hdr.chunks_nr += 1;
        if c.free {
            self.hdr.free_chunks_nr += 1;
            self.hdr.free += c.size;
        } else {
            self.hdr.used += c.size;
        }
    }

    fn account_remove(&mut self, c: &ChunkHeader) {
        self.hdr.chunks_nr -= 1;
        if c.free {
            self.hdr.free_chunks_nr -= 1;
            self.hdr.free -= c.size;
        } else {
            self.hdr.used -= c.size;
        }
    }

    /// Links `addr` into `kind` right after `after`, or at the head.
    fn list_insert_after(&mut self, kind: ListKind, after: Option<SegAddr>, addr: SegAddr) {
        let next = match after {
            Some(a) => self.get(a).links(kind).next,
            None => self.hdr.list(kind).head,
        };
        self.update(addr, |c| *c.links_mut(kind) = Links { prev: after, next });
        match after {
            Some(a) => self.update(a, |c| c.links_mut(kind).next = Some(addr)),
            None => self.hdr.list_mut(kind).head = Some(addr),
        }
        match next {
            Some(n) => self.update(n, |c| c.links_mut(kind).prev = Some(addr)),
            None => self.hdr.list_mut(kind).tail = Some(addr),
        }
    }

    /// Links `addr` into `kind` right before `before`, or at the tail.
    fn list_insert_before(&mut self, kind: ListKind, before: Option<SegAddr>, addr: SegAddr) {
        let prev = match before {
            Some(b) => self.get(b).links(kind).prev,
            None => self.hdr.list(kind).tail,
        };
        self.list_insert_after(kind, prev, addr);
    }

    fn list_remove(&mut self, kind: ListKind, addr: SegAddr) {
        let Links { prev, next } = self.get(addr).links(kind);
        match prev {
            Some(p) => self.update(p, |c| c.links_mut(kind).next = next),
            None => self.hdr.list_mut(kind).head = next,
        }
        match next {
            Some(n) => self.update(n, |c| c.links_mut(kind).prev = prev),
            None => self.hdr.list_mut(kind).tail = prev,
        }
        self.update(addr, |c| *c.links_mut(kind) = Links::default());
    }

    /// Threads a free chunk into the free list before the first free chunk
    /// that follows it in memory, or at the tail.
    fn free_list_insert(&mut self, addr: SegAddr) {
        let mut cursor = self.get(addr).all.next;
        while let Some(next) = cursor {
            let chunk = self.get(next);
            if chunk.free {
                break;
            }
            cursor = chunk.all.next;
        }
        self.list_insert_before(ListKind::Free, cursor, addr);
    }

    /// Creates a chunk at `addr` and links it after `after` in the all list.
    fn add_after(&mut self, after: Option<SegAddr>, addr: SegAddr, size: u64, free: bool) {
        let chunk = ChunkHeader::new(addr, size, free);
        self.put(chunk);
        self.account_add(&chunk);
        self.list_insert_after(ListKind::All, after, addr);
        if free {
            self.free_list_insert(addr);
        }
    }

    /// Unlinks a chunk from both lists and drops its header.
    fn del_fini(&mut self, addr: SegAddr) {
        let chunk = self.get(addr);
        if chunk.free {
            self.list_remove(ListKind::Free, addr);
        }
        self.list_remove(ListKind::All, addr);
        self.account_remove(&chunk);
        self.forget(addr);
    }

    fn grow(&mut self, addr: SegAddr, delta: u64) {
        let chunk = self.get(addr);
        self.account_remove(&chunk);
        self.update(addr, |c| c.size += delta);
        let grown = self.get(addr);
        self.account_add(&grown);
    }

    /// Carves an allocated chunk with header at `start_new` and `size`
    /// payload bytes out of free chunk `addr`. Returns the new chunk.
    fn split(&mut self, addr: SegAddr, start_new: SegAddr, size: u64) -> SegAddr {
        let c = self.get(addr);
        let prev = c.all.prev;
        let start0 = match prev {
            Some(p) => self.get(p).end(),
            None => self.hdr.space_addr.get(),
        };
        let start1 = start_new.get() + CHUNK_HDR_LEN + size;
        let start_next = c.end();
        if !(start0 <= start_new.get() && start_new.get() <= start1 && start1 <= start_next) {
            fatal("chunk split bounds out of order");
        }
        let chunk0 = start_new.get() - start0;
        let chunk1 = start_next - start1;

        self.del_fini(addr);

        let mut left = prev;
        if chunk0 <= CHUNK_HDR_LEN {
            if let Some(p) = prev {
                self.grow(p, chunk0);
            }
        } else {
            let addr0 = SegAddr(start0);
            self.add_after(prev, addr0, chunk0 - CHUNK_HDR_LEN, true);
            left = Some(addr0);
        }

        self.add_after(left, start_new, size, false);

        if chunk1 <= CHUNK_HDR_LEN {
            self.grow(start_new, chunk1);
        } else {
            self.add_after(Some(start_new), SegAddr(start1), chunk1 - CHUNK_HDR_LEN, true);
        }
        start_new
    }

    /// Merges `y` into `x` when both are free and memory-adjacent.
    fn try_merge(&mut self, x: SegAddr, y: SegAddr) -> bool {
        let cx = self.get(x);
        let cy = self.get(y);
        if !cx.free || !cy.free {
            return false;
        }
        if cx.end() != y.get() {
            fatal("merging chunks that are not adjacent");
        }
        self.del_fini(y);
        self.grow(x, CHUNK_HDR_LEN + cy.size);
        true
    }

    /// Writes back every touched header plus the allocator header and
    /// captures each once.
    fn commit(&mut self, tx: Option<&Tx>) {
        self.hdr.lost = match self.hdr.all.head {
            Some(head) => head.get() - self.hdr.space_addr.get(),
            None => self.hdr.space_size,
        };
        for addr in &self.dirty {
            if let Some(chunk) = self.chunks.get(addr) {
                chunk.encode(self.pin.bytes_mut(*addr, CHUNK_HDR_LEN));
            }
        }
        let region = header_region();
        self.hdr.encode(self.pin.bytes_mut(region.addr, region.len));
        if let Some(tx) = tx {
            for addr in &self.dirty {
                tx.capture(Region::new(*addr, CHUNK_HDR_LEN));
            }
            tx.capture(region);
        }
        self.dirty.clear();
    }
}

/// Full structural check of allocator space.
pub(crate) fn check_space<P: SegBytes>(pin: &P) -> Result<()> {
    let region = header_region();
    let hdr = AllocHeader::decode(pin.bytes_at(region.addr, region.len))?;
    let space_start = hdr.space_addr.get();
    let space_end = hdr.space_end();
    let limit = hdr.space_size / CHUNK_HDR_LEN + 1;
    let load = |addr: SegAddr| -> Result<ChunkHeader> {
        if addr.get() < space_start || addr.get() + CHUNK_HDR_LEN > space_end {
            return Err(StoreError::Corruption("chunk outside allocator space"));
        }
        ChunkHeader::decode(addr, pin.bytes_at(addr, CHUNK_HDR_LEN))
    };

    let (mut chunks_nr, mut free_nr, mut used, mut free) = (0u64, 0u64, 0u64, 0u64);
    let mut expected_addr = match hdr.all.head {
        Some(head) => head.get(),
        None => return Err(StoreError::Corruption("allocator has no chunks")),
    };
    let lost = expected_addr - space_start;
    if lost > CHUNK_HDR_LEN || lost != hdr.lost {
        return Err(StoreError::Corruption("allocator lost prefix inconsistent"));
    }
    let mut prev: Option<ChunkHeader> = None;
    let mut cursor = hdr.all.head;
    while let Some(addr) = cursor {
        if chunks_nr >= limit {
            return Err(StoreError::Corruption("all-chunks list does not terminate"));
        }
        let c = load(addr)?;
        if addr.get() != expected_addr {
            return Err(StoreError::Corruption("chunks are not contiguous"));
        }
        if c.end() > space_end {
            return Err(StoreError::Corruption("chunk extends past allocator space"));
        }
        if c.all.prev != prev.map(|p| p.addr) {
            return Err(StoreError::Corruption("all-chunks back link mismatch"));
        }
        if let Some(p) = prev {
            if p.free && c.free {
                return Err(StoreError::Corruption("adjacent free chunks"));
            }
        }
        chunks_nr += 1;
        if c.free {
            free_nr += 1;
            free += c.size;
        } else {
            used += c.size;
        }
        expected_addr = c.end();
        cursor = c.all.next;
        prev = Some(c);
    }
    if prev.map(|p| p.addr) != hdr.all.tail {
        return Err(StoreError::Corruption("all-chunks tail mismatch"));
    }
    if expected_addr != space_end {
        return Err(StoreError::Corruption("chunks do not cover allocator space"));
    }

    let mut prev_free: Option<SegAddr> = None;
    let mut listed = 0u64;
    let mut cursor = hdr.free_list.head;
    while let Some(addr) = cursor {
        if listed >= limit {
            return Err(StoreError::Corruption("free list does not terminate"));
        }
        let c = load(addr)?;
        if !c.free {
            return Err(StoreError::Corruption("allocated chunk on free list"));
        }
        if c.free_links.prev != prev_free {
            return Err(StoreError::Corruption("free list back link mismatch"));
        }
        if let Some(p) = prev_free {
            if p >= addr {
                return Err(StoreError::Corruption("free list not address ordered"));
            }
        }
        listed += 1;
        prev_free = Some(addr);
        cursor = c.free_links.next;
    }
    if prev_free != hdr.free_list.tail {
        return Err(StoreError::Corruption("free list tail mismatch"));
    }
    if listed != free_nr {
        return Err(StoreError::Corruption("free chunk missing from free list"));
    }
    if chunks_nr != hdr.chunks_nr
        || free_nr != hdr.free_chunks_nr
        || used != hdr.used
        || free != hdr.free
    {
        return Err(StoreError::Corruption("allocator counters out of date"));
    }
    if used + free + chunks_nr * CHUNK_HDR_LEN + lost != hdr.space_size {
        return Err(StoreError::Corruption("allocator space not fully accounted"));
    }
    Ok(())
}

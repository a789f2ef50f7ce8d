//! Fixed-capacity packet buffer pool.
//!
//! A [`Mempool`] owns `capacity` equally sized buffers carved out of one
//! contiguous allocation. Free buffer indexes live in a lock-free
//! `ArrayQueue`, so any number of polling contexts may allocate and free
//! concurrently; a [`MempoolCache`] stages indexes locally to keep those
//! contexts off the shared queue. Staged indexes stay reachable: once the
//! shared queue runs dry, allocation takes them from the caches, so the
//! pool only reports exhaustion when no buffer is free anywhere.
//!
//! Every allocated buffer is represented by exactly one [`Mbuf`]. The
//! handle is move-only and returns its slot to the pool when dropped, so a
//! buffer is reclaimed exactly once by construction. The slot state is
//! still tracked at runtime and a second reclaim of the same slot panics.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam::queue::ArrayQueue;
use triomphe::Arc;

use crate::api::PortId;
use crate::api::hint::unlikely;
use crate::errors::Error;

/// Bytes reserved in front of the packet data of every buffer.
pub const PKTMBUF_HEADROOM: u16 = 128;
pub const MBUF_DEFAULT_DATAROOM: u16 = 2048;
/// Default total buffer size: data room plus headroom.
pub const MBUF_DEFAULT_BUF_SIZE: u16 = MBUF_DEFAULT_DATAROOM + PKTMBUF_HEADROOM;
/// Default number of buffers provisioned per port.
pub const NUM_MBUFS: u32 = 8191;
pub const MBUF_CACHE_SIZE: u32 = 250;
pub const MEMPOOL_CACHE_MAX_SIZE: usize = 512;

const SLOT_FREE: u8 = 0;
const SLOT_ALLOCATED: u8 = 1;

/// Sizing of the process-wide pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConf {
    pub mbufs_per_port: u32,
    pub cache_size: u32,
    /// Total size of each buffer, headroom included.
    pub buf_size: u16,
}

impl Default for PoolConf {
    fn default() -> Self {
        Self {
            mbufs_per_port: NUM_MBUFS,
            cache_size: MBUF_CACHE_SIZE,
            buf_size: MBUF_DEFAULT_BUF_SIZE,
        }
    }
}

impl PoolConf {
    /// Pool capacity for `nb_ports` ports, `None` on overflow.
    pub fn capacity(&self, nb_ports: usize) -> Option<usize> {
        (self.mbufs_per_port as usize).checked_mul(nb_ports)
    }
}

fn flush_threshold(cache_size: usize) -> usize {
    cache_size * 3 / 2
}

#[derive(Clone, Copy, Debug)]
struct MbufHdr {
    data_off: u16,
    data_len: u16,
    pkt_len: u32,
    port: Option<PortId>,
}

impl MbufHdr {
    const fn reset(headroom: u16) -> Self {
        Self {
            data_off: headroom,
            data_len: 0,
            pkt_len: 0,
            port: None,
        }
    }
}

struct Slot {
    state: AtomicU8,
    hdr: UnsafeCell<MbufHdr>,
}

struct RawMempool {
    name: String,
    buf_len: u16,
    headroom: u16,
    cache_size: usize,
    slots: Box<[Slot]>,
    storage: NonNull<u8>,
    storage_len: usize,
    ring: ArrayQueue<u32>,
    /// Staging queues of the live caches.
    stages: Mutex<Vec<Arc<ArrayQueue<u32>>>>,
    in_use: AtomicUsize,
}

// SAFETY: a slot's header and data bytes are only touched through the one
// `Mbuf` that owns the slot, and ownership moves between contexts through
// the atomic slot state and the lock-free ring.
unsafe impl Send for RawMempool {}
unsafe impl Sync for RawMempool {}

impl RawMempool {
    fn new(name: &str, nb_bufs: usize, cache_size: usize, buf_len: u16) -> Result<Self, Error> {
        let fail = |reason: String| Error::PoolCreate {
            name: name.to_string(),
            reason,
        };
        if nb_bufs == 0 {
            return Err(fail("pool must hold at least one buffer".into()));
        }
        if nb_bufs > u32::MAX as usize {
            return Err(fail(format!("{nb_bufs} buffers exceed the index space")));
        }
        if cache_size > MEMPOOL_CACHE_MAX_SIZE || flush_threshold(cache_size) > nb_bufs {
            return Err(fail(format!(
                "cache size {cache_size} is invalid for {nb_bufs} buffers"
            )));
        }
        if buf_len <= PKTMBUF_HEADROOM {
            return Err(fail(format!(
                "buffer size {buf_len} leaves no room after {PKTMBUF_HEADROOM} bytes of headroom"
            )));
        }

        let storage_len = nb_bufs
            .checked_mul(usize::from(buf_len))
            .ok_or_else(|| fail("buffer storage size overflows".into()))?;
        let mut bytes: Vec<u8> = Vec::new();
        bytes
            .try_reserve_exact(storage_len)
            .map_err(|e| fail(format!("cannot reserve {storage_len} bytes: {e}")))?;
        bytes.resize(storage_len, 0);
        let raw = Box::into_raw(bytes.into_boxed_slice());
        // SAFETY: `Box::into_raw` never returns null.
        let storage = unsafe { NonNull::new_unchecked(raw as *mut u8) };

        let mut slots = Vec::with_capacity(nb_bufs);
        for _ in 0..nb_bufs {
            slots.push(Slot {
                state: AtomicU8::new(SLOT_FREE),
                hdr: UnsafeCell::new(MbufHdr::reset(PKTMBUF_HEADROOM)),
            });
        }

        let ring = ArrayQueue::new(nb_bufs);
        for i in 0..nb_bufs as u32 {
            if ring.push(i).is_err() {
                unreachable!("free ring sized for every slot");
            }
        }

        Ok(Self {
            name: name.to_string(),
            buf_len,
            headroom: PKTMBUF_HEADROOM,
            cache_size,
            slots: slots.into_boxed_slice(),
            storage,
            storage_len,
            ring,
            stages: Mutex::new(Vec::new()),
            in_use: AtomicUsize::new(0),
        })
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Marks a free index as owned by a new handle.
    fn claim(&self, idx: u32) {
        let slot = &self.slots[idx as usize];
        let prev = slot.state.swap(SLOT_ALLOCATED, Ordering::Acquire);
        if unlikely(prev != SLOT_FREE) {
            panic!(
                "mempool {}: buffer {idx} handed out while already allocated",
                self.name
            );
        }
        // SAFETY: the swap above made this context the only owner of the slot.
        unsafe { *slot.hdr.get() = MbufHdr::reset(self.headroom) };
        self.in_use.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks an allocated index as free. The index must then go back to the
    /// ring or to a cache.
    fn reclaim(&self, idx: u32) {
        let prev = self.slots[idx as usize]
            .state
            .swap(SLOT_FREE, Ordering::Release);
        if unlikely(prev != SLOT_ALLOCATED) {
            panic!("mempool {}: double free of buffer {idx}", self.name);
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Pops a free index from the ring, or from a cache once the ring is
    /// empty.
    fn take(&self) -> Option<u32> {
        match self.ring.pop() {
            Some(idx) => Some(idx),
            None => self.steal(),
        }
    }

    #[cold]
    fn steal(&self) -> Option<u32> {
        let stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        stages.iter().find_map(|stage| stage.pop())
    }

    fn attach(&self, stage: Arc<ArrayQueue<u32>>) {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stage);
    }

    fn detach(&self, stage: &Arc<ArrayQueue<u32>>) {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| !Arc::ptr_eq(s, stage));
    }

    fn put(&self, idx: u32) {
        self.reclaim(idx);
        self.enqueue(idx);
    }

    fn enqueue(&self, idx: u32) {
        if self.ring.push(idx).is_err() {
            unreachable!("mempool {}: free ring overflow", self.name);
        }
    }

    /// # Safety
    ///
    /// The caller must own slot `idx`.
    unsafe fn buf_ptr(&self, idx: u32) -> *mut u8 {
        // SAFETY: `idx` indexes a slot, so the offset stays inside `storage`.
        unsafe {
            self.storage
                .as_ptr()
                .add(idx as usize * usize::from(self.buf_len))
        }
    }
}

impl Drop for RawMempool {
    fn drop(&mut self) {
        let raw = ptr::slice_from_raw_parts_mut(self.storage.as_ptr(), self.storage_len);
        // SAFETY: `storage` came from `Box::into_raw` on a boxed slice of
        // exactly `storage_len` bytes, and no `Mbuf` outlives the pool since
        // each one holds a strong reference to it.
        unsafe { drop(Box::from_raw(raw)) };
    }
}

/// Shared handle to a pool of packet buffers. Cloning is cheap and every
/// clone refers to the same buffers.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<RawMempool>,
}

impl Mempool {
    /// Creates a pool of `nb_bufs` buffers of `buf_size` bytes each, with a
    /// staging cache of `cache_size` entries for every [`MempoolCache`].
    ///
    /// Capacity and cache size are fixed for the life of the pool.
    pub fn create(name: &str, nb_bufs: usize, cache_size: usize, buf_size: u16) -> crate::api::Result<Self> {
        let inner = RawMempool::new(name, nb_bufs, cache_size, buf_size)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Creates the pool described by `conf` for `nb_ports` ports.
    pub fn from_conf(name: &str, conf: &PoolConf, nb_ports: usize) -> crate::api::Result<Self> {
        let nb_bufs = conf.capacity(nb_ports).ok_or_else(|| Error::PoolCreate {
            name: name.to_string(),
            reason: format!(
                "{} buffers per port for {nb_ports} ports overflows",
                conf.mbufs_per_port
            ),
        })?;
        Self::create(name, nb_bufs, conf.cache_size as usize, conf.buf_size)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Buffers currently owned by some [`Mbuf`].
    pub fn in_use_count(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }

    /// Buffers not owned by any [`Mbuf`], whether on the shared ring or
    /// staged in a cache. Always `capacity() - in_use_count()`.
    pub fn avail_count(&self) -> usize {
        self.capacity() - self.in_use_count()
    }

    /// Free buffers on the shared ring, excluding those staged in caches.
    pub fn ring_count(&self) -> usize {
        self.inner.ring.len()
    }

    pub fn cache_size(&self) -> usize {
        self.inner.cache_size
    }

    /// Total bytes per buffer, headroom included.
    pub fn buf_len(&self) -> u16 {
        self.inner.buf_len
    }

    /// Bytes available for packet data after the headroom.
    pub fn data_room(&self) -> u16 {
        self.inner.buf_len - self.inner.headroom
    }

    pub fn ptr_eq(&self, other: &Mempool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Takes a free buffer, or `None` when the pool is exhausted. Never
    /// blocks. Buffers staged in caches are handed out once the shared ring
    /// is empty.
    pub fn alloc(&self) -> Option<Mbuf> {
        let idx = self.inner.take()?;
        self.inner.claim(idx);
        Some(Mbuf {
            pool: self.inner.clone(),
            idx,
        })
    }

    /// Returns `m` to this pool.
    ///
    /// # Panics
    ///
    /// Panics if `m` was allocated from another pool.
    pub fn release(&self, m: Mbuf) {
        if unlikely(!m.belongs_to(self)) {
            panic!(
                "buffer {} of mempool {} does not belong to mempool {}",
                m.idx, m.pool.name, self.inner.name
            );
        }
        drop(m);
    }

    /// Opens a staging cache for one polling context.
    pub fn cache(&self) -> MempoolCache {
        MempoolCache::new(self.clone())
    }
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("name", &self.inner.name)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use_count())
            .field("buf_len", &self.inner.buf_len)
            .field("cache_size", &self.inner.cache_size)
            .finish()
    }
}

/// Exclusive handle to one allocated packet buffer.
///
/// Dropping the handle returns the buffer to its pool.
pub struct Mbuf {
    pool: Arc<RawMempool>,
    idx: u32,
}

impl Mbuf {
    fn hdr(&self) -> &MbufHdr {
        // SAFETY: this handle owns the slot.
        unsafe { &*self.pool.slots[self.idx as usize].hdr.get() }
    }

    fn hdr_mut(&mut self) -> &mut MbufHdr {
        // SAFETY: this handle owns the slot and is borrowed mutably.
        unsafe { &mut *self.pool.slots[self.idx as usize].hdr.get() }
    }

    fn into_parts(self) -> (Arc<RawMempool>, u32) {
        let me = ManuallyDrop::new(self);
        // SAFETY: `me` is never dropped, so the pool reference is moved out
        // exactly once.
        let pool = unsafe { ptr::read(&me.pool) };
        (pool, me.idx)
    }

    /// Slot index inside the owning pool.
    pub fn index(&self) -> u32 {
        self.idx
    }

    pub fn belongs_to(&self, pool: &Mempool) -> bool {
        Arc::ptr_eq(&self.pool, &pool.inner)
    }

    /// Total capacity of the buffer, headroom included.
    pub fn buf_len(&self) -> u16 {
        self.pool.buf_len
    }

    /// Offset of the packet data from the start of the buffer.
    pub fn data_off(&self) -> u16 {
        self.hdr().data_off
    }

    pub fn headroom(&self) -> u16 {
        self.hdr().data_off
    }

    pub fn tailroom(&self) -> u16 {
        let hdr = self.hdr();
        self.pool.buf_len - hdr.data_off - hdr.data_len
    }

    /// Bytes occupied in this buffer.
    pub fn data_len(&self) -> u16 {
        self.hdr().data_len
    }

    /// Logical packet length. Buffers are never chained, so this equals
    /// [`data_len`](Mbuf::data_len) unless set otherwise by a driver.
    pub fn pkt_len(&self) -> u32 {
        self.hdr().pkt_len
    }

    /// Port the buffer was received on.
    pub fn port(&self) -> Option<PortId> {
        self.hdr().port
    }

    pub fn set_port(&mut self, port: PortId) {
        self.hdr_mut().port = Some(port);
    }

    pub fn data(&self) -> &[u8] {
        let hdr = self.hdr();
        // SAFETY: the slot is owned by this handle and `data_off + data_len`
        // never exceeds `buf_len`.
        unsafe {
            let base = self.pool.buf_ptr(self.idx).add(usize::from(hdr.data_off));
            slice::from_raw_parts(base, usize::from(hdr.data_len))
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let hdr = *self.hdr();
        // SAFETY: as in `data`, plus the handle is borrowed mutably.
        unsafe {
            let base = self.pool.buf_ptr(self.idx).add(usize::from(hdr.data_off));
            slice::from_raw_parts_mut(base, usize::from(hdr.data_len))
        }
    }

    /// Extends the packet by `len` bytes at the tail and returns the new
    /// region, or `None` if the tailroom is too small.
    pub fn append(&mut self, len: u16) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            return None;
        }
        let old = self.data_len();
        let hdr = self.hdr_mut();
        hdr.data_len += len;
        hdr.pkt_len += u32::from(len);
        Some(&mut self.data_mut()[usize::from(old)..])
    }

    /// Replaces the content with `frame`, truncated to the data room.
    /// Returns the number of bytes stored.
    pub fn fill(&mut self, frame: &[u8]) -> usize {
        let headroom = self.pool.headroom;
        let room = usize::from(self.pool.buf_len - headroom);
        let len = frame.len().min(room);
        let hdr = self.hdr_mut();
        hdr.data_off = headroom;
        hdr.data_len = len as u16;
        hdr.pkt_len = len as u32;
        self.data_mut().copy_from_slice(&frame[..len]);
        len
    }

    /// Sets the occupied length of a buffer whose data area was written
    /// through a raw receive. `len` is clamped to the room after the data
    /// offset.
    pub fn set_len(&mut self, len: usize) -> u16 {
        let room = usize::from(self.pool.buf_len - self.hdr().data_off);
        let len = len.min(room) as u16;
        let hdr = self.hdr_mut();
        hdr.data_len = len;
        hdr.pkt_len = u32::from(len);
        len
    }

    /// The whole area after the data offset, for drivers that receive
    /// straight into the buffer before calling [`set_len`](Mbuf::set_len).
    pub fn room_mut(&mut self) -> &mut [u8] {
        let off = self.hdr().data_off;
        let room = usize::from(self.pool.buf_len - off);
        // SAFETY: the slot is owned by this handle and the range stays inside it.
        unsafe {
            let base = self.pool.buf_ptr(self.idx).add(usize::from(off));
            slice::from_raw_parts_mut(base, room)
        }
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.put(self.idx);
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("pool", &self.pool.name)
            .field("idx", &self.idx)
            .field("data_len", &self.data_len())
            .field("pkt_len", &self.pkt_len())
            .finish()
    }
}

/// Per-context staging cache in front of a pool's shared ring.
///
/// Allocation refills the cache from the ring in bulk when it runs dry;
/// freeing flushes the excess back once the cache grows past one and a
/// half times its size. Staged buffers remain visible to
/// [`Mempool::alloc`] and to other caches, which take them when the ring is
/// empty. Dropping the cache returns everything it holds.
pub struct MempoolCache {
    pool: Mempool,
    stage: Arc<ArrayQueue<u32>>,
    size: usize,
    flush_thresh: usize,
}

impl MempoolCache {
    fn new(pool: Mempool) -> Self {
        let size = pool.cache_size();
        let flush_thresh = flush_threshold(size);
        let stage = Arc::new(ArrayQueue::new(flush_thresh + 1));
        pool.inner.attach(stage.clone());
        Self {
            pool,
            stage,
            size,
            flush_thresh,
        }
    }

    pub fn pool(&self) -> &Mempool {
        &self.pool
    }

    /// Free buffers currently staged here.
    pub fn len(&self) -> usize {
        self.stage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stage.is_empty()
    }

    fn refill(&mut self) {
        while self.stage.len() < self.size {
            let Some(idx) = self.pool.inner.ring.pop() else {
                break;
            };
            if let Err(idx) = self.stage.push(idx) {
                self.pool.inner.enqueue(idx);
                break;
            }
        }
    }

    /// Takes a free buffer, or `None` when no buffer is free in the cache,
    /// the ring or any other cache.
    pub fn alloc(&mut self) -> Option<Mbuf> {
        if self.stage.is_empty() {
            self.refill();
        }
        let idx = match self.stage.pop() {
            Some(idx) => idx,
            None => self.pool.inner.take()?,
        };
        self.pool.inner.claim(idx);
        Some(Mbuf {
            pool: self.pool.inner.clone(),
            idx,
        })
    }

    /// Stages `m` as free.
    ///
    /// # Panics
    ///
    /// Panics if `m` was allocated from another pool.
    pub fn free(&mut self, m: Mbuf) {
        if unlikely(!m.belongs_to(&self.pool)) {
            panic!(
                "buffer {} of mempool {} does not belong to mempool {}",
                m.idx,
                m.pool.name,
                self.pool.name()
            );
        }
        let (pool, idx) = m.into_parts();
        pool.reclaim(idx);
        if let Err(idx) = self.stage.push(idx) {
            self.pool.inner.enqueue(idx);
        }
        if self.stage.len() > self.flush_thresh || self.size == 0 {
            while self.stage.len() > self.size {
                match self.stage.pop() {
                    Some(idx) => self.pool.inner.enqueue(idx),
                    None => break,
                }
            }
        }
    }

    /// Returns every staged buffer to the shared ring.
    pub fn flush(&mut self) {
        while let Some(idx) = self.stage.pop() {
            self.pool.inner.enqueue(idx);
        }
    }
}

impl Drop for MempoolCache {
    fn drop(&mut self) {
        self.pool.inner.detach(&self.stage);
        self.flush();
    }
}

//! A packet pool for allocating and freeing packet buffers with quality of service policy.
use core::cell::{RefCell, UnsafeCell};
use core::mem::ManuallyDrop;
use core::task::{Context, Poll, Waker};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::MultiWakerRegistration;

// Tasks that can wait for a free packet at the same time before all of them get woken.
const POOL_WAITERS: usize = 8;

/// Quality of service policy for packet allocation
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum Qos {
    /// Distribute evenly among client
    Fair,
    /// Reserve at least N packets for each client
    Guaranteed(usize),
    /// No guarantees
    #[default]
    None,
}

/// Identifies the client of an allocation. Every channel slot is its own client.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocId(usize);

impl AllocId {
    pub(crate) fn from_channel(index: usize) -> AllocId {
        AllocId(index)
    }
}

struct PacketBuf<const MTU: usize> {
    buf: UnsafeCell<[u8; MTU]>,
}

impl<const MTU: usize> PacketBuf<MTU> {
    #[allow(clippy::declare_interior_mutable_const)]
    const NEW: PacketBuf<MTU> = PacketBuf::new();

    const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0; MTU]),
        }
    }
}

struct State<const N: usize, const CLIENTS: usize> {
    refcount: [u8; N],
    owner: [usize; N],
    usage: [usize; CLIENTS],
    // Packets promised to a client that nobody else may take.
    reserved: [usize; CLIENTS],
    qos: Qos,
    waker: MultiWakerRegistration<POOL_WAITERS>,
}

impl<const N: usize, const CLIENTS: usize> State<N, CLIENTS> {
    fn new(qos: Qos) -> Self {
        if let Qos::Guaranteed(n) = qos {
            assert!(n * CLIENTS <= N);
        }
        Self {
            refcount: [0; N],
            owner: [0; N],
            usage: [0; CLIENTS],
            reserved: [0; CLIENTS],
            qos,
            waker: MultiWakerRegistration::new(),
        }
    }

    fn free(&self) -> usize {
        self.refcount.iter().filter(|r| **r == 0).count()
    }

    // Free packets not promised to any client.
    fn unreserved(&self) -> usize {
        self.free().saturating_sub(self.reserved.iter().sum())
    }

    fn available(&self, id: AllocId) -> usize {
        if id.0 >= CLIENTS {
            return 0;
        }
        let free = self.unreserved();
        match self.qos {
            Qos::None => free,
            Qos::Fair => {
                let quota = (N / CLIENTS).max(1);
                quota.saturating_sub(self.usage[id.0]).min(free)
            }
            Qos::Guaranteed(n) => {
                let reserved: usize = self
                    .usage
                    .iter()
                    .enumerate()
                    .filter(|(client, _)| *client != id.0)
                    .map(|(_, usage)| n.saturating_sub(*usage))
                    .sum();
                free.saturating_sub(reserved)
            }
        }
    }

    fn alloc(&mut self, id: AllocId) -> Option<usize> {
        if self.available(id) == 0 {
            return None;
        }
        self.take(id)
    }

    fn take(&mut self, id: AllocId) -> Option<usize> {
        let idx = self.refcount.iter().position(|r| *r == 0)?;
        self.refcount[idx] = 1;
        self.owner[idx] = id.0;
        self.usage[id.0] += 1;
        Some(idx)
    }

    fn reserve(&mut self, id: AllocId, n: usize) -> usize {
        if id.0 >= CLIENTS {
            return 0;
        }
        let n = n.min(self.unreserved());
        self.reserved[id.0] += n;
        n
    }

    fn unreserve(&mut self, id: AllocId, n: usize) {
        if id.0 >= CLIENTS {
            return;
        }
        let n = n.min(self.reserved[id.0]);
        if n > 0 {
            self.reserved[id.0] -= n;
            self.waker.wake();
        }
    }

    fn alloc_reserved(&mut self, id: AllocId) -> Option<usize> {
        if id.0 >= CLIENTS || self.reserved[id.0] == 0 {
            return None;
        }
        let idx = self.take(id)?;
        self.reserved[id.0] -= 1;
        Some(idx)
    }

    fn retain(&mut self, idx: usize) {
        self.refcount[idx] = unwrap!(self.refcount[idx].checked_add(1), "too many references to packet");
    }

    fn release(&mut self, idx: usize) {
        self.refcount[idx] = unwrap!(self.refcount[idx].checked_sub(1), "bug: releasing a free packet");
        if self.refcount[idx] == 0 {
            let owner = self.owner[idx];
            self.usage[owner] -= 1;
            self.waker.wake();
        }
    }
}

/// A packet pool holds a pool of packet buffers that can be dynamically allocated
/// and free'd.
///
/// The pool has a policy for how to distribute buffers among different clients
/// (channels), see [`Qos`].
pub struct PacketPool<M: RawMutex, const MTU: usize, const N: usize, const CLIENTS: usize> {
    state: Mutex<M, RefCell<State<N, CLIENTS>>>,
    packets: [PacketBuf<MTU>; N],
}

impl<M: RawMutex, const MTU: usize, const N: usize, const CLIENTS: usize> PacketPool<M, MTU, N, CLIENTS> {
    /// Create a new packet pool with the given QoS policy
    pub fn new(qos: Qos) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State::new(qos))),
            packets: [PacketBuf::NEW; N],
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State<N, CLIENTS>) -> R) -> R {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            f(&mut state)
        })
    }
}

/// Type erased access to a packet pool, shared by everything that allocates from it.
pub trait GlobalPacketPool {
    /// Allocate a packet for a client, if the QoS policy permits it.
    fn alloc(&'static self, id: AllocId) -> Option<Packet>;

    /// Allocate a packet, registering the waker to be notified when packets are released.
    fn poll_alloc(&'static self, id: AllocId, cx: &mut Context<'_>) -> Poll<Packet>;

    /// Number of packets the client can allocate right now.
    fn available(&self, id: AllocId) -> usize;

    /// Set aside up to `n` free packets for the client, returns how many were reserved.
    ///
    /// Reserved packets are not available to [`GlobalPacketPool::alloc`] until they are
    /// taken with [`GlobalPacketPool::alloc_reserved`] or given back.
    fn reserve(&self, id: AllocId, n: usize) -> usize;

    /// Give back up to `n` packets reserved for the client.
    fn unreserve(&self, id: AllocId, n: usize);

    /// Packets currently reserved for the client.
    fn reserved(&self, id: AllocId) -> usize;

    /// Take one of the packets reserved for the client.
    fn alloc_reserved(&'static self, id: AllocId) -> Option<Packet>;

    /// Register a waker notified when packets are released or reservations given back.
    fn register_waker(&self, waker: &Waker);

    /// Size of every packet buffer.
    fn mtu(&self) -> usize;

    fn retain(&self, idx: usize);

    fn release(&self, idx: usize);

    fn buffer(&self, idx: usize) -> *mut u8;
}

impl<M: RawMutex + 'static, const MTU: usize, const N: usize, const CLIENTS: usize> GlobalPacketPool
    for PacketPool<M, MTU, N, CLIENTS>
{
    fn alloc(&'static self, id: AllocId) -> Option<Packet> {
        self.with_state(|state| state.alloc(id)).map(|idx| Packet { idx, pool: self })
    }

    fn poll_alloc(&'static self, id: AllocId, cx: &mut Context<'_>) -> Poll<Packet> {
        let idx = self.with_state(|state| match state.alloc(id) {
            Some(idx) => Some(idx),
            None => {
                state.waker.register(cx.waker());
                None
            }
        });
        match idx {
            Some(idx) => Poll::Ready(Packet { idx, pool: self }),
            None => Poll::Pending,
        }
    }

    fn available(&self, id: AllocId) -> usize {
        self.with_state(|state| state.available(id))
    }

    fn reserve(&self, id: AllocId, n: usize) -> usize {
        self.with_state(|state| state.reserve(id, n))
    }

    fn unreserve(&self, id: AllocId, n: usize) {
        self.with_state(|state| state.unreserve(id, n))
    }

    fn reserved(&self, id: AllocId) -> usize {
        self.with_state(|state| state.reserved.get(id.0).copied().unwrap_or(0))
    }

    fn alloc_reserved(&'static self, id: AllocId) -> Option<Packet> {
        self.with_state(|state| state.alloc_reserved(id))
            .map(|idx| Packet { idx, pool: self })
    }

    fn register_waker(&self, waker: &Waker) {
        self.with_state(|state| state.waker.register(waker))
    }

    fn mtu(&self) -> usize {
        MTU
    }

    fn retain(&self, idx: usize) {
        self.with_state(|state| state.retain(idx))
    }

    fn release(&self, idx: usize) {
        self.with_state(|state| state.release(idx))
    }

    fn buffer(&self, idx: usize) -> *mut u8 {
        self.packets[idx].buf.get() as *mut u8
    }
}

/// An owned packet buffer. The buffer returns to the pool when dropped.
pub struct Packet {
    idx: usize,
    pool: &'static dyn GlobalPacketPool,
}

impl Packet {
    /// Convert into a reference counted, read only packet.
    pub fn into_shared(self) -> SharedPacket {
        let this = ManuallyDrop::new(self);
        SharedPacket {
            idx: this.idx,
            pool: this.pool,
        }
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        // Safety: the packet is the only owner of the buffer while it is alive.
        unsafe { core::slice::from_raw_parts(self.pool.buffer(self.idx), self.pool.mtu()) }
    }
}

impl AsMut<[u8]> for Packet {
    fn as_mut(&mut self) -> &mut [u8] {
        // Safety: the packet is the only owner of the buffer while it is alive.
        unsafe { core::slice::from_raw_parts_mut(self.pool.buffer(self.idx), self.pool.mtu()) }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.release(self.idx);
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet").field("idx", &self.idx).finish()
    }
}

/// A packet shared between several readers. Clones keep the buffer allocated.
pub struct SharedPacket {
    idx: usize,
    pool: &'static dyn GlobalPacketPool,
}

impl Clone for SharedPacket {
    fn clone(&self) -> Self {
        self.pool.retain(self.idx);
        Self {
            idx: self.idx,
            pool: self.pool,
        }
    }
}

impl AsRef<[u8]> for SharedPacket {
    fn as_ref(&self) -> &[u8] {
        // Safety: shared packets never hand out mutable access.
        unsafe { core::slice::from_raw_parts(self.pool.buffer(self.idx), self.pool.mtu()) }
    }
}

impl Drop for SharedPacket {
    fn drop(&mut self) {
        self.pool.release(self.idx);
    }
}

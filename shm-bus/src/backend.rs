//! The bus façade: allocation, sending, receive dispatch and the bonding
//! worker.
//!
//! One mutex serializes all mutations of the allocator bitmaps, the
//! endpoint table, the pending-offer table and all sends over the link.
//! There is no cross-side lock: coordination with the peer happens only
//! through notifications plus memory ordering.
//!
//! The link callback hands every event to a single-consumer queue drained
//! by one worker thread per bus. Application callbacks execute
//! synchronously within that worker's processing of one message, never
//! concurrently with each other. The worker releases the mutex around link
//! sends and callback invocations and re-checks its preconditions after
//! re-acquiring it.

use core::sync::atomic::{fence, Ordering};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use shm_notify::{Handler, Link, LinkEvent, Message};
use tracing::{debug, error};

use crate::bitmap::BlockMap;
use crate::endpoint::{BondState, EndpointConfig, Entry, PENDING_NONE};
use crate::geometry::{ChannelLayout, BLOCK_HEADER_SIZE};
use crate::proto::{Control, ADDR_INVALID, ADDR_MAX};
use crate::region::{CacheMaintenance, Channel, NoCache, Region, SizeCheck};
use crate::{Error, Wait};

/// How long the worker waits for blocks when sending a handshake offer.
///
/// The worker also processes the release notifications that free blocks,
/// so it must never park forever on the allocator; a timeout rolls the
/// endpoint back and the pass is re-armed.
const OFFER_ALLOC_WAIT: Wait = Wait::Timeout(Duration::from_millis(100));

/// Configuration of one bus instance.
///
/// The layouts must match the peer's mirrored configuration exactly; the
/// geometry is fixed at build time and never negotiated.
pub struct BusConfig {
    pub tx: ChannelLayout,
    pub rx: ChannelLayout,
    /// Capacity of the endpoint table and of the pending-offer table.
    pub max_endpoints: usize,
    pub cache: Arc<dyn CacheMaintenance>,
}

impl BusConfig {
    pub fn new(tx: ChannelLayout, rx: ChannelLayout) -> Self {
        BusConfig {
            tx,
            rx,
            max_endpoints: 8,
            cache: Arc::new(NoCache),
        }
    }
}

/// A bus instance; cheap to clone, all clones share the same backend.
#[derive(Clone)]
pub struct Bus {
    core: Arc<Core>,
}

struct Core {
    tx: Channel,
    rx: Channel,
    cache: Arc<dyn CacheMaintenance>,
    link: Box<dyn Link>,
    state: Mutex<State>,
    /// Signalled whenever TX blocks are released; allocation retries on
    /// every wake, so wake races need no counting.
    avail: Condvar,
    work: WorkQueue,
    max_endpoints: usize,
    /// Keep the mappings alive as long as the channels referencing them.
    _tx_region: Region,
    _rx_region: Region,
}

struct State {
    tx_map: BlockMap,
    rx_hold: BlockMap,
    eps: Vec<Entry>,
    /// Block indices of offers not yet matched to a local registration.
    pending: Vec<u16>,
    link_ready: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Work {
    LinkReady,
    Notify(Message),
    Bond,
}

struct WorkQueue {
    q: Mutex<VecDeque<Work>>,
    cv: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        WorkQueue {
            q: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, work: Work) {
        let mut q = self.q.lock();
        // Bond passes are idempotent; one queued pass covers any number of
        // triggers.
        if work == Work::Bond && q.contains(&Work::Bond) {
            return;
        }
        q.push_back(work);
        drop(q);
        self.cv.notify_one();
    }

    fn pop(&self) -> Work {
        let mut q = self.q.lock();
        loop {
            if let Some(work) = q.pop_front() {
                return work;
            }
            self.cv.wait(&mut q);
        }
    }
}

impl Bus {
    /// Open a bus instance over its two regions and its link.
    ///
    /// The worker thread starts immediately but stays idle until the link
    /// delivers [`LinkEvent::Ready`] through the handler returned by
    /// [`link_handler`](Self::link_handler).
    pub fn new(
        cfg: BusConfig,
        tx_region: Region,
        rx_region: Region,
        link: impl Link + 'static,
    ) -> Result<Bus, Error> {
        if cfg.max_endpoints == 0 || cfg.max_endpoints > usize::from(ADDR_MAX) + 1 {
            return Err(Error::InvalidArgument);
        }
        let tx = Channel::new(&tx_region, &cfg.tx)?;
        let rx = Channel::new(&rx_region, &cfg.rx)?;
        debug!(
            tx_blocks = tx.block_count(),
            tx_block_size = tx.block_size(),
            rx_blocks = rx.block_count(),
            rx_block_size = rx.block_size(),
            max_allocable = tx.allocable_size() - BLOCK_HEADER_SIZE,
            "opening bus instance"
        );

        let state = State {
            tx_map: BlockMap::new(tx.block_count()),
            rx_hold: BlockMap::new(rx.block_count()),
            eps: Vec::new(),
            pending: vec![PENDING_NONE; cfg.max_endpoints],
            link_ready: false,
        };
        let core = Arc::new(Core {
            tx,
            rx,
            cache: cfg.cache,
            link: Box::new(link),
            state: Mutex::new(state),
            avail: Condvar::new(),
            work: WorkQueue::new(),
            max_endpoints: cfg.max_endpoints,
            _tx_region: tx_region,
            _rx_region: rx_region,
        });

        let worker = Arc::clone(&core);
        thread::spawn(move || Core::work_loop(&worker));

        Ok(Bus { core })
    }

    /// The event handler to install into the link serving this bus.
    pub fn link_handler(&self) -> Handler {
        let core = Arc::clone(&self.core);
        Box::new(move |event| match event {
            LinkEvent::Ready => core.work.push(Work::LinkReady),
            LinkEvent::Message(msg) => core.work.push(Work::Notify(msg)),
        })
    }

    /// Register a named endpoint.
    ///
    /// The local address is the registration sequence number; the handshake
    /// pairing it with the peer's endpoint of the same name runs in the
    /// background and fires `on_bound` once the endpoint is ready.
    pub fn register(&self, cfg: EndpointConfig) -> Result<Endpoint, Error> {
        let mut st = self.core.state.lock();
        if st.eps.len() >= self.core.max_endpoints {
            error!("too many endpoints");
            return Err(Error::TooManyEndpoints);
        }
        let local_addr = st.eps.len() as u8;
        st.eps.push(Entry {
            name: cfg.name,
            local_addr,
            remote_addr: ADDR_INVALID,
            state: BondState::Configured,
            on_receive: Arc::new(Mutex::new(cfg.on_receive)),
            on_bound: Arc::new(Mutex::new(cfg.on_bound)),
        });
        drop(st);
        self.core.work.push(Work::Bond);
        Ok(Endpoint {
            core: Arc::clone(&self.core),
            addr: local_addr,
        })
    }

    /// Largest payload a single send can carry.
    pub fn max_message_size(&self) -> usize {
        self.core.tx.allocable_size() - BLOCK_HEADER_SIZE
    }

    /// Number of currently unreserved TX blocks.
    pub fn free_tx_blocks(&self) -> usize {
        let st = self.core.state.lock();
        self.core.tx.block_count() - st.tx_map.count_set()
    }

    /// Reserve a TX buffer for zero-copy sending.
    ///
    /// `size == 0` asks for the largest contiguous run available: one block
    /// is secured and the reservation then extends over the immediately
    /// following free blocks. Dropping the buffer without sending releases
    /// it.
    pub fn tx_buffer(&self, size: usize, wait: Wait) -> Result<TxBuffer, Error> {
        let (index, granted) = self.core.alloc_tx(size, wait)?;
        Ok(TxBuffer {
            core: Arc::clone(&self.core),
            index,
            cap: granted,
            armed: true,
        })
    }
}

/// Handle to one registered endpoint.
#[derive(Clone)]
pub struct Endpoint {
    core: Arc<Core>,
    addr: u8,
}

impl Endpoint {
    fn remote_addr(&self) -> Result<u8, Error> {
        let st = self.core.state.lock();
        let remote = st.eps[usize::from(self.addr)].remote_addr;
        if remote == ADDR_INVALID {
            // Not bound yet; sending would address nobody.
            return Err(Error::InvalidArgument);
        }
        Ok(remote)
    }

    /// Copy `data` into a freshly allocated buffer and send it.
    ///
    /// Blocks until TX blocks are available; fails with
    /// [`Error::InvalidArgument`] before the endpoint is bound or when the
    /// payload exceeds [`Bus::max_message_size`].
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let remote = self.remote_addr()?;
        let (index, _granted) = self.core.alloc_tx(data.len(), Wait::Forever)?;
        self.core.tx.copy_in(index, data);
        self.core.send_block(
            index,
            data.len(),
            Control::Data { addr: remote, block: index as u8 },
        )
    }

    /// Send the first `len` bytes of a buffer obtained from
    /// [`Bus::tx_buffer`], without copying.
    ///
    /// The buffer is shrunk to `len` first, returning its unused tail
    /// blocks; a `len` needing more blocks than the buffer holds fails
    /// with [`Error::InvalidArgument`] and releases the buffer whole.
    pub fn send_buffer(&self, mut buf: TxBuffer, len: usize) -> Result<(), Error> {
        let remote = self.remote_addr()?;
        buf.armed = false;
        let (index, cap) = (buf.index, buf.cap);
        drop(buf);
        if let Err(e) = self.core.release_tx(index, cap, Some(len)) {
            let _ = self.core.release_tx(index, cap, None);
            return Err(e);
        }
        self.core.send_block(
            index,
            len,
            Control::Data { addr: remote, block: index as u8 },
        )
    }
}

/// An allocated TX block run, released on drop unless sent.
pub struct TxBuffer {
    core: Arc<Core>,
    index: usize,
    cap: usize,
    armed: bool,
}

impl TxBuffer {
    pub fn capacity(&self) -> usize {
        self.cap
    }
}

impl core::ops::Deref for TxBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: the run is exclusively ours until sent or dropped.
        unsafe { self.core.tx.data_slice(self.index, self.cap) }
    }
}

impl core::ops::DerefMut for TxBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: as for `deref`, plus `&mut self` rules out local aliasing.
        unsafe { self.core.tx.data_slice_mut(self.index, self.cap) }
    }
}

impl Drop for TxBuffer {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.core.release_tx(self.index, self.cap, None);
        }
    }
}

/// A received payload, valid for the duration of the receive callback.
pub struct RxBuffer<'a> {
    core: &'a Arc<Core>,
    data: &'a [u8],
}

impl core::ops::Deref for RxBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl RxBuffer<'_> {
    /// Retain the buffer past the callback's return.
    ///
    /// Holding suppresses the automatic release notification; the buffer is
    /// released when the returned handle is dropped.
    pub fn hold(self) -> Result<HeldRx, Error> {
        let (index, _) =
            self.core
                .rx
                .buffer_to_index(self.data.as_ptr(), SizeCheck::None, &*self.core.cache)?;
        self.core.state.lock().rx_hold.set(index);
        Ok(HeldRx {
            core: Arc::clone(self.core),
            index,
            len: self.data.len(),
        })
    }
}

/// An RX buffer held beyond its receive callback; released on drop.
pub struct HeldRx {
    core: Arc<Core>,
    index: usize,
    len: usize,
}

impl core::ops::Deref for HeldRx {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: the peer keeps the run untouched until we release it.
        unsafe { self.core.rx.data_slice(self.index, self.len) }
    }
}

impl HeldRx {
    /// Release the buffer back to the sender.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for HeldRx {
    fn drop(&mut self) {
        let _ = self
            .core
            .send_control(Control::ReleaseData { block: self.index as u8 });
    }
}

impl Core {
    /// Reserve blocks for `size` payload bytes, waiting per `wait`.
    ///
    /// Returns the first block index and the granted capacity, which is
    /// already written into the block header so the peer can discover it
    /// before the sender commits the final length.
    fn alloc_tx(&self, size: usize, wait: Wait) -> Result<(usize, usize), Error> {
        let needed = (size + BLOCK_HEADER_SIZE).div_ceil(self.tx.block_size());
        if needed > self.tx.block_count() {
            error!(size, "requested size exceeds the blocks area");
            return Err(Error::InvalidArgument);
        }

        let deadline = wait.deadline();
        let mut st = self.state.lock();
        let index = loop {
            if let Some(index) = st.tx_map.alloc_run(needed) {
                break index;
            }
            match (wait, deadline) {
                (Wait::NoWait, _) => return Err(Error::OutOfSpace),
                (_, Some(deadline)) => {
                    if self.avail.wait_until(&mut st, deadline).timed_out() {
                        // One last try; the wake that beat the deadline may
                        // have freed our run.
                        match st.tx_map.alloc_run(needed) {
                            Some(index) => break index,
                            None => return Err(Error::Timeout),
                        }
                    }
                }
                (_, None) => self.avail.wait(&mut st),
            }
        };

        let mut blocks = needed;
        if size == 0 {
            // Grow the reservation over the immediately following free
            // blocks; the caller wants the largest run available.
            let mut next = index + blocks;
            while next < self.tx.block_count() && !st.tx_map.test_and_set(next) {
                next += 1;
            }
            blocks = next - index;
        }
        drop(st);

        let granted = blocks * self.tx.block_size() - BLOCK_HEADER_SIZE;
        self.tx.write_header(index, granted);
        Ok((index, granted))
    }

    /// Release all blocks of a run (`new_size == None`) or shrink it to
    /// `new_size` bytes, freeing the now-unneeded tail.
    fn release_tx(&self, index: usize, size: usize, new_size: Option<usize>) -> Result<(), Error> {
        let block_size = self.tx.block_size();
        let mut blocks = (size + BLOCK_HEADER_SIZE).div_ceil(block_size);
        let mut release_at = index;
        if let Some(new_size) = new_size {
            let keep = (new_size + BLOCK_HEADER_SIZE).div_ceil(block_size);
            if keep > blocks {
                error!(requested = keep, allocated = blocks, "cannot grow a buffer on release");
                return Err(Error::InvalidArgument);
            }
            self.tx.write_header(index, new_size);
            release_at = index + keep;
            blocks -= keep;
        }
        if blocks > 0 {
            self.state.lock().tx_map.free_run(release_at, blocks);
            // All waiters retry; the race for the freed run is resolved by
            // the allocation loop, not by counting.
            self.avail.notify_all();
        }
        Ok(())
    }

    /// Send one control notification over the link.
    fn send_control(&self, ctl: Control) -> Result<(), Error> {
        // The link may not tolerate concurrent senders; serialize on the
        // instance mutex.
        let guard = self.state.lock();
        let sent = self.link.send(ctl.encode());
        drop(guard);
        sent.map_err(|e| {
            error!(error = %e, "link send failed");
            Error::Link(e)
        })
    }

    /// Commit `size` payload bytes in a block run and notify the peer.
    ///
    /// On link failure the run is released so no blocks leak.
    fn send_block(&self, index: usize, size: usize, ctl: Control) -> Result<(), Error> {
        // The payload must be visible before the header, and the header
        // before the notification; the flush pushes both past our cache.
        fence(Ordering::SeqCst);
        self.tx.write_header(index, size);
        fence(Ordering::SeqCst);
        self.cache
            .flush(self.tx.block_ptr(index), size + BLOCK_HEADER_SIZE);

        let sent = self.send_control(ctl);
        if sent.is_err() {
            let _ = self.release_tx(index, size, None);
        }
        sent
    }

    fn work_loop(this: &Arc<Self>) {
        loop {
            match this.work.pop() {
                Work::LinkReady => {
                    this.state.lock().link_ready = true;
                    this.work.push(Work::Bond);
                }
                Work::Notify(msg) => Self::on_notify(this, msg),
                Work::Bond => this.bond_pass(),
            }
        }
    }

    /// Decode and dispatch one incoming notification.
    ///
    /// Corruption here is logged and the message dropped; the transport
    /// keeps operating.
    fn on_notify(this: &Arc<Self>, msg: Message) {
        let ctl = match Control::decode(msg) {
            Ok(ctl) => ctl,
            Err(_) => {
                error!(?msg, "dropping undecodable notification");
                return;
            }
        };
        let handled = match ctl {
            Control::Data { addr, block } => Self::on_data(this, addr, usize::from(block)),
            Control::ReleaseData { block } => this.on_release_data(usize::from(block)),
            Control::Bound { block } => this.on_bound(usize::from(block)),
            Control::ReleaseBound { block } => this.on_release_bound(usize::from(block)),
        };
        if let Err(e) = handled {
            error!(error = %e, ?msg, "dropping notification");
        }
    }

    fn on_data(this: &Arc<Self>, addr: u8, block: usize) -> Result<(), Error> {
        let size = this.rx.validate(block, SizeCheck::Invalidate, &*this.cache)?;

        let on_receive = {
            let mut st = this.state.lock();
            let Some(entry) = st.eps.get(usize::from(addr)) else {
                error!(addr, "data for an unregistered endpoint");
                return Err(Error::Corrupted);
            };
            let cb = Arc::clone(&entry.on_receive);
            // Default is to give the buffer back; the callback may hold it.
            st.rx_hold.clear(block);
            cb
        };

        // Safety: validated above; the peer hands us the run until released.
        let data = unsafe { this.rx.data_slice(block, size) };
        (*on_receive.lock())(RxBuffer { core: this, data });

        let held = this.state.lock().rx_hold.test(block);
        if !held {
            this.send_control(Control::ReleaseData { block: block as u8 })?;
        }
        Ok(())
    }

    fn on_release_data(&self, block: usize) -> Result<(), Error> {
        let size = self.tx.validate(block, SizeCheck::Trusted, &*self.cache)?;
        self.check_tx_allocated(block, size)?;
        self.release_tx(block, size, None)
    }

    /// A release notification must name blocks this side actually has
    /// allocated; a stale header alone can pass size validation.
    fn check_tx_allocated(&self, index: usize, size: usize) -> Result<(), Error> {
        let blocks = (size + BLOCK_HEADER_SIZE).div_ceil(self.tx.block_size());
        if self.state.lock().tx_map.run_set(index, blocks) {
            Ok(())
        } else {
            error!(index, "release names unallocated blocks");
            Err(Error::Corrupted)
        }
    }

    fn on_bound(&self, block: usize) -> Result<(), Error> {
        // Validate now so a corrupted offer never parks in the table. The
        // shortest well-formed offer is an address plus an empty name's
        // terminator.
        let size = self.rx.validate(block, SizeCheck::Invalidate, &*self.cache)?;
        if size < 2 {
            return Err(Error::Corrupted);
        }

        let mut st = self.state.lock();
        let Some(slot) = st.pending.iter_mut().find(|slot| **slot == PENDING_NONE) else {
            error!("too many pending remote endpoints");
            return Err(Error::TooManyPendingBinds);
        };
        *slot = block as u16;
        drop(st);

        self.work.push(Work::Bond);
        Ok(())
    }

    fn on_release_bound(&self, block: usize) -> Result<(), Error> {
        let size = self.tx.validate(block, SizeCheck::Trusted, &*self.cache)?;
        if size < 1 {
            return Err(Error::Corrupted);
        }
        self.check_tx_allocated(block, size)?;
        // Safety: validated; the run is ours again now that the peer
        // released it. Its first byte is the address we embedded when
        // sending the offer.
        let local_addr = unsafe { self.tx.data_slice(block, size)[0] };
        self.release_tx(block, size, None)?;

        let mut st = self.state.lock();
        let Some(entry) = st.eps.get_mut(usize::from(local_addr)) else {
            error!(addr = local_addr, "released offer names an unknown endpoint");
            return Err(Error::Corrupted);
        };
        entry.state = BondState::Bounded;
        drop(st);

        self.work.push(Work::Bond);
        Ok(())
    }

    /// One pass of the bonding worker. Idempotent; running it with nothing
    /// to do is a no-op.
    fn bond_pass(&self) {
        let mut failed = false;
        let mut st = self.state.lock();
        if !st.link_ready {
            return;
        }

        // Match stashed offers against the current registrations. Unmatched
        // entries stay pending; the name may belong to an endpoint not yet
        // registered.
        for slot in 0..st.pending.len() {
            let block = st.pending[slot];
            if block == PENDING_NONE {
                continue;
            }
            match self.match_offer(&mut st, usize::from(block)) {
                Ok(true) => st.pending[slot] = PENDING_NONE,
                Ok(false) => {}
                Err(Error::Link(e)) => {
                    // Keep the slot so the re-armed pass retries the
                    // acknowledgement.
                    error!(error = %e, "acknowledging a matched offer failed");
                    failed = true;
                }
                Err(e) => {
                    // An offer that fails revalidation will never match;
                    // drop it so it cannot wedge the table.
                    error!(error = %e, "dropping a corrupted pending offer");
                    st.pending[slot] = PENDING_NONE;
                }
            }
        }

        let mut i = 0;
        while i < st.eps.len() {
            match st.eps[i].state {
                BondState::Configured => {
                    st.eps[i].state = BondState::Bounding;
                    let name = st.eps[i].name.clone();
                    let local_addr = st.eps[i].local_addr;
                    let sent =
                        MutexGuard::unlocked(&mut st, || self.send_offer(&name, local_addr));
                    if let Err(e) = sent {
                        error!(error = %e, %name, "sending the endpoint offer failed");
                        st.eps[i].state = BondState::Unconfigured;
                        failed = true;
                    }
                }
                BondState::Bounded if st.eps[i].remote_addr != ADDR_INVALID => {
                    st.eps[i].state = BondState::Ready;
                    let on_bound = Arc::clone(&st.eps[i].on_bound);
                    MutexGuard::unlocked(&mut st, || (*on_bound.lock())());
                }
                _ => {}
            }
            i += 1;
        }
        drop(st);

        if failed {
            // Back off briefly before re-arming so a dead link does not
            // spin the worker.
            thread::sleep(Duration::from_millis(1));
            self.work.push(Work::Bond);
        }
    }

    /// Match one stashed offer against the registered endpoints. On a match
    /// the remote address is recorded and the offer buffer acknowledged.
    fn match_offer(&self, st: &mut MutexGuard<'_, State>, block: usize) -> Result<bool, Error> {
        // Revalidate on every read; only the index was stashed.
        let size = self.rx.validate(block, SizeCheck::Invalidate, &*self.cache)?;
        if size < 2 {
            return Err(Error::Corrupted);
        }
        // Safety: validated above; the peer keeps the offer alive until we
        // acknowledge it.
        let payload = unsafe { self.rx.data_slice(block, size) };
        let remote_addr = payload[0];
        let name = &payload[1..];
        // The name lives in shared memory and may be corrupted; bound the
        // terminator scan by the buffer and fall back to the remainder.
        let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = &name[..name_len];

        let Some(i) = st.eps.iter().position(|e| e.name.as_bytes() == name) else {
            return Ok(false);
        };
        st.eps[i].remote_addr = remote_addr;

        MutexGuard::unlocked(st, || {
            self.send_control(Control::ReleaseBound { block: block as u8 })
        })?;
        Ok(true)
    }

    /// Allocate and send one endpoint offer: local address, name, NUL.
    fn send_offer(&self, name: &str, local_addr: u8) -> Result<(), Error> {
        let msg_len = 1 + name.len() + 1;
        let (index, _granted) = self.alloc_tx(msg_len, OFFER_ALLOC_WAIT)?;
        let mut offer = Vec::with_capacity(msg_len);
        offer.push(local_addr);
        offer.extend_from_slice(name.as_bytes());
        offer.push(0);
        self.tx.copy_in(index, &offer);
        self.send_block(index, msg_len, Control::Bound { block: index as u8 })
    }
}

//! Endpoint table entries and the bonding state machine's states.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::RxBuffer;

/// Callback invoked with each received payload.
///
/// Runs on the bus worker thread, never concurrently with other callbacks
/// of the same bus. It must not wait indefinitely for TX blocks: the blocks
/// only free up through notifications this same thread processes.
pub type ReceiveFn = Box<dyn FnMut(RxBuffer<'_>) + Send>;

/// Callback invoked exactly once when the endpoint becomes ready.
pub type BoundFn = Box<dyn FnMut() + Send>;

/// Configuration of one named endpoint.
pub struct EndpointConfig {
    /// Name matched against the peer's registrations during bonding.
    pub name: String,
    pub on_receive: ReceiveFn,
    pub on_bound: BoundFn,
}

/// Bonding progress of one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BondState {
    /// Initial state; also the rollback target when sending the offer
    /// failed.
    Unconfigured,
    /// Registered locally, waiting for the worker to send the offer.
    Configured,
    /// Offer sent, waiting for the peer's release acknowledgement.
    Bounding,
    /// Acknowledged; ready once the remote address is known too.
    Bounded,
    /// Bound on both sides, exchanging data.
    Ready,
}

/// One slot of the endpoint table.
pub(crate) struct Entry {
    pub name: String,
    /// Index in registration order, stable for the process lifetime.
    pub local_addr: u8,
    /// Learned during bonding; `ADDR_INVALID` until then.
    pub remote_addr: u8,
    pub state: BondState,
    /// Callbacks are individually locked so the worker can invoke them with
    /// the bus state mutex released.
    pub on_receive: Arc<Mutex<ReceiveFn>>,
    pub on_bound: Arc<Mutex<BoundFn>>,
}

/// Empty marker in the pending-bound table.
pub(crate) const PENDING_NONE: u16 = 0xFFFF;

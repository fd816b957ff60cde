//! The short-message link underneath the block-allocated messaging backend.
//!
//! `shm-bus` coordinates with its peer through one narrow primitive: send a
//! single 2-byte notification over an already-reliable channel, receive a
//! callback when the peer sends one, and receive a one-shot callback when the
//! link itself has finished its own readiness handshake. This crate pins that
//! boundary down as the [`Link`] trait plus [`LinkEvent`], and provides an
//! in-process [`loopback`] pair that stands in for a real ring-based link in
//! tests.
//!
//! Nothing above this layer may send before [`LinkEvent::Ready`] has been
//! delivered.

use parking_lot::Mutex;
use std::sync::Arc;

/// Number of bytes carried by one notification.
pub const MESSAGE_LEN: usize = 2;

/// One notification as it crosses the link.
pub type Message = [u8; MESSAGE_LEN];

/// Events a link delivers to its owning side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link finished its readiness handshake. Delivered exactly once.
    Ready,
    /// The peer sent a notification.
    Message(Message),
}

/// Callback installed by the owning side to consume [`LinkEvent`]s.
///
/// Handlers may be invoked from an arbitrary context (the loopback pair calls
/// them from whatever thread drives the peer's send). They must only hand the
/// event off, never block.
pub type Handler = Box<dyn Fn(LinkEvent) + Send + Sync>;

/// Sending half of a notification link.
pub trait Link: Send + Sync {
    /// Send one notification to the peer.
    ///
    /// The link is reliable once ready: a successful return means the peer
    /// will observe the message.
    fn send(&self, msg: Message) -> Result<(), LinkError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkError {
    /// The link has not completed its readiness handshake.
    NotReady,
    /// The link cannot accept the message right now.
    Full,
}

impl core::fmt::Display for LinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkError::NotReady => write!(f, "link is not ready"),
            LinkError::Full => write!(f, "link rejected the message"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Create a connected pair of in-process link ends.
///
/// Each end becomes usable once both sides have called [`LoopEnd::open`];
/// at that point `Ready` is delivered to both handlers, mirroring the
/// readiness handshake of a real link.
pub fn loopback() -> (LoopEnd, LoopEnd) {
    let inner = Arc::new(Inner {
        handlers: [Mutex::new(None), Mutex::new(None)],
        ready: Mutex::new(false),
    });
    (
        LoopEnd { side: 0, inner: Arc::clone(&inner) },
        LoopEnd { side: 1, inner },
    )
}

/// One end of an in-process link pair.
#[derive(Clone)]
pub struct LoopEnd {
    side: usize,
    inner: Arc<Inner>,
}

struct Inner {
    handlers: [Mutex<Option<Handler>>; 2],
    ready: Mutex<bool>,
}

impl LoopEnd {
    /// Install the event handler for this end.
    ///
    /// When the second end opens, `Ready` is delivered to both handlers
    /// before this call returns.
    pub fn open(&self, handler: Handler) {
        *self.inner.handlers[self.side].lock() = Some(handler);

        let mut ready = self.inner.ready.lock();
        if *ready {
            return;
        }
        let both = self
            .inner
            .handlers
            .iter()
            .all(|slot| slot.lock().is_some());
        if both {
            *ready = true;
            drop(ready);
            for slot in &self.inner.handlers {
                if let Some(handler) = slot.lock().as_ref() {
                    handler(LinkEvent::Ready);
                }
            }
        }
    }
}

impl Link for LoopEnd {
    fn send(&self, msg: Message) -> Result<(), LinkError> {
        if !*self.inner.ready.lock() {
            return Err(LinkError::NotReady);
        }
        let peer = self.inner.handlers[1 - self.side].lock();
        match peer.as_ref() {
            Some(handler) => {
                handler(LinkEvent::Message(msg));
                Ok(())
            }
            None => Err(LinkError::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn collecting_handler() -> (Handler, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel();
        let handler: Handler = Box::new(move |ev| {
            let _ = tx.send(ev);
        });
        (handler, rx)
    }

    #[test]
    fn ready_fires_once_both_ends_open() {
        let (a, b) = loopback();
        let (ha, ra) = collecting_handler();
        let (hb, rb) = collecting_handler();

        a.open(ha);
        assert!(ra.try_recv().is_err());

        b.open(hb);
        assert_eq!(ra.try_recv(), Ok(LinkEvent::Ready));
        assert_eq!(rb.try_recv(), Ok(LinkEvent::Ready));
    }

    #[test]
    fn send_before_open_is_rejected() {
        let (a, _b) = loopback();
        assert_eq!(a.send([1, 2]), Err(LinkError::NotReady));
    }

    #[test]
    fn messages_cross_both_ways() {
        let (a, b) = loopback();
        let (ha, ra) = collecting_handler();
        let (hb, rb) = collecting_handler();
        a.open(ha);
        b.open(hb);
        let _ = ra.try_recv();
        let _ = rb.try_recv();

        a.send([0x07, 0x03]).unwrap();
        b.send([0xFE, 0x01]).unwrap();
        assert_eq!(rb.try_recv(), Ok(LinkEvent::Message([0x07, 0x03])));
        assert_eq!(ra.try_recv(), Ok(LinkEvent::Message([0xFE, 0x01])));
    }
}

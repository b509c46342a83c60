//! Token-addressed RPC namespace.
//!
//! A [`Transport`] moves opaque byte payloads between ranks, addressed by
//! [`RpcToken`]. The physical wire is out of scope; [`LoopbackHub`] is an
//! in-process implementation used by tests and the demo, where every rank is
//! a VM in the same process.
//!
//! Receivers detect lost, duplicated and reordered messages through the
//! per-channel sequence numbers carried by `Data` and `Cmd` tokens; see
//! [`SequenceGuard`].

use parking_lot::{Condvar, Mutex};
use ranklane_core::{RpcToken, TokenType, VmError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out after {timeout_ms} ms waiting for {token}")]
    Timeout { token: RpcToken, timeout_ms: u64 },
    #[error("transport is closed")]
    Disconnected,
    #[error("duplicate delivery of {0}")]
    Duplicate(RpcToken),
    #[error("out-of-order delivery of {token}: expected sequence {expected}")]
    OutOfOrder { token: RpcToken, expected: u32 },
    #[error("rank {0} is not part of this transport")]
    UnknownRank(u16),
    #[error("{token} cannot be used by rank {rank}")]
    Misaddressed { token: RpcToken, rank: u16 },
}

impl From<TransportError> for VmError {
    fn from(err: TransportError) -> Self {
        VmError::ExecutionFailed(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Logical contract a physical transport has to satisfy.
///
/// `send` never blocks on the receiver. `recv` blocks until a payload under
/// exactly `token` arrives or `timeout` elapses. A token is consumed by the
/// first successful `recv`.
pub trait Transport: Send + Sync {
    /// Rank of the local endpoint.
    fn rank(&self) -> u16;

    /// Deliver `payload` under `token`. `token.src_rank()` must be the local
    /// rank.
    fn send(&self, token: RpcToken, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Take the payload delivered under `token`. `token.dst_rank()` must be
    /// the local rank.
    fn recv(&self, token: RpcToken, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

// ---------------------------------------------------------------------------
// SequenceGuard
// ---------------------------------------------------------------------------

/// Accepts exactly the next expected sequence number per channel.
///
/// Channels are keyed by [`RpcToken::channel_key`], so a `Cmd` channel is
/// per (src, dst, uid, rank group, command). `Extended` tokens carry no
/// delivery order and pass unchecked.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    expected: HashMap<u64, u32>,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, token: &RpcToken) -> Result<(), TransportError> {
        if token.token_type() == TokenType::Extended {
            return Ok(());
        }
        let key = token.channel_key();
        let expected = self.expected.get(&key).copied().unwrap_or(0);
        let seq = token.sequence();
        if seq == expected {
            self.expected.insert(key, token.next().sequence());
            Ok(())
        } else if seq < expected {
            Err(TransportError::Duplicate(*token))
        } else {
            Err(TransportError::OutOfOrder {
                token: *token,
                expected,
            })
        }
    }

    /// Next sequence number the channel of `token` will accept.
    pub fn expected(&self, token: &RpcToken) -> u32 {
        self.expected
            .get(&token.channel_key())
            .copied()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// LoopbackHub
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HubState {
    mailboxes: HashMap<RpcToken, Vec<u8>>,
    guard: SequenceGuard,
    closed: bool,
}

/// In-process message switch shared by the endpoints of every rank.
pub struct LoopbackHub {
    world_size: u16,
    state: Mutex<HubState>,
    arrived: Condvar,
}

impl LoopbackHub {
    pub fn new(world_size: u16) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            state: Mutex::new(HubState::default()),
            arrived: Condvar::new(),
        })
    }

    pub fn world_size(&self) -> u16 {
        self.world_size
    }

    /// The endpoint for `rank`.
    pub fn endpoint(self: &Arc<Self>, rank: u16) -> Result<LoopbackTransport, TransportError> {
        if rank >= self.world_size {
            return Err(TransportError::UnknownRank(rank));
        }
        Ok(LoopbackTransport {
            hub: Arc::clone(self),
            rank,
        })
    }

    /// Wake every blocked receiver with `Disconnected`; later sends fail.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.arrived.notify_all();
    }

    /// Payloads delivered but not yet received.
    pub fn in_flight(&self) -> usize {
        self.state.lock().mailboxes.len()
    }

    fn deliver(&self, token: RpcToken, payload: Vec<u8>) -> Result<(), TransportError> {
        if token.dst_rank() >= self.world_size {
            return Err(TransportError::UnknownRank(token.dst_rank()));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Disconnected);
        }
        state.guard.check(&token)?;
        state.mailboxes.insert(token, payload);
        drop(state);
        self.arrived.notify_all();
        Ok(())
    }

    fn take(&self, token: RpcToken, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(payload) = state.mailboxes.remove(&token) {
                return Ok(payload);
            }
            if state.closed {
                return Err(TransportError::Disconnected);
            }
            if self.arrived.wait_until(&mut state, deadline).timed_out() {
                return state
                    .mailboxes
                    .remove(&token)
                    .ok_or(TransportError::Timeout {
                        token,
                        timeout_ms: timeout.as_millis() as u64,
                    });
            }
        }
    }
}

impl fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackHub")
            .field("world_size", &self.world_size)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// One rank's view of a [`LoopbackHub`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    rank: u16,
}

impl LoopbackTransport {
    pub fn hub(&self) -> &Arc<LoopbackHub> {
        &self.hub
    }
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> u16 {
        self.rank
    }

    fn send(&self, token: RpcToken, payload: Vec<u8>) -> Result<(), TransportError> {
        if token.src_rank() != self.rank {
            return Err(TransportError::Misaddressed {
                token,
                rank: self.rank,
            });
        }
        tracing::trace!(%token, bytes = payload.len(), "send");
        self.hub.deliver(token, payload)
    }

    fn recv(&self, token: RpcToken, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if token.dst_rank() != self.rank {
            return Err(TransportError::Misaddressed {
                token,
                rank: self.rank,
            });
        }
        let payload = self.hub.take(token, timeout)?;
        tracing::trace!(%token, bytes = payload.len(), "recv");
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// DataChannels
// ---------------------------------------------------------------------------

/// Per-peer `Data` token counters for one rank: the next token to send to
/// each peer and the next one to expect from it.
#[derive(Debug)]
pub struct DataChannels {
    rank: u16,
    outgoing: Mutex<HashMap<u16, RpcToken>>,
    incoming: Mutex<HashMap<u16, RpcToken>>,
}

impl DataChannels {
    pub fn new(rank: u16) -> Self {
        Self {
            rank,
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
        }
    }

    /// Token for the next transfer to `peer`; advances the channel.
    pub fn next_outgoing(&self, peer: u16) -> RpcToken {
        let mut map = self.outgoing.lock();
        let slot = map
            .entry(peer)
            .or_insert_with(|| RpcToken::new_data(self.rank, peer));
        let token = *slot;
        slot.increment();
        token
    }

    /// Token of the next transfer expected from `peer`; advances the channel.
    pub fn next_incoming(&self, peer: u16) -> RpcToken {
        let mut map = self.incoming.lock();
        let slot = map
            .entry(peer)
            .or_insert_with(|| RpcToken::new_data(peer, self.rank));
        let token = *slot;
        slot.increment();
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranklane_core::RankGroupCmd;
    use std::thread;

    #[test]
    fn guard_rejects_duplicates_and_gaps() {
        let mut guard = SequenceGuard::new();
        let t0 = RpcToken::new_data(0, 1);
        let t1 = t0.next();
        let t2 = t1.next();

        guard.check(&t0).unwrap();
        assert_eq!(guard.check(&t0), Err(TransportError::Duplicate(t0)));
        assert!(matches!(
            guard.check(&t2),
            Err(TransportError::OutOfOrder { expected: 1, .. })
        ));
        guard.check(&t1).unwrap();
        guard.check(&t2).unwrap();
        assert_eq!(guard.expected(&t0), 3);

        // Independent channel.
        guard.check(&RpcToken::new_data(1, 0)).unwrap();
    }

    #[test]
    fn guard_orders_meta_tokens_and_ignores_extended() {
        let mut guard = SequenceGuard::new();
        let meta = RpcToken::new_op_tensor_meta(0, 1, 0, 0).unwrap();
        guard.check(&meta).unwrap();
        assert_eq!(guard.check(&meta), Err(TransportError::Duplicate(meta)));
        guard.check(&meta.next()).unwrap();

        let ext = RpcToken::new_extended(0, 1, 7).unwrap();
        guard.check(&ext).unwrap();
        guard.check(&ext).unwrap();
    }

    #[test]
    fn loopback_delivers_across_threads() {
        let hub = LoopbackHub::new(2);
        let a = hub.endpoint(0).unwrap();
        let b = hub.endpoint(1).unwrap();
        let token = RpcToken::new_cmd(0, 1, RankGroupCmd::Barrier, 0, 0).unwrap();

        let receiver = thread::spawn(move || b.recv(token, Duration::from_secs(5)));
        a.send(token, b"hello".to_vec()).unwrap();
        assert_eq!(receiver.join().unwrap().unwrap(), b"hello".to_vec());
        assert_eq!(hub.in_flight(), 0);
    }

    #[test]
    fn loopback_checks_addressing() {
        let hub = LoopbackHub::new(2);
        let a = hub.endpoint(0).unwrap();
        assert!(matches!(hub.endpoint(2), Err(TransportError::UnknownRank(2))));
        assert!(matches!(
            a.send(RpcToken::new_data(1, 0), Vec::new()),
            Err(TransportError::Misaddressed { rank: 0, .. })
        ));
        assert!(matches!(
            a.recv(RpcToken::new_data(0, 1), Duration::from_millis(1)),
            Err(TransportError::Misaddressed { .. })
        ));
        assert_eq!(
            a.send(RpcToken::new_data(0, 9), Vec::new()),
            Err(TransportError::UnknownRank(9))
        );
    }

    #[test]
    fn recv_times_out_then_close_disconnects() {
        let hub = LoopbackHub::new(2);
        let b = hub.endpoint(1).unwrap();
        let token = RpcToken::new_data(0, 1);
        assert!(matches!(
            b.recv(token, Duration::from_millis(10)),
            Err(TransportError::Timeout { .. })
        ));
        hub.close();
        assert_eq!(
            b.recv(token, Duration::from_secs(1)),
            Err(TransportError::Disconnected)
        );
    }

    #[test]
    fn data_channels_walk_both_directions() {
        let channels = DataChannels::new(2);
        let first = channels.next_outgoing(5);
        let second = channels.next_outgoing(5);
        assert_eq!(first.data_seq_id().unwrap(), 0);
        assert_eq!(second.data_seq_id().unwrap(), 1);
        assert_eq!((first.src_rank(), first.dst_rank()), (2, 5));

        let inbound = channels.next_incoming(5);
        assert_eq!((inbound.src_rank(), inbound.dst_rank()), (5, 2));
        assert_eq!(inbound.data_seq_id().unwrap(), 0);
    }

    #[test]
    fn transport_errors_surface_as_execution_failures() {
        let err: VmError = TransportError::Disconnected.into();
        assert_eq!(err, VmError::ExecutionFailed("transport is closed".into()));
    }
}

//! Subscribe session lifecycle.
//!
//! One session per connected replica, in its own thread with an
//! ack-reader sibling. The session pairs with tx over the bus, watches
//! the WAL for write/rotate events, and registers a WAL-exit hook so the
//! WAL thread can force-cancel it in bounded time. Acknowledged vclocks
//! flow relay -> tx -> wal, ending in the matrix clock that pins log
//! retention.

use std::any::Any;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::bus::{Envelope, Hop, Pipe};
use crate::core::frame::{FrameError, FrameReader};
use crate::core::{VClock, Row, wall_clock_seconds};
use crate::wal::watcher::{WalEvents, WatcherNotice};
use crate::wal::writer::{TxWorld, WalHandle, consumer_update_envelope};

use super::filter::RelayFilter;
use super::{Relay, RelayError, RelayInner, RelayState, send_row};

/// Streaming context of one session; doubles as the relay endpoint's
/// dispatch context.
pub(crate) struct RelaySession {
    pub(crate) wal: WalHandle,
    pub(crate) relay: Arc<RelayInner>,
    pub(crate) sock: TcpStream,
    pub(crate) filter: RelayFilter,
    /// Rows sent so far, seeded with the replica's subscribe clock.
    pub(crate) vclock: VClock,
    /// Bound for join-style replays; endless when unset.
    pub(crate) stop_vclock: Option<VClock>,
    pub(crate) sync: u64,
    pub(crate) relay_pipe: Pipe,
    pub(crate) tx_pipe: Pipe,
    /// WAL events observed since the last wait; a wake signal.
    pub(crate) wal_events: WalEvents,
    pub(crate) last_status_signature: i64,
}

impl RelaySession {
    pub(crate) fn send_heartbeat(&mut self) -> Result<(), RelayError> {
        let hb = Row::heartbeat(self.wal.instance_id(), wall_clock_seconds());
        send_row(&mut self.sock, hb, self.sync)?;
        self.relay.touch_last_row_time();
        Ok(())
    }

    pub(crate) fn send_row_stamped(&mut self, row: Row) -> Result<(), RelayError> {
        send_row(&mut self.sock, row, self.sync)?;
        self.relay.touch_last_row_time();
        Ok(())
    }

    /// Report the freshest acknowledged vclock to tx, keeping at most
    /// one status message in flight.
    pub(crate) fn maybe_send_status(&mut self) -> Result<(), RelayError> {
        if self.relay.status_in_flight.load(Ordering::Acquire) {
            return Ok(());
        }
        let recv = self
            .relay
            .recv_vclock
            .lock()
            .expect("relay recv vclock lock poisoned")
            .clone();
        if recv.sum() == self.last_status_signature {
            return Ok(());
        }
        self.last_status_signature = recv.sum();
        self.relay.status_in_flight.store(true, Ordering::Release);
        let env = Envelope::new(
            RelayStatusMsg {
                relay: Arc::clone(&self.relay),
                vclock: recv,
            },
            vec![
                Hop {
                    perform: tx_status_update,
                    next: Some(self.relay_pipe.clone()),
                },
                Hop {
                    perform: relay_status_update,
                    next: None,
                },
            ],
        );
        self.tx_pipe.push(env)?;
        Ok(())
    }

    pub(crate) fn check_cancel(&self) -> Result<(), RelayError> {
        if self.relay.is_cancelled() {
            Err(if self.relay.wal_exited() {
                RelayError::WalExit
            } else {
                RelayError::Cancelled
            })
        } else {
            Ok(())
        }
    }
}

/// Acknowledged-vclock message bouncing relay -> tx -> relay. While it is
/// in flight no second status message is sent.
struct RelayStatusMsg {
    relay: Arc<RelayInner>,
    vclock: VClock,
}

/// TX-side hop: record the replica's progress and feed the matrix clock
/// for registered replicas; anonymous ones never pin retention.
fn tx_status_update(cx: &mut dyn Any, env: &mut Envelope) {
    let tx = cx.downcast_mut::<TxWorld>().expect("tx context");
    let msg = env.payload_mut::<RelayStatusMsg>();
    *msg.relay
        .tx_vclock
        .write()
        .expect("relay tx vclock lock poisoned") = msg.vclock.clone();
    if !msg.relay.anon
        && tx
            .wal_pipe
            .push(consumer_update_envelope(
                msg.relay.replica_id,
                msg.vclock.clone(),
            ))
            .is_err()
    {
        tracing::trace!("wal endpoint gone, dropping consumer update");
    }
}

/// Relay-side hop: the round trip is over.
fn relay_status_update(_cx: &mut dyn Any, env: &mut Envelope) {
    env.payload_mut::<RelayStatusMsg>()
        .relay
        .status_in_flight
        .store(false, Ordering::Release);
}

/// WAL watcher hop on the relay endpoint. Re-checks cancellation first:
/// a cancelled session may have left a partial frame on the socket, and
/// acting on the event would corrupt the stream.
fn relay_watcher_perform(cx: &mut dyn Any, env: &mut Envelope) {
    let session = cx
        .downcast_mut::<RelaySession>()
        .expect("relay session context");
    if session.relay.is_cancelled() {
        return;
    }
    session.wal_events |= env.payload_mut::<WatcherNotice>().events;
}

/// Ack reader: one row-per-frame vclocks from the replica, with the
/// disconnect deadline. The first error wins the diagnostic slot and
/// cancels the session.
fn ack_reader(sock: TcpStream, relay: Arc<RelayInner>, timeout: Duration) {
    if let Err(err) = sock.set_read_timeout(Some(timeout)) {
        relay.set_diag(&format!("ack reader setup failed: {err}"));
        relay.cancel_session();
        return;
    }
    let mut frames = FrameReader::new(BufReader::new(sock));
    while !relay.is_cancelled() {
        match frames.read_frame() {
            Ok(Some(rows)) => {
                for row in rows {
                    match row.decode_vclock() {
                        Ok(vclock) => {
                            *relay
                                .recv_vclock
                                .lock()
                                .expect("relay recv vclock lock poisoned") = vclock;
                        }
                        Err(err) => {
                            relay.set_diag(&format!("bad acknowledgement: {err}"));
                            relay.cancel_session();
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                relay.set_diag(&RelayError::Eof.to_string());
                relay.cancel_session();
                return;
            }
            Err(FrameError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                relay.set_diag(&RelayError::Timeout.to_string());
                relay.cancel_session();
                return;
            }
            Err(err) => {
                if !relay.is_cancelled() {
                    relay.set_diag(&format!("ack read failed: {err}"));
                }
                relay.cancel_session();
                return;
            }
        }
    }
}

/// Serve a subscribe request. Streams rows to the replica from the
/// memory ring with segment-file fallback, starting at `replica_clock`,
/// until the session fails or is cancelled. Blocks the caller for the
/// session's lifetime; `relay.cancel()` unwinds it.
pub fn subscribe(
    wal: &WalHandle,
    relay: &Relay,
    socket: TcpStream,
    sync: u64,
    replica_clock: VClock,
    replica_version: u32,
) -> Result<(), RelayError> {
    let inner = Arc::clone(&relay.inner);
    if relay.state() == RelayState::Follow {
        return Err(RelayError::AlreadyFollowing);
    }
    tracing::info!(
        replica = %inner.uuid,
        version = replica_version,
        clock = %replica_clock,
        "starting subscribe session"
    );
    // seed retention before the first row goes out
    if !inner.anon {
        wal.consumer_update(inner.replica_id, replica_clock.clone());
    }
    let local_vclock_at_subscribe = wal.tx_vclock();
    *inner
        .tx_vclock
        .write()
        .expect("relay tx vclock lock poisoned") = replica_clock.clone();
    inner.start(socket.try_clone().map_err(RelayError::Io)?);

    let thread_wal = wal.clone();
    let thread_inner = Arc::clone(&inner);
    let handle = thread::Builder::new()
        .name(format!("relay/{}", inner.uuid))
        .spawn(move || {
            run_session(
                thread_wal,
                thread_inner,
                socket,
                sync,
                replica_clock,
                local_vclock_at_subscribe,
            )
        })
        .expect("spawn relay thread");
    let result = handle.join().unwrap_or(Err(RelayError::Cancelled));
    inner.stop();
    if let Err(err) = &result {
        tracing::warn!(replica = %inner.uuid, "subscribe session ended: {err}");
    }
    result
}

fn run_session(
    wal: WalHandle,
    relay: Arc<RelayInner>,
    sock: TcpStream,
    sync: u64,
    replica_clock: VClock,
    local_vclock_at_subscribe: VClock,
) -> Result<(), RelayError> {
    let endpoint_name = format!("relay/{}", relay.uuid);
    let endpoint = wal.bus().endpoint(&endpoint_name)?;
    let relay_pipe = wal.bus().pipe(&endpoint_name)?;
    let tx_pipe = wal.bus().pipe("tx")?;
    let reader_sock = sock.try_clone().map_err(RelayError::Io)?;

    let hook_relay = Arc::clone(&relay);
    let hook_id = wal.register_exit_hook(Box::new(move || {
        hook_relay.cancel_for_wal_exit();
    }));
    let watcher_id = match wal.attach_watcher(relay_pipe.clone(), relay_watcher_perform) {
        Ok(id) => id,
        Err(err) => {
            wal.unregister_exit_hook(hook_id);
            return Err(err.into());
        }
    };

    let reader_relay = Arc::clone(&relay);
    let disconnect_timeout = wal.replication_disconnect_timeout();
    let reader = thread::Builder::new()
        .name(format!("relay/{}:reader", relay.uuid))
        .spawn(move || ack_reader(reader_sock, reader_relay, disconnect_timeout))
        .expect("spawn relay ack reader");

    let mut session = RelaySession {
        filter: RelayFilter::subscribe(relay.replica_id, local_vclock_at_subscribe),
        wal: wal.clone(),
        relay: Arc::clone(&relay),
        sock,
        vclock: replica_clock,
        stop_vclock: None,
        sync,
        relay_pipe,
        tx_pipe,
        wal_events: WalEvents::NONE,
        last_status_signature: 0,
    };

    // if the replica is already up to date, update its replication lag
    // right away instead of waiting out the first timeout
    let result = session
        .send_heartbeat()
        .and_then(|()| session.stream(&endpoint));

    if let Err(err) = &result {
        relay.set_diag(&err.to_string());
        tracing::warn!(replica = %relay.uuid, "exiting the relay loop: {err}");
    }

    // teardown: stop the sibling first, then detach from the wal
    relay.cancel_session();
    let _ = reader.join();
    if !relay.wal_exited() {
        let _ = wal.detach_watcher(watcher_id);
        wal.unregister_exit_hook(hook_id);
    }
    drop(endpoint);
    result
}

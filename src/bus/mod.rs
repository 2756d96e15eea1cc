//! In-process message bus connecting named thread endpoints.
//!
//! Every thread of the engine (tx, wal, relay/<id>) owns one endpoint. A
//! message is an envelope carrying an owned payload and a route: an
//! ordered list of (handler, next-pipe) hops. Dispatch pops the current
//! hop, runs it against the endpoint's context, and forwards the envelope
//! along the hop's pipe, if any.
//!
//! Two pipes exist per endpoint. The priority pipe is drained before the
//! regular one in every scheduling round and its handlers must not block:
//! it is the wal-to-tx return path that has to make progress even when tx
//! is saturated with client traffic. Messages along a single pipe are
//! FIFO; distinct pipes are independent.
//!
//! A call (push plus wait for a reply) is expressed by embedding a
//! `crossbeam::channel::Sender` in the payload; the caller blocks on the
//! paired receiver. Only callers that can block without holding locks may
//! use it.

use std::any::Any;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, select, unbounded};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("endpoint {name} is already registered")]
    Duplicate { name: String },
    #[error("no endpoint named {name}")]
    NoEndpoint { name: String },
    #[error("endpoint {name} is gone")]
    Closed { name: String },
}

/// One route step: a handler executed at the endpoint the envelope is
/// currently queued on, then an optional pipe to the next endpoint.
pub struct Hop {
    pub perform: Handler,
    pub next: Option<Pipe>,
}

pub type Handler = fn(&mut dyn Any, &mut Envelope);

pub struct Envelope {
    route: VecDeque<Hop>,
    payload: Option<Box<dyn Any + Send>>,
}

impl Envelope {
    pub fn new<P: Any + Send>(payload: P, route: Vec<Hop>) -> Self {
        Self {
            route: route.into(),
            payload: Some(Box::new(payload)),
        }
    }

    /// Borrow the payload. The payload type is part of the route contract;
    /// a mismatch is a routing bug.
    pub fn payload_mut<P: Any>(&mut self) -> &mut P {
        self.payload
            .as_mut()
            .expect("envelope payload already taken")
            .downcast_mut::<P>()
            .expect("envelope payload type mismatch")
    }

    pub fn take_payload<P: Any>(&mut self) -> Box<P> {
        self.payload
            .take()
            .expect("envelope payload already taken")
            .downcast::<P>()
            .ok()
            .expect("envelope payload type mismatch")
    }

    /// Detach the remaining route and payload into a new envelope. The
    /// dispatcher then treats the original as consumed; the handler is
    /// responsible for pushing the detached envelope onward. Used when a
    /// handler must control the order between forwarding and its own
    /// side effects.
    pub fn detach(&mut self) -> Envelope {
        Envelope {
            route: std::mem::take(&mut self.route),
            payload: self.payload.take(),
        }
    }
}

#[derive(Clone)]
pub struct Pipe {
    endpoint: Arc<str>,
    tx: Sender<Envelope>,
}

impl Pipe {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn push(&self, env: Envelope) -> Result<(), BusError> {
        self.tx.send(env).map_err(|_| BusError::Closed {
            name: self.endpoint.to_string(),
        })
    }
}

struct EndpointSlots {
    normal: Sender<Envelope>,
    prio: Sender<Envelope>,
}

/// Process-wide endpoint registry.
#[derive(Clone, Default)]
pub struct Bus {
    slots: Arc<Mutex<HashMap<String, EndpointSlots>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and hand back its receiving half. The caller
    /// thread owns the endpoint and is the only consumer.
    pub fn endpoint(&self, name: &str) -> Result<Endpoint, BusError> {
        let mut slots = self.slots.lock().expect("bus registry lock poisoned");
        if slots.contains_key(name) {
            return Err(BusError::Duplicate {
                name: name.to_string(),
            });
        }
        let (normal_tx, normal_rx) = unbounded();
        let (prio_tx, prio_rx) = unbounded();
        slots.insert(
            name.to_string(),
            EndpointSlots {
                normal: normal_tx,
                prio: prio_tx,
            },
        );
        Ok(Endpoint {
            name: name.to_string(),
            bus: self.clone(),
            normal: normal_rx,
            prio: prio_rx,
        })
    }

    pub fn pipe(&self, name: &str) -> Result<Pipe, BusError> {
        self.pipe_inner(name, false)
    }

    /// Priority pipe: drained ahead of the regular pipe each round.
    pub fn prio_pipe(&self, name: &str) -> Result<Pipe, BusError> {
        self.pipe_inner(name, true)
    }

    fn pipe_inner(&self, name: &str, prio: bool) -> Result<Pipe, BusError> {
        let slots = self.slots.lock().expect("bus registry lock poisoned");
        let slot = slots.get(name).ok_or_else(|| BusError::NoEndpoint {
            name: name.to_string(),
        })?;
        Ok(Pipe {
            endpoint: Arc::from(name),
            tx: if prio {
                slot.prio.clone()
            } else {
                slot.normal.clone()
            },
        })
    }

    fn unregister(&self, name: &str) {
        self.slots
            .lock()
            .expect("bus registry lock poisoned")
            .remove(name);
    }
}

pub struct Endpoint {
    name: String,
    bus: Bus,
    normal: Receiver<Envelope>,
    prio: Receiver<Envelope>,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(cx: &mut dyn Any, mut env: Envelope) {
        let Some(hop) = env.route.pop_front() else {
            return;
        };
        (hop.perform)(cx, &mut env);
        if env.payload.is_none() {
            // handler detached the envelope and owns its routing now
            return;
        }
        if let Some(next) = hop.next
            && let Err(err) = next.push(env)
        {
            tracing::trace!("dropping envelope routed to a dead endpoint: {err}");
        }
    }

    /// Drain pending messages, priority pipe first. Returns the number of
    /// dispatched envelopes.
    pub fn process(&self, cx: &mut dyn Any) -> usize {
        let mut n = 0;
        loop {
            if let Ok(env) = self.prio.try_recv() {
                Self::dispatch(cx, env);
                n += 1;
                continue;
            }
            match self.normal.try_recv() {
                Ok(env) => {
                    Self::dispatch(cx, env);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    /// Like `process`, but blocks up to `timeout` for the first message
    /// when both pipes are empty.
    pub fn process_for(&self, cx: &mut dyn Any, timeout: Duration) -> usize {
        let n = self.process(cx);
        if n > 0 {
            return n;
        }
        let first = select! {
            recv(self.prio) -> env => env.ok(),
            recv(self.normal) -> env => env.ok(),
            default(timeout) => None,
        };
        match first {
            Some(env) => {
                Self::dispatch(cx, env);
                1 + self.process(cx)
            }
            None => 0,
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.bus.unregister(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestCx {
        seen: Vec<&'static str>,
    }

    fn record_a(cx: &mut dyn Any, _env: &mut Envelope) {
        cx.downcast_mut::<TestCx>().unwrap().seen.push("a");
    }

    fn record_b(cx: &mut dyn Any, _env: &mut Envelope) {
        cx.downcast_mut::<TestCx>().unwrap().seen.push("b");
    }

    fn bump(cx: &mut dyn Any, env: &mut Envelope) {
        let _ = cx;
        *env.payload_mut::<u64>() += 1;
    }

    fn reply(_cx: &mut dyn Any, env: &mut Envelope) {
        let payload = env.take_payload::<(u64, Sender<u64>)>();
        let _ = payload.1.send(payload.0 * 2);
    }

    #[test]
    fn fifo_within_a_pipe() {
        let bus = Bus::new();
        let ep = bus.endpoint("tx").unwrap();
        let pipe = bus.pipe("tx").unwrap();
        pipe.push(Envelope::new(
            (),
            vec![Hop {
                perform: record_a,
                next: None,
            }],
        ))
        .unwrap();
        pipe.push(Envelope::new(
            (),
            vec![Hop {
                perform: record_b,
                next: None,
            }],
        ))
        .unwrap();
        let mut cx = TestCx::default();
        assert_eq!(ep.process(&mut cx), 2);
        assert_eq!(cx.seen, vec!["a", "b"]);
    }

    #[test]
    fn priority_pipe_runs_first() {
        let bus = Bus::new();
        let ep = bus.endpoint("tx").unwrap();
        let normal = bus.pipe("tx").unwrap();
        let prio = bus.prio_pipe("tx").unwrap();
        normal
            .push(Envelope::new(
                (),
                vec![Hop {
                    perform: record_b,
                    next: None,
                }],
            ))
            .unwrap();
        prio.push(Envelope::new(
            (),
            vec![Hop {
                perform: record_a,
                next: None,
            }],
        ))
        .unwrap();
        let mut cx = TestCx::default();
        ep.process(&mut cx);
        assert_eq!(cx.seen, vec!["a", "b"]);
    }

    #[test]
    fn route_hops_across_endpoints() {
        let bus = Bus::new();
        let tx = bus.endpoint("tx").unwrap();
        let wal = bus.endpoint("wal").unwrap();
        let to_wal = bus.pipe("wal").unwrap();
        let to_tx = bus.pipe("tx").unwrap();

        to_wal
            .push(Envelope::new(
                0u64,
                vec![
                    Hop {
                        perform: bump,
                        next: Some(to_tx.clone()),
                    },
                    Hop {
                        perform: bump,
                        next: None,
                    },
                ],
            ))
            .unwrap();

        let mut wal_cx = TestCx::default();
        let mut tx_cx = TestCx::default();
        assert_eq!(wal.process(&mut wal_cx), 1);
        assert_eq!(tx.process(&mut tx_cx), 1);
        // both hops ran; the envelope ended its route on tx
        assert_eq!(tx.process(&mut tx_cx), 0);
    }

    #[test]
    fn call_pattern_with_reply_channel() {
        let bus = Bus::new();
        let wal = bus.endpoint("wal").unwrap();
        let pipe = bus.pipe("wal").unwrap();
        let (reply_tx, reply_rx) = crossbeam::channel::bounded::<u64>(1);
        pipe.push(Envelope::new(
            (21u64, reply_tx),
            vec![Hop {
                perform: reply,
                next: None,
            }],
        ))
        .unwrap();
        let mut cx = TestCx::default();
        wal.process(&mut cx);
        assert_eq!(reply_rx.recv().unwrap(), 42);
    }

    #[test]
    fn push_to_dropped_endpoint_fails() {
        let bus = Bus::new();
        let pipe = {
            let _ep = bus.endpoint("relay/1").unwrap();
            bus.pipe("relay/1").unwrap()
        };
        assert!(matches!(
            pipe.push(Envelope::new((), Vec::new())),
            Err(BusError::Closed { .. })
        ));
        // the name is free again after drop
        assert!(bus.endpoint("relay/1").is_ok());
    }
}

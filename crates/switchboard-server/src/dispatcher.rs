//! Per-worker event loop: drains one completion queue and demultiplexes
//! events to the owning call slots.
//!
//! Each worker owns its queue for locality; a slot is only ever touched by
//! the worker that armed it, so slots need no internal locking. The loop
//! waits with a short timeout so it can observe the stop flag, and on stop
//! it drains the queue, advancing every remaining slot to a terminal state
//! so no call is leaked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchboard_transport::{CqNext, Tag};

use crate::slot::{fresh_tag, ActiveSlot, SlotEnv, SlotFactory, SlotState};

const EVENT_WAIT: Duration = Duration::from_millis(200);

pub(crate) struct Dispatcher {
    env: SlotEnv,
    slots: HashMap<Tag, Box<dyn ActiveSlot>>,
    running: Arc<AtomicBool>,
    index: usize,
}

impl Dispatcher {
    pub(crate) fn new(env: SlotEnv, running: Arc<AtomicBool>, index: usize) -> Self {
        Self {
            env,
            slots: HashMap::new(),
            running,
            index,
        }
    }

    fn arm(&mut self, mut slot: Box<dyn ActiveSlot>) {
        let tag = fresh_tag();
        slot.start(tag, &self.env);
        self.slots.insert(tag, slot);
    }

    pub(crate) fn run(mut self, factories: Vec<Arc<dyn SlotFactory>>, slots_per_method: usize) {
        let _mask = signal::block_worker_signals();

        for factory in &factories {
            for _ in 0..slots_per_method.max(1) {
                self.arm(factory.make());
            }
        }
        self.env.hooks.on_info(&format!(
            "worker {} started with {} armed slots",
            self.index,
            self.slots.len()
        ));

        while self.running.load(Ordering::SeqCst) {
            match self.env.cq.next(EVENT_WAIT) {
                CqNext::Event { tag, ok } => self.handle_event(tag, ok, false),
                CqNext::TimedOut => continue,
                CqNext::Shutdown => break,
            }
        }

        // Stop flag observed: shut the queue down and drain what is left,
        // advancing every slot to a terminal state.
        self.env.cq.shutdown();
        while let Some((tag, ok)) = self.env.cq.try_next() {
            self.handle_event(tag, ok, true);
        }

        self.env
            .hooks
            .on_info(&format!("worker {} is completed", self.index));
    }

    fn handle_event(&mut self, tag: Tag, ok: bool, draining: bool) {
        let (state, fresh) = match self.slots.get(&tag) {
            Some(slot) => {
                let state = slot.state();
                // Leaving the accept state, successfully or not: arm a
                // replacement before the event is processed so accept
                // capacity never dips. The drain path is the exception;
                // there the remaining slots only advance to terminal.
                let fresh = if state == SlotState::Accept && !draining {
                    Some(slot.clone_fresh())
                } else {
                    None
                };
                (state, fresh)
            }
            None => {
                self.env
                    .hooks
                    .on_error(&format!("completion queue returned unknown tag {}", tag.0));
                return;
            }
        };
        if let Some(fresh) = fresh {
            self.arm(fresh);
        }

        let Some(slot) = self.slots.get_mut(&tag) else {
            return;
        };

        if !ok {
            match state {
                // A failed read means the client half-closed its stream.
                SlotState::Read => {
                    slot.set_state(SlotState::ReadEnd);
                    slot.process(&self.env);
                }
                // Failed accept (transport shutting down): the slot is
                // spent; its replacement was armed above unless the
                // queue is draining.
                SlotState::Accept => {
                    slot.set_state(SlotState::Done);
                }
                SlotState::Finish => {
                    slot.end(&self.env, true);
                }
                SlotState::Write => {
                    self.env.hooks.on_error(&format!(
                        "completion failed for method '{}' in state {state:?}",
                        slot.full_name()
                    ));
                    slot.fail(&self.env);
                }
                SlotState::ReadEnd | SlotState::Done => {
                    self.env.hooks.on_error(&format!(
                        "unexpected failed completion for method '{}' in state {state:?}",
                        slot.full_name()
                    ));
                    slot.set_state(SlotState::Done);
                }
            }
        } else {
            match state {
                SlotState::Accept | SlotState::Read | SlotState::Write | SlotState::ReadEnd => {
                    slot.process(&self.env);
                }
                SlotState::Finish => {
                    slot.end(&self.env, false);
                }
                SlotState::Done => {
                    self.env.hooks.on_error(&format!(
                        "completion for already-terminal slot of method '{}'",
                        slot.full_name()
                    ));
                }
            }
        }

        if self
            .slots
            .get(&tag)
            .map(|slot| slot.state() == SlotState::Done)
            .unwrap_or(false)
        {
            self.slots.remove(&tag);
        }
    }
}

/// Worker threads leave SIGHUP and SIGINT to the main thread so Ctrl-C
/// still reaches the default handlers and triggers orderly shutdown. The
/// previous mask is restored when the guard drops.
#[cfg(unix)]
mod signal {
    pub(crate) struct SignalMaskGuard {
        old: libc::sigset_t,
    }

    pub(crate) fn block_worker_signals() -> SignalMaskGuard {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGHUP);
            libc::sigaddset(&mut set, libc::SIGINT);
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
            SignalMaskGuard { old }
        }
    }

    impl Drop for SignalMaskGuard {
        fn drop(&mut self) {
            unsafe {
                libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
            }
        }
    }
}

#[cfg(not(unix))]
mod signal {
    pub(crate) struct SignalMaskGuard;

    pub(crate) fn block_worker_signals() -> SignalMaskGuard {
        SignalMaskGuard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use switchboard_transport::{
        bincode_marshaller, CompletionQueue, MethodDescriptor, MethodKind, ServerTransport,
    };

    use crate::metrics::RegistryMetrics;
    use crate::server::{ServerBuilder, ServerHandler};
    use crate::slot::{UnaryBinding, UnaryBindingInner};

    struct QuietHooks;

    impl ServerHandler for QuietHooks {
        fn on_init(&self, _builder: &mut ServerBuilder) -> bool {
            true
        }
        fn on_error(&self, _msg: &str) {}
        fn on_info(&self, _msg: &str) {}
    }

    fn noop_factory() -> Arc<dyn SlotFactory> {
        Arc::new(UnaryBinding {
            inner: Arc::new(UnaryBindingInner {
                desc: MethodDescriptor::<(), ()> {
                    service: "drill.Service",
                    method: "Noop",
                    kind: MethodKind::Unary,
                    req: bincode_marshaller(),
                    resp: bincode_marshaller(),
                },
                handler: Box::new(|_ctx, _req, _resp| {}),
                param: None,
            }),
        })
    }

    fn dispatcher_for(uri: &str) -> (ServerTransport, Arc<CompletionQueue>, Dispatcher) {
        let methods: HashMap<String, MethodKind> =
            [("drill.Service/Noop".to_string(), MethodKind::Unary)].into();
        let transport = ServerTransport::bind(&[uri.to_string()], methods).unwrap();
        let cq = Arc::new(CompletionQueue::new());
        let env = SlotEnv {
            transport: transport.clone(),
            cq: cq.clone(),
            hooks: Arc::new(QuietHooks),
            metrics: Arc::new(RegistryMetrics::new()),
        };
        let dispatcher = Dispatcher::new(env, Arc::new(AtomicBool::new(true)), 0);
        (transport, cq, dispatcher)
    }

    #[test]
    fn test_failed_accept_rearms_fresh_slot() {
        let (transport, cq, mut dispatcher) = dispatcher_for("unix-abstract:swb-dispatch-rearm");
        dispatcher.arm(noop_factory().make());
        assert_eq!(dispatcher.slots.len(), 1);
        let old_tag = *dispatcher.slots.keys().next().unwrap();

        // Shutting the transport down completes the armed accept ok=false.
        transport.shutdown();
        let event = cq.next(Duration::from_millis(500));
        let CqNext::Event { tag, ok } = event else {
            panic!("expected a completion, got {event:?}");
        };
        assert_eq!(tag, old_tag);
        assert!(!ok);

        dispatcher.handle_event(tag, ok, false);

        // The spent slot is discarded and exactly one fresh slot is armed
        // in its place, under a new tag, back in the accept state.
        assert_eq!(dispatcher.slots.len(), 1);
        let (new_tag, fresh) = dispatcher.slots.iter().next().unwrap();
        assert_ne!(*new_tag, old_tag);
        assert_eq!(fresh.state(), SlotState::Accept);

        // The re-arm reached the transport: the downed listener fails the
        // fresh accept right away too.
        assert!(matches!(
            cq.next(Duration::from_millis(500)),
            CqNext::Event { ok: false, .. }
        ));
    }

    #[test]
    fn test_draining_failed_accept_is_not_rearmed() {
        let (transport, cq, mut dispatcher) = dispatcher_for("unix-abstract:swb-dispatch-drain");
        dispatcher.arm(noop_factory().make());
        let old_tag = *dispatcher.slots.keys().next().unwrap();

        transport.shutdown();
        let event = cq.next(Duration::from_millis(500));
        let CqNext::Event { tag, ok } = event else {
            panic!("expected a completion, got {event:?}");
        };
        assert_eq!(tag, old_tag);

        dispatcher.handle_event(tag, ok, true);

        // During the drain the slot only advances to terminal.
        assert!(dispatcher.slots.is_empty());
        assert!(cq.try_next().is_none());
    }
}

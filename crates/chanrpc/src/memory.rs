//! In-process ports.
//!
//! `MemoryPort::pair()` returns two connected ends, like the two ports of a
//! message channel. Each end implements both port flavors, so either adapter
//! can sit on top of it.
//!
//! Messages posted on one end are delivered synchronously to the listeners of
//! the other end. Messages posted before the other end has any listener are
//! queued and handed to the first listener that registers.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::transport;
use crate::transport::CloseHandler;
use crate::transport::EmitterPort;
use crate::transport::EventPort;
use crate::transport::ListenerId;
use crate::transport::MessageHandler;
use crate::transport::Port;

#[derive(Default)]
struct Endpoint {
    listeners: Mutex<Vec<(ListenerId, MessageHandler)>>,
    queued: Mutex<Vec<String>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    next_listener: AtomicU64,
}

impl Endpoint {
    fn deliver(&self, message: String) {
        let handlers: Vec<MessageHandler> = {
            let listeners = lock(&self.listeners);
            if listeners.is_empty() {
                lock(&self.queued).push(message);
                return;
            }
            listeners.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(message.clone());
        }
    }

    fn listen(&self, handler: MessageHandler) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let backlog = {
            let mut listeners = lock(&self.listeners);
            listeners.push((id, Arc::clone(&handler)));
            std::mem::take(&mut *lock(&self.queued))
        };
        for message in backlog {
            handler(message);
        }
        id
    }

    fn unlisten(&self, id: ListenerId) {
        lock(&self.listeners).retain(|(listener, _)| *listener != id);
    }

    fn fire_close(&self) {
        let handlers = std::mem::take(&mut *lock(&self.close_handlers));
        for handler in handlers {
            handler();
        }
    }
}

struct Shared {
    ends: [Endpoint; 2],
    closed: AtomicBool,
}

/// One end of an in-process message channel.
#[derive(Clone)]
pub struct MemoryPort {
    shared: Arc<Shared>,
    side: usize,
}

impl MemoryPort {
    /// Creates a pair of ports connected to each other.
    ///
    /// Messages posted on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let shared = Arc::new(Shared {
            ends: [Endpoint::default(), Endpoint::default()],
            closed: AtomicBool::new(false),
        });
        let a = Self { shared: Arc::clone(&shared), side: 0 };
        let b = Self { shared, side: 1 };
        (a, b)
    }

    /// Disconnects both ends. Close handlers on both ends run once.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for end in &self.shared.ends {
            end.fire_close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// This end, seen through the listener-registration adapter.
    pub fn event_port(&self) -> Port {
        Port::Event(Arc::new(self.clone()))
    }

    /// This end, seen through the emitter adapter.
    pub fn emitter_port(&self) -> Port {
        Port::Emitter(Arc::new(self.clone()))
    }

    fn local(&self) -> &Endpoint {
        &self.shared.ends[self.side]
    }

    fn remote(&self) -> &Endpoint {
        &self.shared.ends[1 - self.side]
    }

    fn post(&self, message: String) -> transport::Result<()> {
        if self.is_closed() {
            return Err(transport::Error::Closed);
        }
        self.remote().deliver(message);
        Ok(())
    }
}

impl EventPort for MemoryPort {
    fn post_message(&self, message: String) -> transport::Result<()> {
        self.post(message)
    }

    fn add_message_listener(&self, handler: MessageHandler) -> ListenerId {
        self.local().listen(handler)
    }

    fn remove_message_listener(&self, id: ListenerId) {
        self.local().unlisten(id);
    }
}

impl EmitterPort for MemoryPort {
    fn post_message(&self, message: String) -> transport::Result<()> {
        self.post(message)
    }

    fn on_message(&self, handler: MessageHandler) -> ListenerId {
        self.local().listen(handler)
    }

    fn off_message(&self, id: ListenerId) {
        self.local().unlisten(id);
    }

    fn once_close(&self, handler: CloseHandler) {
        if self.is_closed() {
            handler();
            return;
        }
        lock(&self.local().close_handlers).push(handler);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(port: &MemoryPort) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        EventPort::add_message_listener(port, Arc::new(move |msg: String| sink.lock().unwrap().push(msg)));
        seen
    }

    #[test]
    fn test_pair_delivers_both_ways() {
        let (a, b) = MemoryPort::pair();
        let at_a = recorder(&a);
        let at_b = recorder(&b);

        EventPort::post_message(&a, "ping".into()).unwrap();
        EventPort::post_message(&b, "pong".into()).unwrap();

        assert_eq!(*at_b.lock().unwrap(), vec!["ping".to_string()]);
        assert_eq!(*at_a.lock().unwrap(), vec!["pong".to_string()]);
    }

    #[test]
    fn test_messages_queue_until_first_listener() {
        let (a, b) = MemoryPort::pair();
        EventPort::post_message(&a, "early".into()).unwrap();
        let at_b = recorder(&b);
        assert_eq!(*at_b.lock().unwrap(), vec!["early".to_string()]);
    }

    #[test]
    fn test_removed_listener_stops_receiving() {
        let (a, b) = MemoryPort::pair();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let id = EventPort::add_message_listener(&b, Arc::new(move |_: String| *sink.lock().unwrap() += 1));

        EventPort::post_message(&a, "one".into()).unwrap();
        b.remove_message_listener(id);
        EventPort::post_message(&a, "two".into()).unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_close_fires_once_and_rejects_posts() {
        let (a, b) = MemoryPort::pair();
        let fired = Arc::new(AtomicU64::new(0));
        for port in [&a, &b] {
            let fired = Arc::clone(&fired);
            port.once_close(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        a.close();
        b.close();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(EmitterPort::post_message(&b, "late".into()), Err(transport::Error::Closed));
    }

    #[test]
    fn test_dropped_adapters_release_their_listeners() {
        let (a, _b) = MemoryPort::pair();

        let emitter = a.emitter_port().into_transport();
        let event = a.event_port().into_transport();
        assert_eq!(lock(&a.local().listeners).len(), 2);

        drop(emitter);
        assert_eq!(lock(&a.local().listeners).len(), 1);
        drop(event);
        assert!(lock(&a.local().listeners).is_empty());
    }
}

// In-process duplex message ports, the transport the binders run on.
//
// A `channel()` pair moves discrete messages in both directions. The message
// body is an opaque boxed value; ports listed alongside it move to the
// receiver with the message, which is how reply endpoints and the generator
// sub-channels travel nested inside other messages.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type Body = Box<dyn Any + Send>;

pub struct Envelope {
    pub body: Body,
    pub ports: Vec<Port>,
}

impl Envelope {
    // Splits the envelope into a typed body and its ports, or hands it back
    // unchanged when the body is of another type.
    pub fn downcast<T: Any>(self) -> Result<(T, Vec<Port>), Envelope> {
        let Envelope { body, ports } = self;
        match body.downcast::<T>() {
            Ok(body) => Ok((*body, ports)),
            Err(body) => Err(Envelope { body, ports }),
        }
    }
}

type Listener = Box<dyn FnMut(Envelope) -> Option<Envelope> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
    delivering: bool,
    stale: Vec<ListenerId>,
}

impl Registry {
    fn clear(&mut self) {
        self.entries.clear();
        self.stale.clear();
    }
}

struct Shared {
    id: u64,
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    listeners: Mutex<Registry>,
    closed: CancellationToken,
}

impl Shared {
    fn send(&self, body: Body, ports: Vec<Port>) -> Result<(), Error> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(Error::ChannelClosed)?;
        sender
            .send(Envelope { body, ports })
            .map_err(|_| Error::ChannelClosed)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let mut registry = self.listeners.lock();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.entries.push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        let mut registry = self.listeners.lock();
        registry.entries.retain(|(entry, _)| *entry != id);
        if registry.delivering {
            registry.stale.push(id);
        }
    }
}

// Listeners are offered the envelope in registration order until one of them
// consumes it. The entries run outside the registry lock so a listener can
// register and remove listeners on its own port; removals requested while
// they run are applied when the entries are put back.
fn deliver(shared: &Shared, envelope: Envelope) {
    let mut entries = {
        let mut registry = shared.listeners.lock();
        registry.delivering = true;
        std::mem::take(&mut registry.entries)
    };
    let mut offered = Some(envelope);
    for (_, listener) in entries.iter_mut() {
        match offered.take() {
            Some(envelope) => offered = listener(envelope),
            None => break,
        }
    }
    if offered.is_some() {
        tracing::trace!("message not claimed by any listener on port {}", shared.id);
    }

    let mut registry = shared.listeners.lock();
    registry.delivering = false;
    if shared.closed.is_cancelled() {
        // The port closed while the listeners ran; the taken entries die with
        // the registry.
        registry.clear();
        return;
    }
    entries.retain(|(id, _)| !registry.stale.contains(id));
    registry.stale.clear();
    let added = std::mem::replace(&mut registry.entries, entries);
    registry.entries.extend(added);
}

pub struct Port {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

pub fn channel() -> (Port, Port) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let a = Port::new(tx_b, rx_a);
    let b = Port::new(tx_a, rx_b);
    tracing::trace!("created port pair {} <-> {}", a.id(), b.id());
    (a, b)
}

impl Port {
    fn new(sender: mpsc::UnboundedSender<Envelope>, receiver: mpsc::UnboundedReceiver<Envelope>) -> Port {
        Port {
            shared: Arc::new(Shared {
                id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
                sender: Mutex::new(Some(sender)),
                listeners: Mutex::new(Registry::default()),
                closed: CancellationToken::new(),
            }),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    // Ports listed in `transfer` move to the receiver with the message.
    pub fn send<M: Send + 'static>(&self, message: M, transfer: Vec<Port>) -> Result<(), Error> {
        self.shared.send(Box::new(message), transfer)
    }

    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(Envelope) -> Option<Envelope> + Send + 'static,
    {
        self.shared.add_listener(Box::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.remove_listener(id)
    }

    // Activates delivery. Messages sent before the port is started are queued
    // and delivered afterwards.
    pub fn start(&self) {
        let mut receiver = match self.receiver.lock().take() {
            Some(receiver) => receiver,
            None => return,
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    biased;
                    _ = shared.closed.cancelled() => break,
                    received = receiver.recv() => match received {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                deliver(&shared, envelope);
            }
            shared.listeners.lock().clear();
        });
    }

    // Renders this endpoint inert: no further deliveries, later sends fail
    // with `Error::ChannelClosed`. Messages already handed to the peer stay
    // deliverable there. Idempotent; also runs on drop.
    pub fn close(&self) {
        drop(self.shared.sender.lock().take());
        self.shared.closed.cancel();
        drop(self.receiver.lock().take());
        // The delivery task clears the registry when it stops; this covers
        // ports that were never started.
        if let Some(mut registry) = self.shared.listeners.try_lock() {
            registry.clear();
        }
    }

    pub(crate) fn link(&self) -> PortLink {
        PortLink {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Port").field("id", &self.shared.id).finish()
    }
}

// Handle used by the binders to send frames and manage frame listeners
// without taking ownership of the port itself.
#[derive(Clone)]
pub(crate) struct PortLink {
    shared: Arc<Shared>,
}

impl PortLink {
    pub(crate) fn send(&self, body: Body, ports: Vec<Port>) -> Result<(), Error> {
        self.shared.send(body, ports)
    }

    pub(crate) fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(Envelope) -> Option<Envelope> + Send + 'static,
    {
        self.shared.add_listener(Box::new(listener))
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) {
        self.shared.remove_listener(id)
    }
}

// Call binder. Binding a port installs a frame listener on it; the stub on
// the other side opens a fresh reply channel per invocation and sends its
// receiving end along with the call, so concurrent calls settle
// independently and in any order.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::channel::{channel, Envelope, ListenerId, Port, PortLink};
use crate::error::Error;
use crate::protocol::{Abort, Call, Fault, Payload, Reply};

// Invoked once per incoming call. Closures of the shape
// `Fn(CallContext, A) -> impl Future<Output = Result<R, Fault>>` implement it
// automatically.
#[async_trait]
pub trait Handler<A, R>: Send + Sync + 'static {
    async fn call(&self, context: CallContext, args: A) -> Result<R, Fault>;
}

#[async_trait]
impl<A, R, F, Fut> Handler<A, R> for F
where
    A: Send + 'static,
    R: Send + 'static,
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<R, Fault>> + Send + 'static,
{
    async fn call(&self, context: CallContext, args: A) -> Result<R, Fault> {
        (self)(context, args).await
    }
}

pub struct CallContext {
    // Cancelled when the caller posts an abort for this call. Observing it is
    // cooperative; a handler that ignores it runs to completion.
    pub cancel: CancellationToken,
    // Ports that moved with the call beyond the reply endpoint.
    pub transferred: Vec<Port>,
}

#[derive(Default)]
pub struct CallOptions {
    pub signal: Option<CancellationToken>,
    pub transfer: Vec<Port>,
}

// State shared by all stub variants created from one bind.
pub(crate) struct Binding {
    link: PortLink,
    listener: Mutex<Option<ListenerId>>,
    detached: AtomicBool,
}

impl Binding {
    pub(crate) fn new(link: PortLink, listener: ListenerId) -> Binding {
        Binding {
            link,
            listener: Mutex::new(Some(listener)),
            detached: AtomicBool::new(false),
        }
    }

    pub(crate) fn send<M: Send + 'static>(&self, message: M, ports: Vec<Port>) -> Result<(), Error> {
        self.link.send(Box::new(message), ports)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        if let Some(id) = self.listener.lock().take() {
            self.link.remove_listener(id);
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

pub struct Stub<A, R> {
    binding: Arc<Binding>,
    signal: Option<CancellationToken>,
    transfer: Mutex<Vec<Port>>,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> Stub<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    // Caller-only bind: incoming calls on `port` are rejected with a
    // "no function registered" fault. Starts the port.
    pub fn bind(port: &Port) -> Stub<A, R> {
        let link = port.link();
        let listener = reject_calls(&link);
        port.start();
        Stub::from_binding(Arc::new(Binding::new(link, listener)))
    }

    // Binds `handler` to `port` and returns the stub for the opposite
    // direction. The handler's argument and result types are independent of
    // the stub's, so the two directions of a channel can disagree freely.
    pub fn bind_with<HA, HR, H>(port: &Port, handler: H) -> Stub<A, R>
    where
        HA: Send + 'static,
        HR: Send + 'static,
        H: Handler<HA, HR>,
    {
        let link = port.link();
        let listener = serve_calls(&link, Arc::new(handler));
        port.start();
        Stub::from_binding(Arc::new(Binding::new(link, listener)))
    }

    fn from_binding(binding: Arc<Binding>) -> Stub<A, R> {
        Stub {
            binding,
            signal: None,
            transfer: Mutex::new(Vec::new()),
            _types: PhantomData,
        }
    }

    // Returns a stub variant sharing this binding. The signal, when it fires,
    // aborts calls still in flight; transfer ports move to the handler with
    // the next invocation.
    pub fn with_options(&self, options: CallOptions) -> Stub<A, R> {
        Stub {
            binding: self.binding.clone(),
            signal: options.signal,
            transfer: Mutex::new(options.transfer),
            _types: PhantomData,
        }
    }

    // Permanently removes the frame listener installed by the bind. Calls
    // already in flight settle normally; from then on every stub sharing the
    // binding fails with `Error::Detached` before touching the channel.
    pub fn detach(&self) {
        self.binding.detach();
    }

    pub async fn call(&self, args: A) -> Result<R, Error> {
        if self.binding.is_detached() {
            return Err(Error::Detached);
        }
        if let Some(signal) = &self.signal {
            if signal.is_cancelled() {
                return Err(Error::Aborted);
            }
        }

        let (local, remote) = channel();
        let (settle, settled) = oneshot::channel::<Reply>();
        let mut settle = Some(settle);
        local.on_message(move |envelope| match envelope.downcast::<Reply>() {
            Ok((reply, _)) => {
                if let Some(settle) = settle.take() {
                    let _ = settle.send(reply);
                }
                None
            }
            Err(envelope) => Some(envelope),
        });
        local.start();

        let mut ports = vec![remote];
        ports.append(&mut self.transfer.lock());
        if self
            .binding
            .send(Call { args: Box::new(args) }, ports)
            .is_err()
        {
            local.close();
            return Err(Error::ChannelClosed);
        }

        let reply = match &self.signal {
            None => settled.await.ok(),
            Some(signal) => tokio::select! {
                biased;
                reply = settled => reply.ok(),
                _ = signal.cancelled() => {
                    let _ = local.send(Abort, Vec::new());
                    local.close();
                    return Err(Error::Aborted);
                }
            },
        };
        local.close();

        match reply {
            Some(Reply::Resolve(value)) => match value.downcast::<R>() {
                Ok(value) => Ok(*value),
                Err(_) => Err(Error::UnexpectedPayloadType(std::any::type_name::<R>())),
            },
            Some(Reply::Reject(fault)) => Err(fault.into()),
            // The reply channel went away without a settlement frame.
            None => Err(Error::ChannelClosed),
        }
    }
}

// Answers a call frame with a rejection. A call frame without a reply port
// is a protocol fault and panics the delivery task.
pub(crate) fn reject_call(envelope: Envelope, fault: &Fault) -> Option<Envelope> {
    match envelope.downcast::<Call>() {
        Ok((_, mut ports)) => {
            if ports.is_empty() {
                panic!("call frame arrived without a reply port");
            }
            let reply = ports.remove(0);
            tracing::debug!("rejecting call: {}", fault.message);
            let _ = reply.send(Reply::Reject(fault.clone()), Vec::new());
            reply.close();
            None
        }
        Err(envelope) => Some(envelope),
    }
}

pub(crate) fn reject_calls(link: &PortLink) -> ListenerId {
    link.add_listener(|envelope| reject_call(envelope, &Fault::no_function_registered()))
}

pub(crate) fn serve_calls<HA, HR, H>(link: &PortLink, handler: Arc<H>) -> ListenerId
where
    HA: Send + 'static,
    HR: Send + 'static,
    H: Handler<HA, HR>,
{
    link.add_listener(move |envelope| match envelope.downcast::<Call>() {
        Ok((call, mut ports)) => {
            if ports.is_empty() {
                panic!("call frame arrived without a reply port");
            }
            let reply = ports.remove(0);
            let handler = handler.clone();
            tokio::spawn(dispatch(handler, reply, call.args, ports));
            None
        }
        Err(envelope) => Some(envelope),
    })
}

async fn dispatch<HA, HR, H>(handler: Arc<H>, reply: Port, args: Payload, transferred: Vec<Port>)
where
    HA: Send + 'static,
    HR: Send + 'static,
    H: Handler<HA, HR>,
{
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        reply.on_message(move |envelope| match envelope.downcast::<Abort>() {
            Ok(_) => {
                cancel.cancel();
                None
            }
            Err(envelope) => Some(envelope),
        });
    }
    reply.start();

    let outcome = match args.downcast::<HA>() {
        Ok(args) => {
            handler
                .call(
                    CallContext {
                        cancel,
                        transferred,
                    },
                    *args,
                )
                .await
        }
        Err(_) => Err(Fault::unexpected_payload(std::any::type_name::<HA>())),
    };
    let frame = match outcome {
        Ok(value) => Reply::Resolve(Box::new(value)),
        Err(fault) => {
            tracing::debug!("call rejected: {}", fault.message);
            Reply::Reject(fault)
        }
    };
    if reply.send(frame, Vec::new()).is_err() {
        tracing::debug!("reply channel closed before the result was posted");
    }
    reply.close();
}

// Generator binder. A generate frame opens a session backed by three
// dedicated sub-channels, one per generator operation, each carrying an
// ordinary call binding. The proxy on the caller side owns its ends of the
// sub-channels and closes all three once the session reaches a terminal
// state.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{channel, ListenerId, Port, PortLink};
use crate::error::Error;
use crate::protocol::{Fault, Generate, Step};
use crate::rpc::{reject_call, serve_calls, Binding, CallContext, CallOptions, Stub};

// Server-side generator driven by a remote proxy. `finish` and `throw`
// default to answering a completed step, the contract for generators without
// a return or throw path.
#[async_trait]
pub trait Generator: Send + 'static {
    type Yield: Send + 'static;
    type Return: Send + 'static;
    type Next: Send + 'static;

    async fn next(
        &mut self,
        input: Option<Self::Next>,
    ) -> Result<Step<Self::Yield, Self::Return>, Fault>;

    async fn finish(
        &mut self,
        _value: Option<Self::Return>,
    ) -> Result<Step<Self::Yield, Self::Return>, Fault> {
        Ok(Step::Done(None))
    }

    async fn throw(
        &mut self,
        _error: Fault,
    ) -> Result<Step<Self::Yield, Self::Return>, Fault> {
        Ok(Step::Done(None))
    }
}

// Produces one generator per incoming generate frame. Closures of the shape
// `Fn(A) -> G` implement it automatically.
pub trait GeneratorFactory<A>: Send + Sync + 'static {
    type Generator: Generator;

    fn create(&self, args: A) -> Self::Generator;
}

impl<A, G, F> GeneratorFactory<A> for F
where
    F: Fn(A) -> G + Send + Sync + 'static,
    G: Generator,
{
    type Generator = G;

    fn create(&self, args: A) -> G {
        (self)(args)
    }
}

// Adapts a plain iterator: yields its items, then completes without a value.
pub struct IterGenerator<I>(I);

impl<I> IterGenerator<I> {
    pub fn new(iter: I) -> IterGenerator<I> {
        IterGenerator(iter)
    }
}

#[async_trait]
impl<I> Generator for IterGenerator<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Yield = I::Item;
    type Return = ();
    type Next = ();

    async fn next(&mut self, _input: Option<()>) -> Result<Step<I::Item, ()>, Fault> {
        Ok(match self.0.next() {
            Some(item) => Step::Yield(item),
            None => Step::Done(None),
        })
    }
}

pub struct GeneratorStub<A, Y, Rt, N> {
    binding: Arc<Binding>,
    signal: Option<CancellationToken>,
    _types: PhantomData<fn(A, N) -> (Y, Rt)>,
}

impl<A, Y, Rt, N> GeneratorStub<A, Y, Rt, N>
where
    A: Send + 'static,
    Y: Send + 'static,
    Rt: Send + 'static,
    N: Send + 'static,
{
    // Caller-only bind: generate frames arriving on `port` answer every
    // operation with a "no function registered" rejection.
    pub fn bind(port: &Port) -> Self {
        let link = port.link();
        let listener = reject_generate(&link);
        port.start();
        GeneratorStub::from_binding(Arc::new(Binding::new(link, listener)))
    }

    // Binds `factory` to `port` and returns the stub for the opposite
    // direction. The factory's argument and generator types are independent
    // of the stub's.
    pub fn bind_with<FA, F>(port: &Port, factory: F) -> Self
    where
        FA: Send + 'static,
        F: GeneratorFactory<FA>,
    {
        let link = port.link();
        let listener = serve_generate(&link, Arc::new(factory));
        port.start();
        GeneratorStub::from_binding(Arc::new(Binding::new(link, listener)))
    }

    fn from_binding(binding: Arc<Binding>) -> Self {
        GeneratorStub {
            binding,
            signal: None,
            _types: PhantomData,
        }
    }

    // Returns a stub variant whose sessions abort when `signal` fires.
    pub fn with_signal(&self, signal: CancellationToken) -> Self {
        GeneratorStub {
            binding: self.binding.clone(),
            signal: Some(signal),
            _types: PhantomData,
        }
    }

    pub fn detach(&self) {
        self.binding.detach();
    }

    // Opens a session: sends a generate frame carrying three fresh
    // sub-channels and returns the proxy driving the remote generator.
    pub fn start(&self, args: A) -> Result<GeneratorProxy<Y, Rt, N>, Error> {
        if self.binding.is_detached() {
            return Err(Error::Detached);
        }

        let (next_local, next_remote) = channel();
        let (finish_local, finish_remote) = channel();
        let (throw_local, throw_remote) = channel();

        let stubs = Arc::new(ProxyStubs {
            next: self.sub_stub(&next_local),
            finish: self.sub_stub(&finish_local),
            throw: self.sub_stub(&throw_local),
        });
        let shared = Arc::new(ProxyShared {
            phase: Mutex::new(Phase::Active),
            ports: Mutex::new(vec![next_local, finish_local, throw_local]),
        });
        let guard = CancellationToken::new();

        if let Some(signal) = &self.signal {
            // A signal that already fired aborts the session before any
            // traffic happens.
            if signal.is_cancelled() {
                shared.settle(Phase::Aborted);
                return Ok(GeneratorProxy {
                    stubs,
                    shared,
                    guard,
                });
            }
        }

        self.binding.send(
            Generate {
                args: Box::new(args),
            },
            vec![next_remote, finish_remote, throw_remote],
        )?;

        if let Some(signal) = &self.signal {
            let signal = signal.clone();
            let shared = shared.clone();
            let dropped = guard.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal.cancelled() => shared.settle(Phase::Aborted),
                    _ = dropped.cancelled() => {}
                }
            });
        }

        Ok(GeneratorProxy {
            stubs,
            shared,
            guard,
        })
    }

    fn sub_stub<SA, SR>(&self, port: &Port) -> Stub<SA, SR>
    where
        SA: Send + 'static,
        SR: Send + 'static,
    {
        let stub = Stub::bind(port);
        match &self.signal {
            Some(signal) => stub.with_options(CallOptions {
                signal: Some(signal.clone()),
                ..CallOptions::default()
            }),
            None => stub,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Active,
    Finished,
    Aborted,
}

struct ProxyShared {
    phase: Mutex<Phase>,
    ports: Mutex<Vec<Port>>,
}

impl ProxyShared {
    fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    // Moves an active session to a terminal phase and closes the local ends
    // of the sub-channels. Terminal phases never change again.
    fn settle(&self, terminal: Phase) {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Active {
                return;
            }
            *phase = terminal;
        }
        for port in self.ports.lock().drain(..) {
            port.close();
        }
    }
}

struct ProxyStubs<Y, Rt, N> {
    next: Stub<Option<N>, Step<Y, Rt>>,
    finish: Stub<Option<Rt>, Step<Y, Rt>>,
    throw: Stub<Fault, Step<Y, Rt>>,
}

// Caller-side handle to a remote generator session. The first operation
// whose result reports completion finishes the session; later operations
// answer a completed step locally without further traffic. Once the signal
// fires, every operation, including ones still in flight, fails with
// `Error::GeneratorAborted`.
pub struct GeneratorProxy<Y, Rt, N>
where
    Y: Send + 'static,
    Rt: Send + 'static,
    N: Send + 'static,
{
    stubs: Arc<ProxyStubs<Y, Rt, N>>,
    shared: Arc<ProxyShared>,
    guard: CancellationToken,
}

impl<Y, Rt, N> GeneratorProxy<Y, Rt, N>
where
    Y: Send + 'static,
    Rt: Send + 'static,
    N: Send + 'static,
{
    pub async fn next(&self, input: Option<N>) -> Result<Step<Y, Rt>, Error> {
        self.drive(self.stubs.next.call(input)).await
    }

    // Forwards the generator's return operation: the remote cleanup path runs
    // and the session completes.
    pub async fn finish(&self, value: Option<Rt>) -> Result<Step<Y, Rt>, Error> {
        self.drive(self.stubs.finish.call(value)).await
    }

    pub async fn throw(&self, error: Fault) -> Result<Step<Y, Rt>, Error> {
        self.drive(self.stubs.throw.call(error)).await
    }

    // Equivalent to `finish(None)`. Dropping an active proxy schedules the
    // same cleanup.
    pub async fn dispose(&self) -> Result<(), Error> {
        self.finish(None).await.map(|_| ())
    }

    async fn drive(
        &self,
        call: impl std::future::Future<Output = Result<Step<Y, Rt>, Error>>,
    ) -> Result<Step<Y, Rt>, Error> {
        match self.shared.phase() {
            Phase::Aborted => return Err(Error::GeneratorAborted),
            Phase::Finished => return Ok(Step::Done(None)),
            Phase::Active => {}
        }
        match call.await {
            Ok(step) => {
                if step.is_done() {
                    self.shared.settle(Phase::Finished);
                }
                Ok(step)
            }
            // The sub-stubs only abort through the session's signal.
            Err(Error::Aborted) => Err(Error::GeneratorAborted),
            Err(error) => {
                if self.shared.phase() == Phase::Aborted {
                    Err(Error::GeneratorAborted)
                } else {
                    Err(error)
                }
            }
        }
    }

    // Consumes the proxy into a stream of yielded values, driving `next`
    // until the generator completes. A failing step yields its error once and
    // ends the stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Y, Error>> + Send {
        stream::unfold(Some(self), |state| async move {
            let proxy = state?;
            match proxy.next(None).await {
                Ok(Step::Yield(value)) => Some((Ok(value), Some(proxy))),
                Ok(Step::Done(_)) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl<Y, Rt, N> Drop for GeneratorProxy<Y, Rt, N>
where
    Y: Send + 'static,
    Rt: Send + 'static,
    N: Send + 'static,
{
    fn drop(&mut self) {
        self.guard.cancel();
        if self.shared.phase() != Phase::Active {
            return;
        }
        let stubs = self.stubs.clone();
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if shared.phase() != Phase::Active {
                        return;
                    }
                    let _ = stubs.finish.call(None).await;
                    shared.settle(Phase::Finished);
                });
            }
            // No runtime to run the return call on; closing the sub-channels
            // still releases the remote session.
            Err(_) => shared.settle(Phase::Finished),
        }
    }
}

struct GeneratorSession<G> {
    generator: tokio::sync::Mutex<G>,
    ports: [Port; 3],
}

pub(crate) fn serve_generate<FA, F>(link: &PortLink, factory: Arc<F>) -> ListenerId
where
    FA: Send + 'static,
    F: GeneratorFactory<FA>,
{
    link.add_listener(move |envelope| match envelope.downcast::<Generate>() {
        Ok((generate, mut ports)) => {
            if ports.len() < 3 {
                panic!("generate frame must carry next, return and throw ports");
            }
            let next_port = ports.remove(0);
            let finish_port = ports.remove(0);
            let throw_port = ports.remove(0);
            // Any ports past the three sub-channels are not part of the frame
            // and close unused when it is dropped.
            match generate.args.downcast::<FA>() {
                Ok(args) => start_session(factory.create(*args), next_port, finish_port, throw_port),
                Err(_) => {
                    let expected = std::any::type_name::<FA>();
                    tracing::debug!("generate arguments of unexpected type, expected {}", expected);
                    reject_session(
                        vec![next_port, finish_port, throw_port],
                        Fault::unexpected_payload(expected),
                    );
                }
            }
            None
        }
        Err(envelope) => Some(envelope),
    })
}

pub(crate) fn reject_generate(link: &PortLink) -> ListenerId {
    link.add_listener(move |envelope| match envelope.downcast::<Generate>() {
        Ok((_, ports)) => {
            tracing::debug!("rejecting generate, no function registered");
            reject_session(ports, Fault::no_function_registered());
            None
        }
        Err(envelope) => Some(envelope),
    })
}

fn start_session<G: Generator>(generator: G, next_port: Port, finish_port: Port, throw_port: Port) {
    let next_link = next_port.link();
    let finish_link = finish_port.link();
    let throw_link = throw_port.link();
    // The handler closures keep the session (generator plus server-side
    // ports) alive; the listener registries clear when the caller closes its
    // sub-channel ends, which releases the session and drops the generator.
    let session = Arc::new(GeneratorSession {
        generator: tokio::sync::Mutex::new(generator),
        ports: [next_port, finish_port, throw_port],
    });
    tracing::debug!("generator session started");

    {
        let session = session.clone();
        serve_calls(
            &next_link,
            Arc::new(move |_context: CallContext, input: Option<G::Next>| {
                let session = session.clone();
                async move { session.generator.lock().await.next(input).await }
            }),
        );
    }
    {
        let session = session.clone();
        serve_calls(
            &finish_link,
            Arc::new(move |_context: CallContext, value: Option<G::Return>| {
                let session = session.clone();
                async move { session.generator.lock().await.finish(value).await }
            }),
        );
    }
    {
        let session = session.clone();
        serve_calls(
            &throw_link,
            Arc::new(move |_context: CallContext, error: Fault| {
                let session = session.clone();
                async move { session.generator.lock().await.throw(error).await }
            }),
        );
    }

    for port in session.ports.iter() {
        port.start();
    }
}

// Answers the first call on any sub-channel with `fault`. The listeners keep
// the ports alive until the caller closes its ends.
fn reject_session(ports: Vec<Port>, fault: Fault) {
    let ports = Arc::new(ports);
    for index in 0..ports.len() {
        let keep = ports.clone();
        let fault = fault.clone();
        ports[index].on_message(move |envelope| {
            let _keep = &keep;
            reject_call(envelope, &fault)
        });
        ports[index].start();
    }
}

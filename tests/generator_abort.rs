use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portrpc::{channel, Error, Fault, Generator, GeneratorStub, Step};
use tokio_util::sync::CancellationToken;

const DEBUG: bool = false;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not reached in time");
}

struct Ticker {
    value: i32,
    nexts: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl Generator for Ticker {
    type Yield = i32;
    type Return = ();
    type Next = ();

    async fn next(&mut self, _input: Option<()>) -> Result<Step<i32, ()>, Fault> {
        self.nexts.fetch_add(1, Ordering::SeqCst);
        self.value += 1;
        Ok(Step::Yield(self.value))
    }

    async fn finish(&mut self, _value: Option<()>) -> Result<Step<i32, ()>, Fault> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(Step::Done(None))
    }
}

fn ticker_server(
    server_port: &portrpc::Port,
) -> (
    GeneratorStub<(), i32, (), ()>,
    Arc<AtomicUsize>,
    Arc<AtomicUsize>,
) {
    let nexts = Arc::new(AtomicUsize::new(0));
    let cleanups = Arc::new(AtomicUsize::new(0));
    let server = GeneratorStub::<(), i32, (), ()>::bind_with(server_port, {
        let nexts = nexts.clone();
        let cleanups = cleanups.clone();
        move |(): ()| Ticker {
            value: 0,
            nexts: nexts.clone(),
            cleanups: cleanups.clone(),
        }
    });
    (server, nexts, cleanups)
}

#[tokio::test]
async fn abort_session_test() -> Result<(), Error> {
    if DEBUG {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let _test = tracing::subscriber::set_global_default(subscriber);
    }
    let (client_port, server_port) = channel();
    let (_server, nexts, _cleanups) = ticker_server(&server_port);

    let token = CancellationToken::new();
    let stub = GeneratorStub::<(), i32, (), ()>::bind(&client_port).with_signal(token.clone());
    let proxy = stub.start(())?;
    assert_eq!(proxy.next(None).await?, Step::Yield(1));
    token.cancel();
    // Every operation on an aborted session fails the same way, and none of
    // them reaches the generator.
    for _ in 0..2 {
        match proxy.next(None).await {
            Err(Error::GeneratorAborted) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }
    match proxy.finish(None).await {
        Err(Error::GeneratorAborted) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    match proxy.throw(Fault::new("boom")).await {
        Err(Error::GeneratorAborted) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(Error::GeneratorAborted.to_string(), "This generator has been aborted.");
    assert_eq!(nexts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn pre_cancelled_session_test() -> Result<(), Error> {
    if DEBUG {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let _test = tracing::subscriber::set_global_default(subscriber);
    }
    let (client_port, server_port) = channel();
    let (_server, nexts, _cleanups) = ticker_server(&server_port);

    let token = CancellationToken::new();
    token.cancel();
    let stub = GeneratorStub::<(), i32, (), ()>::bind(&client_port).with_signal(token);
    let proxy = stub.start(())?;
    match proxy.next(None).await {
        Err(Error::GeneratorAborted) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    // No session was ever opened on the serving side.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(nexts.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn drop_disposes_test() -> Result<(), Error> {
    if DEBUG {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let _test = tracing::subscriber::set_global_default(subscriber);
    }
    let (client_port, server_port) = channel();
    let (_server, _nexts, cleanups) = ticker_server(&server_port);

    let stub = GeneratorStub::<(), i32, (), ()>::bind(&client_port);
    {
        let proxy = stub.start(())?;
        assert_eq!(proxy.next(None).await?, Step::Yield(1));
    }
    // Dropping an active proxy runs the remote cleanup path.
    wait_until(|| cleanups.load(Ordering::SeqCst) == 1).await;
    Ok(())
}

#[tokio::test]
async fn dispose_test() -> Result<(), Error> {
    if DEBUG {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let _test = tracing::subscriber::set_global_default(subscriber);
    }
    let (client_port, server_port) = channel();
    let (_server, nexts, cleanups) = ticker_server(&server_port);

    let stub = GeneratorStub::<(), i32, (), ()>::bind(&client_port);
    let proxy = stub.start(())?;
    assert_eq!(proxy.next(None).await?, Step::Yield(1));
    proxy.dispose().await?;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    // The disposed session absorbs later operations locally.
    assert_eq!(proxy.next(None).await?, Step::Done(None));
    assert_eq!(nexts.load(Ordering::SeqCst), 1);
    drop(proxy);
    // Dropping a proxy that already completed does not clean up again.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn detach_test() -> Result<(), Error> {
    if DEBUG {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let _test = tracing::subscriber::set_global_default(subscriber);
    }
    let (client_port, server_port) = channel();
    let (_server, nexts, _cleanups) = ticker_server(&server_port);

    let stub = GeneratorStub::<(), i32, (), ()>::bind(&client_port);
    let proxy = stub.start(())?;
    assert_eq!(proxy.next(None).await?, Step::Yield(1));
    stub.detach();
    match stub.start(()) {
        Err(Error::Detached) => (),
        Err(other) => panic!("unexpected error: {:?}", other),
        Ok(_) => panic!("a detached stub opened a session"),
    }
    // The session opened before the detach keeps working.
    assert_eq!(proxy.next(None).await?, Step::Yield(2));
    assert_eq!(nexts.load(Ordering::SeqCst), 2);
    Ok(())
}

struct Stall {
    started: Arc<tokio::sync::Notify>,
    gate: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl Generator for Stall {
    type Yield = i32;
    type Return = ();
    type Next = ();

    async fn next(&mut self, _input: Option<()>) -> Result<Step<i32, ()>, Fault> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(Step::Yield(1))
    }
}

#[tokio::test]
async fn inflight_abort_test() -> Result<(), Error> {
    if DEBUG {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::TRACE)
            .finish();

        let _test = tracing::subscriber::set_global_default(subscriber);
    }
    let (client_port, server_port) = channel();
    let started = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::new(tokio::sync::Notify::new());
    let _server = GeneratorStub::<(), i32, (), ()>::bind_with(&server_port, {
        let started = started.clone();
        let gate = gate.clone();
        move |(): ()| Stall {
            started: started.clone(),
            gate: gate.clone(),
        }
    });

    let token = CancellationToken::new();
    let stub = GeneratorStub::<(), i32, (), ()>::bind(&client_port).with_signal(token.clone());
    let proxy = Arc::new(stub.start(())?);
    let in_flight = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.next(None).await }
    });
    started.notified().await;
    // The signal fires while the generator still holds the step; the
    // operation in flight fails like any later one.
    token.cancel();
    match in_flight.await {
        Ok(Err(Error::GeneratorAborted)) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    match proxy.next(None).await {
        Err(Error::GeneratorAborted) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    Ok(())
}

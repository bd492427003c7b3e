use async_trait::async_trait;
use futures::StreamExt;
use portrpc::{channel, Fault, Generator, GeneratorStub, Step};

struct Countdown {
    remaining: u32,
}

#[async_trait]
impl Generator for Countdown {
    type Yield = u32;
    type Return = &'static str;
    type Next = ();

    async fn next(&mut self, _input: Option<()>) -> Result<Step<u32, &'static str>, Fault> {
        if self.remaining == 0 {
            return Ok(Step::Done(Some("liftoff")));
        }
        let current = self.remaining;
        self.remaining -= 1;
        Ok(Step::Yield(current))
    }

    async fn finish(
        &mut self,
        _value: Option<&'static str>,
    ) -> Result<Step<u32, &'static str>, Fault> {
        Ok(Step::Done(Some("scrubbed")))
    }
}

#[tokio::main]
async fn main() -> Result<(), portrpc::Error> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let (client_port, server_port) = channel();
    let _server = GeneratorStub::<u32, u32, &'static str, ()>::bind_with(
        &server_port,
        |from: u32| Countdown { remaining: from },
    );
    let stub = GeneratorStub::<u32, u32, &'static str, ()>::bind(&client_port);

    let proxy = stub.start(3)?;
    loop {
        match proxy.next(None).await? {
            Step::Yield(value) => println!("t minus {}", value),
            Step::Done(message) => {
                println!("{}", message.unwrap_or("done"));
                break;
            }
        }
    }

    // The same session as a stream, stopped early; dropping the stream lets
    // the proxy run the remote cleanup.
    let mut stream = Box::pin(stub.start(10)?.into_stream());
    while let Some(value) = stream.next().await {
        let value = value?;
        println!("holding at {}", value);
        if value == 9 {
            break;
        }
    }
    drop(stream);
    let spare = stub.start(2)?;
    spare.dispose().await?;
    println!("spare session disposed");
    Ok(())
}

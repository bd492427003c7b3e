use portrpc::{channel, CallContext, Fault, Stub};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let (client_port, server_port) = channel();
    let _server = Stub::<(), ()>::bind_with(
        &server_port,
        |_context: CallContext, (op, x, y): (char, f64, f64)| async move {
            match op {
                '+' => Ok::<f64, Fault>(x + y),
                '-' => Ok(x - y),
                '*' => Ok(x * y),
                '/' if y != 0.0 => Ok(x / y),
                '/' => Err("division by zero".into()),
                _ => Err(format!("unknown operator {}", op).into()),
            }
        },
    );

    let calculator = Stub::<(char, f64, f64), f64>::bind(&client_port);
    for (op, x, y) in vec![('+', 12.0, 34.0), ('*', 2.5, 4.0), ('-', 10.0, 0.5)] {
        let result = calculator.call((op, x, y)).await?;
        println!("{} {} {} = {}", x, op, y, result);
    }
    let result = calculator.call(('/', 1.0, 0.0)).await;
    println!("1 / 0 = {:?}", result);
    Ok(())
}

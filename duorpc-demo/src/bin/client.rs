use std::net::SocketAddr;

use clap::Parser;
use duorpc::{Connection, DynTransport, Result, tcp::TcpTransport};
use duorpc_demo::{AddResult, CalculatorService, TelemetryInfo, TelemetryType, Timestamp, Value};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address.
    #[arg(default_value = "127.0.0.1:7776")]
    pub addr: SocketAddr,
}

/// Brackets a test with begin/end telemetry events, the way an
/// instrumentation layer would.
struct TelemetryEvent<'a> {
    connection: &'a Connection,
    event: String,
}

impl<'a> TelemetryEvent<'a> {
    fn begin(connection: &'a Connection, event: &str) -> Self {
        let _ = connection.send_telemetry_event(TelemetryInfo {
            event: event.to_string(),
            kind: TelemetryType::Beginning,
            success: true,
            time: Timestamp::now(),
        });
        Self {
            connection,
            event: event.to_string(),
        }
    }
}

impl Drop for TelemetryEvent<'_> {
    fn drop(&mut self) {
        let _ = self.connection.send_telemetry_event(TelemetryInfo {
            event: self.event.clone(),
            kind: TelemetryType::End,
            success: !std::thread::panicking(),
            time: Timestamp::now(),
        });
    }
}

async fn test1(connection: &Connection) -> Result<()> {
    let _event = TelemetryEvent::begin(connection, "Test 1");
    let sum = connection.simple_sum(17, 42).await?;
    tracing::info!("Test 1: a simple sum of 17 and 42 is... {sum}");
    Ok(())
}

async fn test2(connection: &Connection) -> Result<()> {
    let _event = TelemetryEvent::begin(connection, "Test 2");
    let sum = connection.array_sum(vec![17, 42, 33, -956]).await?;
    tracing::info!("Test 2: a sum of array values 17, 42, 33, -956 is... {sum}");
    Ok(())
}

async fn test3(connection: &Connection) -> Result<()> {
    let _event = TelemetryEvent::begin(connection, "Test 3");
    let text = connection
        .string_concatenate("Hello ".to_string(), "World!".to_string())
        .await?;
    tracing::info!("Test 3: a concatenation of \"Hello \" and \"World!\" is... {text:?}");
    Ok(())
}

async fn test4(connection: &Connection) -> Result<()> {
    let _event = TelemetryEvent::begin(connection, "Test 4");

    let sum = connection
        .universal_add(Value::from(42), Value::from(33))
        .await?;
    tracing::info!("Test 4: the \"universal add\" computes 42 + 33 = {sum:?}");

    let text = connection
        .universal_add(Value::from("Hello "), Value::from("World!"))
        .await?;
    tracing::info!("        and concatenates \"Hello \" and \"World!\" into {text:?}");

    let mixed = connection
        .universal_add(Value::from(42), Value::from("Hello World!"))
        .await?;
    match mixed {
        AddResult::Error(error) => {
            tracing::info!(
                "        and reports {:?} for the incorrect combination of 42 and \"Hello World!\"",
                error.description
            );
        }
        other => tracing::warn!("unexpected result for mixed arguments: {other:?}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    tracing::info!("Trying to connect to the server...");
    let transport = match TcpTransport::connect(args.addr).await {
        Ok(transport) => transport,
        Err(error) => {
            tracing::error!("Error occurred: {error}");
            return;
        }
    };
    tracing::info!("Client successfully connected.");

    let connection = Connection::new();
    connection.start(DynTransport::new(transport)).unwrap();

    for (name, result) in [
        ("Test 1", test1(&connection).await),
        ("Test 2", test2(&connection).await),
        ("Test 3", test3(&connection).await),
        ("Test 4", test4(&connection).await),
    ] {
        if let Err(error) = result {
            tracing::error!("{name} failed: {error}");
        }
    }

    tracing::info!("Our sample server is re-enterable. Launching all tests concurrently!");
    let (r1, r2, r3, r4) = tokio::join!(
        test1(&connection),
        test2(&connection),
        test3(&connection),
        test4(&connection),
    );
    for result in [r1, r2, r3, r4] {
        if let Err(error) = result {
            tracing::error!("concurrent test failed: {error}");
        }
    }

    connection.stop().await;
    tracing::info!("Exiting client.");
}

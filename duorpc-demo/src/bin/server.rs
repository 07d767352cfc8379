use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use duorpc::{Connection, Result, tcp::TcpListener};
use duorpc_demo::{
    AddError, AddErrorCode, AddResult, CalculatorService, TelemetryInfo, Value,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "127.0.0.1:7776")]
    pub addr: SocketAddr,
}

struct Calculator;

impl CalculatorService for Calculator {
    async fn simple_sum(&self, a: i32, b: i32) -> Result<i32> {
        // Simulate hard work.
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(a + b)
    }

    async fn array_sum(&self, values: Vec<i32>) -> Result<i32> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(values.iter().sum())
    }

    async fn string_concatenate(&self, a: String, b: String) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(a + &b)
    }

    async fn universal_add(&self, a: Value, b: Value) -> Result<AddResult> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(match (a, b) {
            (Value::Int(a), Value::Int(b)) => AddResult::Int(a + b),
            (Value::Text(a), Value::Text(b)) => AddResult::Text(a + &b),
            _ => AddResult::Error(AddError {
                description: "Incompatible argument types".to_string(),
                code: AddErrorCode::IncompatibleTypes,
            }),
        })
    }

    fn send_telemetry_event(&self, tm: TelemetryInfo) -> Result<()> {
        tracing::info!(
            "client sent telemetry event {:?}: type = {:?}, success = {}",
            tm.event,
            tm.kind,
            tm.success
        );
        Ok(())
    }
}

async fn serve_client(transport: duorpc::tcp::TcpTransport) {
    let connection = Connection::with_dispatcher(Arc::new(Calculator).export());
    if let Err(error) = connection.start(transport) {
        tracing::error!("failed to start connection: {error}");
        return;
    }

    // Hold the connection until the transport reports the client gone.
    let (gone_tx, gone_rx) = tokio::sync::oneshot::channel();
    connection.on_error(move |error, on| {
        let _ = gone_tx.send((error, on));
    });
    if let Ok((error, on)) = gone_rx.await {
        tracing::info!("client disconnected ({on:?}: {error}), server instance deleted");
    }
    connection.stop().await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let listener = TcpListener::bind(args.addr).await.unwrap();
    tracing::info!(
        "Serving {:?} on {}...",
        <Calculator as CalculatorService>::NAME,
        listener.local_addr().unwrap()
    );

    loop {
        match listener.accept().await {
            Ok(transport) => {
                tracing::info!("client connected, creating server instance");
                tokio::spawn(serve_client(transport));
            }
            Err(error) => {
                tracing::error!("accept failed: {error}");
                break;
            }
        }
    }
}

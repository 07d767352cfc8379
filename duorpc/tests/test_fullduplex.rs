//! Both endpoints carrying a dispatcher: the server calls back into the
//! client while the client's own request is still in flight.

use std::sync::{Arc, OnceLock};

use duorpc::{Connection, Result, mailbox};

#[duorpc::interface]
trait Uplink {
    async fn query(&self, value: i32) -> Result<i32>;
}

#[duorpc::interface]
trait Downlink {
    async fn scale_factor(&self) -> Result<i32>;
    fn log_line(&self, line: String) -> Result<()>;
}

struct UplinkImpl {
    peer: OnceLock<Arc<Connection>>,
}

impl Uplink for UplinkImpl {
    async fn query(&self, value: i32) -> Result<i32> {
        // Consult the caller over the same connection before answering.
        let peer = self.peer.get().expect("peer installed");
        let factor = peer.scale_factor().await?;
        peer.log_line(format!("query({value}) scaled by {factor}"))?;
        Ok(value * factor)
    }
}

struct DownlinkImpl {
    lines: std::sync::Mutex<Vec<String>>,
}

impl Downlink for DownlinkImpl {
    async fn scale_factor(&self) -> Result<i32> {
        Ok(10)
    }

    fn log_line(&self, line: String) -> Result<()> {
        self.lines.lock().unwrap().push(line);
        Ok(())
    }
}

#[tokio::test]
async fn test_server_calls_back_during_request() {
    let (client_transport, server_transport) = mailbox::pair();

    let uplink = Arc::new(UplinkImpl {
        peer: OnceLock::new(),
    });
    let server = Arc::new(Connection::with_dispatcher(Arc::clone(&uplink).export()));
    uplink.peer.set(Arc::clone(&server)).ok().unwrap();
    server.start(server_transport).unwrap();

    let downlink = Arc::new(DownlinkImpl {
        lines: std::sync::Mutex::default(),
    });
    let client = Connection::with_dispatcher(Arc::clone(&downlink).export());
    client.start(client_transport).unwrap();

    assert_eq!(client.query(7).await.unwrap(), 70);
    assert_eq!(client.query(-3).await.unwrap(), -30);

    // The fire-and-forget downlink calls landed in order.
    assert_eq!(
        *downlink.lines.lock().unwrap(),
        ["query(7) scaled by 10", "query(-3) scaled by 10"]
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_overlapping_calls_in_both_directions() {
    let (client_transport, server_transport) = mailbox::pair();

    let uplink = Arc::new(UplinkImpl {
        peer: OnceLock::new(),
    });
    let server = Arc::new(Connection::with_dispatcher(Arc::clone(&uplink).export()));
    uplink.peer.set(Arc::clone(&server)).ok().unwrap();
    server.start(server_transport).unwrap();

    let downlink = Arc::new(DownlinkImpl {
        lines: std::sync::Mutex::default(),
    });
    let client = Arc::new(Connection::with_dispatcher(Arc::clone(&downlink).export()));
    client.start(client_transport).unwrap();

    let mut tasks = Vec::new();
    for value in 0..16 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move { (value, client.query(value).await) }));
    }
    for task in tasks {
        let (value, result) = task.await.unwrap();
        assert_eq!(result.unwrap(), value * 10);
    }
    assert_eq!(downlink.lines.lock().unwrap().len(), 16);

    client.stop().await;
    server.stop().await;
}

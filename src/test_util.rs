//! Socket helpers shared by the unit tests of the pool and its drivers.

use std::future::Future;
use std::net::Shutdown;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

/// Two ends of an established localhost TCP connection
pub async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

/// Like [connected_pair], but the first stream's sending direction is shut down: every write
///  to it fails with a broken pipe while its receiving direction keeps working
pub async fn write_broken_pair() -> (TcpStream, TcpStream) {
    let (client, server) = connected_pair().await;
    SockRef::from(&client).shutdown(Shutdown::Write).unwrap();
    (client, server)
}

/// Fails the test if `f` does not complete within a second
pub async fn within_a_second<T>(f: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(1), f).await
        .expect("operation should have completed within a second")
}

/// Polls `condition` until it holds, failing the test after five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition did not become true in time");
        sleep(Duration::from_millis(10)).await;
    }
}

//! Integration test for §8 scenario 6: three processor nodes register
//! `area_id` 1, 2, 3 against one broker over a real loopback TCP transport; a
//! message from node 1 addressed to area 3 arrives at node 3 intact.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use worldcache::broker::{transport, BrokerNode};

fn frame(category: u8, method: u8, payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(6 + payload.len());
    f.push(category);
    f.push(method);
    f.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    f.extend_from_slice(payload);
    f
}

#[tokio::test]
async fn broker_fans_out_to_registered_area() {
    let broker = Arc::new(BrokerNode::new());
    let addr = transport::bind("127.0.0.1:0".parse().unwrap(), broker).await.unwrap();

    let mut node1 = TcpStream::connect(addr).await.unwrap();
    let mut node2 = TcpStream::connect(addr).await.unwrap();
    let mut node3 = TcpStream::connect(addr).await.unwrap();

    node1.write_all(&frame(0, 0, &1u64.to_le_bytes())).await.unwrap();
    node2.write_all(&frame(0, 0, &2u64.to_le_bytes())).await.unwrap();
    node3.write_all(&frame(0, 0, &3u64.to_le_bytes())).await.unwrap();

    // Registrations are processed by independently spawned connection tasks;
    // give them a moment to land before routing traffic.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let opaque_payload = b"payload-from-area-one";
    let mut addressed = opaque_payload.to_vec();
    addressed.extend_from_slice(&3u64.to_le_bytes());
    node1.write_all(&frame(5, 9, &addressed)).await.unwrap();

    let mut header = [0u8; 6];
    node3.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 5);
    assert_eq!(header[1], 9);
    let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    let mut body = vec![0u8; len];
    node3.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, opaque_payload);

    // node2 was never addressed and should have nothing to read.
    let mut probe = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_millis(100), node2.read(&mut probe)).await;
    assert!(result.is_err(), "area 2 should not have received the frame addressed to area 3");
}

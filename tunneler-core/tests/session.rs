use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;

use tunneler_core::address::{Destination, HostPort, Protocol};
use tunneler_core::session::{Role, Session, SessionConfig, StreamHandle};
use tunneler_core::test_util::session_pair;
use tunneler_core::transport::MemoryTransport;
use tunneler_core::TunnelError;

fn destination(port: u16) -> Destination {
    Destination::new(Protocol::Tcp, HostPort::new("10.0.0.1", port))
}

async fn open_streams(
    client: &Session,
    server: &Session,
    count: u16,
) -> Vec<(StreamHandle, StreamHandle)> {
    let mut pairs = Vec::new();
    for port in 0..count {
        let mut opened = client.open_stream(&destination(8000 + port)).await.unwrap();
        let (accepted, _) = server.accept_incoming().await.unwrap();
        opened.opened().await.unwrap();
        pairs.push((opened, accepted));
    }

    pairs
}

#[tokio::test]
async fn concurrent_streams_keep_order_and_isolation() {
    // Arrange
    let (client, server) = session_pair(SessionConfig::default());
    let pairs = open_streams(&client, &server, 8).await;

    // Act
    let mut tasks = Vec::new();
    for (index, (mut opened, mut accepted)) in pairs.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            let mut expected = Vec::new();
            for chunk in 0..32u8 {
                let mut payload = vec![index as u8, chunk];
                let mut noise = vec![0u8; 64];
                rand::thread_rng().fill_bytes(&mut noise);
                payload.extend_from_slice(&noise);
                expected.extend_from_slice(&payload);
                opened.send(Bytes::from(payload)).await.unwrap();
            }
            opened.close().await.unwrap();

            let mut received = Vec::new();
            while let Some(data) = accepted.receive().await.unwrap() {
                received.extend_from_slice(&data);
            }

            (expected, received)
        }));
    }

    // Assert
    for task in tasks {
        let (expected, received) = task.await.unwrap();
        assert_eq!(expected, received);
    }
}

#[tokio::test]
async fn closing_one_stream_leaves_others_working() {
    // Arrange
    let (client, server) = session_pair(SessionConfig::default());
    let mut pairs = open_streams(&client, &server, 3).await;

    // Act
    {
        let (first, first_peer) = &mut pairs[0];
        first.close().await.unwrap();
        first_peer.close().await.unwrap();
        assert_eq!(None, first_peer.receive().await.unwrap());
    }
    let (second, second_peer) = &mut pairs[1];
    second.send(Bytes::from_static(b"still here")).await.unwrap();
    let data = second_peer.receive().await.unwrap();

    // Assert
    assert_eq!(Some(Bytes::from_static(b"still here")), data);
    assert!(!client.is_closed());
    assert!(!server.is_closed());
}

#[tokio::test]
async fn dropped_transport_ends_every_stream() {
    // Arrange
    let (client_end, server_end) = MemoryTransport::pair(64);
    let (client_reader, client_writer) = client_end.split();
    let (server_reader, server_writer) = server_end.split();
    let client = Session::spawn(
        Role::Client,
        SessionConfig::default(),
        client_reader,
        client_writer,
    );
    let server = Session::spawn(
        Role::Server,
        SessionConfig::default(),
        server_reader,
        server_writer,
    );
    let pairs = open_streams(&client, &server, 3).await;
    let receivers: Vec<_> = pairs
        .into_iter()
        .map(|(opened, accepted)| {
            tokio::spawn(async move {
                let mut opened = opened;
                let end = opened.receive().await;
                (opened, accepted, end)
            })
        })
        .collect();

    // Act
    server.close();
    let mut ends = Vec::new();
    for receiver in receivers {
        let finished = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap();
        ends.push(finished);
    }
    client.closed().await;

    // Assert
    for (mut opened, _, end) in ends {
        assert_eq!(None, end.unwrap());
        let send = opened.send(Bytes::from_static(b"late")).await;
        assert!(matches!(send, Err(TunnelError::SessionClosed)));
    }
    let open = client.open_stream(&destination(9000)).await;
    assert!(matches!(open, Err(TunnelError::SessionClosed)));
    assert_eq!(0, client.stream_count());
}

#[tokio::test]
async fn each_role_allocates_ids_of_its_own_parity() {
    // Arrange
    let (client, server) = session_pair(SessionConfig::default());

    // Act
    let from_server = server.open_stream(&destination(7000)).await.unwrap();
    let (from_client, _) = {
        let mut opened = client.open_stream(&destination(7001)).await.unwrap();
        let accepted = server.accept_incoming().await.unwrap();
        opened.opened().await.unwrap();
        (opened, accepted)
    };

    // Assert
    assert_eq!(0, from_server.id() % 2);
    assert_eq!(1, from_client.id() % 2);
}

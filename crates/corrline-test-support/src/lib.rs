//! Shared test harness: an in-memory connected peer pair, standing in for a
//! real transport the way `rt-test-utils`'s mock WebSocket server/client
//! pair stands in for a real network connection, minus the network.

mod mock_peer_pair;

pub use mock_peer_pair::duplex_peers;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn duplex_peers_can_exchange_a_correspondence() {
        let (alice, bob) = duplex_peers("alice", "bob");

        let header = corrline::MessageHeader::new("", "ping");
        let sent = alice.send(header, Some(json!({"n": 1}))).await.unwrap();

        let received = bob.receive().await.unwrap();
        assert_eq!(received.header().await.subject, "ping");

        let outcome = received.next(&[]).await.unwrap();
        assert_eq!(outcome, corrline::NextOutcome::Chunk(json!({"n": 1})));

        received.finish(Some(json!({"pong": true}))).await.unwrap();
        let reply = sent.next(&[]).await.unwrap();
        assert_eq!(reply, corrline::NextOutcome::Chunk(json!({"pong": true})));
        let end = sent.next(&[]).await.unwrap();
        assert_eq!(end, corrline::NextOutcome::End);
    }
}

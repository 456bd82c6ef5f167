use corrline::Peer;

/// Builds two `Peer`s joined by an in-memory duplex pipe — the test-only
/// stand-in for a real transport adapter (`corrline-tcp`, `corrline-ws`).
/// Anything sent by one side's `send`/`correspond` is observed by the other
/// via `receive`/`next`/`all`, exactly as over a real connection.
pub fn duplex_peers(id_a: impl Into<String>, id_b: impl Into<String>) -> (Peer, Peer) {
    let (side_a, side_b) = tokio::io::duplex(64 * 1024);
    (Peer::new(id_a, side_a), Peer::new(id_b, side_b))
}

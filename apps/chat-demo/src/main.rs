//! Two-peer chat demo: each line typed on stdin becomes one correspondence
//! on the `chat` subject (one `Data` chunk, then `Finish`); a background
//! task prints whatever correspondences the remote peer opens in return.
//!
//! Mode, bind address, and remote address are read from the environment,
//! matching how the rest of this workspace's binaries are configured.
//!
//! ```text
//! CORRLINE_MODE=listen CORRLINE_BIND=127.0.0.1:9000 cargo run --bin chat-demo
//! CORRLINE_MODE=dial CORRLINE_CONNECT=127.0.0.1:9000 cargo run --bin chat-demo
//! ```

use std::env;
use std::sync::Arc;

use corrline::{MessageHeader, NextOutcome, Peer};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mode = env::var("CORRLINE_MODE").unwrap_or_else(|_| "listen".to_owned());
    let peer = match mode.as_str() {
        "listen" => {
            let bind = env::var("CORRLINE_BIND").unwrap_or_else(|_| "127.0.0.1:9000".to_owned());
            let listener = corrline_tcp::TcpPeerListener::bind(&bind)
                .await
                .unwrap_or_else(|e| panic!("failed to bind {bind}: {e}"));
            info!(addr = %listener.local_addr().unwrap(), "waiting for a peer to connect");
            let (peer, remote) = listener.accept().await.expect("accept failed");
            info!(remote = %remote, "peer connected");
            peer
        }
        "dial" => {
            let connect = env::var("CORRLINE_CONNECT").expect("CORRLINE_CONNECT must be set in dial mode");
            let peer = corrline_tcp::dial(&connect)
                .await
                .unwrap_or_else(|e| panic!("failed to connect to {connect}: {e}"));
            info!(addr = %connect, "connected");
            peer
        }
        other => panic!("unknown CORRLINE_MODE '{other}', expected 'listen' or 'dial'"),
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down on ctrl-c");
        }
        _ = run_chat(peer) => {}
    }
}

async fn run_chat(peer: Peer) {
    let peer = Arc::new(peer);
    let reader_peer = peer.clone();
    let receive_task = tokio::spawn(async move { print_incoming(reader_peer).await });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        if !peer.is_connected() {
            break;
        }
        match lines.next_line().await {
            Ok(Some(text)) if !text.is_empty() => {
                if let Err(e) = send_line(&peer, &text).await {
                    error!(error = %e, "failed to send line");
                    break;
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        }
    }

    receive_task.abort();
}

async fn send_line(peer: &Peer, text: &str) -> Result<(), corrline::PeerError> {
    let corr = peer.send(MessageHeader::new("", "chat"), Some(json!(text))).await?;
    let _ = corr.finish(None).await;
    Ok(())
}

async fn print_incoming(peer: Arc<Peer>) {
    loop {
        let corr = match peer.receive().await {
            Ok(corr) => corr,
            Err(_) => {
                info!("remote peer disconnected");
                break;
            }
        };
        if corr.header().await.subject != "chat" {
            warn!(subject = %corr.header().await.subject, "ignoring non-chat correspondence");
            let _ = corr.finish(None).await;
            continue;
        }
        match corr.next(&[]).await {
            Ok(NextOutcome::Chunk(body)) => {
                match body.as_str() {
                    Some(text) => println!("{text}"),
                    None => println!("{body}"),
                }
                let _ = corr.next(&[]).await;
            }
            Ok(NextOutcome::End) => {}
            Err(e) => warn!(error = %e, "chat correspondence errored"),
        }
    }
}

//! Connects to a QWormhole listener, sends one line per stdin line, and logs
//! whatever comes back. Run the listener first:
//!
//! ```sh
//! cargo run -p qwormhole-server -- --bind 127.0.0.1:7800
//! cargo run -p qwormhole-client --example echo -- 127.0.0.1:7800
//! ```

use std::env;

use bytes::Bytes;
use qwormhole_client::{Client, ClientConfig, ClientEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let remote_addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7800".to_string());
    let config = ClientConfig { remote_addr, ..ClientConfig::default() };
    let client = Client::spawn(config);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = client.next_event() => {
                match event {
                    Some(ClientEvent::Message(payload)) => {
                        tracing::info!(message = %String::from_utf8_lossy(&payload), "received");
                    },
                    Some(ClientEvent::Ready) => tracing::info!("connected"),
                    Some(ClientEvent::Close { had_error, .. }) => {
                        tracing::info!(had_error, "closed");
                        break;
                    },
                    Some(ClientEvent::Error(message)) => {
                        tracing::error!(%message, "client error");
                        break;
                    },
                    Some(_) => {},
                    None => break,
                }
            },
            line = stdin.next_line() => {
                match line {
                    Ok(Some(line)) => client.send(Bytes::from(line)),
                    _ => break,
                }
            },
        }
    }

    client.disconnect().await;
}

use std::env;
use std::error::Error;

use event_stream_client::{StreamClient, StreamClientOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080/events".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let options = StreamClientOptions::default()
            .with_auto_connect(false)
            .on_close(|event| eprintln!("stream closed: {event}"));
        let client = StreamClient::new(url, options)?;
        let mut messages = client.subscribe_messages();

        let handle = client.connect().await?;
        eprintln!("connected to {}", handle.url());

        let mut states = client.subscribe_state();
        loop {
            tokio::select! {
                changed = messages.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(message) = messages.borrow_and_update().clone() {
                        println!("{}: {}", message.event_type, message.data);
                    }
                }
                _ = states.wait_for(|state| state.is_closed()) => break,
                _ = tokio::signal::ctrl_c() => {
                    client.close().await?;
                    break;
                }
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}

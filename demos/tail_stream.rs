//! Tails a newline-delimited JSON stream and prints every response.
//!
//! Configuration comes from the environment:
//! - `STREAM_HOST` / `STREAM_PORT`: endpoint (defaults to `127.0.0.1:9000`).
//! - `STREAM_PLAIN=1`: connect over plain TCP instead of TLS.
//! - `STREAM_HANDSHAKE`: preamble written after every connect, e.g. an auth line.
//! - `RUST_LOG`: tracing filter, `info` by default.
//!
//! Press Ctrl-C to close the stream and exit.

use std::env;
use std::error::Error;

use secrecy::SecretString;
use serde_json::Value;
use streamtap::{Request, Stream, StreamEvent, Transport};
use tracing_subscriber::EnvFilter;

fn request_from_env() -> Result<Request, Box<dyn Error>> {
    let host = env::var("STREAM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = match env::var("STREAM_PORT") {
        Ok(port) => port.parse()?,
        Err(_) => 9000,
    };
    let transport = if env::var("STREAM_PLAIN").is_ok_and(|value| value == "1") {
        Transport::Plain
    } else {
        Transport::Tls
    };

    let mut request = Request::new(host, port).with_transport(transport);
    if let Ok(handshake) = env::var("STREAM_HANDSHAKE") {
        request = request.with_handshake(SecretString::new(format!("{handshake}\n")));
    }
    Ok(request)
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let request = request_from_env()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let stream = Stream::new(request);
        stream.register_function(|response: &Value| println!("{response}"));
        stream.register_function_if(
            |response: &Value| eprintln!("server error: {}", response["error"]),
            |response: &Value| response.get("error").is_some(),
        );

        let mut events = stream.events();
        stream.open().await?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(StreamEvent::Closed { reason, .. }) => {
                        eprintln!("stream closed: {reason:?}");
                        break;
                    }
                    Ok(event) => eprintln!("{event:?}"),
                    Err(_) => {}
                },
            }
        }

        stream.close().await;
        Ok::<(), Box<dyn Error>>(())
    })
}

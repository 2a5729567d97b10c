//! OTP relay companion.
//!
//! Usage: otp-relay <PORT> <PURPOSE>
//!
//! Listens on 127.0.0.1:<PORT> for one-time passwords and forwards them to
//! the launcher channel named by `ADDONHOST_OTP_CHANNEL` (default `otpLink`).

use std::env;
use std::sync::Arc;

use addonhost::ipc::{ChannelClient, DEFAULT_OTP_CHANNEL};
use addonhost::logging;
use addonhost::otp::{CHANNEL_ENV, ChannelForwarder, OtpListener, OtpSink};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: otp-relay <PORT> <PURPOSE>");
        std::process::exit(2);
    }

    let port: u16 = args[1]
        .parse()
        .map_err(|_| format!("invalid port: {}", args[1]))?;
    let purpose = args[2].clone();
    let channel = env::var(CHANNEL_ENV).unwrap_or_else(|_| DEFAULT_OTP_CHANNEL.to_string());

    logging::init_stderr("info");
    tracing::info!("[OTP] Relay for {} on channel '{}'", purpose, channel);

    let register_channel = channel.clone();
    let registered = tokio::task::spawn_blocking(move || {
        ChannelClient::connect(&register_channel)
            .and_then(|mut client| client.register_callback(std::process::id(), &purpose))
    })
    .await?;
    if let Err(e) = registered {
        tracing::warn!("[OTP] Could not register with the launcher: {}", e);
    }

    let sink: Arc<dyn OtpSink> = Arc::new(ChannelForwarder::new(channel));
    let mut listener = OtpListener::start(port, sink).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        "[OTP] Shutting down after {} code(s)",
        listener.delivered()
    );
    listener.stop();
    Ok(())
}

//! Integration tests for the OTP relay.
//!
//! These tests verify the relay path end to end:
//! - Channel request/response handling
//! - HTTP listener forwarding into the channel
//! - Teardown through the channel, including a missing channel

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use addonhost::addons::builtin::{OtpCallback, OtpChannelHandler, OtpRelayAddon, OtpRelayConfig};
use addonhost::ipc::{ChannelClient, ChannelHandler, ChannelServer, IpcError};

fn unique_channel(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Callback recording every delivered code.
fn recorder() -> (OtpCallback, Arc<Mutex<Vec<String>>>) {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let codes_clone = Arc::clone(&codes);
    let callback: OtpCallback = Arc::new(move |code: String| {
        codes_clone.lock().unwrap().push(code);
    });
    (callback, codes)
}

fn serve(channel: &str) -> (ChannelServer, Arc<OtpChannelHandler>, Arc<Mutex<Vec<String>>>) {
    let (callback, codes) = recorder();
    let handler = Arc::new(OtpChannelHandler::new(callback));
    let shared: Arc<dyn ChannelHandler> = handler.clone();
    let server = ChannelServer::start(channel, shared).unwrap();
    (server, handler, codes)
}

// ============================================================================
// Channel tests
// ============================================================================

mod channel_tests {
    use super::*;

    #[test]
    fn test_code_submitted_once_is_received_once() {
        let channel = unique_channel("otp");
        let (mut server, _, codes) = serve(&channel);

        let mut client = ChannelClient::connect(&channel).unwrap();
        client.submit_otp("123456").unwrap();

        assert_eq!(*codes.lock().unwrap(), vec!["123456".to_string()]);
        drop(client);
        server.shutdown();
        assert!(!server.is_running());
    }

    #[test]
    fn test_invalid_code_is_remote_error() {
        let channel = unique_channel("otp");
        let (_server, _, codes) = serve(&channel);

        let mut client = ChannelClient::connect(&channel).unwrap();
        let err = client.submit_otp("12x456").unwrap_err();
        assert!(matches!(err, IpcError::Remote(_)));
        assert!(codes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_register_then_get_handle() {
        let channel = unique_channel("otp");
        let (_server, handler, _) = serve(&channel);

        let mut client = ChannelClient::connect(&channel).unwrap();
        assert_eq!(client.get_handle().unwrap(), None);
        client.register_callback(4_000_001, "Login").unwrap();
        assert_eq!(client.get_handle().unwrap(), Some(4_000_001));
        assert_eq!(handler.registered_purpose().as_deref(), Some("Login"));
    }

    #[test]
    fn test_kill_without_companion_reports_false() {
        let channel = unique_channel("otp");
        let (_server, _, _) = serve(&channel);

        let mut client = ChannelClient::connect(&channel).unwrap();
        assert!(!client.kill().unwrap());
    }
}

// ============================================================================
// Listener tests
// ============================================================================

mod listener_tests {
    use super::*;
    use addonhost::otp::{ChannelForwarder, OtpListener, OtpSink};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_http_code_forwarded_through_channel() {
        let channel = unique_channel("otp-http");
        let (_server, _, codes) = serve(&channel);

        let sink: Arc<dyn OtpSink> = Arc::new(ChannelForwarder::new(channel.clone()));
        let mut listener = OtpListener::start(0, sink).await.unwrap();

        let response = get(listener.port(), "/ffxivlauncher/123456").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains("OTP received"));

        let response = get(listener.port(), "/ffxivlauncher/abc").await;
        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

        assert_eq!(*codes.lock().unwrap(), vec!["123456".to_string()]);
        assert_eq!(listener.delivered(), 1);
        listener.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_launcher_is_bad_gateway() {
        let sink: Arc<dyn OtpSink> = Arc::new(ChannelForwarder::new(unique_channel("gone")));
        let listener = OtpListener::start(0, sink).await.unwrap();

        let response = get(listener.port(), "/ffxivlauncher/123456").await;
        assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
        assert_eq!(listener.delivered(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_health() {
        let sink: Arc<dyn OtpSink> = Arc::new(|_: &str| Ok::<(), String>(()));
        let listener = OtpListener::start(0, sink).await.unwrap();

        let response = get(listener.port(), "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("OK"));
    }
}

// ============================================================================
// Addon tests
// ============================================================================

mod addon_tests {
    use super::*;
    use addonhost::addons::{Addon, GameProcess};
    use addonhost::config::LauncherSettings;

    fn addon(channel: &str, config: OtpRelayConfig) -> (OtpRelayAddon, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let callback: OtpCallback = Arc::new(move |_code: String| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        let config = OtpRelayConfig {
            channel: channel.to_string(),
            ..config
        };
        (OtpRelayAddon::new(config, callback), count)
    }

    #[test]
    fn test_stop_against_gone_channel_does_not_panic() {
        let (addon, _) = addon(&unique_channel("gone"), OtpRelayConfig::default());
        addon.stop();
        addon.stop();
        assert!(!addon.is_serving());
    }

    #[test]
    fn test_missing_companion_withdraws_channel() {
        let channel = unique_channel("otp-missing");
        let (mut addon, _) = addon(
            &channel,
            OtpRelayConfig {
                companion_path: Some("/nonexistent/otp-relay-binary".into()),
                ..OtpRelayConfig::default()
            },
        );
        let game = Arc::new(GameProcess::launcher());
        addon.setup(&game, &LauncherSettings::default()).unwrap();

        assert!(addon.as_runnable().unwrap().run(&game).is_err());
        assert!(!addon.is_serving());
        assert!(ChannelClient::connect(&channel).is_err());
    }

    #[cfg(unix)]
    mod companion_tests {
        use super::*;
        use std::io::{Read, Write};
        use std::net::{TcpListener, TcpStream};
        use std::time::{Duration, Instant};

        use addonhost::addons::process::is_process_alive;

        fn free_port() -> u16 {
            TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .local_addr()
                .unwrap()
                .port()
        }

        fn try_get(port: u16, path: &str) -> Option<String> {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
            stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
            write!(
                stream,
                "GET {} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
                path
            )
            .ok()?;
            let mut response = String::new();
            stream.read_to_string(&mut response).ok()?;
            Some(response)
        }

        #[test]
        fn test_companion_relays_and_is_killed_through_channel() {
            let channel = unique_channel("otp-e2e");
            let port = free_port();
            let (mut addon, count) = addon(
                &channel,
                OtpRelayConfig {
                    http_port: port,
                    companion_path: Some(env!("CARGO_BIN_EXE_otp-relay").into()),
                    ..OtpRelayConfig::default()
                },
            );
            let game = Arc::new(GameProcess::launcher());
            addon.setup(&game, &LauncherSettings::default()).unwrap();
            addon.as_runnable().unwrap().run(&game).unwrap();
            assert!(addon.is_serving());

            let deadline = Instant::now() + Duration::from_secs(10);
            let mut health = None;
            while health.is_none() && Instant::now() < deadline {
                health = try_get(port, "/health");
                if health.is_none() {
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
            assert!(health.is_some(), "companion never listened");

            let response = try_get(port, "/ffxivlauncher/123456").unwrap();
            assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
            assert_eq!(count.load(Ordering::SeqCst), 1);

            let pid = ChannelClient::connect(&channel)
                .unwrap()
                .get_handle()
                .unwrap()
                .expect("companion pid");
            assert!(is_process_alive(pid));

            addon.as_notify_on_close().unwrap().game_closed().unwrap();
            assert!(!addon.is_serving());
            assert!(!is_process_alive(pid));
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}

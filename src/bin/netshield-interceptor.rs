//! The privileged process: owns the kernel packet-diversion handle, applies
//! the token bucket, and forwards packet descriptors / accepts commands
//! over the IPC fabric (spec.md §2, §4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use netshield::config::Config;
use netshield::core::token_bucket::TokenBucket;
use netshield::interceptor::{InterceptMode, Interceptor, TcpPacketSink};
use netshield::ipc::messages::Command;
use netshield::ipc::{frame::FrameResult, read_frame, IpcServer};

#[tokio::main]
async fn main() {
    netshield::init_logging("netshield=info");

    let cfg = Config::from_env();
    if let Err(e) = cfg.validate() {
        eprintln!("netshield-interceptor: invalid configuration: {e}");
        std::process::exit(1);
    }

    let rate_bytes_per_sec = cfg.bandwidth_ceiling_mbps * 1_000_000.0 / 8.0;
    let capacity_bytes = cfg.burst_capacity_mb * 1_000_000.0;
    let bucket = match TokenBucket::new(rate_bytes_per_sec, capacity_bytes) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("netshield-interceptor: invalid bandwidth configuration: {e}");
            std::process::exit(1);
        }
    };

    let interceptor = Arc::new(Interceptor::new(bucket, cfg.bandwidth_window_secs));
    let started_at = chrono::Utc::now();
    let start = std::time::Instant::now();
    let running = Arc::new(AtomicBool::new(true));
    let mode = InterceptMode::from_config_str(&cfg.mode);

    let server = match IpcServer::bind(cfg.packet_channel_port, cfg.command_channel_port).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("netshield-interceptor: could not bind IPC fabric: {e}");
            std::process::exit(1);
        }
    };
    info!("waiting for analyzer to connect on ports {}/{}", cfg.packet_channel_port, cfg.command_channel_port);

    let packet_stream = match server.accept_packet_channel().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("netshield-interceptor: analyzer never connected: {e}");
            std::process::exit(1);
        }
    };
    let command_stream = match server.accept_command_channel().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("netshield-interceptor: analyzer never connected: {e}");
            std::process::exit(1);
        }
    };

    let std_stream = match packet_stream.into_std().and_then(|s| {
        s.set_nonblocking(false)?;
        Ok(s)
    }) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("netshield-interceptor: could not hand off packet channel: {e}");
            std::process::exit(1);
        }
    };
    let sink = match TcpPacketSink::new(std_stream) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("netshield-interceptor: could not configure packet channel: {e}");
            std::process::exit(1);
        }
    };

    tokio::spawn(run_command_loop(command_stream, interceptor.clone(), running.clone()));

    let hot_loop_handle = spawn_hot_loop(mode, sink, interceptor.clone(), running.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            running.store(false, Ordering::Relaxed);
        }
        _ = wait_until_stopped(running.clone()) => {}
    }

    if let Some(handle) = hot_loop_handle {
        let _ = handle.join();
    }

    let summary = interceptor.session_summary(started_at, start, cfg.bandwidth_ceiling_mbps);
    info!(target: "interceptor", ?summary, "session summary");
}

/// Reads commands off the command channel and applies them until the peer
/// disconnects or an invalid command is silently rejected (spec.md §8
/// scenario 5).
async fn run_command_loop(
    mut stream: tokio::net::TcpStream,
    interceptor: Arc<Interceptor>,
    running: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut stream).await {
            Ok(FrameResult::Data(body)) => match serde_json::from_slice::<Command>(&body) {
                Ok(cmd) if cmd.is_valid() => interceptor.apply_command(&cmd, &running),
                Ok(_) => warn!(target: "interceptor", "rejected invalid command at the boundary"),
                Err(e) => warn!(target: "interceptor", error = %e, "malformed command frame"),
            },
            Ok(FrameResult::Discarded { declared_len }) => {
                warn!(target: "interceptor", declared_len, "oversized command frame discarded");
            }
            Ok(FrameResult::Closed) => {
                info!(target: "interceptor", "command channel closed by analyzer");
                break;
            }
            Err(e) => {
                error!(target: "interceptor", error = %e, "command channel read failed");
                break;
            }
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }
    }
}

async fn wait_until_stopped(running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(target_os = "windows")]
fn spawn_hot_loop(
    mode: InterceptMode,
    sink: TcpPacketSink,
    interceptor: Arc<Interceptor>,
    running: Arc<AtomicBool>,
) -> Option<std::thread::JoinHandle<()>> {
    let filter = mode.filter_expression();
    let handle = std::thread::Builder::new()
        .name("interceptor-hot-loop".into())
        .spawn(move || {
            if let Err(e) =
                netshield::interceptor::windivert_backend::run_intercept_loop(filter, sink, interceptor, running)
            {
                error!(target: "interceptor", error = %e, "hot loop exited fatally");
                std::process::exit(1);
            }
        })
        .expect("failed to spawn hot loop thread");
    Some(handle)
}

#[cfg(not(target_os = "windows"))]
fn spawn_hot_loop(
    _mode: InterceptMode,
    _sink: TcpPacketSink,
    _interceptor: Arc<Interceptor>,
    _running: Arc<AtomicBool>,
) -> Option<std::thread::JoinHandle<()>> {
    eprintln!("netshield-interceptor: kernel packet interception requires Windows (WinDivert)");
    std::process::exit(1);
}

//! Periodic pings through the tunnel to keep NAT state warm.

use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn ping_args(target: IpAddr) -> Vec<String> {
    let count_flag = if cfg!(target_os = "windows") { "-n" } else { "-c" };
    vec![count_flag.to_string(), "4".to_string(), target.to_string()]
}

/// Ping `target` now and then every `interval` until `token` is cancelled.
/// Failures are logged only.
pub fn spawn_heartbeat(token: CancellationToken, target: IpAddr, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let ping = Command::new("ping")
                .args(ping_args(target))
                .kill_on_drop(true)
                .output();
            let result = tokio::select! {
                _ = token.cancelled() => break,
                r = ping => r,
            };
            match result {
                Ok(output) if output.status.success() => log::trace!("heartbeat {} ok", target),
                Ok(output) => log::debug!("heartbeat {} failed: {}", target, output.status),
                Err(e) => log::debug!("heartbeat {}: {}", target, e),
            }
        }
        log::debug!("heartbeat to {} stopped", target);
    })
}

//! PulseAudio loopback management via `pactl`.
//!
//! All audio leaves through one null sink (`virtual_out`); a
//! `module-loopback` per speaker carries its monitor stream to that
//! speaker's Bluetooth sink. Sinks for freshly connected devices can take
//! a few seconds to appear, so route creation polls for the sink by name
//! prefix before loading the loopback.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{AudioError, Result};
use crate::router::AudioRouter;

/// Name of the shared null sink all loopbacks read from.
pub const VIRTUAL_SINK: &str = "virtual_out";

/// How long `create_route` waits for the target sink to appear.
const SINK_WAIT: Duration = Duration::from_secs(20);

/// Poll interval while waiting for the sink.
const SINK_POLL: Duration = Duration::from_millis(500);

/// `pactl`-backed [`AudioRouter`].
pub struct PulseRouter {
    source: String,
}

impl PulseRouter {
    /// Router reading from the default `virtual_out` monitor.
    pub fn new() -> Self {
        Self {
            source: format!("{VIRTUAL_SINK}.monitor"),
        }
    }
}

impl Default for PulseRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioRouter for PulseRouter {
    async fn create_route(&self, sink_prefix: &str, latency_ms: u32) -> Result<()> {
        info!(
            "Creating loopback: {} -> {}* (latency {} ms)",
            self.source, sink_prefix, latency_ms
        );

        let deadline = tokio::time::Instant::now() + SINK_WAIT;
        loop {
            let sinks = pactl(&["list", "sinks", "short"]).await?;
            if let Some(sink) = parse_sink_name(&sinks, sink_prefix) {
                debug!("Found matching sink {}", sink);

                // Replace any loopback already targeting this sink.
                if let Err(e) = unload_loopbacks(&sink).await {
                    warn!("Failed to unload conflicting loopbacks: {}", e);
                }

                pactl(&[
                    "load-module",
                    "module-loopback",
                    &format!("source={}", self.source),
                    &format!("sink={sink}"),
                    &format!("latency_msec={latency_ms}"),
                ])
                .await?;
                info!("Loopback established for {}", sink);
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                error!(
                    "Timeout - sink {} not found within {:?}",
                    sink_prefix, SINK_WAIT
                );
                return Err(AudioError::SinkNotFound(sink_prefix.to_string()));
            }
            sleep(SINK_POLL).await;
        }
    }

    async fn remove_route(&self, sink_prefix: &str) -> Result<()> {
        info!("Removing loopback(s) for {}*", sink_prefix);
        unload_loopbacks(sink_prefix).await
    }
}

/// Ensure PulseAudio is running and the `virtual_out` sink exists and is
/// the default.
pub async fn setup() -> Result<()> {
    info!("Checking if PulseAudio daemon is responsive");
    if !daemon_responsive().await {
        warn!("PulseAudio not responding - restarting it");
        let _ = Command::new("pkill").args(["-9", "pulseaudio"]).status().await;
        sleep(Duration::from_secs(1)).await;
        let _ = Command::new("pulseaudio").arg("--start").status().await;

        let mut responsive = false;
        for attempt in 1..=5 {
            if daemon_responsive().await {
                info!("PulseAudio is up (after {} attempt(s))", attempt);
                responsive = true;
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
        if !responsive {
            return Err(AudioError::DaemonUnavailable);
        }
    }

    let sinks = pactl(&["list", "short", "sinks"]).await?;
    if sinks.contains(VIRTUAL_SINK) {
        info!("Sink '{}' already present - skipping creation", VIRTUAL_SINK);
        return Ok(());
    }

    info!("Creating virtual sink '{}'", VIRTUAL_SINK);
    pactl(&[
        "load-module",
        "module-null-sink",
        &format!("sink_name={VIRTUAL_SINK}"),
        &format!("sink_properties=device.description={VIRTUAL_SINK}"),
    ])
    .await?;

    pactl(&["set-default-sink", VIRTUAL_SINK]).await?;
    info!("PulseAudio ready - default sink is '{}'", VIRTUAL_SINK);
    Ok(())
}

/// Unload every `module-loopback` whose arguments reference a sink
/// matching `sink_fragment`.
async fn unload_loopbacks(sink_fragment: &str) -> Result<()> {
    let modules = pactl(&["list", "short", "modules"]).await?;
    for id in parse_loopback_module_ids(&modules, sink_fragment) {
        debug!("Unloading loopback module {} for {}", id, sink_fragment);
        if let Err(e) = pactl(&["unload-module", &id]).await {
            warn!("Failed to unload module {}: {}", id, e);
        }
    }
    Ok(())
}

async fn daemon_responsive() -> bool {
    match pactl(&["info"]).await {
        Ok(out) => out.contains("Server Name"),
        Err(_) => false,
    }
}

/// Run `pactl` and return stdout on success.
async fn pactl(args: &[&str]) -> Result<String> {
    let output = Command::new("pactl").args(args).output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(AudioError::CommandFailed {
            command: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Find the first sink whose name starts with `prefix` in
/// `pactl list sinks short` output.
fn parse_sink_name(output: &str, prefix: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let name = line.split_whitespace().nth(1)?;
        name.starts_with(prefix).then(|| name.to_string())
    })
}

/// Module ids of loopbacks referencing `sink_fragment` in
/// `pactl list short modules` output.
fn parse_loopback_module_ids(output: &str, sink_fragment: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let module = parts.next()?;
            (module.contains("module-loopback") && line.contains(sink_fragment))
                .then(|| id.to_string())
        })
        .collect()
}

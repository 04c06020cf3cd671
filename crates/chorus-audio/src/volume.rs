//! Per-sink volume, balance, and mute control.

use tokio::process::Command;
use tracing::info;

use crate::error::{AudioError, Result};

/// Volume ceiling accepted by PulseAudio without clipping complaints.
const MAX_VOLUME_PCT: u32 = 150;

/// Split a volume level into left/right channel levels according to a
/// balance in `[0.0, 1.0]` (0.0 = full left, 0.5 = centered, 1.0 = full
/// right). Out-of-range balance is clamped; channel levels are capped at
/// 150 %.
pub fn split_volume(volume: u32, balance: f64) -> (u32, u32) {
    let balance = balance.clamp(0.0, 1.0);

    let (left, right) = if balance >= 0.5 {
        let left = (f64::from(volume) * (1.0 - balance) * 2.0).round() as u32;
        (left, volume)
    } else {
        let right = (f64::from(volume) * balance * 2.0).round() as u32;
        (volume, right)
    };

    (left.min(MAX_VOLUME_PCT), right.min(MAX_VOLUME_PCT))
}

/// Set the volume of a sink, split across channels by `balance`.
///
/// Returns the applied (left, right) percentages.
pub async fn set_sink_volume(sink: &str, volume: u32, balance: f64) -> Result<(u32, u32)> {
    let (left, right) = split_volume(volume, balance);

    let output = Command::new("pactl")
        .args([
            "set-sink-volume",
            sink,
            &format!("{left}%"),
            &format!("{right}%"),
        ])
        .output()
        .await?;

    if output.status.success() {
        info!("Volume on {} set to {}%/{}%", sink, left, right);
        Ok((left, right))
    } else {
        Err(AudioError::CommandFailed {
            command: "set-sink-volume".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Mute or unmute the first sink whose name contains `sink_fragment`.
pub async fn set_sink_mute(sink_fragment: &str, mute: bool) -> Result<()> {
    let output = Command::new("pactl")
        .args(["list", "sinks", "short"])
        .output()
        .await?;
    if !output.status.success() {
        return Err(AudioError::CommandFailed {
            command: "list sinks short".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let listing = String::from_utf8_lossy(&output.stdout).into_owned();
    let sink = listing
        .lines()
        .find_map(|line| {
            let name = line.split_whitespace().nth(1)?;
            name.contains(sink_fragment).then(|| name.to_string())
        })
        .ok_or_else(|| AudioError::SinkNotFound(sink_fragment.to_string()))?;

    let flag = if mute { "1" } else { "0" };
    let output = Command::new("pactl")
        .args(["set-sink-mute", &sink, flag])
        .output()
        .await?;

    if output.status.success() {
        info!("Sink {} mute set to {}", sink, mute);
        Ok(())
    } else {
        Err(AudioError::CommandFailed {
            command: "set-sink-mute".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

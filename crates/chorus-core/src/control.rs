//! Wire-message codec and request dispatch.
//!
//! Frames are one tag byte followed by a JSON payload. The dispatch layer
//! turns connection requests into queued intents, drives free-running
//! scans on the reserved controller through the discovery coordinator,
//! and answers audio-control requests directly; status notifications are
//! rendered through the same codec.

use std::sync::Arc;

use chorus_audio::{set_sink_mute, set_sink_volume, AudioRouter};
use chorus_bluetooth::{Address, ControllerId, Stack, StackEvent};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryCoordinator;
use crate::intent::Intent;
use crate::status::StatusEvent;
use crate::worker::IntentSender;

/// Message tags shared with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0x01,
    Pong = 0x02,
    Error = 0x03,
    ScanStart = 0x40,
    ScanStop = 0x41,
    ScanDevices = 0x43,
    ConnectOne = 0x60,
    Disconnect = 0x61,
    SetLatency = 0x62,
    SetVolume = 0x63,
    GetPairedDevices = 0x64,
    SetMute = 0x65,
    StatusUpdate = 0x70,
    Success = 0xF0,
    Failure = 0xF1,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(MessageKind::Ping),
            0x02 => Some(MessageKind::Pong),
            0x03 => Some(MessageKind::Error),
            0x40 => Some(MessageKind::ScanStart),
            0x41 => Some(MessageKind::ScanStop),
            0x43 => Some(MessageKind::ScanDevices),
            0x60 => Some(MessageKind::ConnectOne),
            0x61 => Some(MessageKind::Disconnect),
            0x62 => Some(MessageKind::SetLatency),
            0x63 => Some(MessageKind::SetVolume),
            0x64 => Some(MessageKind::GetPairedDevices),
            0x65 => Some(MessageKind::SetMute),
            0x70 => Some(MessageKind::StatusUpdate),
            0xF0 => Some(MessageKind::Success),
            0xF1 => Some(MessageKind::Failure),
            _ => None,
        }
    }
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Value,
}

/// Codec errors.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message tag: {0:#04x}")]
    UnknownKind(u8),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Render a frame: tag byte + JSON payload (omitted when null).
pub fn encode(kind: MessageKind, payload: &Value) -> Vec<u8> {
    let mut out = vec![kind as u8];
    if !payload.is_null() {
        out.extend_from_slice(payload.to_string().as_bytes());
    }
    out
}

/// Parse a frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, ControlError> {
    let (&tag, rest) = bytes.split_first().ok_or(ControlError::Empty)?;
    let kind = MessageKind::from_byte(tag).ok_or(ControlError::UnknownKind(tag))?;
    let payload = if rest.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(rest)?
    };
    Ok(Frame { kind, payload })
}

/// Render a status notification for clients: error phases go out under
/// the error tag, everything else as a status update.
pub fn render_status(event: &StatusEvent) -> Vec<u8> {
    let kind = if event.kind.is_error() {
        MessageKind::Error
    } else {
        MessageKind::StatusUpdate
    };
    let payload = serde_json::to_value(event).unwrap_or(Value::Null);
    encode(kind, &payload)
}

/// Request dispatcher for one transport.
///
/// Scan requests drive the discovery coordinator directly from the
/// caller's task (the coordinator is built for concurrent callers), while
/// connection mutations always go through the intent queue.
pub struct ControlPort {
    intents: IntentSender,
    stack: Arc<dyn Stack>,
    discovery: Arc<DiscoveryCoordinator>,
    router: Arc<dyn AudioRouter>,
    reserved: ControllerId,
    outbound: mpsc::Sender<Vec<u8>>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPort {
    pub fn new(
        intents: IntentSender,
        stack: Arc<dyn Stack>,
        discovery: Arc<DiscoveryCoordinator>,
        router: Arc<dyn AudioRouter>,
        reserved: ControllerId,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            intents,
            stack,
            discovery,
            router,
            reserved,
            outbound,
            scan: Mutex::new(None),
        }
    }

    /// Handle one request frame and return the encoded response.
    pub async fn handle(&self, frame: Frame) -> Vec<u8> {
        match frame.kind {
            MessageKind::Ping => {
                let count = frame.payload.get("count").cloned().unwrap_or(json!(0));
                reply(MessageKind::Pong, json!({ "count": count }))
            }
            MessageKind::ConnectOne => self.connect_one(&frame.payload),
            MessageKind::Disconnect => self.disconnect(&frame.payload),
            MessageKind::SetLatency => self.set_latency(&frame.payload).await,
            MessageKind::SetVolume => self.set_volume(&frame.payload).await,
            MessageKind::SetMute => self.set_mute(&frame.payload).await,
            MessageKind::GetPairedDevices => self.get_paired().await,
            MessageKind::ScanStart => self.start_scan().await,
            MessageKind::ScanStop => self.stop_scan().await,
            _ => error_reply("unsupported request"),
        }
    }

    fn connect_one(&self, payload: &Value) -> Vec<u8> {
        let Some(mac) = payload
            .pointer("/targetSpeaker/mac")
            .and_then(Value::as_str)
        else {
            return error_reply("missing targetSpeaker.mac");
        };
        let allowed = string_list(payload.get("allowed"));

        info!("Queuing connect_one for {}", mac);
        self.intents.submit(Intent::ConnectOne {
            target: Address::new(mac),
            allowed: allowed.into_iter().map(Address::new).collect(),
        });
        reply(MessageKind::Success, json!({ "queued": true }))
    }

    fn disconnect(&self, payload: &Value) -> Vec<u8> {
        let Some(mac) = payload.get("mac").and_then(Value::as_str) else {
            return error_reply("missing mac");
        };
        self.intents.submit(Intent::Disconnect {
            address: Address::new(mac),
        });
        reply(MessageKind::Success, json!({ "queued": true }))
    }

    async fn set_latency(&self, payload: &Value) -> Vec<u8> {
        let (Some(mac), Some(latency)) = (
            payload.get("mac").and_then(Value::as_str),
            payload.get("latency").and_then(Value::as_u64),
        ) else {
            return error_reply("missing mac/latency");
        };

        let prefix = Address::new(mac).sink_prefix();
        match self.router.create_route(&prefix, latency as u32).await {
            Ok(()) => reply(MessageKind::Success, json!({ "latency": latency })),
            Err(e) => error_reply(&e.to_string()),
        }
    }

    async fn set_volume(&self, payload: &Value) -> Vec<u8> {
        let (Some(mac), Some(volume)) = (
            payload.get("mac").and_then(Value::as_str),
            payload.get("volume").and_then(Value::as_u64),
        ) else {
            return error_reply("missing mac/volume");
        };
        let balance = payload
            .get("balance")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);

        let sink = format!("{}.a2dp_sink", Address::new(mac).sink_prefix());
        match set_sink_volume(&sink, volume as u32, balance).await {
            Ok((left, right)) => {
                reply(MessageKind::Success, json!({ "left": left, "right": right }))
            }
            Err(e) => error_reply(&e.to_string()),
        }
    }

    async fn set_mute(&self, payload: &Value) -> Vec<u8> {
        let (Some(mac), Some(mute)) = (
            payload.get("mac").and_then(Value::as_str),
            payload.get("mute").and_then(Value::as_bool),
        ) else {
            return error_reply("missing mac/mute");
        };

        let fragment = mac.to_uppercase().replace(':', "_");
        match set_sink_mute(&fragment, mute).await {
            Ok(()) => reply(MessageKind::Success, json!({ "mac": mac, "mute": mute })),
            Err(e) => error_reply(&e.to_string()),
        }
    }

    async fn get_paired(&self) -> Vec<u8> {
        match self.stack.snapshot().await {
            Ok(snapshot) => {
                let mut paired = serde_json::Map::new();
                for device in snapshot.paired_devices() {
                    paired.insert(device.address.to_string(), json!(device.display_name()));
                }
                if paired.is_empty() {
                    return reply(MessageKind::Success, json!({ "message": "No devices" }));
                }
                reply(MessageKind::Success, Value::Object(paired))
            }
            Err(e) => error_reply(&e.to_string()),
        }
    }

    async fn start_scan(&self) -> Vec<u8> {
        let mut scan = self.scan.lock().await;
        if scan.is_some() {
            return error_reply("scan already active");
        }
        if let Err(e) = self.discovery.ensure(&self.reserved).await {
            warn!("Cannot start scan on {}: {}", self.reserved, e);
            return error_reply(&e.to_string());
        }

        *scan = Some(spawn_scan_forwarder(
            self.stack.clone(),
            self.reserved.clone(),
            self.outbound.clone(),
        ));
        info!("Scan started on {}", self.reserved);
        reply(MessageKind::Success, json!({ "scanning": true }))
    }

    async fn stop_scan(&self) -> Vec<u8> {
        let mut scan = self.scan.lock().await;
        match scan.take() {
            Some(forwarder) => {
                forwarder.abort();
                self.discovery.release(&self.reserved).await;
                info!("Scan stopped on {}", self.reserved);
                reply(MessageKind::Success, json!({ "scanning": false }))
            }
            None => error_reply("scan not active"),
        }
    }
}

/// Stream discovered devices to the client while a scan is active.
fn spawn_scan_forwarder(
    stack: Arc<dyn Stack>,
    reserved: ControllerId,
    outbound: mpsc::Sender<Vec<u8>>,
) -> JoinHandle<()> {
    let mut events = stack.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StackEvent::DeviceAdded {
                    controller,
                    address,
                }) if controller == reserved => {
                    let details = stack.snapshot().await.ok().and_then(|snapshot| {
                        snapshot
                            .device_on(&controller, &address)
                            .map(|d| (d.display_name(), d.paired))
                    });
                    let (name, paired) =
                        details.unwrap_or_else(|| (address.to_string(), false));

                    if looks_like_bare_address(&name) {
                        debug!("Filtering out unnamed device {}", address);
                        continue;
                    }
                    let frame = encode(
                        MessageKind::ScanDevices,
                        &json!({ "device": { "mac": address, "name": name, "paired": paired } }),
                    );
                    if outbound.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Scan forwarder lagged, {} event(s) dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Names that are just the address with separators (e.g. "AA-BB-CC-DD")
/// mean the device never told us its real name.
fn looks_like_bare_address(name: &str) -> bool {
    let chars: Vec<char> = name.chars().collect();
    let mut runs = 0;
    let mut i = 0;
    while i + 3 <= chars.len() {
        if chars[i].is_ascii_hexdigit() && chars[i + 1].is_ascii_hexdigit() && chars[i + 2] == '-'
        {
            runs += 1;
            if runs >= 2 {
                return true;
            }
            i += 3;
        } else {
            runs = 0;
            i += 1;
        }
    }
    false
}

fn reply(kind: MessageKind, payload: Value) -> Vec<u8> {
    encode(kind, &payload)
}

fn error_reply(message: &str) -> Vec<u8> {
    encode(MessageKind::Error, &json!({ "error": message }))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{speaker, MockRouter, MockStack};
    use std::time::Duration;

    const DEV: &str = "AA:AA:AA:AA:AA:AA";

    mod codec {
        use super::*;

        #[test]
        fn frames_round_trip() {
            let payload = json!({ "mac": DEV, "latency": 120 });
            let bytes = encode(MessageKind::SetLatency, &payload);
            let frame = decode(&bytes).expect("decodable");
            assert_eq!(frame.kind, MessageKind::SetLatency);
            assert_eq!(frame.payload, payload);
        }

        #[test]
        fn tag_only_frames_carry_a_null_payload() {
            let bytes = encode(MessageKind::ScanStart, &Value::Null);
            assert_eq!(bytes, vec![0x40]);
            let frame = decode(&bytes).expect("decodable");
            assert_eq!(frame.payload, Value::Null);
        }

        #[test]
        fn empty_and_unknown_frames_are_rejected() {
            assert!(matches!(decode(&[]), Err(ControlError::Empty)));
            assert!(matches!(decode(&[0x7E]), Err(ControlError::UnknownKind(0x7E))));
        }

        #[test]
        fn error_statuses_render_under_the_error_tag() {
            use crate::status::{StatusEvent, StatusKind};

            let event = StatusEvent::new(StatusKind::PairingFailed, Address::new(DEV));
            let frame = decode(&render_status(&event)).expect("decodable");
            assert_eq!(frame.kind, MessageKind::Error);
            assert_eq!(frame.payload["phase"], "pairing_failed");

            let event = StatusEvent::new(StatusKind::ConnectSuccess, Address::new(DEV));
            let frame = decode(&render_status(&event)).expect("decodable");
            assert_eq!(frame.kind, MessageKind::StatusUpdate);
        }
    }

    mod dispatch {
        use super::*;
        use tokio::sync::mpsc;

        struct Fixture {
            port: ControlPort,
            stack: Arc<MockStack>,
            intents: mpsc::Receiver<Intent>,
            outbound: mpsc::Receiver<Vec<u8>>,
        }

        fn fixture() -> Fixture {
            let stack = Arc::new(MockStack::with_controllers(&["hci9", "hci0"]));
            let (intent_tx, intents) = mpsc::channel(16);
            let (outbound_tx, outbound) = mpsc::channel(16);
            let port = ControlPort::new(
                IntentSender::new(intent_tx),
                stack.clone(),
                DiscoveryCoordinator::new(stack.clone()),
                Arc::new(MockRouter::new()),
                ControllerId::new("hci9"),
                outbound_tx,
            );
            Fixture {
                port,
                stack,
                intents,
                outbound,
            }
        }

        #[tokio::test]
        async fn ping_answers_pong_with_the_count() {
            let f = fixture();
            let response = f
                .port
                .handle(Frame {
                    kind: MessageKind::Ping,
                    payload: json!({ "count": 7 }),
                })
                .await;
            let frame = decode(&response).expect("decodable");
            assert_eq!(frame.kind, MessageKind::Pong);
            assert_eq!(frame.payload["count"], 7);
        }

        #[tokio::test]
        async fn connect_one_queues_an_intent() {
            let mut f = fixture();
            let response = f
                .port
                .handle(Frame {
                    kind: MessageKind::ConnectOne,
                    payload: json!({
                        "targetSpeaker": { "mac": DEV, "name": "Kitchen" },
                        "allowed": [DEV, "BB:BB:BB:BB:BB:BB"],
                    }),
                })
                .await;

            let frame = decode(&response).expect("decodable");
            assert_eq!(frame.kind, MessageKind::Success);

            match f.intents.try_recv().expect("queued") {
                Intent::ConnectOne { target, allowed } => {
                    assert_eq!(target, Address::new(DEV));
                    assert_eq!(allowed.len(), 2);
                }
                other => panic!("unexpected intent: {other:?}"),
            }
        }

        #[tokio::test]
        async fn connect_one_without_target_is_an_error() {
            let mut f = fixture();
            let response = f
                .port
                .handle(Frame {
                    kind: MessageKind::ConnectOne,
                    payload: json!({ "allowed": [] }),
                })
                .await;
            let frame = decode(&response).expect("decodable");
            assert_eq!(frame.kind, MessageKind::Error);
            assert!(f.intents.try_recv().is_err());
        }

        #[tokio::test]
        async fn paired_devices_are_listed_by_address() {
            let f = fixture();
            f.stack.add_device("hci0", speaker(DEV, false));

            let response = f
                .port
                .handle(Frame {
                    kind: MessageKind::GetPairedDevices,
                    payload: Value::Null,
                })
                .await;
            let frame = decode(&response).expect("decodable");
            assert_eq!(frame.kind, MessageKind::Success);
            assert_eq!(frame.payload[DEV], DEV);
        }

        #[tokio::test]
        async fn scan_runs_on_the_reserved_controller_and_streams_devices() {
            let mut f = fixture();

            let response = f
                .port
                .handle(Frame {
                    kind: MessageKind::ScanStart,
                    payload: Value::Null,
                })
                .await;
            assert_eq!(decode(&response).expect("ok").kind, MessageKind::Success);
            assert_eq!(f.stack.discovery_starts(), 1);

            let mut named = speaker(DEV, false);
            named.alias = Some("Kitchen Speaker".to_string());
            f.stack.add_device("hci9", named);
            f.stack.emit_device_added("hci9", DEV);

            let frame = tokio::time::timeout(Duration::from_secs(2), f.outbound.recv())
                .await
                .expect("frame in time")
                .expect("channel open");
            let frame = decode(&frame).expect("decodable");
            assert_eq!(frame.kind, MessageKind::ScanDevices);
            assert_eq!(frame.payload["device"]["mac"], DEV);

            let response = f
                .port
                .handle(Frame {
                    kind: MessageKind::ScanStop,
                    payload: Value::Null,
                })
                .await;
            assert_eq!(decode(&response).expect("ok").kind, MessageKind::Success);
            assert_eq!(f.stack.discovery_stops(), 1);

            // A second stop has nothing to stop.
            let response = f
                .port
                .handle(Frame {
                    kind: MessageKind::ScanStop,
                    payload: Value::Null,
                })
                .await;
            assert_eq!(decode(&response).expect("ok").kind, MessageKind::Error);
        }
    }

    mod names {
        use super::*;

        #[test]
        fn separator_style_addresses_are_filtered() {
            assert!(looks_like_bare_address("AA-BB-CC-DD-EE-FF"));
            assert!(looks_like_bare_address("12-34-56"));
            assert!(!looks_like_bare_address("Kitchen Speaker"));
            assert!(!looks_like_bare_address("JBL Flip 5"));
        }
    }
}

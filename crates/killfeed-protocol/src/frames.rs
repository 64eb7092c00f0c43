//! Frame types for the Killfeed channel protocol.
//!
//! Every frame on the wire is a JSON object of the shape
//! `{topic, event, payload, ref}`. Outbound frames are built from
//! [`OutboundCommand`]; inbound frames are parsed into a [`RawFrame`] and then
//! classified into an [`InboundEvent`].

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Topic key: a solar system id.
pub type SystemId = u64;

/// Well-known event names.
pub mod events {
    pub const PHX_JOIN: &str = "phx_join";
    pub const PHX_LEAVE: &str = "phx_leave";
    pub const PHX_REPLY: &str = "phx_reply";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SUBSCRIBE_SYSTEMS: &str = "subscribe_systems";
    pub const UNSUBSCRIBE_SYSTEMS: &str = "unsubscribe_systems";
    pub const GET_STATUS: &str = "get_status";
    pub const KILLMAIL_UPDATE: &str = "killmail_update";
    pub const KILL_COUNT_UPDATE: &str = "kill_count_update";
}

/// Topic used for socket-level heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Correlation id pairing a request with its reply.
///
/// Serialized as a JSON number. Servers may echo it back as a numeric
/// string, so both forms are accepted on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Ref(pub u64);

impl Ref {
    /// Get the numeric value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Ref {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for Ref {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Ref(n)),
            Repr::Text(s) => s
                .parse()
                .map(Ref)
                .map_err(|_| de::Error::custom(format!("invalid ref: {s:?}"))),
        }
    }
}

/// Events the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboundEvent {
    /// Join the channel topic.
    #[serde(rename = "phx_join")]
    Join,
    /// Leave the channel topic.
    #[serde(rename = "phx_leave")]
    Leave,
    /// Add systems to the subscription.
    #[serde(rename = "subscribe_systems")]
    SubscribeSystems,
    /// Remove systems from the subscription.
    #[serde(rename = "unsubscribe_systems")]
    UnsubscribeSystems,
    /// Ask the server for its view of the subscription.
    #[serde(rename = "get_status")]
    GetStatus,
    /// Socket keepalive.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl OutboundEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundEvent::Join => events::PHX_JOIN,
            OutboundEvent::Leave => events::PHX_LEAVE,
            OutboundEvent::SubscribeSystems => events::SUBSCRIBE_SYSTEMS,
            OutboundEvent::UnsubscribeSystems => events::UNSUBSCRIBE_SYSTEMS,
            OutboundEvent::GetStatus => events::GET_STATUS,
            OutboundEvent::Heartbeat => events::HEARTBEAT,
        }
    }
}

impl fmt::Display for OutboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundCommand {
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: OutboundEvent,
    /// Event-specific payload.
    pub payload: Value,
    /// Correlation id.
    #[serde(rename = "ref")]
    pub reference: Ref,
}

impl OutboundCommand {
    /// Create a command with an arbitrary payload.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        event: OutboundEvent,
        payload: Value,
        reference: Ref,
    ) -> Self {
        Self {
            topic: topic.into(),
            event,
            payload,
            reference,
        }
    }

    /// Create a `phx_join` command.
    #[must_use]
    pub fn join(topic: impl Into<String>, reference: Ref) -> Self {
        Self::new(topic, OutboundEvent::Join, json!({}), reference)
    }

    /// Create a `phx_leave` command.
    #[must_use]
    pub fn leave(topic: impl Into<String>, reference: Ref) -> Self {
        Self::new(topic, OutboundEvent::Leave, json!({}), reference)
    }

    /// Create a `subscribe_systems` command.
    #[must_use]
    pub fn subscribe_systems(
        topic: impl Into<String>,
        systems: &[SystemId],
        reference: Ref,
    ) -> Self {
        Self::new(
            topic,
            OutboundEvent::SubscribeSystems,
            json!({ "systems": systems }),
            reference,
        )
    }

    /// Create an `unsubscribe_systems` command.
    #[must_use]
    pub fn unsubscribe_systems(
        topic: impl Into<String>,
        systems: &[SystemId],
        reference: Ref,
    ) -> Self {
        Self::new(
            topic,
            OutboundEvent::UnsubscribeSystems,
            json!({ "systems": systems }),
            reference,
        )
    }

    /// Create a `get_status` command.
    #[must_use]
    pub fn get_status(topic: impl Into<String>, reference: Ref) -> Self {
        Self::new(topic, OutboundEvent::GetStatus, json!({}), reference)
    }

    /// Create a socket heartbeat.
    #[must_use]
    pub fn heartbeat(reference: Ref) -> Self {
        Self::new(HEARTBEAT_TOPIC, OutboundEvent::Heartbeat, json!({}), reference)
    }
}

/// Structural form of any frame, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Channel topic.
    #[serde(default)]
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Correlation id, absent on server pushes.
    #[serde(rename = "ref", default)]
    pub reference: Option<Ref>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Status carried by a `phx_reply`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// The request succeeded.
    Ok,
    /// The request failed.
    Error,
    /// Any other status string.
    Other(String),
}

impl ReplyStatus {
    /// Check if the status reports success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, ReplyStatus::Ok)
    }

    /// Wire representation of the status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Other(s) => s,
        }
    }
}

impl From<&str> for ReplyStatus {
    fn from(s: &str) -> Self {
        match s {
            "ok" => ReplyStatus::Ok,
            "error" => ReplyStatus::Error,
            other => ReplyStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Victim section of a killmail.
///
/// Every field is optional and a field of the wrong type reads as absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Victim {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub character_id: Option<Value>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub ship_type_id: Option<Value>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub ship_type_name: Option<String>,
    /// Fields the client does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A killmail record as pushed by the feed.
///
/// Records are carried, not validated: only the fields used for display are
/// typed, each one reads as absent when missing, `null` or of another type,
/// and everything else is kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Killmail {
    /// Killmail identifier.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub killmail_id: Option<u64>,
    /// Time of the kill as sent by the server.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub kill_time: Option<String>,
    /// The destroyed ship and its pilot.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub victim: Option<Victim>,
    /// Attackers, uninterpreted.
    #[serde(default, deserialize_with = "lenient_list")]
    pub attackers: Vec<Value>,
    /// Fields the client does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct KillmailUpdatePayload {
    system_id: SystemId,
    #[serde(default, deserialize_with = "killmail_records")]
    killmails: Vec<Killmail>,
    #[serde(default, deserialize_with = "string_or_number")]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct KillCountPayload {
    system_id: SystemId,
    count: u64,
}

#[derive(Deserialize)]
struct ReplyPayload {
    #[serde(default)]
    status: String,
    #[serde(default = "empty_object")]
    response: Value,
}

/// Read a field as `T`, or `None` if it is `null` or does not fit.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// Read a list field; anything but an array is empty.
fn lenient_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Value>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(items),
        _ => Ok(Vec::new()),
    }
}

/// Read killmail records one by one. Entries that are not objects are
/// skipped; a malformed record never hides the rest of the batch.
fn killmail_records<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Killmail>, D::Error> {
    Ok(lenient_list(deserializer)?
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|record| Killmail::deserialize(record).ok())
        .collect())
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Ok(None),
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Reply to the channel join.
    JoinReply {
        reference: Ref,
        status: ReplyStatus,
        response: Value,
    },

    /// New killmails in a subscribed system.
    KillmailUpdate {
        system_id: SystemId,
        killmails: Vec<Killmail>,
        timestamp: Option<String>,
    },

    /// Updated kill count for a subscribed system.
    KillCountUpdate { system_id: SystemId, count: u64 },

    /// Reply to any other request.
    Reply {
        reference: Option<Ref>,
        status: ReplyStatus,
        response: Value,
    },

    /// An event this client does not know about.
    Unrecognized {
        topic: String,
        event: String,
        payload: Value,
    },
}

impl InboundEvent {
    /// Classify a raw frame by its event name.
    ///
    /// Never fails: a known event whose payload does not have the expected
    /// shape is returned as [`InboundEvent::Unrecognized`].
    #[must_use]
    pub fn classify(frame: RawFrame, join_ref: Ref) -> Self {
        let RawFrame {
            topic,
            event,
            payload,
            reference,
        } = frame;

        let classified = match event.as_str() {
            events::PHX_REPLY => ReplyPayload::deserialize(&payload).ok().map(|reply| {
                let status = ReplyStatus::from(reply.status.as_str());
                if reference == Some(join_ref) {
                    InboundEvent::JoinReply {
                        reference: join_ref,
                        status,
                        response: reply.response,
                    }
                } else {
                    InboundEvent::Reply {
                        reference,
                        status,
                        response: reply.response,
                    }
                }
            }),
            events::KILLMAIL_UPDATE => KillmailUpdatePayload::deserialize(&payload)
                .ok()
                .map(|update| InboundEvent::KillmailUpdate {
                    system_id: update.system_id,
                    killmails: update.killmails,
                    timestamp: update.timestamp,
                }),
            events::KILL_COUNT_UPDATE => KillCountPayload::deserialize(&payload)
                .ok()
                .map(|update| InboundEvent::KillCountUpdate {
                    system_id: update.system_id,
                    count: update.count,
                }),
            _ => None,
        };

        classified.unwrap_or(InboundEvent::Unrecognized {
            topic,
            event,
            payload,
        })
    }

    /// Short name for logs and metrics labels.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            InboundEvent::JoinReply { .. } => "join_reply",
            InboundEvent::KillmailUpdate { .. } => "killmail_update",
            InboundEvent::KillCountUpdate { .. } => "kill_count_update",
            InboundEvent::Reply { .. } => "reply",
            InboundEvent::Unrecognized { .. } => "unrecognized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(event: &str, payload: Value, reference: Option<u64>) -> RawFrame {
        RawFrame {
            topic: "killmails:lobby".to_string(),
            event: event.to_string(),
            payload,
            reference: reference.map(Ref),
        }
    }

    #[test]
    fn test_ref_accepts_number_and_string() {
        let frame: RawFrame =
            serde_json::from_str(r#"{"topic":"t","event":"e","payload":{},"ref":"7"}"#).unwrap();
        assert_eq!(frame.reference, Some(Ref(7)));

        let frame: RawFrame =
            serde_json::from_str(r#"{"topic":"t","event":"e","payload":{},"ref":7}"#).unwrap();
        assert_eq!(frame.reference, Some(Ref(7)));

        let frame: RawFrame =
            serde_json::from_str(r#"{"topic":"t","event":"e","payload":{},"ref":null}"#).unwrap();
        assert_eq!(frame.reference, None);

        let frame: RawFrame = serde_json::from_str(r#"{"topic":"t","event":"e"}"#).unwrap();
        assert_eq!(frame.reference, None);
        assert_eq!(frame.payload, json!({}));

        assert!(serde_json::from_str::<RawFrame>(r#"{"event":"e","ref":"abc"}"#).is_err());
    }

    #[test]
    fn test_subscribe_payload_shape() {
        let cmd = OutboundCommand::subscribe_systems("killmails:lobby", &[30000142, 30002659], Ref(2));
        assert_eq!(cmd.event, OutboundEvent::SubscribeSystems);
        assert_eq!(cmd.payload, json!({ "systems": [30000142, 30002659] }));
    }

    #[test]
    fn test_classify_kill_count_update() {
        let event = InboundEvent::classify(
            raw("kill_count_update", json!({"system_id": 30000142, "count": 3}), None),
            Ref(1),
        );
        assert_eq!(
            event,
            InboundEvent::KillCountUpdate {
                system_id: 30000142,
                count: 3
            }
        );
    }

    #[test]
    fn test_classify_killmail_update() {
        let payload = json!({
            "system_id": 30002659,
            "timestamp": "2024-01-01T00:00:00Z",
            "killmails": [{
                "killmail_id": 123,
                "victim": {"character_name": "Pilot", "ship_type_name": "Rifter", "damage_taken": 900},
                "attackers": [{"character_id": 1}, {"character_id": 2}],
                "zkb": {"totalValue": 1.5}
            }]
        });
        match InboundEvent::classify(raw("killmail_update", payload, None), Ref(1)) {
            InboundEvent::KillmailUpdate {
                system_id,
                killmails,
                timestamp,
            } => {
                assert_eq!(system_id, 30002659);
                assert_eq!(timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
                assert_eq!(killmails.len(), 1);
                let km = &killmails[0];
                assert_eq!(km.killmail_id, Some(123));
                assert_eq!(km.attackers.len(), 2);
                assert!(km.extra.contains_key("zkb"));
                let victim = km.victim.as_ref().unwrap();
                assert_eq!(victim.ship_type_name.as_deref(), Some("Rifter"));
                assert!(victim.extra.contains_key("damage_taken"));
            }
            other => panic!("Expected KillmailUpdate, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_timestamp_is_kept() {
        let payload = json!({"system_id": 1, "killmails": [], "timestamp": 1700000000});
        match InboundEvent::classify(raw("killmail_update", payload, None), Ref(1)) {
            InboundEvent::KillmailUpdate { timestamp, .. } => {
                assert_eq!(timestamp.as_deref(), Some("1700000000"));
            }
            other => panic!("Expected KillmailUpdate, got {:?}", other),
        }
    }

    fn killmails_of(payload: Value) -> Vec<Killmail> {
        match InboundEvent::classify(raw("killmail_update", payload, None), Ref(1)) {
            InboundEvent::KillmailUpdate { killmails, .. } => killmails,
            other => panic!("Expected KillmailUpdate, got {:?}", other),
        }
    }

    #[test]
    fn test_loose_killmail_records_are_kept() {
        let killmails = killmails_of(json!({
            "system_id": 30000142,
            "killmails": [
                {"killmail_id": 1, "attackers": null},
                {"victim": {"character_name": "Pilot"}, "attackers": [{"character_id": 7}]},
                {"killmail_id": 3, "victim": {"ship_type_id": "587", "character_id": null}},
                {"killmail_id": "four", "kill_time": 1700000000, "victim": "gone"}
            ]
        }));

        assert_eq!(killmails.len(), 4);

        assert_eq!(killmails[0].killmail_id, Some(1));
        assert!(killmails[0].attackers.is_empty());

        assert_eq!(killmails[1].killmail_id, None);
        assert_eq!(killmails[1].attackers.len(), 1);
        let victim = killmails[1].victim.as_ref().unwrap();
        assert_eq!(victim.character_name.as_deref(), Some("Pilot"));

        let victim = killmails[2].victim.as_ref().unwrap();
        assert_eq!(victim.ship_type_id, Some(json!("587")));
        assert_eq!(victim.character_id, None);

        assert_eq!(killmails[3].killmail_id, None);
        assert_eq!(killmails[3].kill_time, None);
        assert_eq!(killmails[3].victim, None);
    }

    #[test]
    fn test_non_object_killmail_records_are_skipped() {
        let killmails = killmails_of(json!({
            "system_id": 1,
            "killmails": [null, 42, {"killmail_id": 5}],
            "timestamp": {"unexpected": true}
        }));
        assert_eq!(killmails.len(), 1);
        assert_eq!(killmails[0].killmail_id, Some(5));

        assert!(killmails_of(json!({"system_id": 1, "killmails": null})).is_empty());
    }

    #[test]
    fn test_classify_replies() {
        let join = InboundEvent::classify(
            raw(
                "phx_reply",
                json!({"status": "ok", "response": {"subscription_id": "sub-1"}}),
                Some(1),
            ),
            Ref(1),
        );
        assert_eq!(
            join,
            InboundEvent::JoinReply {
                reference: Ref(1),
                status: ReplyStatus::Ok,
                response: json!({"subscription_id": "sub-1"}),
            }
        );

        let reply = InboundEvent::classify(
            raw("phx_reply", json!({"status": "error", "response": {"reason": "nope"}}), Some(4)),
            Ref(1),
        );
        match reply {
            InboundEvent::Reply {
                reference, status, ..
            } => {
                assert_eq!(reference, Some(Ref(4)));
                assert_eq!(status, ReplyStatus::Error);
                assert!(!status.is_ok());
            }
            other => panic!("Expected Reply, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_known_event_is_unrecognized() {
        let event = InboundEvent::classify(
            raw("kill_count_update", json!({"system_id": "jita"}), None),
            Ref(1),
        );
        assert_eq!(event.kind_name(), "unrecognized");

        let event = InboundEvent::classify(raw("presence_diff", json!({}), None), Ref(1));
        match event {
            InboundEvent::Unrecognized { event, .. } => assert_eq!(event, "presence_diff"),
            other => panic!("Expected Unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_status_conversion() {
        assert_eq!(ReplyStatus::from("ok"), ReplyStatus::Ok);
        assert_eq!(ReplyStatus::from("error"), ReplyStatus::Error);
        assert_eq!(
            ReplyStatus::from("timeout"),
            ReplyStatus::Other("timeout".to_string())
        );
        assert_eq!(ReplyStatus::from("timeout").to_string(), "timeout");
    }
}

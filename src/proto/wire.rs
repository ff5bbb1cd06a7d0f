//! JSON message codec.
//!
//! Decoding accepts exactly the fields the per-(command, message type)
//! tables allow; anything extra, missing, mistyped or out of range is a
//! [`ProtoError`], which is fatal to the connection.

use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::{
    Cmd, FailReason, MatchType, MsgType, TrackType, FIELD_CLIENT_ADDR, FIELD_CLIENT_ID,
    FIELD_FAIL_REASON, FIELD_FILTER, FIELD_GENERATION, FIELD_IDLE, FIELD_LATENCY, FIELD_MATCH_TYPE,
    FIELD_MSG_TYPE, FIELD_ORPHAN_SINCE, FIELD_PROTO_MAX_VERSION, FIELD_PROTO_MIN_VERSION,
    FIELD_PROTO_VERSION, FIELD_SERVICE_ID, FIELD_SERVICE_PROPS, FIELD_SUBSCRIPTION_ID,
    FIELD_TA_CMD, FIELD_TA_ID, FIELD_TIME, FIELD_TRACK_TYPE, FIELD_TTL, MAX_ID,
};
use crate::props::{PropMap, PropValue};

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message is missing required field \"{0}\"")]
    MissingField(&'static str),
    #[error("message field \"{0}\" is not of the expected type")]
    FieldType(&'static str),
    #[error("message field \"{0}\" has a negative value")]
    NegativeField(&'static str),
    #[error("message field \"{0}\" has too large a value to be represented in a signed 64-bit integer")]
    FieldTooLarge(&'static str),
    #[error("message carries unknown field \"{0}\"")]
    UnknownField(String),
    #[error("unknown protocol command \"{0}\"")]
    UnknownCommand(String),
    #[error("unknown message type \"{0}\"")]
    UnknownMsgType(String),
    #[error("message type \"{0}\" is not of a client-generated kind")]
    NotClientGenerated(String),
    #[error("\"{0}\" transactions carry no inform messages")]
    UnexpectedInform(&'static str),
    #[error("unknown track type \"{0}\"")]
    UnknownTrackType(String),
    #[error("service property key bound to a non-list value")]
    PropsNotAList,
    #[error("service property value is neither string nor integer")]
    BadPropValue,
}

/// A decoded client-generated message.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Request { ta_id: u64, request: Request },
    TrackInform { ta_id: u64, track_type: TrackType },
}

/// Request bodies, one per command.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Hello {
        client_id: u64,
        proto_min: u64,
        proto_max: u64,
    },
    Ping,
    Publish {
        service_id: u64,
        generation: u64,
        props: PropMap,
        ttl: u64,
    },
    Unpublish {
        service_id: u64,
    },
    Subscribe {
        subscription_id: u64,
        filter: Option<String>,
    },
    Unsubscribe {
        subscription_id: u64,
    },
    Services {
        filter: Option<String>,
    },
    Subscriptions,
    Clients,
    Track,
}

impl Request {
    pub fn cmd(&self) -> Cmd {
        match self {
            Request::Hello { .. } => Cmd::Hello,
            Request::Ping => Cmd::Ping,
            Request::Publish { .. } => Cmd::Publish,
            Request::Unpublish { .. } => Cmd::Unpublish,
            Request::Subscribe { .. } => Cmd::Subscribe,
            Request::Unsubscribe { .. } => Cmd::Unsubscribe,
            Request::Services { .. } => Cmd::Services,
            Request::Subscriptions => Cmd::Subscriptions,
            Request::Clients => Cmd::Clients,
            Request::Track => Cmd::Track,
        }
    }
}

/// Decode one wire line into a client message. `proto_version` selects
/// the command table; before the handshake the caller passes the highest
/// version the domain speaks.
pub fn decode_client_message(line: &str, proto_version: u16) -> Result<ClientMessage, ProtoError> {
    let value: Value = serde_json::from_str(line)?;
    let mut fields = match value {
        Value::Object(map) => FieldMap(map),
        _ => return Err(ProtoError::NotAnObject),
    };

    let cmd_name = fields.string(FIELD_TA_CMD)?;
    let ta_id = fields.u63(FIELD_TA_ID)?;
    let msg_type_name = fields.string(FIELD_MSG_TYPE)?;

    let msg_type = MsgType::from_str(&msg_type_name)
        .ok_or(ProtoError::UnknownMsgType(msg_type_name))?;
    if !msg_type.is_client_generated() {
        return Err(ProtoError::NotClientGenerated(
            msg_type.as_str().to_string(),
        ));
    }

    let cmd = Cmd::from_str(&cmd_name)
        .filter(|cmd| cmd.min_version() <= proto_version)
        .ok_or(ProtoError::UnknownCommand(cmd_name))?;

    let message = match msg_type {
        MsgType::Inform => {
            if cmd != Cmd::Track {
                return Err(ProtoError::UnexpectedInform(cmd.as_str()));
            }
            let track_type_name = fields.string(FIELD_TRACK_TYPE)?;
            let track_type = TrackType::from_str(&track_type_name)
                .ok_or(ProtoError::UnknownTrackType(track_type_name))?;
            ClientMessage::TrackInform { ta_id, track_type }
        }
        _ => ClientMessage::Request {
            ta_id,
            request: decode_request(cmd, &mut fields)?,
        },
    };

    fields.finish()?;
    Ok(message)
}

fn decode_request(cmd: Cmd, fields: &mut FieldMap) -> Result<Request, ProtoError> {
    Ok(match cmd {
        Cmd::Hello => Request::Hello {
            client_id: fields.u63(FIELD_CLIENT_ID)?,
            proto_min: fields.u63(FIELD_PROTO_MIN_VERSION)?,
            proto_max: fields.u63(FIELD_PROTO_MAX_VERSION)?,
        },
        Cmd::Ping => Request::Ping,
        Cmd::Publish => Request::Publish {
            service_id: fields.u63(FIELD_SERVICE_ID)?,
            generation: fields.u63(FIELD_GENERATION)?,
            props: fields.props(FIELD_SERVICE_PROPS)?,
            ttl: fields.u63(FIELD_TTL)?,
        },
        Cmd::Unpublish => Request::Unpublish {
            service_id: fields.u63(FIELD_SERVICE_ID)?,
        },
        Cmd::Subscribe => Request::Subscribe {
            subscription_id: fields.u63(FIELD_SUBSCRIPTION_ID)?,
            filter: fields.opt_string(FIELD_FILTER)?,
        },
        Cmd::Unsubscribe => Request::Unsubscribe {
            subscription_id: fields.u63(FIELD_SUBSCRIPTION_ID)?,
        },
        Cmd::Services => Request::Services {
            filter: fields.opt_string(FIELD_FILTER)?,
        },
        Cmd::Subscriptions => Request::Subscriptions,
        Cmd::Clients => Request::Clients,
        Cmd::Track => Request::Track,
    })
}

struct FieldMap(Map<String, Value>);

impl FieldMap {
    fn take(&mut self, name: &'static str) -> Result<Value, ProtoError> {
        self.0.remove(name).ok_or(ProtoError::MissingField(name))
    }

    fn string(&mut self, name: &'static str) -> Result<String, ProtoError> {
        match self.take(name)? {
            Value::String(s) => Ok(s),
            _ => Err(ProtoError::FieldType(name)),
        }
    }

    fn opt_string(&mut self, name: &'static str) -> Result<Option<String>, ProtoError> {
        match self.0.remove(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(ProtoError::FieldType(name)),
        }
    }

    fn u63(&mut self, name: &'static str) -> Result<u64, ProtoError> {
        let value = self.take(name)?;
        let number = match &value {
            Value::Number(n) => n,
            _ => return Err(ProtoError::FieldType(name)),
        };
        if let Some(n) = number.as_u64() {
            if n > MAX_ID {
                return Err(ProtoError::FieldTooLarge(name));
            }
            return Ok(n);
        }
        if number.is_i64() {
            return Err(ProtoError::NegativeField(name));
        }
        Err(ProtoError::FieldType(name))
    }

    fn props(&mut self, name: &'static str) -> Result<PropMap, ProtoError> {
        let value = self.take(name)?;
        let object = match value {
            Value::Object(map) => map,
            _ => return Err(ProtoError::FieldType(name)),
        };
        let mut props = PropMap::new();
        for (key, values) in object {
            let list = match values {
                Value::Array(list) => list,
                _ => return Err(ProtoError::PropsNotAList),
            };
            for value in list {
                props.insert(key.clone(), prop_value(value)?);
            }
        }
        Ok(props)
    }

    fn finish(self) -> Result<(), ProtoError> {
        match self.0.into_iter().next() {
            Some((name, _)) => Err(ProtoError::UnknownField(name)),
            None => Ok(()),
        }
    }
}

fn prop_value(value: Value) -> Result<PropValue, ProtoError> {
    match value {
        Value::String(s) => Ok(PropValue::Str(s)),
        Value::Number(n) => n
            .as_i64()
            .map(PropValue::Int)
            .ok_or(ProtoError::BadPropValue),
        _ => Err(ProtoError::BadPropValue),
    }
}

/// Server-generated `notify` bodies.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    Match {
        match_type: MatchType,
        service_id: u64,
        state: Option<MatchState>,
    },
    Service {
        service_id: u64,
        generation: u64,
        props: PropMap,
        ttl: u64,
        client_id: u64,
        orphan_since: Option<f64>,
    },
    Subscription {
        subscription_id: u64,
        client_id: u64,
        filter: Option<String>,
    },
    ClientV2 {
        client_id: u64,
        client_addr: String,
        time: u64,
    },
    ClientV3 {
        client_id: u64,
        client_addr: String,
        time: u64,
        idle: f64,
        proto_version: u16,
        latency: Option<f64>,
    },
    Track(TrackType),
}

/// The service state carried by `appeared` and `modified` match
/// notifications.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchState {
    pub generation: u64,
    pub props: PropMap,
    pub ttl: u64,
    pub client_id: u64,
    pub orphan_since: Option<f64>,
}

fn base(cmd: Cmd, ta_id: u64, msg_type: MsgType) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(FIELD_TA_CMD.into(), Value::String(cmd.as_str().into()));
    map.insert(FIELD_TA_ID.into(), Value::Number(Number::from(ta_id)));
    map.insert(
        FIELD_MSG_TYPE.into(),
        Value::String(msg_type.as_str().into()),
    );
    map
}

fn render(map: Map<String, Value>) -> String {
    Value::Object(map).to_string()
}

fn put_u64(map: &mut Map<String, Value>, name: &str, value: u64) {
    map.insert(name.into(), Value::Number(Number::from(value)));
}

fn put_f64(map: &mut Map<String, Value>, name: &str, value: f64) {
    if let Some(number) = Number::from_f64(value) {
        map.insert(name.into(), Value::Number(number));
    }
}

pub fn props_to_value(props: &PropMap) -> Value {
    let mut map = Map::new();
    for (name, values) in props.iter() {
        let list = values
            .iter()
            .map(|value| match value {
                PropValue::Int(n) => Value::Number(Number::from(*n)),
                PropValue::Str(s) => Value::String(s.clone()),
            })
            .collect();
        map.insert(name.clone(), Value::Array(list));
    }
    Value::Object(map)
}

pub fn encode_accept(cmd: Cmd, ta_id: u64) -> String {
    render(base(cmd, ta_id, MsgType::Accept))
}

pub fn encode_complete(cmd: Cmd, ta_id: u64) -> String {
    render(base(cmd, ta_id, MsgType::Complete))
}

pub fn encode_hello_complete(ta_id: u64, proto_version: u16) -> String {
    let mut map = base(Cmd::Hello, ta_id, MsgType::Complete);
    put_u64(&mut map, FIELD_PROTO_VERSION, u64::from(proto_version));
    render(map)
}

pub fn encode_fail(cmd: Cmd, ta_id: u64, reason: Option<FailReason>) -> String {
    let mut map = base(cmd, ta_id, MsgType::Fail);
    if let Some(reason) = reason {
        map.insert(
            FIELD_FAIL_REASON.into(),
            Value::String(reason.as_str().into()),
        );
    }
    render(map)
}

pub fn encode_notify(cmd: Cmd, ta_id: u64, notice: &Notice) -> String {
    let mut map = base(cmd, ta_id, MsgType::Notify);
    match notice {
        Notice::Match {
            match_type,
            service_id,
            state,
        } => {
            map.insert(
                FIELD_MATCH_TYPE.into(),
                Value::String(match_type.as_str().into()),
            );
            put_u64(&mut map, FIELD_SERVICE_ID, *service_id);
            if let Some(state) = state {
                put_u64(&mut map, FIELD_GENERATION, state.generation);
                map.insert(FIELD_SERVICE_PROPS.into(), props_to_value(&state.props));
                put_u64(&mut map, FIELD_TTL, state.ttl);
                put_u64(&mut map, FIELD_CLIENT_ID, state.client_id);
                if let Some(orphan_since) = state.orphan_since {
                    put_f64(&mut map, FIELD_ORPHAN_SINCE, orphan_since);
                }
            }
        }
        Notice::Service {
            service_id,
            generation,
            props,
            ttl,
            client_id,
            orphan_since,
        } => {
            put_u64(&mut map, FIELD_SERVICE_ID, *service_id);
            put_u64(&mut map, FIELD_GENERATION, *generation);
            map.insert(FIELD_SERVICE_PROPS.into(), props_to_value(props));
            put_u64(&mut map, FIELD_TTL, *ttl);
            put_u64(&mut map, FIELD_CLIENT_ID, *client_id);
            if let Some(orphan_since) = orphan_since {
                put_f64(&mut map, FIELD_ORPHAN_SINCE, *orphan_since);
            }
        }
        Notice::Subscription {
            subscription_id,
            client_id,
            filter,
        } => {
            put_u64(&mut map, FIELD_SUBSCRIPTION_ID, *subscription_id);
            put_u64(&mut map, FIELD_CLIENT_ID, *client_id);
            if let Some(filter) = filter {
                map.insert(FIELD_FILTER.into(), Value::String(filter.clone()));
            }
        }
        Notice::ClientV2 {
            client_id,
            client_addr,
            time,
        } => {
            put_u64(&mut map, FIELD_CLIENT_ID, *client_id);
            map.insert(FIELD_CLIENT_ADDR.into(), Value::String(client_addr.clone()));
            put_u64(&mut map, FIELD_TIME, *time);
        }
        Notice::ClientV3 {
            client_id,
            client_addr,
            time,
            idle,
            proto_version,
            latency,
        } => {
            put_u64(&mut map, FIELD_CLIENT_ID, *client_id);
            map.insert(FIELD_CLIENT_ADDR.into(), Value::String(client_addr.clone()));
            put_u64(&mut map, FIELD_TIME, *time);
            put_f64(&mut map, FIELD_IDLE, *idle);
            put_u64(&mut map, FIELD_PROTO_VERSION, u64::from(*proto_version));
            if let Some(latency) = latency {
                put_f64(&mut map, FIELD_LATENCY, *latency);
            }
        }
        Notice::Track(track_type) => {
            map.insert(
                FIELD_TRACK_TYPE.into(),
                Value::String(track_type.as_str().into()),
            );
        }
    }
    render(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &str) -> Result<ClientMessage, ProtoError> {
        decode_client_message(line, super::super::MAX_VERSION)
    }

    #[test]
    fn decodes_hello() {
        let msg = decode(
            r#"{"ta-cmd": "hello", "ta-id": 0, "msg-type": "request",
                "client-id": 4711, "protocol-minimum-version": 2,
                "protocol-maximum-version": 3}"#,
        )
        .expect("hello");
        assert_eq!(
            msg,
            ClientMessage::Request {
                ta_id: 0,
                request: Request::Hello {
                    client_id: 4711,
                    proto_min: 2,
                    proto_max: 3
                }
            }
        );
    }

    #[test]
    fn decodes_publish_props() {
        let msg = decode(
            r#"{"ta-cmd": "publish", "ta-id": 7, "msg-type": "request",
                "service-id": 99, "generation": 1, "ttl": 60,
                "service-props": {"name": ["foo", "foo"], "port": [4711]}}"#,
        )
        .expect("publish");
        let ClientMessage::Request {
            request: Request::Publish { props, .. },
            ..
        } = msg
        else {
            panic!("not a publish");
        };
        assert_eq!(props.value_count(), 2);
        assert!(props.get("port").is_some());
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = decode(
            r#"{"ta-cmd": "ping", "ta-id": 1, "msg-type": "request", "extra": 1}"#,
        )
        .expect_err("unknown field");
        assert!(matches!(err, ProtoError::UnknownField(name) if name == "extra"));
    }

    #[test]
    fn rejects_missing_fields() {
        let err = decode(r#"{"ta-cmd": "publish", "ta-id": 1, "msg-type": "request"}"#)
            .expect_err("missing");
        assert!(matches!(err, ProtoError::MissingField(_)));
    }

    #[test]
    fn rejects_out_of_range_ids() {
        let err = decode(
            r#"{"ta-cmd": "unpublish", "ta-id": 1, "msg-type": "request",
                "service-id": 9223372036854775808}"#,
        )
        .expect_err("too large");
        assert!(matches!(err, ProtoError::FieldTooLarge("service-id")));

        let err = decode(
            r#"{"ta-cmd": "unpublish", "ta-id": 1, "msg-type": "request",
                "service-id": -1}"#,
        )
        .expect_err("negative");
        assert!(matches!(err, ProtoError::NegativeField("service-id")));
    }

    #[test]
    fn rejects_server_generated_types() {
        let err = decode(r#"{"ta-cmd": "ping", "ta-id": 1, "msg-type": "complete"}"#)
            .expect_err("not client generated");
        assert!(matches!(err, ProtoError::NotClientGenerated(_)));
    }

    #[test]
    fn track_is_version_gated() {
        let line = r#"{"ta-cmd": "track", "ta-id": 1, "msg-type": "request"}"#;
        assert!(decode_client_message(line, 3).is_ok());
        let err = decode_client_message(line, 2).expect_err("v2 track");
        assert!(matches!(err, ProtoError::UnknownCommand(_)));
    }

    #[test]
    fn inform_is_track_only() {
        let msg = decode(
            r#"{"ta-cmd": "track", "ta-id": 2, "msg-type": "inform",
                "track-type": "query"}"#,
        )
        .expect("track inform");
        assert_eq!(
            msg,
            ClientMessage::TrackInform {
                ta_id: 2,
                track_type: TrackType::Query
            }
        );

        let err = decode(
            r#"{"ta-cmd": "ping", "ta-id": 2, "msg-type": "inform"}"#,
        )
        .expect_err("ping inform");
        assert!(matches!(err, ProtoError::UnexpectedInform("ping")));
    }

    #[test]
    fn encodes_match_notify() {
        let state = MatchState {
            generation: 3,
            props: [("name", "foo")].into_iter().collect(),
            ttl: 60,
            client_id: 17,
            orphan_since: Some(1000.5),
        };
        let line = encode_notify(
            Cmd::Subscribe,
            9,
            &Notice::Match {
                match_type: MatchType::Modified,
                service_id: 4711,
                state: Some(state),
            },
        );
        let value: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["ta-cmd"], "subscribe");
        assert_eq!(value["msg-type"], "notify");
        assert_eq!(value["match-type"], "modified");
        assert_eq!(value["service-id"], 4711);
        assert_eq!(value["orphan-since"], 1000.5);
        assert_eq!(value["service-props"]["name"][0], "foo");
    }

    #[test]
    fn disappeared_notify_has_no_state() {
        let line = encode_notify(
            Cmd::Subscribe,
            9,
            &Notice::Match {
                match_type: MatchType::Disappeared,
                service_id: 4711,
                state: None,
            },
        );
        let value: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["match-type"], "disappeared");
        assert!(value.get("generation").is_none());
        assert!(value.get("service-props").is_none());
    }

    #[test]
    fn fail_carries_reason() {
        let line = encode_fail(Cmd::Hello, 0, Some(FailReason::NoHello));
        let value: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["msg-type"], "fail");
        assert_eq!(value["fail-reason"], "no-hello");
    }
}

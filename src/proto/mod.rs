//! Wire protocol vocabulary: versions, commands, message types, and
//! failure reason codes.
//!
//! The protocol is JSON objects over a line-delimited stream. Every
//! message carries `ta-cmd`, `ta-id` and `msg-type`; the remaining
//! fields depend on the (command, message type) pair and are enforced
//! by the codec in [`wire`].

pub mod wire;

pub use wire::{decode_client_message, ClientMessage, Notice, ProtoError, Request};

/// Lowest protocol version this server speaks.
pub const MIN_VERSION: u16 = 2;
/// Highest protocol version this server speaks.
pub const MAX_VERSION: u16 = 3;

/// Identifiers and generations must fit a signed 64-bit integer.
pub const MAX_ID: u64 = (1 << 63) - 1;

pub const FIELD_TA_CMD: &str = "ta-cmd";
pub const FIELD_TA_ID: &str = "ta-id";
pub const FIELD_MSG_TYPE: &str = "msg-type";
pub const FIELD_FAIL_REASON: &str = "fail-reason";
pub const FIELD_PROTO_MIN_VERSION: &str = "protocol-minimum-version";
pub const FIELD_PROTO_MAX_VERSION: &str = "protocol-maximum-version";
pub const FIELD_PROTO_VERSION: &str = "protocol-version";
pub const FIELD_TRACK_TYPE: &str = "track-type";
pub const FIELD_SERVICE_ID: &str = "service-id";
pub const FIELD_SERVICE_PROPS: &str = "service-props";
pub const FIELD_GENERATION: &str = "generation";
pub const FIELD_TTL: &str = "ttl";
pub const FIELD_ORPHAN_SINCE: &str = "orphan-since";
pub const FIELD_SUBSCRIPTION_ID: &str = "subscription-id";
pub const FIELD_FILTER: &str = "filter";
pub const FIELD_CLIENT_ID: &str = "client-id";
pub const FIELD_CLIENT_ADDR: &str = "client-address";
pub const FIELD_TIME: &str = "time";
pub const FIELD_IDLE: &str = "idle";
pub const FIELD_LATENCY: &str = "latency";
pub const FIELD_MATCH_TYPE: &str = "match-type";

/// Protocol commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cmd {
    Hello,
    Ping,
    Publish,
    Unpublish,
    Subscribe,
    Unsubscribe,
    Services,
    Subscriptions,
    Clients,
    Track,
}

/// Transaction interaction shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interaction {
    SingleResponse,
    MultiResponse,
    TwoWay,
}

impl Cmd {
    pub fn as_str(self) -> &'static str {
        match self {
            Cmd::Hello => "hello",
            Cmd::Ping => "ping",
            Cmd::Publish => "publish",
            Cmd::Unpublish => "unpublish",
            Cmd::Subscribe => "subscribe",
            Cmd::Unsubscribe => "unsubscribe",
            Cmd::Services => "services",
            Cmd::Subscriptions => "subscriptions",
            Cmd::Clients => "clients",
            Cmd::Track => "track",
        }
    }

    pub fn from_str(s: &str) -> Option<Cmd> {
        Some(match s {
            "hello" => Cmd::Hello,
            "ping" => Cmd::Ping,
            "publish" => Cmd::Publish,
            "unpublish" => Cmd::Unpublish,
            "subscribe" => Cmd::Subscribe,
            "unsubscribe" => Cmd::Unsubscribe,
            "services" => Cmd::Services,
            "subscriptions" => Cmd::Subscriptions,
            "clients" => Cmd::Clients,
            "track" => Cmd::Track,
            _ => return None,
        })
    }

    pub fn interaction(self) -> Interaction {
        match self {
            Cmd::Hello | Cmd::Ping | Cmd::Publish | Cmd::Unpublish | Cmd::Unsubscribe => {
                Interaction::SingleResponse
            }
            Cmd::Subscribe | Cmd::Services | Cmd::Subscriptions | Cmd::Clients => {
                Interaction::MultiResponse
            }
            Cmd::Track => Interaction::TwoWay,
        }
    }

    /// The lowest protocol version at which the command exists.
    pub fn min_version(self) -> u16 {
        match self {
            Cmd::Track => 3,
            _ => MIN_VERSION,
        }
    }
}

/// Message types. `request` and `inform` are client-generated; the rest
/// are server-generated. `inform` only exists on `track` transactions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Request,
    Accept,
    Notify,
    Inform,
    Complete,
    Fail,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Request => "request",
            MsgType::Accept => "accept",
            MsgType::Notify => "notify",
            MsgType::Inform => "inform",
            MsgType::Complete => "complete",
            MsgType::Fail => "fail",
        }
    }

    pub fn from_str(s: &str) -> Option<MsgType> {
        Some(match s {
            "request" => MsgType::Request,
            "accept" => MsgType::Accept,
            "notify" => MsgType::Notify,
            "inform" => MsgType::Inform,
            "complete" => MsgType::Complete,
            "fail" => MsgType::Fail,
            _ => return None,
        })
    }

    pub fn is_client_generated(self) -> bool {
        matches!(self, MsgType::Request | MsgType::Inform)
    }
}

/// Subscription match event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Appeared,
    Modified,
    Disappeared,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Appeared => "appeared",
            MatchType::Modified => "modified",
            MatchType::Disappeared => "disappeared",
        }
    }
}

/// Track probe directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackType {
    Query,
    Reply,
}

impl TrackType {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackType::Query => "query",
            TrackType::Reply => "reply",
        }
    }

    pub fn from_str(s: &str) -> Option<TrackType> {
        Some(match s {
            "query" => TrackType::Query,
            "reply" => TrackType::Reply,
            _ => return None,
        })
    }
}

/// Machine-readable `fail-reason` codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailReason {
    NoHello,
    TrackExists,
    ClientIdExists,
    InvalidFilterSyntax,
    SubscriptionIdExists,
    NonExistentSubscriptionId,
    NonExistentServiceId,
    UnsupportedProtocolVersion,
    PermissionDenied,
    OldGeneration,
    SameGenerationButDifferent,
    InsufficientResources,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailReason::NoHello => "no-hello",
            FailReason::TrackExists => "track-exists",
            FailReason::ClientIdExists => "client-id-exists",
            FailReason::InvalidFilterSyntax => "invalid-filter-syntax",
            FailReason::SubscriptionIdExists => "subscription-id-exists",
            FailReason::NonExistentSubscriptionId => "non-existent-subscription-id",
            FailReason::NonExistentServiceId => "non-existent-service-id",
            FailReason::UnsupportedProtocolVersion => "unsupported-protocol-version",
            FailReason::PermissionDenied => "permission-denied",
            FailReason::OldGeneration => "old-generation",
            FailReason::SameGenerationButDifferent => "same-generation-but-different",
            FailReason::InsufficientResources => "insufficient-resources",
        }
    }
}

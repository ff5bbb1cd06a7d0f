//! The per-domain engine loop.
//!
//! This is THE serialisation point: one thread owns the domain store,
//! every session's protocol state and all timers, and processes one
//! event at a time. Reader threads feed it raw wire lines; it feeds
//! writer threads encoded responses. Between two events there is no
//! partially applied mutation anywhere.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::DomainSettings;
use crate::filter;
use crate::proto::wire::{MatchState, Notice};
use crate::proto::{Cmd, FailReason, MatchType, TrackType};
use crate::sd::{ClientId, Domain, MatchEvent, SdError, ServiceState, SubscriptionId};
use crate::transport::Stream;

use super::coalesce::Coalescer;
use super::session::{Session, SessionError, TaId};
use super::{now_ms, ConnId};

/// Time a fresh connection gets to complete the hello handshake.
const HANDSHAKE_GRACE_MS: u64 = 2_000;
/// Cadence of the handshake/idle sweep.
const SWEEP_INTERVAL_MS: u64 = 1_000;

/// Everything the engine can be woken up by.
pub enum EngineEvent {
    Connected {
        conn: ConnId,
        peer_addr: String,
        user_id: String,
        writer: Sender<String>,
        closer: Stream,
    },
    Line {
        conn: ConnId,
        line: String,
    },
    Disconnected {
        conn: ConnId,
    },
    Shutdown,
}

pub(super) struct Engine {
    settings: DomainSettings,
    domain: Domain,
    sessions: HashMap<ConnId, Session>,
    by_client: HashMap<ClientId, ConnId>,
    coalescer: Coalescer,
    events: Receiver<EngineEvent>,
    next_sweep_ms: Option<u64>,
}

impl Engine {
    pub(super) fn new(settings: DomainSettings, events: Receiver<EngineEvent>) -> Self {
        let domain = Domain::new(
            settings.user_limits,
            settings.total_limits,
            settings.policy,
        );
        let coalescer = Coalescer::new(settings.notification_delay_ms);
        Self {
            settings,
            domain,
            sessions: HashMap::new(),
            by_client: HashMap::new(),
            coalescer,
            events,
            next_sweep_ms: None,
        }
    }

    pub(super) fn run(mut self) {
        loop {
            let now = now_ms();
            if self.sessions.is_empty() {
                self.next_sweep_ms = None;
            } else if self.next_sweep_ms.is_none() {
                self.next_sweep_ms = Some(now.saturating_add(SWEEP_INTERVAL_MS));
            }

            let deadline = [
                self.domain.next_orphan_deadline(),
                self.coalescer.next_deadline(),
                self.next_sweep_ms,
            ]
            .into_iter()
            .flatten()
            .min();

            // Wait for the next event, or until the earliest deadline.
            let event = match deadline {
                Some(at) => {
                    let timeout = Duration::from_millis(at.saturating_sub(now));
                    match self.events.recv_timeout(timeout) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match self.events.recv() {
                    Ok(event) => Some(event),
                    Err(_) => return,
                },
            };

            match event {
                Some(EngineEvent::Shutdown) => {
                    tracing::info!(
                        domain = %domain_label(&self.settings),
                        "engine shutting down"
                    );
                    return;
                }
                Some(event) => self.handle_event(event),
                None => self.handle_deadlines(),
            }
        }
    }

    fn handle_event(&mut self, event: EngineEvent) {
        let now = now_ms();
        match event {
            EngineEvent::Connected {
                conn,
                peer_addr,
                user_id,
                writer,
                closer,
            } => {
                tracing::info!(
                    domain = %domain_label(&self.settings),
                    peer = %peer_addr,
                    "accepted new client connection"
                );
                self.sessions.insert(
                    conn,
                    Session::new(conn, peer_addr, user_id, writer, closer, now),
                );
            }
            EngineEvent::Line { conn, line } => self.handle_line(conn, line, now),
            EngineEvent::Disconnected { conn } => {
                self.drop_connection(conn, now, "transport closed");
            }
            EngineEvent::Shutdown => {}
        }
    }

    fn handle_line(&mut self, conn: ConnId, line: String, now: u64) {
        let decode_version = match self.sessions.get_mut(&conn) {
            Some(session) => {
                session.last_activity_ms = now;
                session
                    .proto_version
                    .unwrap_or(self.settings.protocol.max)
            }
            None => return,
        };

        let message = match crate::proto::decode_client_message(&line, decode_version) {
            Ok(message) => message,
            Err(err) => {
                self.fatal(conn, now, SessionError::from(err));
                return;
            }
        };

        // A panic in a handler is a bug, but it must not take the other
        // connections down with it.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match message {
            crate::proto::ClientMessage::Request { ta_id, request } => {
                self.handle_request(conn, ta_id, request, now)
            }
            crate::proto::ClientMessage::TrackInform { ta_id, track_type } => {
                self.handle_track_inform(conn, ta_id, track_type, now)
            }
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.fatal(conn, now, err),
            Err(_) => {
                tracing::error!(
                    domain = %domain_label(&self.settings),
                    "panic while handling message"
                );
                self.drop_connection(conn, now, "internal error");
            }
        }
    }

    fn handle_request(
        &mut self,
        conn: ConnId,
        ta_id: TaId,
        request: crate::proto::Request,
        now: u64,
    ) -> Result<(), SessionError> {
        let cmd = request.cmd();
        {
            let Some(session) = self.sessions.get(&conn) else {
                return Ok(());
            };
            session.begin_request(ta_id)?;
            if !session.handshaked && cmd != Cmd::Hello {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = %session.ident(),
                    cmd = cmd.as_str(),
                    "attempt to issue command before hello"
                );
                session.send_fail(cmd, ta_id, FailReason::NoHello);
                return Ok(());
            }
        }

        use crate::proto::Request::*;
        match request {
            Hello {
                client_id,
                proto_min,
                proto_max,
            } => self.handle_hello(conn, ta_id, client_id, proto_min, proto_max),
            Ping => {
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_complete(Cmd::Ping, ta_id);
                }
            }
            Publish {
                service_id,
                generation,
                props,
                ttl,
            } => self.handle_publish(conn, ta_id, service_id, generation, props, ttl, now),
            Unpublish { service_id } => self.handle_unpublish(conn, ta_id, service_id, now),
            Subscribe {
                subscription_id,
                filter,
            } => self.handle_subscribe(conn, ta_id, subscription_id, filter),
            Unsubscribe { subscription_id } => {
                self.handle_unsubscribe(conn, ta_id, subscription_id)
            }
            Services { filter } => self.handle_services(conn, ta_id, filter),
            Subscriptions => self.handle_subscriptions(conn, ta_id),
            Clients => self.handle_clients(conn, ta_id, now),
            Track => self.handle_track(conn, ta_id),
        }
        Ok(())
    }

    fn handle_hello(
        &mut self,
        conn: ConnId,
        ta_id: TaId,
        client_id: u64,
        proto_min: u64,
        proto_max: u64,
    ) {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };

        if session.handshaked {
            if session.first_hello == Some((client_id, proto_min, proto_max)) {
                // A repeated, identical hello is harmless.
                if let Some(version) = session.proto_version {
                    session.send(crate::proto::wire::encode_hello_complete(ta_id, version));
                }
            } else {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = %session.ident(),
                    "hello differs from the completed handshake"
                );
                session.send_fail(Cmd::Hello, ta_id, FailReason::PermissionDenied);
            }
            return;
        }

        match session.client_id {
            Some(previous) if previous != client_id => {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = %session.ident(),
                    "attempt to change client id denied"
                );
                session.send_fail(Cmd::Hello, ta_id, FailReason::PermissionDenied);
                return;
            }
            _ => session.client_id = Some(client_id),
        }

        let range = self.settings.protocol;
        let low = proto_min.max(u64::from(range.min));
        let high = proto_max.min(u64::from(range.max));
        if low > high {
            tracing::warn!(
                domain = %domain_label(&self.settings),
                client = %session.ident(),
                client_min = proto_min,
                client_max = proto_max,
                "client does not support a protocol version in range {}-{}",
                range.min,
                range.max
            );
            session.send_fail(Cmd::Hello, ta_id, FailReason::UnsupportedProtocolVersion);
            return;
        }
        let version = high as u16;

        match self.domain.client_connect(client_id, &session.user_id) {
            Ok(()) => {
                session.proto_version = Some(version);
                session.handshaked = true;
                session.first_hello = Some((client_id, proto_min, proto_max));
                tracing::info!(
                    domain = %domain_label(&self.settings),
                    client = %session.ident(),
                    user = %session.user_id,
                    version,
                    "handshake complete"
                );
                session.send(crate::proto::wire::encode_hello_complete(ta_id, version));
                self.by_client.insert(client_id, conn);
            }
            Err(err) => {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = %session.ident(),
                    "unable to connect: {err}"
                );
                session.send_fail(Cmd::Hello, ta_id, fail_reason(&err));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_publish(
        &mut self,
        conn: ConnId,
        ta_id: TaId,
        service_id: u64,
        generation: u64,
        props: crate::props::PropMap,
        ttl: u64,
        now: u64,
    ) {
        let Some(client_id) = self.session_client(conn) else {
            return;
        };
        match self
            .domain
            .publish(client_id, service_id, generation, props, ttl)
        {
            Ok(events) => {
                tracing::debug!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    service = format_args!("{service_id:#x}"),
                    generation,
                    ttl,
                    "published service"
                );
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_complete(Cmd::Publish, ta_id);
                }
                self.route_events(events, now);
            }
            Err(err) => {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    service = format_args!("{service_id:#x}"),
                    "publish failed: {err}"
                );
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_fail(Cmd::Publish, ta_id, fail_reason(&err));
                }
            }
        }
    }

    fn handle_unpublish(&mut self, conn: ConnId, ta_id: TaId, service_id: u64, now: u64) {
        let Some(client_id) = self.session_client(conn) else {
            return;
        };
        match self.domain.unpublish(client_id, service_id) {
            Ok(events) => {
                tracing::debug!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    service = format_args!("{service_id:#x}"),
                    "unpublished service"
                );
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_complete(Cmd::Unpublish, ta_id);
                }
                self.route_events(events, now);
            }
            Err(err) => {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    service = format_args!("{service_id:#x}"),
                    "unpublish failed: {err}"
                );
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_fail(Cmd::Unpublish, ta_id, fail_reason(&err));
                }
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        conn: ConnId,
        ta_id: TaId,
        sub_id: SubscriptionId,
        filter_expr: Option<String>,
    ) {
        let Some(client_id) = self.session_client(conn) else {
            return;
        };

        let filter = match filter_expr.as_deref().map(filter::parse).transpose() {
            Ok(filter) => filter,
            Err(err) => {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    "subscription request with malformed filter: {err}"
                );
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_fail(Cmd::Subscribe, ta_id, FailReason::InvalidFilterSyntax);
                }
                return;
            }
        };

        match self.domain.subscribe(client_id, sub_id, filter) {
            Ok(()) => {
                if let Some(session) = self.sessions.get_mut(&conn) {
                    session.open_transaction(ta_id, Cmd::Subscribe);
                    session.sub_tas.insert(sub_id, ta_id);
                    session.send_accept(Cmd::Subscribe, ta_id);
                }
                tracing::debug!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    subscription = sub_id,
                    "installed subscription"
                );
                // The initial backlog is the subscription's starting
                // snapshot; it is delivered as-is, not coalesced.
                let backlog = self.domain.activate_subscription(sub_id);
                for event in backlog {
                    self.deliver(event);
                }
            }
            Err(err) => {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    subscription = sub_id,
                    "subscribe failed: {err}"
                );
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_fail(Cmd::Subscribe, ta_id, fail_reason(&err));
                }
            }
        }
    }

    fn handle_unsubscribe(&mut self, conn: ConnId, ta_id: TaId, sub_id: SubscriptionId) {
        let Some(client_id) = self.session_client(conn) else {
            return;
        };
        match self.domain.unsubscribe(client_id, sub_id) {
            Ok(()) => {
                self.coalescer.drop_subscription(sub_id);
                if let Some(session) = self.sessions.get_mut(&conn) {
                    if let Some(sub_ta) = session.sub_tas.remove(&sub_id) {
                        session.close_transaction(sub_ta);
                        session.send_complete(Cmd::Subscribe, sub_ta);
                    }
                    session.send_complete(Cmd::Unsubscribe, ta_id);
                }
                tracing::debug!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    subscription = sub_id,
                    "cancelled subscription"
                );
            }
            Err(err) => {
                tracing::warn!(
                    domain = %domain_label(&self.settings),
                    client = format_args!("{client_id:#x}"),
                    subscription = sub_id,
                    "unsubscribe failed: {err}"
                );
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_fail(Cmd::Unsubscribe, ta_id, fail_reason(&err));
                }
            }
        }
    }

    fn handle_services(&mut self, conn: ConnId, ta_id: TaId, filter_expr: Option<String>) {
        let filter = match filter_expr.as_deref().map(filter::parse).transpose() {
            Ok(filter) => filter,
            Err(err) => {
                tracing::info!(
                    domain = %domain_label(&self.settings),
                    "services request with malformed filter: {err}"
                );
                if let Some(session) = self.sessions.get(&conn) {
                    session.send_fail(Cmd::Services, ta_id, FailReason::InvalidFilterSyntax);
                }
                return;
            }
        };

        // The whole listing is emitted within this turn, which is what
        // gives it snapshot semantics.
        let notices: Vec<Notice> = self
            .domain
            .services()
            .filter(|svc| {
                filter
                    .as_ref()
                    .map(|f| f.matches(&svc.props))
                    .unwrap_or(true)
            })
            .map(|svc| Notice::Service {
                service_id: svc.service_id,
                generation: svc.generation,
                props: svc.props.clone(),
                ttl: svc.ttl,
                client_id: svc.owner,
                orphan_since: svc.orphan_since.map(ms_to_secs),
            })
            .collect();

        if let Some(session) = self.sessions.get(&conn) {
            session.send_accept(Cmd::Services, ta_id);
            for notice in &notices {
                session.send_notify(Cmd::Services, ta_id, notice);
            }
            session.send_complete(Cmd::Services, ta_id);
        }
    }

    fn handle_subscriptions(&mut self, conn: ConnId, ta_id: TaId) {
        let notices: Vec<Notice> = self
            .domain
            .subscriptions()
            .map(|sub| Notice::Subscription {
                subscription_id: sub.sub_id,
                client_id: sub.owner,
                filter: sub.filter.as_ref().map(|f| f.to_string()),
            })
            .collect();

        if let Some(session) = self.sessions.get(&conn) {
            session.send_accept(Cmd::Subscriptions, ta_id);
            for notice in &notices {
                session.send_notify(Cmd::Subscriptions, ta_id, notice);
            }
            session.send_complete(Cmd::Subscriptions, ta_id);
        }
    }

    fn handle_clients(&mut self, conn: ConnId, ta_id: TaId, now: u64) {
        let extended = self
            .sessions
            .get(&conn)
            .and_then(|session| session.proto_version)
            .map(|version| version >= 3)
            .unwrap_or(false);

        let notices: Vec<Notice> = self
            .sessions
            .values()
            .filter(|s| s.handshaked)
            .filter_map(|s| {
                let client_id = s.client_id?;
                let time = s.connected_at_ms / 1000;
                Some(if extended {
                    Notice::ClientV3 {
                        client_id,
                        client_addr: s.peer_addr.clone(),
                        time,
                        idle: ms_to_secs(now.saturating_sub(s.last_activity_ms)),
                        proto_version: s.proto_version.unwrap_or(0),
                        latency: if s.is_tracked() {
                            s.track_latency_ms.map(ms_to_secs)
                        } else {
                            None
                        },
                    }
                } else {
                    Notice::ClientV2 {
                        client_id,
                        client_addr: s.peer_addr.clone(),
                        time,
                    }
                })
            })
            .collect();

        if let Some(session) = self.sessions.get(&conn) {
            session.send_accept(Cmd::Clients, ta_id);
            for notice in &notices {
                session.send_notify(Cmd::Clients, ta_id, notice);
            }
            session.send_complete(Cmd::Clients, ta_id);
        }
    }

    fn handle_track(&mut self, conn: ConnId, ta_id: TaId) {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        if session.is_tracked() {
            tracing::warn!(
                domain = %domain_label(&self.settings),
                client = %session.ident(),
                "track transaction already exists"
            );
            session.send_fail(Cmd::Track, ta_id, FailReason::TrackExists);
            return;
        }
        session.open_transaction(ta_id, Cmd::Track);
        session.track_ta = Some(ta_id);
        session.send_accept(Cmd::Track, ta_id);
        tracing::debug!(
            domain = %domain_label(&self.settings),
            client = %session.ident(),
            "installed tracker"
        );
    }

    fn handle_track_inform(
        &mut self,
        conn: ConnId,
        ta_id: TaId,
        track_type: TrackType,
        now: u64,
    ) -> Result<(), SessionError> {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return Ok(());
        };
        match session.open_transaction_cmd(ta_id) {
            None => return Err(SessionError::UnknownTransaction(ta_id)),
            Some(Cmd::Track) => {}
            Some(cmd) => {
                return Err(SessionError::UnexpectedInform {
                    cmd: cmd.as_str(),
                    ta_id,
                })
            }
        }
        match track_type {
            TrackType::Query => {
                session.send_notify(Cmd::Track, ta_id, &Notice::Track(TrackType::Reply));
            }
            TrackType::Reply => match session.track_query_at_ms.take() {
                Some(sent_at) => {
                    session.track_latency_ms = Some(now.saturating_sub(sent_at));
                }
                None => {
                    tracing::debug!(
                        domain = %domain_label(&self.settings),
                        client = %session.ident(),
                        "ignoring unsolicited track reply"
                    );
                }
            },
        }
        Ok(())
    }

    fn session_client(&self, conn: ConnId) -> Option<ClientId> {
        self.sessions.get(&conn).and_then(|s| s.client_id)
    }

    fn route_events(&mut self, events: Vec<MatchEvent>, now: u64) {
        for event in events {
            if let Some(event) = self.coalescer.push(event, now) {
                self.deliver(event);
            }
        }
    }

    fn deliver(&self, event: MatchEvent) {
        let Some(conn) = self.by_client.get(&event.subscriber) else {
            return;
        };
        let Some(session) = self.sessions.get(conn) else {
            return;
        };
        let Some(ta_id) = session.sub_tas.get(&event.sub_id).copied() else {
            return;
        };
        let notice = Notice::Match {
            match_type: event.match_type,
            service_id: event.service_id,
            state: event.state.map(match_state),
        };
        session.send_notify(Cmd::Subscribe, ta_id, &notice);
    }

    fn handle_deadlines(&mut self) {
        let now = now_ms();

        let reaped = self.domain.purge_due_orphans(now);
        if !reaped.is_empty() {
            tracing::info!(
                domain = %domain_label(&self.settings),
                count = reaped
                    .iter()
                    .filter(|e| e.match_type == MatchType::Disappeared)
                    .count(),
                "reaped timed-out orphans"
            );
            self.route_events(reaped, now);
        }

        let flushed = self.coalescer.flush_due(now);
        for event in flushed {
            self.deliver(event);
        }

        if let Some(at) = self.next_sweep_ms {
            if now >= at {
                self.sweep(now);
                self.next_sweep_ms = Some(now.saturating_add(SWEEP_INTERVAL_MS));
            }
        }
    }

    /// Once a second: drop connections that never said hello, and run
    /// the idle/liveness checks on the ones that did.
    fn sweep(&mut self, now: u64) {
        enum Action {
            Close(ConnId, &'static str),
            Query(ConnId),
        }

        let mut actions = Vec::new();
        for session in self.sessions.values() {
            if !session.handshaked {
                if now.saturating_sub(session.connected_at_ms) >= HANDSHAKE_GRACE_MS {
                    actions.push(Action::Close(session.conn, "handshake timeout"));
                }
                continue;
            }
            // Transport liveness is trusted for protocol v2 peers.
            if session.proto_version.unwrap_or(0) < 3 {
                continue;
            }
            let max_idle_ms = self.max_idle_ms(session.client_id);
            if let Some(sent_at) = session.track_query_at_ms {
                if session.is_tracked() && now.saturating_sub(sent_at) >= max_idle_ms {
                    actions.push(Action::Close(session.conn, "track query timed out"));
                }
            } else if now.saturating_sub(session.last_activity_ms) >= max_idle_ms {
                if session.is_tracked() {
                    actions.push(Action::Query(session.conn));
                } else {
                    actions.push(Action::Close(session.conn, "idle timeout"));
                }
            }
        }

        for action in actions {
            match action {
                Action::Close(conn, reason) => self.drop_connection(conn, now, reason),
                Action::Query(conn) => {
                    if let Some(session) = self.sessions.get_mut(&conn) {
                        if let Some(ta_id) = session.track_ta {
                            session.send_notify(
                                Cmd::Track,
                                ta_id,
                                &Notice::Track(TrackType::Query),
                            );
                            session.track_query_at_ms = Some(now);
                        }
                    }
                }
            }
        }
    }

    /// The maximum idle time of one connection: the configured range,
    /// tightened by the shortest TTL among the client's services.
    fn max_idle_ms(&self, client_id: Option<ClientId>) -> u64 {
        let idle = self.settings.idle;
        let max_idle_s = match client_id.and_then(|id| self.domain.min_owned_ttl(id)) {
            Some(min_ttl) => min_ttl.clamp(idle.min, idle.max),
            None => idle.max,
        };
        max_idle_s.saturating_mul(1000)
    }

    fn fatal(&mut self, conn: ConnId, now: u64, err: SessionError) {
        if let Some(session) = self.sessions.get(&conn) {
            tracing::warn!(
                domain = %domain_label(&self.settings),
                client = %session.ident(),
                "fatal protocol error: {err}"
            );
        }
        self.drop_connection(conn, now, "protocol error");
    }

    fn drop_connection(&mut self, conn: ConnId, now: u64, reason: &str) {
        let Some(session) = self.sessions.remove(&conn) else {
            return;
        };
        tracing::info!(
            domain = %domain_label(&self.settings),
            client = %session.ident(),
            reason,
            "disconnected"
        );
        if session.handshaked {
            if let Some(client_id) = session.client_id {
                self.by_client.remove(&client_id);
                match self.domain.client_disconnect(client_id, now) {
                    Ok(outcome) => {
                        for sub_id in outcome.dropped_subscriptions {
                            self.coalescer.drop_subscription(sub_id);
                        }
                        self.route_events(outcome.events, now);
                    }
                    Err(err) => {
                        tracing::debug!(
                            domain = %domain_label(&self.settings),
                            "disconnect bookkeeping failed: {err}"
                        );
                    }
                }
            }
        }
        // Dropping the session shut the transport down; the reader and
        // writer threads unwind from there.
    }
}

/// The domain's display name for log records.
fn domain_label(settings: &DomainSettings) -> &str {
    settings.name.as_deref().unwrap_or("-")
}

fn match_state(state: ServiceState) -> MatchState {
    MatchState {
        generation: state.generation,
        props: state.props,
        ttl: state.ttl,
        client_id: state.owner,
        orphan_since: state.orphan_since.map(ms_to_secs),
    }
}

fn ms_to_secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

fn fail_reason(err: &SdError) -> FailReason {
    match err {
        SdError::ClientExists(_) => FailReason::ClientIdExists,
        SdError::UnknownService(_) => FailReason::NonExistentServiceId,
        SdError::UnknownSubscription(_) => FailReason::NonExistentSubscriptionId,
        SdError::SubscriptionExists(_) => FailReason::SubscriptionIdExists,
        SdError::UserMismatch { .. } | SdError::SubscriptionOwner { .. } | SdError::UnknownClient(_) => {
            FailReason::PermissionDenied
        }
        SdError::OldGeneration { .. } => FailReason::OldGeneration,
        SdError::SameGenerationButDifferent(_) => FailReason::SameGenerationButDifferent,
        SdError::Resource(_) => FailReason::InsufficientResources,
    }
}

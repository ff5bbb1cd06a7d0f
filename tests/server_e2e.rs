//! End-to-end tests: boot a real domain server on a local socket and
//! speak raw newline-delimited JSON at it.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use pathfinderd::config::Config;
use pathfinderd::server::{self, ServerHandle};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct TestDomain {
    _dir: TempDir,
    handle: Option<ServerHandle>,
    socket: PathBuf,
}

impl TestDomain {
    /// Boot one domain on a ux socket in a scratch directory.
    /// `extra` is appended to the domain's YAML configuration entry.
    fn start(extra_domain: &str, extra_top: &str) -> TestDomain {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("pf.sock");
        let yaml = format!(
            "domains:\n  - sockets: [\"ux:{}\"]\n{extra_domain}{extra_top}",
            socket.display()
        );
        let config = Config::parse(&yaml).expect("config");
        let settings = config.domain_settings().remove(0);
        let handle = server::start(settings).expect("server start");
        TestDomain {
            _dir: dir,
            handle: Some(handle),
            socket,
        }
    }

    fn immediate() -> TestDomain {
        TestDomain::start("    notification_delay_ms: 0\n", "")
    }

    fn connect(&self) -> Client {
        let stream = UnixStream::connect(&self.socket).expect("connect");
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone"));
        Client { stream, reader }
    }
}

impl Drop for TestDomain {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

struct Client {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Client {
    fn send(&mut self, msg: Value) {
        let mut line = msg.to_string();
        line.push('\n');
        self.stream.write_all(line.as_bytes()).expect("send");
    }

    /// Read one message; `None` means the server closed the connection.
    fn try_recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).expect("recv");
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).expect("json"))
    }

    fn recv(&mut self) -> Value {
        self.try_recv().expect("connection closed")
    }

    fn hello(&mut self, client_id: u64) {
        self.hello_versions(client_id, 2, 3);
    }

    fn hello_versions(&mut self, client_id: u64, min: u64, max: u64) {
        self.send(json!({
            "ta-cmd": "hello", "ta-id": 0, "msg-type": "request",
            "client-id": client_id,
            "protocol-minimum-version": min,
            "protocol-maximum-version": max,
        }));
        let reply = self.recv();
        assert_eq!(reply["msg-type"], "complete", "hello failed: {reply}");
    }

    fn publish(&mut self, ta_id: u64, service_id: u64, generation: u64, props: Value, ttl: u64) -> Value {
        self.send(json!({
            "ta-cmd": "publish", "ta-id": ta_id, "msg-type": "request",
            "service-id": service_id, "generation": generation,
            "service-props": props, "ttl": ttl,
        }));
        self.recv()
    }

    fn subscribe(&mut self, ta_id: u64, sub_id: u64, filter: Option<&str>) -> Value {
        let mut msg = json!({
            "ta-cmd": "subscribe", "ta-id": ta_id, "msg-type": "request",
            "subscription-id": sub_id,
        });
        if let Some(filter) = filter {
            msg["filter"] = json!(filter);
        }
        self.send(msg);
        self.recv()
    }

    fn ping(&mut self, ta_id: u64) {
        self.send(json!({"ta-cmd": "ping", "ta-id": ta_id, "msg-type": "request"}));
        let reply = self.recv();
        assert_eq!(reply["ta-cmd"], "ping");
        assert_eq!(reply["msg-type"], "complete");
    }
}

#[test]
fn hello_negotiates_and_ping_completes() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();

    client.send(json!({
        "ta-cmd": "hello", "ta-id": 0, "msg-type": "request",
        "client-id": 1,
        "protocol-minimum-version": 2,
        "protocol-maximum-version": 7,
    }));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "complete");
    assert_eq!(reply["protocol-version"], 3);

    client.ping(1);
}

#[test]
fn requests_before_hello_fail() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();

    client.send(json!({"ta-cmd": "ping", "ta-id": 5, "msg-type": "request"}));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "no-hello");

    // The session is still usable; hello works afterwards.
    client.hello(1);
    client.ping(6);
}

#[test]
fn unsupported_version_range_fails() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();

    client.send(json!({
        "ta-cmd": "hello", "ta-id": 0, "msg-type": "request",
        "client-id": 1,
        "protocol-minimum-version": 8,
        "protocol-maximum-version": 9,
    }));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "unsupported-protocol-version");
}

#[test]
fn duplicate_client_id_is_rejected() {
    let domain = TestDomain::immediate();
    let mut first = domain.connect();
    first.hello(42);

    let mut second = domain.connect();
    second.send(json!({
        "ta-cmd": "hello", "ta-id": 0, "msg-type": "request",
        "client-id": 42,
        "protocol-minimum-version": 2,
        "protocol-maximum-version": 3,
    }));
    let reply = second.recv();
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "client-id-exists");
}

#[test]
fn repeated_identical_hello_is_accepted() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();
    client.hello(1);

    // Identical repeat: completes again with the same version.
    client.send(json!({
        "ta-cmd": "hello", "ta-id": 1, "msg-type": "request",
        "client-id": 1,
        "protocol-minimum-version": 2,
        "protocol-maximum-version": 3,
    }));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "complete");
    assert_eq!(reply["protocol-version"], 3);

    // A different triple is denied.
    client.send(json!({
        "ta-cmd": "hello", "ta-id": 2, "msg-type": "request",
        "client-id": 2,
        "protocol-minimum-version": 2,
        "protocol-maximum-version": 3,
    }));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "permission-denied");
}

#[test]
fn subscription_matching_and_backlog() {
    let domain = TestDomain::immediate();
    let mut producer = domain.connect();
    producer.hello(1);

    let reply = producer.publish(1, 10, 0, json!({"name": ["foo"], "ver": [10]}), 30);
    assert_eq!(reply["msg-type"], "complete");
    let reply = producer.publish(2, 20, 0, json!({"name": ["foo"], "ver": [20]}), 30);
    assert_eq!(reply["msg-type"], "complete");

    let mut consumer = domain.connect();
    consumer.hello(2);

    // Initial backlog honours the filter: exactly one of the two
    // services has ver > 15.
    let reply = consumer.subscribe(1, 100, Some("(&(name=foo)(ver>15))"));
    assert_eq!(reply["msg-type"], "accept");
    let notify = consumer.recv();
    assert_eq!(notify["msg-type"], "notify");
    assert_eq!(notify["match-type"], "appeared");
    assert_eq!(notify["service-id"], 20);
    assert_eq!(notify["generation"], 0);

    // A live publish that matches triggers appeared; one that does not
    // stays silent.
    let reply = producer.publish(3, 30, 0, json!({"name": ["foo"], "ver": [25]}), 30);
    assert_eq!(reply["msg-type"], "complete");
    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "appeared");
    assert_eq!(notify["service-id"], 30);

    let reply = producer.publish(4, 40, 0, json!({"name": ["foo"], "ver": [5]}), 30);
    assert_eq!(reply["msg-type"], "complete");
    consumer.ping(2);
}

#[test]
fn generation_discipline() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();
    client.hello(1);

    let reply = client.publish(1, 1, 5, json!({"v": [1]}), 60);
    assert_eq!(reply["msg-type"], "complete");

    let reply = client.publish(2, 1, 5, json!({"v": [2]}), 60);
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "same-generation-but-different");

    let reply = client.publish(3, 1, 4, json!({"v": [2]}), 60);
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "old-generation");

    let reply = client.publish(4, 1, 6, json!({"v": [2]}), 60);
    assert_eq!(reply["msg-type"], "complete");
}

#[test]
fn orphan_and_reclaim() {
    let domain = TestDomain::immediate();
    let mut producer = domain.connect();
    producer.hello(1);
    let reply = producer.publish(1, 4711, 0, json!({"name": ["foo"]}), 30);
    assert_eq!(reply["msg-type"], "complete");

    let mut consumer = domain.connect();
    consumer.hello(2);
    let reply = consumer.subscribe(1, 100, Some("(name=foo)"));
    assert_eq!(reply["msg-type"], "accept");
    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "appeared");
    assert_eq!(notify["service-id"], 4711);
    assert!(notify.get("orphan-since").is_none());

    // Producer vanishes; the service becomes an orphan.
    drop(producer);
    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "modified");
    assert_eq!(notify["service-id"], 4711);
    assert!(notify.get("orphan-since").is_some());

    // Producer returns within the TTL and republishes the identical
    // record: the orphan mark clears, nothing disappears.
    let mut producer = domain.connect();
    producer.hello(1);
    let reply = producer.publish(1, 4711, 0, json!({"name": ["foo"]}), 30);
    assert_eq!(reply["msg-type"], "complete");

    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "modified");
    assert_eq!(notify["service-id"], 4711);
    assert!(notify.get("orphan-since").is_none());
}

#[test]
fn orphan_ttl_expiry_disappears() {
    let domain = TestDomain::immediate();
    let mut producer = domain.connect();
    producer.hello(1);
    let reply = producer.publish(1, 4711, 0, json!({"name": ["foo"]}), 1);
    assert_eq!(reply["msg-type"], "complete");

    let mut consumer = domain.connect();
    consumer.hello(2);
    let reply = consumer.subscribe(1, 100, Some("(name=foo)"));
    assert_eq!(reply["msg-type"], "accept");
    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "appeared");

    drop(producer);
    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "modified");
    assert!(notify.get("orphan-since").is_some());

    // No reclaim: after the one-second TTL the service is reaped.
    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "disappeared");
    assert_eq!(notify["service-id"], 4711);
    assert!(notify.get("service-props").is_none());
}

#[test]
fn per_user_service_cap() {
    let domain = TestDomain::start(
        "    notification_delay_ms: 0\n",
        "resources:\n  user:\n    services: 2\n",
    );
    let mut client = domain.connect();
    client.hello(1);

    assert_eq!(client.publish(1, 1, 0, json!({"n": ["a"]}), 30)["msg-type"], "complete");
    assert_eq!(client.publish(2, 2, 0, json!({"n": ["b"]}), 30)["msg-type"], "complete");
    let reply = client.publish(3, 3, 0, json!({"n": ["c"]}), 30);
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "insufficient-resources");

    // The failed publish left nothing behind.
    client.send(json!({"ta-cmd": "services", "ta-id": 4, "msg-type": "request"}));
    assert_eq!(client.recv()["msg-type"], "accept");
    let mut count = 0;
    loop {
        let msg = client.recv();
        if msg["msg-type"] == "complete" {
            break;
        }
        assert_eq!(msg["msg-type"], "notify");
        count += 1;
    }
    assert_eq!(count, 2);
}

#[test]
fn services_listing_is_a_filtered_snapshot() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();
    client.hello(1);
    client.publish(1, 1, 7, json!({"name": ["foo"]}), 30);
    client.publish(2, 2, 0, json!({"name": ["bar"]}), 30);

    client.send(json!({
        "ta-cmd": "services", "ta-id": 3, "msg-type": "request",
        "filter": "(name=foo)",
    }));
    assert_eq!(client.recv()["msg-type"], "accept");
    let notify = client.recv();
    assert_eq!(notify["msg-type"], "notify");
    assert_eq!(notify["service-id"], 1);
    assert_eq!(notify["generation"], 7);
    assert_eq!(notify["client-id"], 1);
    assert_eq!(client.recv()["msg-type"], "complete");

    // Malformed filters fail the transaction, not the connection.
    client.send(json!({
        "ta-cmd": "services", "ta-id": 4, "msg-type": "request",
        "filter": "(name=",
    }));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "invalid-filter-syntax");
    client.ping(5);
}

#[test]
fn unsubscribe_completes_the_subscription_transaction() {
    let domain = TestDomain::immediate();
    let mut producer = domain.connect();
    producer.hello(1);

    let mut consumer = domain.connect();
    consumer.hello(2);
    let reply = consumer.subscribe(1, 100, Some("(name=foo)"));
    assert_eq!(reply["msg-type"], "accept");

    consumer.send(json!({
        "ta-cmd": "unsubscribe", "ta-id": 2, "msg-type": "request",
        "subscription-id": 100,
    }));
    // The subscribe transaction is driven to complete before the
    // unsubscribe concludes.
    let first = consumer.recv();
    assert_eq!(first["ta-id"], 1);
    assert_eq!(first["ta-cmd"], "subscribe");
    assert_eq!(first["msg-type"], "complete");
    let second = consumer.recv();
    assert_eq!(second["ta-id"], 2);
    assert_eq!(second["msg-type"], "complete");

    // No notify leaks after the terminal message: a matching publish
    // now produces nothing for the consumer.
    assert_eq!(producer.publish(1, 9, 0, json!({"name": ["foo"]}), 30)["msg-type"], "complete");
    consumer.ping(3);

    // Unknown subscription id afterwards.
    consumer.send(json!({
        "ta-cmd": "unsubscribe", "ta-id": 4, "msg-type": "request",
        "subscription-id": 100,
    }));
    let reply = consumer.recv();
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "non-existent-subscription-id");
}

#[test]
fn subscriptions_and_clients_listings() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();
    client.hello(7);
    let reply = client.subscribe(1, 100, Some("(name=foo)"));
    assert_eq!(reply["msg-type"], "accept");

    client.send(json!({"ta-cmd": "subscriptions", "ta-id": 2, "msg-type": "request"}));
    assert_eq!(client.recv()["msg-type"], "accept");
    let notify = client.recv();
    assert_eq!(notify["subscription-id"], 100);
    assert_eq!(notify["client-id"], 7);
    assert_eq!(notify["filter"], "(name=foo)");
    assert_eq!(client.recv()["msg-type"], "complete");

    client.send(json!({"ta-cmd": "clients", "ta-id": 3, "msg-type": "request"}));
    assert_eq!(client.recv()["msg-type"], "accept");
    let notify = client.recv();
    assert_eq!(notify["client-id"], 7);
    assert_eq!(notify["protocol-version"], 3);
    assert!(notify.get("client-address").is_some());
    assert!(notify.get("time").is_some());
    assert!(notify.get("idle").is_some());
    assert_eq!(client.recv()["msg-type"], "complete");
}

#[test]
fn v2_session_sees_no_v3_commands_or_fields() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();
    client.hello_versions(1, 2, 2);

    client.send(json!({"ta-cmd": "clients", "ta-id": 1, "msg-type": "request"}));
    assert_eq!(client.recv()["msg-type"], "accept");
    let notify = client.recv();
    assert_eq!(notify["client-id"], 1);
    assert!(notify.get("idle").is_none());
    assert!(notify.get("protocol-version").is_none());
    assert_eq!(client.recv()["msg-type"], "complete");

    // track does not exist at v2; unknown commands are fatal.
    client.send(json!({"ta-cmd": "track", "ta-id": 2, "msg-type": "request"}));
    assert!(client.try_recv().is_none());
}

#[test]
fn track_round_trip() {
    let domain = TestDomain::start("    notification_delay_ms: 0\n    idle: {min: 1, max: 1}\n", "");
    let mut client = domain.connect();
    client.hello(1);

    client.send(json!({"ta-cmd": "track", "ta-id": 9, "msg-type": "request"}));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "accept");

    // A second tracker is refused.
    client.send(json!({"ta-cmd": "track", "ta-id": 10, "msg-type": "request"}));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "fail");
    assert_eq!(reply["fail-reason"], "track-exists");

    // Client-originated probe: the server answers immediately.
    client.send(json!({
        "ta-cmd": "track", "ta-id": 9, "msg-type": "inform", "track-type": "query",
    }));
    let reply = client.recv();
    assert_eq!(reply["msg-type"], "notify");
    assert_eq!(reply["track-type"], "reply");

    // Going idle draws a server-originated query; answering it keeps
    // the connection alive.
    let query = client.recv();
    assert_eq!(query["msg-type"], "notify");
    assert_eq!(query["track-type"], "query");
    client.send(json!({
        "ta-cmd": "track", "ta-id": 9, "msg-type": "inform", "track-type": "reply",
    }));
    client.ping(11);
}

#[test]
fn idle_v3_session_without_track_is_closed() {
    let domain = TestDomain::start("    notification_delay_ms: 0\n    idle: {min: 1, max: 1}\n", "");
    let mut client = domain.connect();
    client.hello(1);
    // Roughly one second of silence, a sweep, and the server gives up
    // on the connection.
    assert!(client.try_recv().is_none());
}

#[test]
fn unknown_fields_are_fatal() {
    let domain = TestDomain::immediate();
    let mut client = domain.connect();
    client.hello(1);
    client.send(json!({
        "ta-cmd": "ping", "ta-id": 1, "msg-type": "request", "bogus": true,
    }));
    assert!(client.try_recv().is_none());
}

#[test]
fn notification_coalescing_collapses_churn() {
    // A 500 ms window: modify twice quickly, observe one notification
    // carrying the final state.
    let domain = TestDomain::start("    notification_delay_ms: 500\n", "");
    let mut producer = domain.connect();
    producer.hello(1);
    assert_eq!(producer.publish(1, 5, 0, json!({"name": ["foo"], "v": [1]}), 30)["msg-type"], "complete");

    let mut consumer = domain.connect();
    consumer.hello(2);
    let reply = consumer.subscribe(1, 100, Some("(name=foo)"));
    assert_eq!(reply["msg-type"], "accept");
    // The initial backlog is not delayed.
    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "appeared");

    assert_eq!(producer.publish(2, 5, 1, json!({"name": ["foo"], "v": [2]}), 30)["msg-type"], "complete");
    assert_eq!(producer.publish(3, 5, 2, json!({"name": ["foo"], "v": [3]}), 30)["msg-type"], "complete");

    let notify = consumer.recv();
    assert_eq!(notify["match-type"], "modified");
    assert_eq!(notify["generation"], 2);
    assert_eq!(notify["service-props"]["v"][0], 3);

    // Nothing else follows.
    consumer.ping(2);
}

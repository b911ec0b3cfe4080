//! Mounts, virtual hosts and handler outcomes, driven through the server.

use std::net::SocketAddr;

use http::StatusCode;
use wicket::{Fault, HostDescriptor, HostPattern, MountOptions, Request, Signal, VirtualHost};

mod common;

use common::{exchange, exchange_on, recording_server, single, test_config};

const GET_ROOT: &[u8] = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";

fn get(path: &str, host: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").into_bytes()
}

fn label(text: &'static str) -> impl Fn(Request) -> std::future::Ready<&'static str> + Send + Sync + 'static {
    move |_req| std::future::ready(text)
}

#[tokio::test]
async fn deeper_mount_is_never_shadowed_by_a_string_prefix() {
    let (server, _log) = recording_server(test_config());
    server.mount("/foo", label("foo"));
    server.mount("/foo-bar", label("foo-bar"));

    assert_eq!(single(&exchange(&server, &get("/foo-bar/x", "localhost")).await).body, "foo-bar");
    assert_eq!(single(&exchange(&server, &get("/foo/x", "localhost")).await).body, "foo");
    assert_eq!(single(&exchange(&server, &get("/foox", "localhost")).await).status, 404);
}

#[tokio::test]
async fn unmount_behaves_as_if_never_registered() {
    let (server, _log) = recording_server(test_config());
    server.mount("/", label("root"));
    server.mount("/api", label("api"));

    assert_eq!(single(&exchange(&server, &get("/api/v1", "localhost")).await).body, "api");

    assert!(server.unmount("/api/"));
    assert!(!server.unmount("/api"));
    assert_eq!(single(&exchange(&server, &get("/api/v1", "localhost")).await).body, "root");
}

#[tokio::test]
async fn remounting_replaces_the_handler_and_options() {
    let (server, _log) = recording_server(test_config());
    let show = |req: Request| async move { req.options::<u32>().map(|n| n.to_string()).unwrap_or_default() };
    server.mount_with("/n", show, MountOptions::new(1u32));
    server.mount_with("/n/", show, MountOptions::new(2u32));

    assert_eq!(single(&exchange(&server, &get("/n", "localhost")).await).body, "2");
}

#[tokio::test]
async fn fully_specified_virtual_host_wins_over_partial() {
    let (server, _log) = recording_server(test_config());
    server.mount("/", label("primary"));

    let by_name = server.add_virtual_host(VirtualHost::new(HostDescriptor::named("site.test")));
    by_name.mount("/", label("name only"));
    let full = server.add_virtual_host(VirtualHost::new(
        HostDescriptor::named("site.test")
            .bind_address("127.0.0.1".parse().unwrap())
            .port(8080),
    ));
    full.mount("/", label("full"));

    assert_eq!(single(&exchange(&server, &get("/", "site.test")).await).body, "full");

    let other_port: SocketAddr = "127.0.0.1:9090".parse().unwrap();
    assert_eq!(single(&exchange_on(&server, &get("/", "site.test"), other_port).await).body, "name only");

    assert_eq!(single(&exchange(&server, &get("/", "elsewhere.test")).await).body, "primary");
}

#[tokio::test]
async fn aliases_route_to_their_host() {
    let (server, _log) = recording_server(test_config());
    server.mount("/", label("primary"));
    let cdn = server.add_virtual_host(VirtualHost::new(
        HostDescriptor::named("cdn.test").alias(HostPattern::parse("*.cdn.test").unwrap()),
    ));
    cdn.mount("/", label("cdn"));

    assert_eq!(single(&exchange(&server, &get("/", "img.cdn.test")).await).body, "cdn");
    assert_eq!(single(&exchange(&server, &get("/", "CDN.TEST:8080")).await).body, "cdn");
}

#[tokio::test]
async fn virtual_host_without_a_matching_mount_is_not_found() {
    let (server, _log) = recording_server(test_config());
    server.mount("/", label("primary"));
    server.add_virtual_host(VirtualHost::new(HostDescriptor::named("empty.test")));

    assert_eq!(single(&exchange(&server, &get("/", "empty.test")).await).status, 404);
}

#[tokio::test]
async fn options_asterisk_lists_methods() {
    let (server, log) = recording_server(test_config());

    let reply = single(&exchange(&server, b"OPTIONS * HTTP/1.1\r\nConnection: close\r\n\r\n").await);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("allow"), Some("GET,HEAD,POST,OPTIONS"));
    assert_eq!(log.entries().len(), 1);
}

#[tokio::test]
async fn redirect_signal_sets_location() {
    let (server, log) = recording_server(test_config());
    server.mount("/old", |_req: Request| async { Signal::redirect(StatusCode::FOUND, "/new") });

    let reply = single(&exchange(&server, &get("/old", "localhost")).await);
    assert_eq!(reply.status, 302);
    assert_eq!(reply.header("location"), Some("/new"));
    assert_eq!(log.entries()[0].status, StatusCode::FOUND);
}

#[tokio::test]
async fn faults_and_panics_become_generic_500s() {
    let (server, log) = recording_server(test_config());
    server.mount("/fault", |_req: Request| async {
        Err::<&'static str, _>(Fault::new("connection string leaked"))
    });
    server.mount("/panic", |_req: Request| async {
        if true {
            panic!("handler exploded");
        }
        "unreachable"
    });

    let reply = single(&exchange(&server, &get("/fault", "localhost")).await);
    assert_eq!(reply.status, 500);
    assert!(!reply.body.contains("leaked"));

    let reply = single(&exchange(&server, GET_ROOT).await);
    assert_eq!(reply.status, 404);

    let reply = single(&exchange(&server, &get("/panic", "localhost")).await);
    assert_eq!(reply.status, 500);
    assert_eq!(reply.header("connection"), Some("close"));

    let statuses: Vec<u16> = log.entries().iter().map(|e| e.status.as_u16()).collect();
    assert_eq!(statuses, [500, 404, 500]);
}

#[tokio::test]
async fn request_hook_sees_every_request_and_can_answer_it() {
    let (server, log) = recording_server(test_config());
    server.mount("/", label("routed"));
    server.on_request(|req: &mut Request| {
        if req.header("x-blocked").is_some() {
            return Err(Signal::new(StatusCode::FORBIDDEN).with_message("blocked."));
        }
        Ok(())
    });

    assert_eq!(single(&exchange(&server, &get("/", "localhost")).await).body, "routed");

    let raw = b"GET / HTTP/1.1\r\nX-Blocked: 1\r\nConnection: close\r\n\r\n";
    let reply = single(&exchange(&server, raw).await);
    assert_eq!(reply.status, 403);
    assert!(reply.body.contains("blocked."));

    let statuses: Vec<u16> = log.entries().iter().map(|e| e.status.as_u16()).collect();
    assert_eq!(statuses, [200, 403]);
}

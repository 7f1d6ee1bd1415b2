use std::io::BufRead;

use hearth::http::parser::Parser;
use hearth::http::request::{Assembler, Limits, Method, RequestQueue, Version};
use hearth::http::response::StatusCode;

fn limits() -> Limits {
    Limits {
        max_content_length: 1024,
        spool_threshold: 64,
        keepalive: true,
    }
}

/// Parses `raw` into a request queue, recording a parse failure the way a
/// connection does.
fn assemble_with(raw: &[u8], limits: &Limits) -> RequestQueue {
    let mut queue = RequestQueue::new();
    let mut parser = Parser::new();
    let result = parser.execute(raw, &mut Assembler::new(&mut queue, limits));
    if let Err(e) = result {
        queue.record_error(e.status());
    }
    queue
}

fn assemble(raw: &[u8]) -> RequestQueue {
    assemble_with(raw, &limits())
}

#[test]
fn test_request_fields() {
    let mut queue = assemble(b"GET /a%2Fb/c?q=rust&x=1 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n");
    let req = queue.pop_front().unwrap();
    assert_eq!(req.method, Method::GET);
    assert_eq!(req.target, "/a%2Fb/c?q=rust&x=1");
    assert_eq!(req.path, "/a/b/c");
    assert_eq!(req.query, "q=rust&x=1");
    assert_eq!(req.version, Version::Http11);
    assert_eq!(req.header("host"), Some("example.com"));
    assert_eq!(req.header("USER-AGENT"), Some("test"));
    assert_eq!(req.header("missing"), None);
    assert!(req.complete);
    assert!(req.body.is_none());
}

#[test]
fn test_keep_alive_rules() {
    let cases: [(&[u8], bool); 4] = [
        (b"GET / HTTP/1.1\r\n\r\n", true),
        (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false),
        (b"GET / HTTP/1.0\r\n\r\n", false),
        (b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", true),
    ];
    for (raw, expected) in cases {
        let queue = assemble(raw);
        assert_eq!(queue.front().unwrap().keep_alive, expected, "{}", String::from_utf8_lossy(raw));
    }

    let mut off = limits();
    off.keepalive = false;
    let queue = assemble_with(b"GET / HTTP/1.1\r\n\r\n", &off);
    assert!(!queue.front().unwrap().keep_alive);
}

#[test]
fn test_missing_length_on_post_is_411() {
    let queue = assemble(b"POST / HTTP/1.1\r\nHost: a\r\n\r\n");
    assert_eq!(queue.front().unwrap().bad_request, Some(StatusCode::LengthRequired));

    // GET without a body is fine
    let queue = assemble(b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(queue.front().unwrap().bad_request, None);
}

#[test]
fn test_declared_length_over_limit_is_413() {
    let queue = assemble(b"PUT / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");
    assert_eq!(queue.front().unwrap().bad_request, Some(StatusCode::PayloadTooLarge));
}

#[test]
fn test_chunked_body_over_limit_is_413() {
    let mut small = limits();
    small.max_content_length = 4;
    let queue = assemble_with(
        b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n",
        &small,
    );
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.front().unwrap().bad_request, Some(StatusCode::PayloadTooLarge));
}

#[test]
fn test_expect_handling() {
    let queue = assemble(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n");
    let req = queue.front().unwrap();
    assert!(req.expect_continue);
    assert!(!req.complete);

    let queue = assemble(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\nabc");
    assert!(!queue.front().unwrap().expect_continue);

    let queue = assemble(b"GET / HTTP/1.1\r\nExpect: something-else\r\n\r\n");
    assert_eq!(queue.front().unwrap().bad_request, Some(StatusCode::ExpectationFailed));
}

#[test]
fn test_websocket_upgrade_needs_key_and_version() {
    let good = assemble(
        b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    );
    let req = good.front().unwrap();
    assert!(req.upgrade);
    assert!(!req.keep_alive);
    assert_eq!(req.bad_request, None);

    let bad = assemble(
        b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 8\r\n\r\n",
    );
    assert_eq!(bad.front().unwrap().bad_request, Some(StatusCode::BadRequest));
}

#[test]
fn test_large_body_is_spooled() {
    let mut raw = b"POST / HTTP/1.1\r\nContent-Length: 200\r\n\r\n".to_vec();
    raw.extend(std::iter::repeat_n(b'z', 100));
    raw.extend(b"\nsecond line\n");
    raw.extend(std::iter::repeat_n(b'y', 200 - 100 - 13));

    let mut queue = assemble(&raw);
    let req = queue.pop_front().unwrap();
    assert!(req.complete);
    let body = req.body.unwrap();
    assert!(body.is_spooled());
    assert_eq!(body.len(), 200);

    let mut input = body.into_input().unwrap();
    let mut line = String::new();
    input.read_line(&mut line).unwrap();
    assert_eq!(line.len(), 101);
    line.clear();
    input.read_line(&mut line).unwrap();
    assert_eq!(line, "second line\n");
}

#[test]
fn test_error_attaches_to_third_request() {
    let queue = assemble(
        b"GET /1 HTTP/1.1\r\n\r\n\
          GET /2 HTTP/1.1\r\n\r\n\
          GET /3 HTTP/1.1\r\nContent-Length: nope\r\n\r\n",
    );
    let statuses: Vec<_> = queue.iter().map(|r| r.bad_request).collect();
    assert_eq!(statuses, vec![None, None, Some(StatusCode::BadRequest)]);
}

#[test]
fn test_error_between_messages_gets_its_own_entry() {
    let mut queue = assemble(b"GET /1 HTTP/1.1\r\n\r\n");
    queue.record_error(StatusCode::RequestTimeout);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.pop_front().unwrap().bad_request, None);
    assert_eq!(queue.pop_front().unwrap().bad_request, Some(StatusCode::RequestTimeout));
}

#[test]
fn test_oversized_uri_is_400() {
    let mut raw = b"GET /".to_vec();
    raw.extend(std::iter::repeat_n(b'a', 9 * 1024));
    raw.extend(b" HTTP/1.1\r\n\r\n");
    let queue = assemble(&raw);
    assert_eq!(queue.front().unwrap().bad_request, Some(StatusCode::BadRequest));
}

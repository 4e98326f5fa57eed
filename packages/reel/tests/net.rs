#![cfg(feature = "net")]

use std::io::{BufRead as _, BufReader, Write as _};
use std::net::TcpListener;
use std::thread::JoinHandle;

use pistonite_reel as reel;
use reel::{Config, Routine, Step};

mod common;
use common::*;

/// Serve one HTTP response on a local port, returns the url
fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/page", listener.local_addr().unwrap());
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                break;
            }
        }
        let mut stream = stream;
        write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
        .unwrap();
        stream.flush().unwrap();
    });
    (url, handle)
}

/// Requests the url, then returns what the request resumed with
fn fetch(url: String, partial: bool) -> impl Routine {
    let mut url = Some(url);
    reel::routine_fn("fetch", move |_, input| match url.take() {
        Some(url) => reel::network_request(url, partial).into(),
        None => match input.into_value() {
            Ok(v) => Step::Return(v),
            Err(e) => Step::Raise(e),
        },
    })
}

#[test]
fn test_partial_body_in_chunks() {
    let d = driver_with(Config {
        chunk_size: 4,
        ..Default::default()
    });
    let (url, server) = serve_once("200 OK", "hello network");
    let out = render(d.stream(fetch(url, true)));
    // chunks, then the byte count
    assert_eq!(out, ["hell", "o ne", "twor", "k", "13"]);
    server.join().unwrap();
    d.shutdown();
}

#[test]
fn test_full_body_in_one_chunk() {
    let d = driver();
    let (url, server) = serve_once("200 OK", "<p>hi</p>");
    let out = render(d.stream(fetch(url, false)));
    // the body is emitted, then returned as the trailer
    assert_eq!(out, ["<p>hi</p>", "<p>hi</p>"]);
    server.join().unwrap();
    d.shutdown();
}

#[test]
fn test_error_status_raises() {
    let d = driver();
    let (url, server) = serve_once("404 Not Found", "missing");
    let out = render(d.stream(fetch(url, true)));
    assert_eq!(out.len(), 1, "{out:?}");
    assert!(out[0].starts_with("!request to"), "{}", out[0]);
    let e = d.spawn(fetch("http://127.0.0.1:1/".to_string(), false)).wait_blocking();
    assert!(e.is_err());
    server.join().unwrap();
    d.shutdown();
}

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// Spawn a one-shot HTTP mock server that accepts a single request, captures it,
/// and responds with the given status line and body. Returns the base URL and a
/// receiver that yields the captured request.
pub fn spawn_one_shot_server(
    status_line: &str,
    response_body: &[u8],
) -> (String, mpsc::Receiver<CapturedRequest>) {
    spawn_streaming_server(
        status_line,
        vec![response_body.to_vec()],
        Duration::ZERO,
        true,
    )
}

/// Like [`spawn_one_shot_server`], but writes the body as separate chunks with
/// `delay` between them so a client sees several reads. When `send_length` is
/// false the body is close-delimited and carries no `content-length` header.
pub fn spawn_streaming_server(
    status_line: &str,
    chunks: Vec<Vec<u8>>,
    delay: Duration,
    send_length: bool,
) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("read mock server addr");
    let (tx, rx) = mpsc::channel();
    let status_line = status_line.to_string();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept mock request");
        stream.set_nodelay(true).ok();
        let req = read_http_request(&mut stream);
        tx.send(req).expect("send captured request");

        let total: usize = chunks.iter().map(Vec::len).sum();
        let mut head = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/octet-stream\r\nconnection: close\r\n"
        );
        if send_length {
            head.push_str(&format!("content-length: {total}\r\n"));
        }
        head.push_str("\r\n");
        if stream.write_all(head.as_bytes()).is_err() {
            return;
        }

        for (idx, chunk) in chunks.iter().enumerate() {
            if idx > 0 && !delay.is_zero() {
                thread::sleep(delay);
            }
            // The client may hang up early (cancelled download).
            if stream.write_all(chunk).is_err() || stream.flush().is_err() {
                return;
            }
        }
    });

    (format!("http://{addr}"), rx)
}

/// Write an executable shell script named `name` into `dir`.
///
/// Used to stand in for external tools (`multipass`, `ssh-keygen`, `open`)
/// so process-driven code paths can be exercised without the real binaries.
#[cfg(unix)]
pub fn write_fake_executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write fake executable");
    let mut perms = std::fs::metadata(&path)
        .expect("stat fake executable")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod fake executable");
    path
}

fn read_http_request(stream: &mut std::net::TcpStream) -> CapturedRequest {
    let mut buf = Vec::new();
    let mut header_end = None;

    while header_end.is_none() {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).expect("read request bytes");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        header_end = buf
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|idx| idx + 4);
    }

    let end = header_end.expect("request headers must be present");
    let headers_raw = String::from_utf8_lossy(&buf[..end]);
    let mut lines = headers_raw.lines();
    let request_line = lines.next().expect("request line");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().expect("method").to_string();
    let path = parts.next().expect("path").to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    CapturedRequest {
        method,
        path,
        headers,
    }
}

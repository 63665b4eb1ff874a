//! End-to-end smoke tests: spawn the compiled binary against isolated ports
//! and directories, and exercise it over raw TCP the same way the plaintext
//! edge listener and the registry server parse requests internally.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct TestServer {
    process: Child,
    work_dir: PathBuf,
}

impl TestServer {
    fn spawn(http_addr: &str, https_addr: &str, registry_addr: &str) -> Self {
        let mut work_dir = std::env::temp_dir();
        work_dir.push(format!("pingclair-it-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&work_dir).unwrap();

        let bin_path = env!("CARGO_BIN_EXE_pingclair");
        let database_path = work_dir.join("pingclair.db");
        let cert_dir = work_dir.join("certs");
        let registry_dir = work_dir.join("registry");

        let process = Command::new(bin_path)
            .env("PINGCLAIR_HTTP_ADDR", http_addr)
            .env("PINGCLAIR_HTTPS_ADDR", https_addr)
            .env("PINGCLAIR_REGISTRY_ADDR", registry_addr)
            .env("PINGCLAIR_DATABASE_PATH", database_path.to_str().unwrap())
            .env("PINGCLAIR_CERT_DIR", cert_dir.to_str().unwrap())
            .env("PINGCLAIR_REGISTRY_DIR", registry_dir.to_str().unwrap())
            .env("PINGCLAIR_ADMIN_DOMAIN", "admin.localhost")
            .env("RUST_LOG", "warn")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("failed to start pingclair");

        Self { process, work_dir }
    }

    fn dump_output(&mut self) {
        if let Some(mut stderr) = self.process.stderr.take() {
            let mut s = String::new();
            let _ = stderr.read_to_string(&mut s);
            eprintln!("STDERR:\n{s}");
        }
        if let Some(mut stdout) = self.process.stdout.take() {
            let mut s = String::new();
            let _ = stdout.read_to_string(&mut s);
            eprintln!("STDOUT:\n{s}");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = std::fs::remove_dir_all(&self.work_dir);
    }
}

async fn wait_for_port(addr: &str, server: &mut TestServer) -> bool {
    for _ in 0..50 {
        if let Ok(Some(status)) = server.process.try_wait() {
            eprintln!("process exited early with {status}");
            server.dump_output();
            return false;
        }
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    eprintln!("timed out waiting for {addr}");
    server.dump_output();
    false
}

async fn raw_http_get(addr: &str, path: &str, host: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn registry_base_endpoint_announces_distribution_api() {
    let registry_addr = "127.0.0.1:19080";
    let mut server = TestServer::spawn("127.0.0.1:19081", "127.0.0.1:19082", registry_addr);

    assert!(wait_for_port(registry_addr, &mut server).await, "registry listener never came up");

    let response = raw_http_get(registry_addr, "/v2/", "admin.localhost").await;
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected status line: {response}");
    assert!(
        response.to_lowercase().contains("docker-distribution-api-version: registry/2.0"),
        "missing distribution API version header: {response}"
    );
}

#[tokio::test]
async fn edge_http_redirects_unknown_paths_to_https() {
    let http_addr = "127.0.0.1:19083";
    let mut server = TestServer::spawn(http_addr, "127.0.0.1:19084", "127.0.0.1:19085");

    assert!(wait_for_port(http_addr, &mut server).await, "edge http listener never came up");

    let response = raw_http_get(http_addr, "/some/path", "example.localhost").await;
    assert!(response.starts_with("HTTP/1.1 301"), "unexpected status line: {response}");
    assert!(
        response.contains("Location: https://example.localhost/some/path"),
        "missing redirect location: {response}"
    );
}

#[tokio::test]
async fn edge_http_acme_challenge_miss_returns_404() {
    let http_addr = "127.0.0.1:19086";
    let mut server = TestServer::spawn(http_addr, "127.0.0.1:19087", "127.0.0.1:19088");

    assert!(wait_for_port(http_addr, &mut server).await, "edge http listener never came up");

    let response = raw_http_get(http_addr, "/.well-known/acme-challenge/unknown-token", "example.localhost").await;
    assert!(response.starts_with("HTTP/1.1 404"), "unexpected status line: {response}");
}

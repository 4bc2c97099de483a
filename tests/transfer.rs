// End-to-end loopback transfers: a real server on an ephemeral port over a
// scratch directory, driven by the real client.

use rtftp::options::ReqOptions;
use rtftp::tftp::ErrorCode;
use rtftp::{Client, ClientConfig, ClientError, FsHandler, Server, ServerConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tempdir::TempDir;
use tokio::task::JoinHandle;

fn test_server_config() -> ServerConfig {
    ServerConfig {
        read_timeout: Duration::from_millis(100),
        ..ServerConfig::default()
    }
}

fn test_client_config(options: ReqOptions) -> ClientConfig {
    ClientConfig {
        timeout: Duration::from_secs(1),
        retries: 3,
        options,
    }
}

async fn start_server(root: &TempDir) -> (Arc<Server>, SocketAddr, JoinHandle<()>) {
    let handler = Arc::new(FsHandler::new(root.path()));
    let server = Arc::new(
        Server::new((Ipv4Addr::LOCALHOST, 0).into(), handler, test_server_config()).unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let runner = {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.run().await;
        })
    };
    (server, addr, runner)
}

async fn seed_file(root: &TempDir, name: &str, contents: &[u8]) {
    tokio::fs::write(root.path().join(name), contents)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_small_file() {
    let root = TempDir::new("tftp").unwrap();
    seed_file(&root, "hello.txt", b"HELLO").await;
    let (server, addr, runner) = start_server(&root).await;

    let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
    let mut sink = Vec::new();
    let n = client.get("hello.txt", &mut sink).await.unwrap();

    assert_eq!(n, 5);
    assert_eq!(sink, b"HELLO");

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_get_spanning_multiple_blocks() {
    let root = TempDir::new("tftp").unwrap();
    let contents: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    seed_file(&root, "blob.bin", &contents).await;
    let (server, addr, runner) = start_server(&root).await;

    let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
    let mut sink = Vec::new();
    let n = client.get("blob.bin", &mut sink).await.unwrap();

    assert_eq!(n, 1500);
    assert_eq!(sink, contents);

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_get_exact_block_multiple() {
    // 1024 bytes is exactly two default blocks; the transfer must end with
    // an empty DATA packet and still come across intact.
    let root = TempDir::new("tftp").unwrap();
    let contents = vec![b'A'; 1024];
    seed_file(&root, "even.bin", &contents).await;
    let (server, addr, runner) = start_server(&root).await;

    let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
    let mut sink = Vec::new();
    let n = client.get("even.bin", &mut sink).await.unwrap();

    assert_eq!(n, 1024);
    assert_eq!(sink, contents);

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_get_with_negotiated_blksize() {
    let root = TempDir::new("tftp").unwrap();
    let contents: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
    seed_file(&root, "big.bin", &contents).await;
    let (server, addr, runner) = start_server(&root).await;

    let options = ReqOptions {
        block_size: Some(1024),
        timeout: None,
        tsize: Some(0),
    };
    let mut client = Client::new(addr, test_client_config(options)).unwrap();
    let mut sink = Vec::new();
    let n = client.get("big.bin", &mut sink).await.unwrap();

    assert_eq!(n, 3000);
    assert_eq!(sink, contents);

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_get_missing_file() {
    let root = TempDir::new("tftp").unwrap();
    let (server, addr, runner) = start_server(&root).await;

    let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
    let mut sink = Vec::new();
    let err = client.get("missing.bin", &mut sink).await.err().unwrap();

    assert!(matches!(
        err,
        ClientError::Remote {
            code: ErrorCode::FileNotFound,
            ..
        }
    ));
    assert!(sink.is_empty());

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_put_small_file() {
    let root = TempDir::new("tftp").unwrap();
    let (server, addr, runner) = start_server(&root).await;

    let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
    let mut source = &b"uploaded contents"[..];
    let n = client.put("upload.txt", &mut source).await.unwrap();

    assert_eq!(n, 17);
    // Give the server's session a moment to flush and finish.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let written = tokio::fs::read(root.path().join("upload.txt")).await.unwrap();
    assert_eq!(written, b"uploaded contents");

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_put_exact_block_multiple() {
    let root = TempDir::new("tftp").unwrap();
    let (server, addr, runner) = start_server(&root).await;

    let contents = vec![b'z'; 1024];
    let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
    let mut source = &contents[..];
    let n = client.put("even.bin", &mut source).await.unwrap();

    assert_eq!(n, 1024);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let written = tokio::fs::read(root.path().join("even.bin")).await.unwrap();
    assert_eq!(written, contents);

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_put_with_options() {
    let root = TempDir::new("tftp").unwrap();
    let (server, addr, runner) = start_server(&root).await;

    let contents: Vec<u8> = (0..2500u32).map(|i| (i % 253) as u8).collect();
    let options = ReqOptions {
        block_size: Some(1024),
        timeout: None,
        tsize: Some(contents.len() as u64),
    };
    let mut client = Client::new(addr, test_client_config(options)).unwrap();
    let mut source = &contents[..];
    let n = client.put("opt.bin", &mut source).await.unwrap();

    assert_eq!(n, 2500);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let written = tokio::fs::read(root.path().join("opt.bin")).await.unwrap();
    assert_eq!(written, contents);

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_put_refuses_existing_file() {
    let root = TempDir::new("tftp").unwrap();
    seed_file(&root, "taken.bin", b"already here").await;
    let (server, addr, runner) = start_server(&root).await;

    let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
    let mut source = &b"new contents"[..];
    let err = client.put("taken.bin", &mut source).await.err().unwrap();

    assert!(matches!(
        err,
        ClientError::Remote {
            code: ErrorCode::FileAlreadyExists,
            ..
        }
    ));
    let untouched = tokio::fs::read(root.path().join("taken.bin")).await.unwrap();
    assert_eq!(untouched, b"already here");

    server.close();
    let _ = runner.await;
}

#[tokio::test]
async fn test_concurrent_transfers_are_independent() {
    let root = TempDir::new("tftp").unwrap();
    let a: Vec<u8> = vec![b'a'; 2000];
    let b: Vec<u8> = vec![b'b'; 1700];
    seed_file(&root, "a.bin", &a).await;
    seed_file(&root, "b.bin", &b).await;
    let (server, addr, runner) = start_server(&root).await;

    let get_a = async {
        let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
        let mut sink = Vec::new();
        client.get("a.bin", &mut sink).await.unwrap();
        sink
    };
    let get_b = async {
        let mut client = Client::new(addr, test_client_config(ReqOptions::none())).unwrap();
        let mut sink = Vec::new();
        client.get("b.bin", &mut sink).await.unwrap();
        sink
    };

    let (got_a, got_b) = tokio::join!(get_a, get_b);
    assert_eq!(got_a, a);
    assert_eq!(got_b, b);

    server.close();
    let _ = runner.await;
}

//! In-process line-protocol server used by the integration tests.
//!
//! Commands, one per line:
//!
//! - `*idn?` replies with [`IDN`]
//! - `sleep <secs>` replies `OK` after the delay
//! - `data? <n>` sends `n` lines (or `|n|` 12-byte blocks for negative `n`)
//!   and closes the connection
//! - `kill` closes the connection
//! - anything else replies with an error line

#![allow(dead_code)]

use std::time::Duration;

use sockio::TcpClientConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const IDN: &[u8] = b"ACME,Model-T,1234,v1.0\n";
pub const BLOCK_SIZE: usize = 12;

pub struct TestServer {
    pub port: u16,
    task: JoinHandle<()>,
}

impl TestServer {
    pub fn config(&self) -> TcpClientConfig {
        TcpClientConfig::new("127.0.0.1", self.port).connection_timeout(Duration::from_secs(2))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve(stream));
        }
    });

    TestServer { port, task }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn line(i: usize) -> Vec<u8> {
    format!("line {i:04}\n").into_bytes()
}

pub fn block(i: usize) -> Vec<u8> {
    format!("block-{i:05}\n").into_bytes()
}

async fn serve(stream: TcpStream) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut request = String::new();

    loop {
        request.clear();
        match reader.read_line(&mut request).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let mut words = request.split_whitespace();
        let reply = match (words.next(), words.next()) {
            (Some("*idn?"), None) => IDN.to_vec(),
            (Some("sleep"), Some(secs)) => {
                let secs: f64 = secs.parse().unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                b"OK\n".to_vec()
            }
            (Some("data?"), Some(n)) => {
                let n: i64 = n.parse().unwrap_or(0);
                let payload: Vec<u8> = if n >= 0 {
                    (0..n as usize).flat_map(line).collect()
                } else {
                    (0..n.unsigned_abs() as usize).flat_map(block).collect()
                };
                let _ = writer.write_all(&payload).await;
                return;
            }
            (Some("kill"), None) => return,
            _ => format!("ERR unknown command {:?}\n", request.trim()).into_bytes(),
        };

        if writer.write_all(&reply).await.is_err() {
            return;
        }
    }
}

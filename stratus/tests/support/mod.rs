//! Runs a complete relay on a loopback port, with a transport that records
//! what it is asked to deliver instead of calling the cloud service.

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use stratus::{Config, RelayError, RelayService};
use stratus_common::DeliveryRequest;
use stratus_delivery::{Transport, TransportError, TransportReceipt};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    task::JoinHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    Fail,
    Stall,
}

pub struct MockTransport {
    behaviour: Behaviour,
    requests: Mutex<Vec<DeliveryRequest>>,
}

impl MockTransport {
    pub const fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &DeliveryRequest,
        _timeout: Duration,
    ) -> Result<TransportReceipt, TransportError> {
        let id = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };

        match self.behaviour {
            Behaviour::Succeed => Ok(TransportReceipt {
                status: String::from("Succeeded"),
                id: Some(format!("operation-{id}")),
                error: None,
            }),
            Behaviour::Fail => Err(TransportError::Connection(String::from(
                "connection refused",
            ))),
            Behaviour::Stall => std::future::pending().await,
        }
    }
}

/// A relay on 127.0.0.1 with an ephemeral port, no retry back-off and an
/// immediate restart after a failure.
pub fn config() -> Config {
    let mut config = Config::default();
    config.relay.address = String::from("127.0.0.1");
    config.relay.port = 0;
    config.relay.from_address = String::from("relay@example.com");
    config.relay.allowed_dest_domains = vec![String::from("example.com")];
    config.relay.allowed_subnets = vec![String::from("127.0.0.0/8")];
    config.relay.delivery.retry.message_retry_delay = 0;
    config.server.restart_delay_secs = 0;
    config.server.watchdog_interval_secs = 1;
    config
}

pub struct Relay {
    pub service: Arc<RelayService>,
    pub transport: Arc<MockTransport>,
    task: JoinHandle<Result<(), RelayError>>,
}

impl Relay {
    pub async fn start(config: Config, behaviour: Behaviour) -> Self {
        let transport = Arc::new(MockTransport::new(behaviour));
        let service = Arc::new(
            RelayService::new(config, Arc::clone(&transport) as Arc<dyn Transport>).unwrap(),
        );

        let task = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.run().await }
        });

        let relay = Self {
            service,
            transport,
            task,
        };
        relay
            .wait_for("the SMTP engine to start", |relay| relay.service.is_healthy())
            .await;
        relay
    }

    pub fn address(&self) -> SocketAddr {
        self.service.local_addr().unwrap()
    }

    /// Poll `condition` until it holds, failing the test after five seconds.
    pub async fn wait_for(&self, what: &str, condition: impl Fn(&Self) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition(self) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    /// Wait for `run` to return without asking it to stop.
    pub async fn finished(self) -> Result<(), RelayError> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("relay did not stop")
            .unwrap()
    }

    pub async fn stop(self) -> Result<(), RelayError> {
        self.service.shutdown();
        self.finished().await
    }
}

pub struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    pub async fn connect(address: SocketAddr) -> Self {
        let mut client = Self {
            stream: BufReader::new(TcpStream::connect(address).await.unwrap()),
        };
        assert!(client.line().await.starts_with("220 "));
        assert!(client.send("HELO client.example.com").await.starts_with("250 "));
        client
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    pub async fn send(&mut self, line: &str) -> String {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.line().await
    }

    /// Send a message body after `DATA` was accepted, returning the final reply.
    pub async fn message(&mut self, content: &str) -> String {
        assert!(self.send("DATA").await.starts_with("354 "));
        self.stream
            .write_all(format!("{content}\r\n.\r\n").as_bytes())
            .await
            .unwrap();
        self.line().await
    }

    /// One complete transaction, returning the reply to the message content.
    pub async fn relay(&mut self, from: &str, to: &[&str], content: &str) -> String {
        assert!(self.send(&format!("MAIL FROM:<{from}>")).await.starts_with("250"));
        for recipient in to {
            assert_eq!(self.send(&format!("RCPT TO:<{recipient}>")).await, "250 OK");
        }
        self.message(content).await
    }
}

//! Drives a real TCP session through the policy filter and envelope parser,
//! the way the relay wires them together.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use stratus_common::{Body, DeliveryRequest, Reply, Signal, Status};
use stratus_smtp::{
    EnvelopeParser, EnvelopeSeed, PolicyConfig, PolicyDecision, PolicyFilter, SessionConfig,
    SmtpHooks, SmtpServer, Transaction,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::broadcast,
};

struct Relay {
    policy: PolicyFilter,
    parser: EnvelopeParser,
    accepted: Mutex<Vec<DeliveryRequest>>,
}

#[async_trait]
impl SmtpHooks for Relay {
    async fn on_rcpt(&self, peer: SocketAddr, address: &str) -> Reply {
        match self.policy.check_recipient(address, peer.ip()) {
            PolicyDecision::Accept => Reply::ok(),
            PolicyDecision::RejectSource => {
                Reply::new(Status::Error, format!("{} not permitted", peer.ip()))
            }
            PolicyDecision::RejectDomain => {
                Reply::new(Status::Error, "not relaying to that domain")
            }
        }
    }

    async fn on_data(&self, transaction: &Transaction) -> Reply {
        let seed = EnvelopeSeed {
            mail_from: transaction.mail_from.clone(),
            rcpt_tos: transaction.rcpt_tos.clone(),
        };

        match self.parser.parse(&transaction.content, &seed) {
            Ok(request) => {
                self.accepted.lock().push(request);
                Reply::new(Status::Ok, "Message accepted for delivery")
            }
            Err(_) => Reply::new(Status::Unprocessable, "Unable to process"),
        }
    }
}

struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    async fn connect(address: SocketAddr) -> Self {
        let mut client = Self {
            stream: BufReader::new(TcpStream::connect(address).await.unwrap()),
        };
        assert!(client.line().await.starts_with("220 "));
        client
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    async fn send(&mut self, line: &str) -> String {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.line().await
    }
}

async fn start(subnets: &[&str]) -> (Arc<Relay>, SocketAddr, broadcast::Sender<Signal>) {
    let relay = Arc::new(Relay {
        policy: PolicyFilter::new(PolicyConfig::new(["example.com"], subnets).unwrap()),
        parser: EnvelopeParser::new("relay@example.com", true),
        accepted: Mutex::new(Vec::new()),
    });

    let server = Arc::new(
        SmtpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            relay.clone(),
            SessionConfig {
                banner: "relay.test".into(),
                command_timeout: Duration::from_secs(5),
                ..SessionConfig::default()
            },
        )
        .await
        .unwrap(),
    );
    let address = server.local_addr();

    let (shutdown, receiver) = broadcast::channel(1);
    tokio::spawn(async move { server.serve(receiver).await });

    (relay, address, shutdown)
}

#[tokio::test]
async fn accepts_allowed_mail() {
    let (relay, address, _shutdown) = start(&["127.0.0.0/8"]).await;
    let mut client = Client::connect(address).await;

    assert_eq!(client.send("HELO tester").await, "250 relay.test");
    assert_eq!(client.send("MAIL FROM:<author@elsewhere.org>").await, "250 OK");
    assert_eq!(client.send("RCPT TO:<one@example.com>").await, "250 OK");
    assert_eq!(client.send("RCPT TO:<two@example.com>").await, "250 OK");
    assert_eq!(
        client.send("RCPT TO:<three@example.org>").await,
        "550 not relaying to that domain"
    );
    assert!(client.send("DATA").await.starts_with("354 "));
    client
        .stream
        .write_all(b"Subject: Nightly report\r\nFrom: Author <author@elsewhere.org>\r\n\r\nAll green.\r\n")
        .await
        .unwrap();
    assert_eq!(client.send(".").await, "250 Message accepted for delivery");
    assert_eq!(client.send("QUIT").await, "221 Bye");

    let accepted = relay.accepted.lock();
    assert_eq!(accepted.len(), 1);
    let request = &accepted[0];
    assert_eq!(request.subject(), "Nightly report");
    assert_eq!(request.sender_address(), "relay@example.com");
    assert_eq!(
        request.recipients().to.addresses().collect::<Vec<_>>(),
        vec!["one@example.com", "two@example.com"]
    );
    assert_eq!(request.reply_to().first_address(), Ok("author@elsewhere.org"));
}

#[tokio::test]
async fn body_keeps_its_final_line_break() {
    let (relay, address, _shutdown) = start(&["127.0.0.0/8"]).await;
    let mut client = Client::connect(address).await;

    client.send("HELO tester").await;
    client.send("MAIL FROM:<author@elsewhere.org>").await;
    client.send("RCPT TO:<one@example.com>").await;
    assert!(client.send("DATA").await.starts_with("354 "));
    client
        .stream
        .write_all(b"Subject: s\r\n\r\nline one\r\nline two\r\n")
        .await
        .unwrap();
    assert_eq!(client.send(".").await, "250 Message accepted for delivery");

    let accepted = relay.accepted.lock();
    assert_eq!(accepted.len(), 1);
    assert_eq!(
        accepted[0].body(),
        &Body::PlainText("line one\r\nline two\r\n".into())
    );
}

#[tokio::test]
async fn rejects_unknown_sources() {
    let (relay, address, _shutdown) = start(&["10.0.0.0/8"]).await;
    let mut client = Client::connect(address).await;

    client.send("EHLO tester").await;
    while client.line().await.starts_with("250-") {}
    assert_eq!(client.send("MAIL FROM:<a@example.com>").await, "250 OK");
    assert_eq!(
        client.send("RCPT TO:<one@example.com>").await,
        "550 127.0.0.1 not permitted"
    );
    assert_eq!(client.send("DATA").await, "503 Error: need RCPT command");
    assert!(relay.accepted.lock().is_empty());
}

#[tokio::test]
async fn malformed_messages_keep_the_connection() {
    let (relay, address, _shutdown) = start(&["127.0.0.1"]).await;
    let mut client = Client::connect(address).await;

    client.send("HELO tester").await;
    client.send("MAIL FROM:<a@example.com>").await;
    client.send("RCPT TO:<one@example.com>").await;
    client.send("DATA").await;
    client
        .stream
        .write_all(b"Subject: no body\r\nTo: one@example.com\r\n")
        .await
        .unwrap();
    assert_eq!(client.send(".").await, "500 Unable to process");

    assert_eq!(client.send("NOOP").await, "250 OK");
    assert!(relay.accepted.lock().is_empty());
}

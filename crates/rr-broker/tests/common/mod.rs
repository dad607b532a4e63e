//! Shared harness for broker integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use rr_broker::api::ApiServer;
use rr_broker::server::AgentListener;
use rr_broker::store::BrokerStore;
use rr_broker::BrokerState;
use rr_core::api::{ApiRequest, ApiRequestFrame, ApiResponse, ApiResponseFrame};
use rr_core::config::BrokerConfig;
use rr_core::AgentId;
use rr_protocol::{AgentInfo, AgentResponse, FrameCodec, Message};

/// A broker running on ephemeral localhost ports over an in-memory store
pub struct TestBroker {
    pub state: Arc<BrokerState>,
    pub agent_addr: SocketAddr,
    pub api_addr: SocketAddr,
    cancel: CancellationToken,
}

impl TestBroker {
    pub async fn start(config: BrokerConfig) -> Self {
        let store = BrokerStore::open_in_memory().await.expect("open store");
        let state = Arc::new(BrokerState::new(config, store));
        let cancel = CancellationToken::new();

        let agent_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind agents");
        let api_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind api");
        let agent_addr = agent_listener.local_addr().unwrap();
        let api_addr = api_listener.local_addr().unwrap();

        let listener = AgentListener::new(Arc::clone(&state), cancel.clone());
        tokio::spawn(async move {
            let _ = listener.serve(agent_listener).await;
        });

        let api = ApiServer::new(Arc::clone(&state), cancel.clone());
        tokio::spawn(async move {
            let _ = api.serve(api_listener).await;
        });

        Self {
            state,
            agent_addr,
            api_addr,
            cancel,
        }
    }

    pub async fn client(&self) -> TestClient {
        TestClient::connect(self.api_addr).await
    }

    pub async fn agent(&self) -> FakeAgent {
        FakeAgent::connect(self.agent_addr).await
    }

    /// Wait until the registry reports `agent_id` with the given online state
    pub async fn wait_online(&self, agent_id: &AgentId, online: bool) {
        for _ in 0..200 {
            let current = self
                .state
                .registry
                .get_agent(agent_id)
                .map(|a| a.is_online)
                .unwrap_or(false);
            if current == online {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {} never became online={}", agent_id, online);
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// API test client
pub struct TestClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl TestClient {
    pub async fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).await.expect("connect api");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    pub async fn send_request(&mut self, request: ApiRequest) -> ApiResponse {
        let mut request_json = serde_json::to_string(&request).expect("Failed to serialize request");
        request_json.push('\n');
        self.writer
            .write_all(request_json.as_bytes())
            .await
            .expect("Failed to write request");
        self.writer.flush().await.expect("Failed to flush");

        let mut response_line = String::new();
        self.reader
            .read_line(&mut response_line)
            .await
            .expect("Failed to read response");

        if response_line.is_empty() {
            panic!("Server sent empty response (connection closed?)");
        }

        serde_json::from_str(&response_line).expect("Failed to parse response")
    }

    /// Send a request tagged with `id` without waiting for its answer
    pub async fn send_frame(&mut self, id: u64, request: ApiRequest) {
        let mut request_json = serde_json::to_string(&ApiRequestFrame::new(id, request))
            .expect("Failed to serialize request");
        request_json.push('\n');
        self.writer
            .write_all(request_json.as_bytes())
            .await
            .expect("Failed to write request");
        self.writer.flush().await.expect("Failed to flush");
    }

    /// Next response line, whichever request it answers
    pub async fn recv_frame(&mut self) -> ApiResponseFrame {
        let mut response_line = String::new();
        self.reader
            .read_line(&mut response_line)
            .await
            .expect("Failed to read response");
        if response_line.is_empty() {
            panic!("Server sent empty response (connection closed?)");
        }
        serde_json::from_str(&response_line).expect("Failed to parse response")
    }
}

/// Agent speaking the wire protocol directly
pub struct FakeAgent {
    framed: Framed<TcpStream, FrameCodec>,
}

impl FakeAgent {
    pub async fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).await.expect("connect agent");
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.framed.send(message).await.expect("send frame");
    }

    pub async fn register(&mut self, credential: &str, machine_name: &str) {
        self.send(Message::Register {
            credential: credential.to_string(),
            info: AgentInfo::new(machine_name),
        })
        .await;
    }

    /// Next message, or `None` once the broker has closed the connection
    pub async fn recv(&mut self) -> Option<Message> {
        let next = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for broker");
        match next {
            Some(Ok(message)) => Some(message),
            _ => None,
        }
    }

    /// Answer the next `Execute` with `reply`
    pub async fn answer_next(&mut self, reply: impl FnOnce(rr_protocol::AgentCommand) -> AgentResponse) {
        match self.recv().await {
            Some(Message::Execute(command)) => {
                let response = reply(command);
                self.send(Message::Respond(response)).await;
            }
            other => panic!("expected Execute, got {:?}", other),
        }
    }
}

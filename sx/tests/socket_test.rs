//! End-to-end tests for the socket broker with blocking client transports

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serialexec::{Channel, Connector, ExecutorConfig, SerializedExecutor, SocketBroker, SocketConnector, Transport, TransportError};
use tempfile::TempDir;
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(5);

struct RunningBroker {
    shutdown: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl RunningBroker {
    fn start(socket_path: &Path) -> Self {
        let (shutdown, stop) = oneshot::channel::<()>();
        let path = socket_path.to_path_buf();
        let thread = thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime
                .block_on(SocketBroker::new(path).run_until(async {
                    let _ = stop.await;
                }))
                .unwrap();
        });
        let deadline = Instant::now() + WAIT;
        while !socket_path.exists() {
            assert!(Instant::now() < deadline, "broker socket never appeared");
            thread::sleep(Duration::from_millis(5));
        }
        Self { shutdown, thread }
    }

    fn stop(self) {
        let _ = self.shutdown.send(());
        self.thread.join().unwrap();
    }
}

fn socket_in(temp: &TempDir) -> PathBuf {
    temp.path().join("broker.sock")
}

#[test]
fn test_publish_reaches_consumer_on_other_connection() {
    let temp = TempDir::new().unwrap();
    let socket_path = socket_in(&temp);
    let broker = RunningBroker::start(&socket_path);
    let connector = SocketConnector::new(&socket_path).with_timeout(WAIT);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let mut channel = Channel::new(connector.open_connection().unwrap());
    channel.declare_topic_exchange("gather_scatter").unwrap();
    let queue = channel.declare_exclusive_queue().unwrap();
    channel.bind_queue("gather_scatter", &queue, "*").unwrap();
    channel
        .consume(&queue, true, move |_, delivery| {
            sink.lock().unwrap().push((delivery.routing_key, delivery.body))
        })
        .unwrap();
    let executor = SerializedExecutor::start(channel, ExecutorConfig::default(), || {}).unwrap();

    let mut publisher = connector.open_connection().unwrap();
    publisher.publish("gather_scatter", "workload", "ping").unwrap();
    publisher.publish("gather_scatter", "deep.key", "filtered").unwrap();

    let deadline = Instant::now() + WAIT;
    while received.lock().unwrap().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    // give the filtered message a chance to show up if routing were wrong
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        *received.lock().unwrap(),
        vec![("workload".to_string(), "ping".to_string())]
    );

    executor.stop(WAIT).unwrap();
    publisher.close().unwrap();
    broker.stop();
}

#[test]
fn test_messages_published_before_consume_are_delivered() {
    let temp = TempDir::new().unwrap();
    let socket_path = socket_in(&temp);
    let broker = RunningBroker::start(&socket_path);
    let connector = SocketConnector::new(&socket_path);

    let mut transport = connector.open_connection().unwrap();
    transport.declare_topic_exchange("ex").unwrap();
    let queue = transport.declare_exclusive_queue().unwrap();
    transport.bind_queue("ex", &queue, "#").unwrap();
    transport.publish("ex", "a.b", "early").unwrap();
    let tag = transport.basic_consume(&queue, true).unwrap();

    let mut got = Vec::new();
    let deadline = Instant::now() + WAIT;
    while got.is_empty() && Instant::now() < deadline {
        got.extend(transport.poll_once(Duration::from_millis(20)).unwrap());
    }
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].body, "early");
    assert_eq!(got[0].consumer_tag, tag);

    transport.close().unwrap();
    broker.stop();
}

#[test]
fn test_broker_errors_surface_to_client() {
    let temp = TempDir::new().unwrap();
    let socket_path = socket_in(&temp);
    let broker = RunningBroker::start(&socket_path);

    let mut transport = SocketConnector::new(&socket_path).open_connection().unwrap();
    let result = transport.publish("never-declared", "k", "b");
    assert!(matches!(result, Err(TransportError::Broker(_))));
    assert!(transport.is_open());

    transport.close().unwrap();
    assert!(matches!(transport.close(), Err(TransportError::ConnectionClosed)));
    broker.stop();
}

#[test]
fn test_connect_to_missing_socket_fails() {
    let temp = TempDir::new().unwrap();
    let connector = SocketConnector::new(socket_in(&temp)).with_timeout(Duration::from_millis(200));
    assert!(!connector.socket_exists());
    assert!(connector.open_connection().is_err());
}

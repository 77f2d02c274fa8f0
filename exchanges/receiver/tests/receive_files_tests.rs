//! Pairs a real sender with a `ReceiveFilesBubble` over in-memory
//! connections.

use relaydropx_common::{BatchRoute, FileHeader, Subscriber, wire};
use relaydropx_receiver::{
    ReceiveFilesBubble, ReceiveFilesEvent, ReceiveOutcome, ReceiverConfig,
};
use relaydropx_sender::{
    SendFilesBubble, SendFilesRequest, SenderConfig, SenderFile,
};
use std::{
    path::Path,
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use tokio::io::duplex;

struct TestSubscriber {
    id: String,
    logs: Mutex<Vec<String>>,
    events: Mutex<Vec<ReceiveFilesEvent>>,
}

impl TestSubscriber {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            logs: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<ReceiveFilesEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Subscriber<ReceiveFilesEvent> for TestSubscriber {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn log(&self, message: String) {
        self.logs.lock().unwrap().push(message);
    }

    fn notify(&self, event: ReceiveFilesEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn write_file(dir: &Path, name: &str, content: &[u8]) -> SenderFile {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    SenderFile::from_path(path).unwrap()
}

#[tokio::test]
async fn relayed_batch_reports_receivers_then_files() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let files = vec![
        write_file(source.path(), "report.txt", b"hello, world!!"),
        write_file(source.path(), "empty.txt", b""),
    ];
    let sender = SendFilesBubble::new(SendFilesRequest {
        files,
        route: BatchRoute::relayed(["bob-pc", "cid-pc"]),
        config: SenderConfig { chunk_size: 5, ..SenderConfig::default() },
    });
    let receiver = ReceiveFilesBubble::new(ReceiverConfig::default());
    let subscriber = TestSubscriber::new("test");
    receiver.subscribe(subscriber.clone());

    let (writer, reader) = duplex(64);
    let (sent, received) = tokio::join!(
        sender.run(writer, "relay"),
        receiver.run(reader, dest.path())
    );
    sent.unwrap();
    let ReceiveOutcome::Received(batch) = received.unwrap() else {
        panic!("expected a batch");
    };

    let report = dest.path().join("report.txt");
    let empty = dest.path().join("empty.txt");
    assert_eq!(std::fs::read(&report).unwrap(), b"hello, world!!");
    assert_eq!(std::fs::read(&empty).unwrap(), b"");
    assert_eq!(batch.route.receivers(), ["bob-pc", "cid-pc"]);
    assert_eq!(batch.files[0].size, 14);

    assert_eq!(
        subscriber.events(),
        vec![
            ReceiveFilesEvent::ReceiverAdded { host_name: "bob-pc".into() },
            ReceiveFilesEvent::ReceiverAdded { host_name: "cid-pc".into() },
            ReceiveFilesEvent::FileReceiveStarted {
                name: "report.txt".into(),
                size: 14,
            },
            ReceiveFilesEvent::FileReceiveFinished {
                name: "report.txt".into(),
                path: report,
            },
            ReceiveFilesEvent::FileReceiveStarted {
                name: "empty.txt".into(),
                size: 0,
            },
            ReceiveFilesEvent::FileReceiveFinished {
                name: "empty.txt".into(),
                path: empty,
            },
            ReceiveFilesEvent::BatchReceived {
                route: BatchRoute::relayed(["bob-pc", "cid-pc"])
            },
        ]
    );
    assert_eq!(subscriber.logs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn same_name_twice_keeps_the_last_write() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let sender = SendFilesBubble::new(SendFilesRequest {
        files: vec![
            write_file(first.path(), "notes.txt", b"old"),
            write_file(second.path(), "notes.txt", b"newer"),
        ],
        route: BatchRoute::Direct,
        config: SenderConfig::default(),
    });
    let receiver = ReceiveFilesBubble::new(ReceiverConfig::low_bandwidth());

    let (writer, reader) = duplex(1024);
    let (sent, received) = tokio::join!(
        sender.run(writer, "peer"),
        receiver.run(reader, dest.path())
    );
    sent.unwrap();
    received.unwrap();

    assert_eq!(std::fs::read(dest.path().join("notes.txt")).unwrap(), b"newer");
}

#[tokio::test]
async fn destination_is_created_on_demand() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let nested = dest.path().join("a").join("b");
    let sender = SendFilesBubble::new(SendFilesRequest {
        files: vec![write_file(source.path(), "x.bin", &[1, 2, 3])],
        route: BatchRoute::Direct,
        config: SenderConfig::default(),
    });
    let receiver = ReceiveFilesBubble::new(ReceiverConfig::default());

    let (writer, reader) = duplex(1024);
    let (sent, received) =
        tokio::join!(sender.run(writer, "peer"), receiver.run(reader, &nested));
    sent.unwrap();
    received.unwrap();

    assert_eq!(std::fs::read(nested.join("x.bin")).unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn truncated_content_fails_and_leaves_partial_file() {
    let dest = TempDir::new().unwrap();
    let mut raw = Vec::new();
    wire::write_route(&mut raw, &BatchRoute::Direct).await.unwrap();
    wire::write_count(&mut raw, 1).await.unwrap();
    wire::write_file_header(
        &mut raw,
        &FileHeader { name: "cut.bin".into(), size: 10 },
    )
    .await
    .unwrap();
    raw.extend_from_slice(b"1234");

    let receiver = ReceiveFilesBubble::new(ReceiverConfig::default());
    let subscriber = TestSubscriber::new("test");
    receiver.subscribe(subscriber.clone());

    let err = receiver.run(raw.as_slice(), dest.path()).await.unwrap_err();

    assert!(err.is_framing(), "{err}");
    assert_eq!(std::fs::read(dest.path().join("cut.bin")).unwrap(), b"1234");
    let events = subscriber.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], ReceiveFilesEvent::Failed { .. }));
}

#[tokio::test]
async fn corrupted_fields_are_framing_errors() {
    let dest = TempDir::new().unwrap();
    let receiver = ReceiveFilesBubble::new(ReceiverConfig::default());

    // Negative receiver count.
    let raw = (-1i32).to_be_bytes();
    let err = receiver.run(&raw[..], dest.path()).await.unwrap_err();
    assert!(err.is_framing());

    // Stream ends inside the receiver count.
    let raw = [0u8, 0];
    let err = receiver.run(&raw[..], dest.path()).await.unwrap_err();
    assert!(err.is_framing());

    // Negative file size.
    let mut raw = Vec::new();
    wire::write_route(&mut raw, &BatchRoute::Direct).await.unwrap();
    wire::write_count(&mut raw, 1).await.unwrap();
    wire::write_string(&mut raw, "neg.bin").await.unwrap();
    raw.extend_from_slice(&(-5i64).to_be_bytes());
    let err = receiver.run(raw.as_slice(), dest.path()).await.unwrap_err();
    assert!(err.is_framing());
    assert!(!dest.path().join("neg.bin").exists());
}

#[tokio::test]
async fn bubble_can_be_run_for_successive_connections() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let receiver = ReceiveFilesBubble::new(ReceiverConfig::default());

    for name in ["one.txt", "two.txt"] {
        let sender = SendFilesBubble::new(SendFilesRequest {
            files: vec![write_file(source.path(), name, name.as_bytes())],
            route: BatchRoute::Direct,
            config: SenderConfig::default(),
        });
        let (writer, reader) = duplex(1024);
        let (sent, received) = tokio::join!(
            sender.run(writer, "peer"),
            receiver.run(reader, dest.path())
        );
        sent.unwrap();
        assert!(matches!(received.unwrap(), ReceiveOutcome::Received(_)));
    }

    assert!(dest.path().join("one.txt").exists());
    assert!(dest.path().join("two.txt").exists());
}

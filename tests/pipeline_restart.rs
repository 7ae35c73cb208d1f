//! Integration tests for cursor durability across pipeline restarts.
//!
//! Builds a real [`Pipeline`] against a temp directory twice over, with a
//! canned worker and a recording channel, and checks that cursors, session
//! handles, and the on-disk state format survive the restart.

use async_trait::async_trait;
use courier::agent::{AgentEvent, AgentHandle, OutputEvent, ProcessRunner, PromptContext};
use courier::channel::{Channel, InboundBatch};
use courier::config::{Config, WorkerConfig};
use courier::dispatch::Pipeline;
use courier::group::{Group, GroupRegistry};
use courier::message::Message;
use courier::store::CursorStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TS1: &str = "2024-06-01T10:00:00.000Z";
const TS2: &str = "2024-06-01T10:00:01.000Z";

/// Channel that records outbound messages and does nothing else.
#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(&self, _tx: mpsc::Sender<InboundBatch>, cancel: CancellationToken) {
        cancel.cancelled().await;
    }

    async fn send_message(&self, _group_id: &str, text: &str) -> color_eyre::Result<()> {
        self.sent.lock().unwrap().push(text.to_owned());
        Ok(())
    }

    async fn set_typing(&self, _group_id: &str, _typing: bool) {}
}

/// Worker that replies once with a fixed text and session, then exits.
#[derive(Default)]
struct CannedProcess {
    session: String,
    prompts: Mutex<Vec<PromptContext>>,
}

#[async_trait]
impl ProcessRunner for CannedProcess {
    async fn spawn(&self, ctx: PromptContext) -> color_eyre::Result<AgentHandle> {
        self.prompts.lock().unwrap().push(ctx);
        let (events_tx, events_rx) = mpsc::channel(4);
        let (input_tx, _input_rx) = mpsc::unbounded_channel();
        let session = self.session.clone();
        tokio::spawn(async move {
            let _ = events_tx
                .send(AgentEvent::Output(OutputEvent {
                    text: Some("worker reply".into()),
                    session: Some(session),
                    error: false,
                }))
                .await;
            let _ = events_tx.send(AgentEvent::Exited { success: true }).await;
        });
        Ok(AgentHandle {
            events: events_rx,
            input: input_tx,
            kill: CancellationToken::new(),
        })
    }
}

fn test_config() -> Config {
    Config {
        main_group: "main".into(),
        trigger: "@courier".into(),
        poll_interval_secs: 2,
        idle_timeout_secs: 60,
        shutdown_deadline_ms: 10_000,
        worker: WorkerConfig {
            command: "true".into(),
            args: Vec::new(),
        },
    }
}

fn make_pipeline(root: &std::path::Path, session: &str) -> (Pipeline, Arc<CannedProcess>) {
    let state_dir = Config::state_dir(root);
    let process = Arc::new(CannedProcess {
        session: session.into(),
        ..Default::default()
    });
    let pipeline = Pipeline::new(
        test_config(),
        CursorStore::load(&state_dir),
        GroupRegistry::load(&state_dir),
        Arc::new(RecordingChannel::default()),
        process.clone(),
    );
    (pipeline, process)
}

fn main_group() -> Group {
    Group {
        group_id: "main".into(),
        folder: "main".into(),
        name: "Main".into(),
        requires_trigger: false,
        registered_at: chrono::Utc::now(),
    }
}

async fn settle(pipeline: &Pipeline, process: &CannedProcess, spawns: usize) {
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if process.prompts.lock().unwrap().len() >= spawns
            && pipeline.queue().active_count() == 0
        {
            return;
        }
    }
    panic!("pipeline did not settle");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cursors_and_session_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    // First run: one message processed end to end.
    {
        let (pipeline, process) = make_pipeline(root, "s-first");
        pipeline.register_group(main_group()).unwrap();
        pipeline.on_new_messages(
            "main",
            vec![Message::new("1", "main", "alice", "hello", TS1)],
        );
        pipeline.tick().await.unwrap();
        settle(&pipeline, &process, 1).await;
    }

    // Durable format contract: the wire names in state.json are stable.
    let raw = std::fs::read_to_string(root.join(".courier/state.json")).unwrap();
    assert!(raw.contains("\"lastSeenTimestamp\""), "raw state: {raw}");
    assert!(raw.contains("\"lastAgentTimestamp\""), "raw state: {raw}");
    assert!(raw.contains("\"sessionHandle\""), "raw state: {raw}");

    // Second run: the transport redelivers the old message plus a new one.
    let (pipeline, process) = make_pipeline(root, "s-second");
    {
        let store = pipeline.store().lock().unwrap();
        assert_eq!(store.global_timestamp(), TS1);
        assert_eq!(store.last_agent_timestamp("main"), TS1);
        assert_eq!(store.session_handle("main").as_deref(), Some("s-first"));
    }

    pipeline.on_new_messages(
        "main",
        vec![
            Message::new("1", "main", "alice", "hello", TS1),
            Message::new("2", "main", "alice", "and another", TS2),
        ],
    );
    pipeline.recover_pending_messages();
    pipeline.tick().await.unwrap();
    settle(&pipeline, &process, 1).await;

    // Only the new message was dispatched, with the saved session handle.
    let prompts = process.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(!prompts[0].prompt.contains("hello"));
    assert!(prompts[0].prompt.contains("and another"));
    assert_eq!(prompts[0].session_handle.as_deref(), Some("s-first"));
    drop(prompts);

    let store = pipeline.store().lock().unwrap();
    assert_eq!(store.global_timestamp(), TS2);
    assert_eq!(store.last_agent_timestamp("main"), TS2);
    assert_eq!(store.session_handle("main").as_deref(), Some("s-second"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    let (pipeline, process) = make_pipeline(root, "s-1");
    pipeline.register_group(main_group()).unwrap();

    // Backlog exists but intake already covered it before the restart.
    pipeline.on_new_messages(
        "main",
        vec![Message::new("1", "main", "alice", "hello", TS1)],
    );
    pipeline
        .store()
        .lock()
        .unwrap()
        .set_global_timestamp(TS1)
        .unwrap();

    // Duplicate recovery calls collapse into one deferred check.
    pipeline.recover_pending_messages();
    pipeline.recover_pending_messages();
    pipeline.tick().await.unwrap();
    settle(&pipeline, &process, 1).await;

    assert_eq!(process.prompts.lock().unwrap().len(), 1);

    // A further tick has nothing left to do.
    pipeline.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(process.prompts.lock().unwrap().len(), 1);
}

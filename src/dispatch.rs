//! Dispatch loop — the single cooperative scheduler for the pipeline.
//!
//! [`Pipeline`] owns every collaborator and exposes the surface the
//! transport layer talks to (`on_new_messages`, `register_group`,
//! `recover_pending_messages`, `shutdown`). `tick` is the explicit scheduler
//! step, separately callable so tests can drive it deterministically;
//! `run` wraps it in a poll-interval loop in the usual
//! `tokio::select!`-over-cancellation shape.

use crate::agent::ProcessRunner;
use crate::channel::Channel;
use crate::config::Config;
use crate::group::{Group, GroupRegistry};
use crate::message::{Message, MessageLog};
use crate::queue::TaskQueue;
use crate::runner::{self, RunnerContext};
use crate::store::CursorStore;
use color_eyre::eyre::Result;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The assembled per-group task execution pipeline.
pub struct Pipeline {
    config: Config,
    store: Arc<Mutex<CursorStore>>,
    groups: Arc<Mutex<GroupRegistry>>,
    log: Arc<MessageLog>,
    queue: Arc<TaskQueue>,
    channel: Arc<dyn Channel>,
    process: Arc<dyn ProcessRunner>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: CursorStore,
        groups: GroupRegistry,
        channel: Arc<dyn Channel>,
        process: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            config,
            store: Arc::new(Mutex::new(store)),
            groups: Arc::new(Mutex::new(groups)),
            log: Arc::new(MessageLog::new()),
            queue: Arc::new(TaskQueue::new()),
            channel,
            process,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<Mutex<CursorStore>> {
        &self.store
    }

    /// Transport push: newly received messages for a group.
    pub fn on_new_messages(&self, group_id: &str, mut messages: Vec<Message>) {
        // The batch is trusted for content but not for routing fields.
        for m in &mut messages {
            m.group_id = group_id.to_owned();
        }
        self.log.append(messages);
    }

    /// Register (or re-register) a group.
    pub fn register_group(&self, group: Group) -> Result<()> {
        let group_id = group.group_id.clone();
        let mut groups = self.groups.lock().unwrap();
        let fresh = groups.register(group);
        groups.save()?;
        if fresh {
            eprintln!("[dispatch] Registered group {group_id}");
        }
        Ok(())
    }

    /// Startup recovery: flag every registered group with a non-empty
    /// backlog for re-evaluation. The normal tick decides whether a worker
    /// is actually spawned, so the at-most-one invariant holds even right
    /// after a restart. Safe to call more than once.
    pub fn recover_pending_messages(&self) {
        let group_ids: Vec<String> = {
            let groups = self.groups.lock().unwrap();
            groups.all().iter().map(|g| g.group_id.clone()).collect()
        };

        let mut recovered = 0;
        for group_id in group_ids {
            let cursor = self.store.lock().unwrap().last_agent_timestamp(&group_id);
            if !self.log.fetch_group_after(&group_id, &cursor).is_empty() {
                self.queue.enqueue_message_check(&group_id);
                recovered += 1;
            }
        }
        if recovered > 0 {
            eprintln!("[dispatch] recovery flagged {recovered} group(s) with pending backlog");
        }
    }

    /// One scheduler step: fetch new messages, advance the global cursor,
    /// and process each group with pending work.
    pub async fn tick(&self) -> Result<()> {
        let since = self.store.lock().unwrap().global_timestamp().to_owned();
        let fetched = self.log.fetch_all_after(&since);
        let pending = self.queue.take_pending();

        if fetched.is_empty() && pending.is_empty() {
            return Ok(());
        }

        // Advance intake progress before any per-group processing, so
        // re-delivery after a crash is bounded by the group cursors, not the
        // global one. A store failure aborts the whole tick unadvanced.
        if let Some(newest) = fetched.last() {
            let newest = newest.timestamp.clone();
            let result = self.store.lock().unwrap().set_global_timestamp(&newest);
            if let Err(e) = result {
                self.queue.requeue_pending(&pending);
                return Err(e);
            }
        }

        // Partition the fresh batch by group, then append pending-only
        // groups (deferred checks, recovery) with an empty batch.
        let mut by_group: Vec<(String, Vec<Message>)> = Vec::new();
        for message in fetched {
            match by_group.iter_mut().find(|(id, _)| *id == message.group_id) {
                Some((_, batch)) => batch.push(message),
                None => by_group.push((message.group_id.clone(), vec![message])),
            }
        }
        for group_id in pending {
            if !by_group.iter().any(|(id, _)| *id == group_id) {
                by_group.push((group_id, Vec::new()));
            }
        }

        for (group_id, batch) in by_group {
            if let Err(e) = self.process_group(&group_id, &batch).await {
                eprintln!("[dispatch] error processing group {group_id}: {e}");
            }
        }

        Ok(())
    }

    /// Handle one group's turn within a tick.
    async fn process_group(&self, group_id: &str, batch: &[Message]) -> Result<()> {
        let group = match self.groups.lock().unwrap().get(group_id) {
            Some(group) => group.clone(),
            None => {
                eprintln!("[dispatch] ignoring messages for unregistered group {group_id}");
                return Ok(());
            }
        };

        // The full backlog since the agent cursor, not just this tick's
        // batch — a group that accumulated messages across several ticks is
        // processed as one complete batch once it qualifies.
        let cursor = self.store.lock().unwrap().last_agent_timestamp(group_id);
        let backlog = self.log.fetch_group_after(group_id, &cursor);
        if backlog.is_empty() {
            return Ok(());
        }

        // Trigger policy: fresh arrivals are checked against this tick's
        // batch; pending-only groups against their backlog, so recovery
        // never bypasses a trigger requirement.
        let trigger_texts = if batch.is_empty() { &backlog } else { batch };
        let satisfied = self.groups.lock().unwrap().trigger_satisfied(
            group_id,
            &self.config.main_group,
            &self.config.trigger,
            trigger_texts.iter().map(|m| m.content.as_str()),
        );
        if !satisfied {
            return Ok(());
        }

        // Live-forward into a running worker when possible.
        let text = runner::format_batch(&backlog);
        if self.queue.try_send(group_id, &text) {
            let last = backlog.last().map(|m| m.timestamp.clone()).unwrap_or_default();
            self.store
                .lock()
                .unwrap()
                .set_last_agent_timestamp(group_id, &last)?;
            self.channel.set_typing(group_id, true).await;
            eprintln!(
                "[dispatch] live-forwarded {} message(s) to {group_id}",
                backlog.len()
            );
            return Ok(());
        }

        if self.queue.is_active(group_id) {
            // Worker exists but its input is closed (draining) — defer to
            // the next tick rather than spawning a second worker.
            self.queue.enqueue_message_check(group_id);
            return Ok(());
        }

        // No active invocation — this tick owns the group's turn and
        // dispatches a runner. The runner re-fetches the backlog and
        // enforces at-most-one through queue registration.
        let ctx = self.runner_context();
        tokio::spawn(async move {
            runner::run_invocation(&ctx, &group).await;
        });
        Ok(())
    }

    fn runner_context(&self) -> RunnerContext {
        RunnerContext {
            store: self.store.clone(),
            log: self.log.clone(),
            queue: self.queue.clone(),
            channel: self.channel.clone(),
            process: self.process.clone(),
            idle_timeout: self.config.idle_timeout(),
        }
    }

    /// Run the dispatch loop until cancelled. Per-tick errors are logged
    /// and the loop continues; only cancellation ends it.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the first immediate tick.
        poll.tick().await;

        eprintln!(
            "[dispatch] loop running (poll every {}s)",
            self.config.poll_interval_secs
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    eprintln!("[dispatch] loop stopping");
                    break;
                }
                _ = poll.tick() => {
                    if let Err(e) = self.tick().await {
                        eprintln!("[dispatch] tick failed: {e}");
                    }
                }
            }
        }
    }

    /// Drain all workers within the configured deadline.
    pub async fn shutdown(&self) {
        self.queue.shutdown(self.config.shutdown_deadline()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentEvent, AgentHandle, AgentInput, OutputEvent};
    use crate::channel::MockChannel;
    use crate::config::WorkerConfig;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const TS1: &str = "2024-06-01T10:00:00.000Z";
    const TS2: &str = "2024-06-01T10:00:01.000Z";
    const TS3: &str = "2024-06-01T10:00:02.000Z";

    #[derive(Clone, Default)]
    struct WorkerScript {
        reply: Option<String>,
        exit_success: bool,
        hold_until_close: bool,
        /// After stdin closes, stay resolved only by kill.
        linger_after_close: bool,
    }

    /// `ProcessRunner` that pops one script per spawn, defaulting to an
    /// immediate clean exit.
    #[derive(Default)]
    struct ScriptedProcess {
        scripts: std::sync::Mutex<VecDeque<WorkerScript>>,
        prompts: std::sync::Mutex<Vec<crate::agent::PromptContext>>,
        forwarded: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl ScriptedProcess {
        fn with_scripts(scripts: impl IntoIterator<Item = WorkerScript>) -> Arc<Self> {
            Arc::new(Self {
                scripts: std::sync::Mutex::new(scripts.into_iter().collect()),
                ..Default::default()
            })
        }

        fn spawn_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ProcessRunner for ScriptedProcess {
        async fn spawn(
            &self,
            ctx: crate::agent::PromptContext,
        ) -> color_eyre::Result<AgentHandle> {
            self.prompts.lock().unwrap().push(ctx);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(WorkerScript {
                    exit_success: true,
                    ..Default::default()
                });
            let forwarded = self.forwarded.clone();

            let (events_tx, events_rx) = mpsc::channel(16);
            let (input_tx, mut input_rx) = mpsc::unbounded_channel();
            let kill = CancellationToken::new();
            let kill_watch = kill.clone();

            tokio::spawn(async move {
                if let Some(reply) = script.reply {
                    let _ = events_tx
                        .send(AgentEvent::Output(OutputEvent {
                            text: Some(reply),
                            session: Some("s-test".into()),
                            error: false,
                        }))
                        .await;
                }
                if script.hold_until_close {
                    loop {
                        tokio::select! {
                            _ = kill_watch.cancelled() => {
                                let _ = events_tx.send(AgentEvent::Exited { success: false }).await;
                                return;
                            }
                            input = input_rx.recv() => match input {
                                Some(AgentInput::Text(text)) => {
                                    forwarded.lock().unwrap().push(text);
                                }
                                Some(AgentInput::Close) | None => break,
                            }
                        }
                    }
                    if script.linger_after_close {
                        kill_watch.cancelled().await;
                        let _ = events_tx.send(AgentEvent::Exited { success: false }).await;
                        return;
                    }
                }
                let _ = events_tx
                    .send(AgentEvent::Exited {
                        success: script.exit_success,
                    })
                    .await;
            });

            Ok(AgentHandle {
                events: events_rx,
                input: input_tx,
                kill,
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

    fn quiet_channel() -> (MockChannel, Arc<std::sync::Mutex<Vec<String>>>) {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut mock = MockChannel::new();
        mock.expect_set_typing().returning(|_, _| ());
        let seen = sent.clone();
        mock.expect_send_message().returning(move |_, text| {
            seen.lock().unwrap().push(text.to_owned());
            Ok(())
        });
        (mock, sent)
    }

    fn make_pipeline(
        dir: &TempDir,
        channel: MockChannel,
        process: Arc<ScriptedProcess>,
    ) -> Pipeline {
        let state_dir = Config::state_dir(dir.path());
        Pipeline::new(
            test_config(),
            CursorStore::load(&state_dir),
            GroupRegistry::load(&state_dir),
            Arc::new(channel),
            process,
        )
    }

    fn make_group(id: &str, requires_trigger: bool) -> Group {
        Group {
            group_id: id.into(),
            folder: id.into(),
            name: id.into(),
            requires_trigger,
            registered_at: chrono::Utc::now(),
        }
    }

    fn msg(id: &str, sender: &str, content: &str, ts: &str) -> Message {
        Message::new(id, "unset", sender, content, ts)
    }

    /// Wait for spawned runners to resolve (paused clock, so this is cheap).
    async fn settle(pipeline: &Pipeline, process: &ScriptedProcess, spawns: usize) {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if process.spawn_count() >= spawns && pipeline.queue().active_count() == 0 {
                return;
            }
        }
        panic!(
            "pipeline did not settle: {} spawn(s), {} active",
            process.spawn_count(),
            pipeline.queue().active_count()
        );
    }

    async fn wait_active(pipeline: &Pipeline, group_id: &str) {
        for _ in 0..200 {
            if pipeline.queue().is_active(group_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no active invocation for {group_id}");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn tick_dispatches_fresh_backlog_and_advances_cursors() {
        let dir = TempDir::new().unwrap();
        let process = ScriptedProcess::with_scripts([WorkerScript {
            reply: Some("done".into()),
            exit_success: true,
            ..Default::default()
        }]);
        let (channel, sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());
        pipeline.register_group(make_group("main", false)).unwrap();

        pipeline.on_new_messages("main", vec![msg("1", "alice", "hi", TS1)]);
        pipeline.tick().await.unwrap();
        settle(&pipeline, &process, 1).await;

        assert_eq!(sent.lock().unwrap().as_slice(), ["done"]);
        let store = pipeline.store().lock().unwrap();
        assert_eq!(store.global_timestamp(), TS1);
        assert_eq!(store.last_agent_timestamp("main"), TS1);
        assert_eq!(store.session_handle("main").as_deref(), Some("s-test"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn tick_with_nothing_new_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let process = ScriptedProcess::with_scripts([]);
        let (channel, _sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());
        pipeline.register_group(make_group("main", false)).unwrap();

        pipeline.tick().await.unwrap();

        assert_eq!(process.spawn_count(), 0);
        assert_eq!(pipeline.store().lock().unwrap().global_timestamp(), "");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn trigger_policy_gates_side_groups_until_the_phrase_appears() {
        let dir = TempDir::new().unwrap();
        let process = ScriptedProcess::with_scripts([WorkerScript {
            exit_success: true,
            ..Default::default()
        }]);
        let (channel, _sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());
        pipeline.register_group(make_group("side", true)).unwrap();

        // No trigger phrase: intake advances, no worker runs.
        pipeline.on_new_messages("side", vec![msg("1", "alice", "hello all", TS1)]);
        pipeline.tick().await.unwrap();
        assert_eq!(process.spawn_count(), 0);
        {
            let store = pipeline.store().lock().unwrap();
            assert_eq!(store.global_timestamp(), TS1);
            assert_eq!(store.last_agent_timestamp("side"), "");
        }

        // The trigger arrives; the prompt covers the accumulated backlog.
        pipeline.on_new_messages("side", vec![msg("2", "bob", "hey @Courier, help", TS2)]);
        pipeline.tick().await.unwrap();
        settle(&pipeline, &process, 1).await;

        let prompts = process.prompts.lock().unwrap();
        assert!(prompts[0].prompt.contains("hello all"));
        assert!(prompts[0].prompt.contains("help"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn messages_for_unregistered_groups_are_ignored() {
        let dir = TempDir::new().unwrap();
        let process = ScriptedProcess::with_scripts([]);
        let (channel, _sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());

        pipeline.on_new_messages("ghost", vec![msg("1", "alice", "hi", TS1)]);
        pipeline.tick().await.unwrap();

        // Intake still advances; nothing is dispatched.
        assert_eq!(pipeline.store().lock().unwrap().global_timestamp(), TS1);
        assert_eq!(process.spawn_count(), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn live_forward_reaches_the_running_worker() {
        let dir = TempDir::new().unwrap();
        let process = ScriptedProcess::with_scripts([WorkerScript {
            hold_until_close: true,
            exit_success: true,
            ..Default::default()
        }]);
        let (channel, _sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());
        pipeline.register_group(make_group("main", false)).unwrap();

        pipeline.on_new_messages("main", vec![msg("1", "alice", "first", TS1)]);
        pipeline.tick().await.unwrap();
        wait_active(&pipeline, "main").await;

        // Second message while the worker runs: forwarded, not re-spawned.
        pipeline.on_new_messages("main", vec![msg("2", "alice", "follow-up", TS2)]);
        pipeline.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(process.spawn_count(), 1);
        assert_eq!(
            pipeline.store().lock().unwrap().last_agent_timestamp("main"),
            TS2
        );
        let forwarded = process.forwarded.lock().unwrap().clone();
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded[0].contains("follow-up"));

        // Drain: Close ends the scripted worker cleanly.
        pipeline.shutdown().await;
        assert_eq!(pipeline.queue().active_count(), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn draining_worker_defers_the_check_instead_of_double_spawning() {
        let dir = TempDir::new().unwrap();
        let process = ScriptedProcess::with_scripts([WorkerScript {
            hold_until_close: true,
            linger_after_close: true,
            ..Default::default()
        }]);
        let (channel, _sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());
        pipeline.register_group(make_group("main", false)).unwrap();

        pipeline.on_new_messages("main", vec![msg("1", "alice", "first", TS1)]);
        pipeline.tick().await.unwrap();
        wait_active(&pipeline, "main").await;

        // Input is closed but the worker is still resolving.
        pipeline.queue().close_stdin("main");
        tokio::time::sleep(Duration::from_millis(1)).await;

        pipeline.on_new_messages("main", vec![msg("2", "alice", "more", TS2)]);
        pipeline.tick().await.unwrap();

        // No live-forward, no second worker — just a deferred check.
        assert_eq!(process.spawn_count(), 1);
        assert!(pipeline.queue().is_active("main"));
        assert_eq!(pipeline.queue().take_pending(), vec!["main".to_owned()]);

        pipeline.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_invocation_is_retried_with_the_same_backlog_next_tick() {
        let dir = TempDir::new().unwrap();
        let process = ScriptedProcess::with_scripts([
            // First worker dies without producing anything.
            WorkerScript {
                exit_success: false,
                ..Default::default()
            },
            WorkerScript {
                reply: Some("second try".into()),
                exit_success: true,
                ..Default::default()
            },
        ]);
        let (channel, sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());
        pipeline.register_group(make_group("main", false)).unwrap();

        pipeline.on_new_messages("main", vec![msg("1", "alice", "hi", TS1)]);
        pipeline.tick().await.unwrap();
        settle(&pipeline, &process, 1).await;
        assert_eq!(
            pipeline.store().lock().unwrap().last_agent_timestamp("main"),
            ""
        );

        // No new message arrives; the retry comes from the rollback's flag.
        pipeline.tick().await.unwrap();
        settle(&pipeline, &process, 2).await;

        let prompts = process.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].prompt, prompts[1].prompt);
        drop(prompts);
        assert_eq!(sent.lock().unwrap().as_slice(), ["second try"]);
        assert_eq!(
            pipeline.store().lock().unwrap().last_agent_timestamp("main"),
            TS1
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn recovery_flags_groups_with_backlog_behind_the_global_cursor() {
        let dir = TempDir::new().unwrap();
        let process = ScriptedProcess::with_scripts([WorkerScript {
            exit_success: true,
            ..Default::default()
        }]);
        let (channel, _sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());
        pipeline.register_group(make_group("main", false)).unwrap();

        // Intake ran before a crash, but the group was never processed.
        pipeline.on_new_messages("main", vec![msg("1", "alice", "lost one", TS1)]);
        pipeline
            .store()
            .lock()
            .unwrap()
            .set_global_timestamp(TS1)
            .unwrap();

        pipeline.recover_pending_messages();
        pipeline.tick().await.unwrap();
        settle(&pipeline, &process, 1).await;

        let prompts = process.prompts.lock().unwrap();
        assert!(prompts[0].prompt.contains("lost one"));
        drop(prompts);
        assert_eq!(
            pipeline.store().lock().unwrap().last_agent_timestamp("main"),
            TS1
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_tick_requeues_pending_checks() {
        let dir = TempDir::new().unwrap();
        // Sabotage the store: a directory where state.json should be makes
        // every persist fail.
        let state_dir = Config::state_dir(dir.path());
        std::fs::create_dir_all(state_dir.join("state.json")).unwrap();

        let process = ScriptedProcess::with_scripts([]);
        let (channel, _sent) = quiet_channel();
        let pipeline = make_pipeline(&dir, channel, process.clone());
        pipeline.register_group(make_group("main", false)).unwrap();

        pipeline.queue().enqueue_message_check("main");
        pipeline.on_new_messages("main", vec![msg("1", "alice", "hi", TS3)]);

        assert!(pipeline.tick().await.is_err());
        assert_eq!(pipeline.queue().take_pending(), vec!["main".to_owned()]);
        assert_eq!(process.spawn_count(), 0);
    }
}

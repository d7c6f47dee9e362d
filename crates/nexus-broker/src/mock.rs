use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use nexus_core::agent::{AgentFactory, AgentTask, AlwaysOnAgent, SpawnRequest};
use nexus_core::errors::AgentFailure;
use nexus_core::ids::AgentId;
use nexus_core::messages::Priority;

/// Scripted behaviour for one execution built by [`MockFactory`].
pub enum MockRun {
    /// Resolve immediately with this text.
    Reply(String),
    /// Resolve immediately with `AgentFailure::Failed`.
    Fail(String),
    /// Panic inside the task.
    Panic(String),
    /// Fail in the factory's `create`, before any task exists.
    RejectCreate(String),
    /// Run until cancelled, then return `Ok(partial)` or `Err(Cancelled)`.
    UntilCancelled(Option<String>),
    /// Wait for the gate to be notified, then resolve the inner run.
    Gated(Arc<Notify>, Box<MockRun>),
    /// Wait a duration, then resolve the inner run.
    Delay(Duration, Box<MockRun>),
}

impl MockRun {
    pub fn reply(text: &str) -> Self {
        Self::Reply(text.to_string())
    }

    pub fn gated(gate: &Arc<Notify>, inner: MockRun) -> Self {
        Self::Gated(Arc::clone(gate), Box::new(inner))
    }

    pub fn delayed(delay: Duration, inner: MockRun) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Activity {
    running: usize,
    peak: usize,
    finished: usize,
}

type ActivityMap = Arc<Mutex<HashMap<AgentId, Activity>>>;

/// Factory that builds tasks from a script, in order. Once the script runs
/// out every task replies `done: {task description}`.
pub struct MockFactory {
    script: Mutex<VecDeque<MockRun>>,
    requests: Mutex<Vec<SpawnRequest>>,
    activity: ActivityMap,
}

impl MockFactory {
    pub fn new(script: Vec<MockRun>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            activity: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Every request seen by `create`, including rejected ones.
    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().clone()
    }

    pub fn create_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Highest number of simultaneously executing tasks seen for `agent_id`.
    pub fn peak_concurrency(&self, agent_id: &AgentId) -> usize {
        self.activity.lock().get(agent_id).map_or(0, |a| a.peak)
    }

    pub fn finished(&self, agent_id: &AgentId) -> usize {
        self.activity.lock().get(agent_id).map_or(0, |a| a.finished)
    }
}

#[async_trait]
impl AgentFactory for MockFactory {
    async fn create(&self, request: SpawnRequest) -> Result<Box<dyn AgentTask>, AgentFailure> {
        let agent_id = request.agent_id.clone();
        let echo = format!("done: {}", request.task_description);
        self.requests.lock().push(request);

        let run = self.script.lock().pop_front().unwrap_or(MockRun::Reply(echo));
        if let MockRun::RejectCreate(reason) = run {
            return Err(AgentFailure::Construction(reason));
        }
        Ok(Box::new(MockTask {
            agent_id,
            run,
            activity: Arc::clone(&self.activity),
        }))
    }
}

struct MockTask {
    agent_id: AgentId,
    run: MockRun,
    activity: ActivityMap,
}

/// Decrements the running count even if the task panics.
struct RunningGuard {
    agent_id: AgentId,
    activity: ActivityMap,
}

impl RunningGuard {
    fn enter(agent_id: AgentId, activity: ActivityMap) -> Self {
        {
            let mut map = activity.lock();
            let entry = map.entry(agent_id.clone()).or_default();
            entry.running += 1;
            entry.peak = entry.peak.max(entry.running);
        }
        Self { agent_id, activity }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.activity.lock().get_mut(&self.agent_id) {
            entry.running -= 1;
            entry.finished += 1;
        }
    }
}

#[async_trait]
impl AgentTask for MockTask {
    async fn execute(self: Box<Self>, cancel: CancellationToken) -> Result<String, AgentFailure> {
        let MockTask {
            agent_id,
            run,
            activity,
        } = *self;
        let _guard = RunningGuard::enter(agent_id, activity);

        // Unrolled iteratively to avoid recursive async.
        let mut current = run;
        loop {
            match current {
                MockRun::Reply(text) => return Ok(text),
                MockRun::Fail(reason) => return Err(AgentFailure::Failed(reason)),
                MockRun::Panic(reason) => panic!("{reason}"),
                MockRun::RejectCreate(reason) => return Err(AgentFailure::Construction(reason)),
                MockRun::UntilCancelled(partial) => {
                    cancel.cancelled().await;
                    return partial.ok_or(AgentFailure::Cancelled);
                }
                MockRun::Gated(gate, inner) => {
                    tokio::select! {
                        _ = gate.notified() => current = *inner,
                        _ = cancel.cancelled() => return Err(AgentFailure::Cancelled),
                    }
                }
                MockRun::Delay(delay, inner) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => current = *inner,
                        _ = cancel.cancelled() => return Err(AgentFailure::Cancelled),
                    }
                }
            }
        }
    }
}

/// One `queue_message` call observed by [`MockAlwaysOn`].
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedCall {
    pub content: String,
    pub priority: Priority,
    pub from: String,
}

/// Always-on agent that records what it is handed.
pub struct MockAlwaysOn {
    queued: Mutex<Vec<QueuedCall>>,
    process_calls: AtomicUsize,
    ack: String,
    failure: Option<String>,
    processed: Notify,
}

impl MockAlwaysOn {
    pub fn new(ack: &str) -> Self {
        Self {
            queued: Mutex::new(Vec::new()),
            process_calls: AtomicUsize::new(0),
            ack: ack.to_string(),
            failure: None,
            processed: Notify::new(),
        }
    }

    /// `process_queue` always fails with this reason.
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::new("")
        }
    }

    pub fn queued(&self) -> Vec<QueuedCall> {
        self.queued.lock().clone()
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    /// Resolves after the next `process_queue` call returns.
    pub async fn processed(&self) {
        self.processed.notified().await;
    }
}

#[async_trait]
impl AlwaysOnAgent for MockAlwaysOn {
    fn queue_message(&self, content: &str, priority: Priority, from: &str) {
        self.queued.lock().push(QueuedCall {
            content: content.to_string(),
            priority,
            from: from.to_string(),
        });
    }

    async fn chat_sync(&self, _content: &str) -> Result<String, AgentFailure> {
        Ok(self.ack.clone())
    }

    async fn process_queue(&self) -> Result<String, AgentFailure> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        let result = match &self.failure {
            Some(reason) => Err(AgentFailure::Failed(reason.clone())),
            None => Ok(self.ack.clone()),
        };
        self.processed.notify_one();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(task: &str) -> SpawnRequest {
        SpawnRequest {
            agent_id: AgentId::from_raw("toolbox-ea-x"),
            task_description: task.to_string(),
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn script_then_echo() {
        let factory = MockFactory::new(vec![MockRun::reply("scripted")]);
        let first = factory.create(request("a")).await.unwrap();
        assert_eq!(first.execute(CancellationToken::new()).await.unwrap(), "scripted");
        let second = factory.create(request("b")).await.unwrap();
        assert_eq!(second.execute(CancellationToken::new()).await.unwrap(), "done: b");
        assert_eq!(factory.create_count(), 2);
        assert_eq!(factory.finished(&AgentId::from_raw("toolbox-ea-x")), 2);
    }

    #[tokio::test]
    async fn reject_create_fails_construction() {
        let factory = MockFactory::new(vec![MockRun::RejectCreate("no model".into())]);
        let err = factory.create(request("a")).await.err().unwrap();
        assert_eq!(err, AgentFailure::Construction("no model".into()));
        assert_eq!(factory.create_count(), 1);
    }

    #[tokio::test]
    async fn until_cancelled_returns_partial() {
        let factory = MockFactory::new(vec![MockRun::UntilCancelled(Some("partial".into()))]);
        let task = factory.create(request("a")).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(task.execute(cancel).await.unwrap(), "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn delay_honours_cancellation() {
        let factory = MockFactory::new(vec![MockRun::delayed(
            Duration::from_secs(60),
            MockRun::reply("late"),
        )]);
        let task = factory.create(request("a")).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task.execute(cancel.clone()));
        tokio::time::advance(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Err(AgentFailure::Cancelled));
    }

    #[tokio::test]
    async fn gated_waits_for_notify() {
        let gate = Arc::new(Notify::new());
        let factory = MockFactory::new(vec![MockRun::gated(&gate, MockRun::reply("opened"))]);
        let task = factory.create(request("a")).await.unwrap();
        gate.notify_one();
        assert_eq!(task.execute(CancellationToken::new()).await.unwrap(), "opened");
    }

    #[tokio::test]
    async fn always_on_records_and_acks() {
        let agent = MockAlwaysOn::new("ok");
        agent.queue_message("hi", Priority::High, "user");
        assert_eq!(agent.process_queue().await.unwrap(), "ok");
        assert_eq!(agent.process_calls(), 1);
        assert_eq!(
            agent.queued(),
            vec![QueuedCall {
                content: "hi".into(),
                priority: Priority::High,
                from: "user".into(),
            }]
        );

        let failing = MockAlwaysOn::failing("offline");
        assert_eq!(
            failing.process_queue().await.unwrap_err(),
            AgentFailure::Failed("offline".into())
        );
    }
}

//! Redis-backed durable queue.
//!
//! Layout (compatible with RQ's key scheme):
//! - `rq:job:<id>`: hash with `func_name`, `args`, `kwargs` (JSON), `origin`,
//!   `status`, `enqueued_at`, `attempts` and, once finished, `ended_at` and
//!   `exc_info`
//! - `rq:queue:<name>`: list of job ids, pushed right, popped left
//! - `rq:queues`: set of known queue keys
//! - `rq:failed`: ids of jobs that failed for good
//!
//! This backend never runs handlers; durable workers pop jobs and resolve the
//! handler by `func_name`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RedisSettings;
use crate::domain::{Task, TaskArgs, TaskId};
use crate::error::QueueError;
use crate::ports::{BackendKind, Clock, IdGenerator, QueueBackend, SystemClock, UlidGenerator};
use crate::runtime::TaskHandler;

const JOB_KEY_PREFIX: &str = "rq:job:";
const QUEUE_KEY_PREFIX: &str = "rq:queue:";
const QUEUES_KEY: &str = "rq:queues";
const FAILED_KEY: &str = "rq:failed";

/// How often `get_task` re-checks an empty queue.
const PEEK_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn job_key(task_id: &TaskId) -> String {
    format!("{JOB_KEY_PREFIX}{task_id}")
}

fn queue_key(queue_name: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}{queue_name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// A job popped by a durable worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub task: Task,
    /// 1 on the first execution.
    pub attempt: u32,
}

fn job_fields(task: &Task) -> Result<Vec<(&'static str, String)>, QueueError> {
    Ok(vec![
        ("func_name", task.handler_name.clone()),
        ("args", serde_json::to_string(&task.args)?),
        ("kwargs", serde_json::to_string(&task.kwargs)?),
        ("origin", task.queue_name.clone()),
        ("status", JobStatus::Queued.as_str().to_string()),
        ("enqueued_at", task.enqueued_at.to_rfc3339()),
        ("attempts", "0".to_string()),
    ])
}

fn task_from_hash(task_id: &TaskId, fields: &HashMap<String, String>) -> Result<Task, QueueError> {
    let malformed = |reason: String| QueueError::MalformedJob {
        task_id: task_id.clone(),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| malformed(format!("missing `{name}`")))
    };

    let args: Vec<Value> = match fields.get("args") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Vec::new(),
    };
    let kwargs: Map<String, Value> = match fields.get("kwargs") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Map::new(),
    };
    let enqueued_at = DateTime::parse_from_rfc3339(field("enqueued_at")?)
        .map_err(|e| malformed(format!("bad `enqueued_at`: {e}")))?
        .with_timezone(&Utc);

    Ok(Task {
        id: task_id.clone(),
        handler_name: field("func_name")?.clone(),
        args,
        kwargs,
        queue_name: field("origin")?.clone(),
        enqueued_at,
    })
}

/// Durable backend over a single multiplexed Redis connection.
///
/// Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl RedisQueueBackend {
    pub async fn connect(settings: &RedisSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(settings.connection_url())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        info!(target = %settings.describe(), "connected to redis queue broker");
        Ok(Self {
            conn,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_ports(mut self, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        self.clock = clock;
        self.ids = ids;
        self
    }

    async fn load(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(job_key(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        task_from_hash(task_id, &fields).map(Some)
    }

    async fn job_exists(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(job_key(task_id)).await?)
    }

    /// Pop the next job, trying `queues` in order. Marks it started.
    ///
    /// Ids whose job hash has disappeared are dropped with a warning.
    pub async fn dequeue(&self, queues: &[String]) -> Result<Option<ClaimedJob>, QueueError> {
        let mut conn = self.conn.clone();
        for queue_name in queues {
            loop {
                let popped: Option<String> = conn.lpop(queue_key(queue_name), None).await?;
                let Some(raw_id) = popped else {
                    break;
                };
                let task_id = TaskId::from(raw_id);
                let Some(task) = self.load(&task_id).await? else {
                    warn!(task_id = %task_id, queue = %queue_name, "dropping id without job data");
                    continue;
                };

                let (attempt,): (u32,) = redis::pipe()
                    .atomic()
                    .hset(job_key(&task_id), "status", JobStatus::Started.as_str())
                    .ignore()
                    .hincr(job_key(&task_id), "attempts", 1)
                    .query_async(&mut conn)
                    .await?;

                debug!(task_id = %task_id, queue = %queue_name, attempt, "claimed job");
                return Ok(Some(ClaimedJob { task, attempt }));
            }
        }
        Ok(None)
    }

    /// Put a claimed job back at the tail of its queue.
    pub async fn requeue(&self, task: &Task) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(job_key(&task.id), "status", JobStatus::Queued.as_str())
            .ignore()
            .rpush(queue_key(&task.queue_name), task.id.as_str())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Queue names that have ever received a job, sorted.
    pub async fn queue_names(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(QUEUES_KEY).await?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(QUEUE_KEY_PREFIX))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn failed_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(FAILED_KEY).await?)
    }

    async fn finish(
        &self,
        task: &Task,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, QueueError> {
        if !self.job_exists(&task.id).await? {
            return Ok(false);
        }

        let key = job_key(&task.id);
        let mut fields = vec![
            ("status", status.as_str().to_string()),
            ("ended_at", self.clock.now().to_rfc3339()),
        ];
        if let Some(error) = error {
            fields.push(("exc_info", error.to_string()));
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .lrem(queue_key(&task.queue_name), 1, task.id.as_str())
            .ignore();
        if status == JobStatus::Failed {
            pipe.rpush(FAILED_KEY, task.id.as_str()).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(true)
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn enqueue(
        &self,
        queue_name: &str,
        handler: Arc<dyn TaskHandler>,
        args: TaskArgs,
    ) -> Result<Task, QueueError> {
        let task = Task::new(
            self.ids.generate_task_id(),
            handler.name(),
            queue_name,
            args,
            self.clock.now(),
        );
        let fields = job_fields(&task)?;
        let queue = queue_key(queue_name);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(job_key(&task.id), &fields)
            .ignore()
            .sadd(QUEUES_KEY, &queue)
            .ignore()
            .rpush(&queue, task.id.as_str())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        info!(
            task_id = %task.id,
            handler = %task.handler_name,
            queue = queue_name,
            "enqueued job"
        );
        Ok(task)
    }

    async fn get_task(
        &self,
        queue_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Task>, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let queue = queue_key(queue_name);
        loop {
            let mut conn = self.conn.clone();
            let head: Option<String> = conn.lindex(&queue, 0).await?;
            if let Some(raw_id) = head {
                let task_id = TaskId::from(raw_id);
                if let Some(task) = self.load(&task_id).await? {
                    return Ok(Some(task));
                }
                warn!(task_id = %task_id, queue = queue_name, "dropping id without job data");
                conn.lrem::<_, _, ()>(&queue, 1, task_id.as_str()).await?;
                continue;
            }

            let wait = match deadline {
                None => PEEK_POLL_INTERVAL,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining.min(PEEK_POLL_INTERVAL)
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    async fn ack(&self, task: &Task) -> Result<(), QueueError> {
        if !self.finish(task, JobStatus::Finished, None).await? {
            warn!(task_id = %task.id, "ack for unknown job ignored");
        }
        Ok(())
    }

    async fn fail(&self, task: &Task, error: &str) -> Result<(), QueueError> {
        if self.finish(task, JobStatus::Failed, Some(error)).await? {
            error!(task_id = %task.id, handler = %task.handler_name, error, "job failed");
        } else {
            warn!(task_id = %task.id, "fail for unknown job ignored");
        }
        Ok(())
    }

    async fn find_task(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        self.load(task_id).await
    }

    async fn queue_length(&self, queue_name: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(queue_key(queue_name)).await?)
    }
}

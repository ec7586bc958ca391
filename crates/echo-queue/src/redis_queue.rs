//! Redis-backed job queue.
//!
//! Key layout (under the configured namespace `ns`):
//! - `{ns}:job:{id}`  hash with the job record
//! - `{ns}:ready`     list of claimable job ids, oldest first
//! - `{ns}:leases`    sorted set of leased job ids scored by deadline (ms)
//! - `{ns}:dead`      sorted set of dead-lettered job ids scored by the time
//!                    their record expires (ms), `+inf` when kept forever
//!
//! Every state transition runs as one Lua script, so concurrent workers can
//! never both claim the same job.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use echo_models::{BlobId, Job, JobError, JobId, JobState, SynthesisPayload};

use crate::error::{QueueError, QueueResult};
use crate::queue::{lease_deadline, ClaimedJob, FailOutcome, JobQueue, Lease, QueueConfig, QueueStats};

// Shared by the claim and reclaim scripts.
// KEYS: ready, leases, dead. ARGV: now_ms, job key prefix, lease error json, retention secs.
const RECLAIM_FN: &str = r#"
local function dead_until(now, retention)
    if retention > 0 then
        return now + retention * 1000
    end
    return '+inf'
end

local function reclaim(now, prefix, err, retention)
    redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', now)
    local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
    local count = 0
    for _, id in ipairs(expired) do
        redis.call('ZREM', KEYS[2], id)
        local key = prefix .. id
        if redis.call('HGET', key, 'state') == 'processing' then
            count = count + 1
            local attempts = tonumber(redis.call('HGET', key, 'attempts'))
            local max = tonumber(redis.call('HGET', key, 'max_attempts'))
            redis.call('HSET', key, 'last_error', err, 'updated_at', now)
            redis.call('HDEL', key, 'lease_deadline', 'worker_id')
            if attempts >= max then
                redis.call('HSET', key, 'state', 'dead_lettered')
                redis.call('ZADD', KEYS[3], dead_until(now, retention), id)
                if retention > 0 then
                    redis.call('EXPIRE', key, retention)
                end
            else
                redis.call('HSET', key, 'state', 'queued')
                redis.call('RPUSH', KEYS[1], id)
            end
        end
    end
    return count
end
"#;

// ARGV (after the reclaim args): deadline_ms, worker_id.
const CLAIM_BODY: &str = r#"
local now = tonumber(ARGV[1])
reclaim(now, ARGV[2], ARGV[3], tonumber(ARGV[4]))
while true do
    local id = redis.call('LPOP', KEYS[1])
    if not id then
        return false
    end
    local key = ARGV[2] .. id
    local state = redis.call('HGET', key, 'state')
    if state == 'queued' or state == 'failed' then
        redis.call('HINCRBY', key, 'attempts', 1)
        redis.call('HSET', key, 'state', 'processing', 'lease_deadline', ARGV[5],
            'worker_id', ARGV[6], 'updated_at', now)
        redis.call('ZADD', KEYS[2], ARGV[5], id)
        return redis.call('HGETALL', key)
    end
end
"#;

const RECLAIM_BODY: &str = r#"
return reclaim(tonumber(ARGV[1]), ARGV[2], ARGV[3], tonumber(ARGV[4]))
"#;

// KEYS: job, leases. ARGV: id, attempt, blob_id, now_ms, retention secs.
// Returns -1 unknown/terminal, 0 lease lost, 1 ok.
const ACK_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state or state == 'completed' or state == 'dead_lettered' then
    return -1
end
if state ~= 'processing' or redis.call('HGET', KEYS[1], 'attempts') ~= ARGV[2] then
    return 0
end
redis.call('HSET', KEYS[1], 'state', 'completed', 'result_blob_id', ARGV[3], 'updated_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'lease_deadline', 'worker_id')
redis.call('ZREM', KEYS[2], ARGV[1])
if tonumber(ARGV[5]) > 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[5])
end
return 1
"#;

// KEYS: job, leases, ready, dead. ARGV: id, attempt, error json, now_ms, retention secs.
// Returns -1 unknown/terminal, 0 lease lost, 1 retrying, 2 dead-lettered.
const FAIL_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state or state == 'completed' or state == 'dead_lettered' then
    return -1
end
if state ~= 'processing' or redis.call('HGET', KEYS[1], 'attempts') ~= ARGV[2] then
    return 0
end
redis.call('HSET', KEYS[1], 'last_error', ARGV[3], 'updated_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'lease_deadline', 'worker_id')
redis.call('ZREM', KEYS[2], ARGV[1])
local attempts = tonumber(ARGV[2])
local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
if attempts < max then
    redis.call('HSET', KEYS[1], 'state', 'failed')
    redis.call('RPUSH', KEYS[3], ARGV[1])
    return 1
end
local retention = tonumber(ARGV[5])
redis.call('HSET', KEYS[1], 'state', 'dead_lettered')
if retention > 0 then
    redis.call('ZADD', KEYS[4], tonumber(ARGV[4]) + retention * 1000, ARGV[1])
    redis.call('EXPIRE', KEYS[1], retention)
else
    redis.call('ZADD', KEYS[4], '+inf', ARGV[1])
end
return 2
"#;

/// Job queue stored in Redis.
pub struct RedisJobQueue {
    client: redis::Client,
    config: QueueConfig,
    claim_script: Script,
    reclaim_script: Script,
    ack_script: Script,
    fail_script: Script,
}

impl RedisJobQueue {
    /// Create a queue client. Does not connect until first use.
    pub fn new(redis_url: &str, config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        info!(namespace = %config.namespace, "Configured Redis job queue");

        Ok(Self {
            client,
            config,
            claim_script: Script::new(&format!("{}{}", RECLAIM_FN, CLAIM_BODY)),
            reclaim_script: Script::new(&format!("{}{}", RECLAIM_FN, RECLAIM_BODY)),
            ack_script: Script::new(ACK_SCRIPT),
            fail_script: Script::new(FAIL_SCRIPT),
        })
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::unavailable(e.to_string()))
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.config.namespace)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}{}", self.job_prefix(), job_id)
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.config.namespace)
    }

    fn leases_key(&self) -> String {
        format!("{}:leases", self.config.namespace)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.config.namespace)
    }

    fn retention_secs(&self) -> u64 {
        self.config
            .job_retention
            .map(|d| d.as_secs().max(1))
            .unwrap_or(0)
    }

    fn reclaim_args(&self, now: DateTime<Utc>) -> QueueResult<(i64, String, String, u64)> {
        Ok((
            now.timestamp_millis(),
            self.job_prefix(),
            serde_json::to_string(&JobError::lease_expired())?,
            self.retention_secs(),
        ))
    }
}

fn job_to_fields(job: &Job) -> QueueResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("state", job.state.as_str().to_string()),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("created_at", job.created_at.timestamp_millis().to_string()),
        ("updated_at", job.updated_at.timestamp_millis().to_string()),
    ];
    if let Some(error) = &job.last_error {
        fields.push(("last_error", serde_json::to_string(error)?));
    }
    Ok(fields)
}

fn parse_millis(fields: &HashMap<String, String>, name: &str) -> QueueResult<Option<DateTime<Utc>>> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| QueueError::invalid_record(format!("bad {}: {}", name, raw))),
    }
}

fn parse_u32(fields: &HashMap<String, String>, name: &str) -> QueueResult<u32> {
    let raw = fields
        .get(name)
        .ok_or_else(|| QueueError::invalid_record(format!("missing {}", name)))?;
    raw.parse()
        .map_err(|_| QueueError::invalid_record(format!("bad {}: {}", name, raw)))
}

fn job_from_fields(fields: HashMap<String, String>) -> QueueResult<Job> {
    let id = fields
        .get("id")
        .ok_or_else(|| QueueError::invalid_record("missing id"))?;
    let payload: SynthesisPayload = serde_json::from_str(
        fields
            .get("payload")
            .ok_or_else(|| QueueError::invalid_record("missing payload"))?,
    )?;
    let state: JobState = fields
        .get("state")
        .ok_or_else(|| QueueError::invalid_record("missing state"))?
        .parse()
        .map_err(QueueError::invalid_record)?;
    let last_error = fields
        .get("last_error")
        .map(|raw| serde_json::from_str::<JobError>(raw))
        .transpose()?;
    let created_at = parse_millis(&fields, "created_at")?
        .ok_or_else(|| QueueError::invalid_record("missing created_at"))?;

    Ok(Job {
        id: JobId::from(id.as_str()),
        payload,
        state,
        attempts: parse_u32(&fields, "attempts")?,
        max_attempts: parse_u32(&fields, "max_attempts")?,
        lease_deadline: parse_millis(&fields, "lease_deadline")?,
        worker_id: fields.get("worker_id").cloned(),
        result_blob_id: fields.get("result_blob_id").map(|s| BlobId::from(s.as_str())),
        last_error,
        created_at,
        updated_at: parse_millis(&fields, "updated_at")?.unwrap_or(created_at),
    })
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, payload: SynthesisPayload) -> QueueResult<JobId> {
        let job = Job::new(payload, self.config.max_attempts);
        let fields = job_to_fields(&job)?;
        let mut conn = self.conn().await?;

        redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(&job.id), &fields)
            .ignore()
            .rpush(self.ready_key(), job.id.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                let err = QueueError::from(e);
                if err.is_unavailable() {
                    QueueError::unavailable(err.to_string())
                } else {
                    err
                }
            })?;

        debug!(job_id = %job.id, "Enqueued job");
        Ok(job.id)
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> QueueResult<Option<ClaimedJob>> {
        let now = Utc::now();
        let deadline = lease_deadline(now, lease_duration);
        let (now_ms, prefix, lease_error, retention) = self.reclaim_args(now)?;
        let mut conn = self.conn().await?;

        let fields: Option<HashMap<String, String>> = self
            .claim_script
            .key(self.ready_key())
            .key(self.leases_key())
            .key(self.dead_key())
            .arg(now_ms)
            .arg(prefix)
            .arg(lease_error)
            .arg(retention)
            .arg(deadline.timestamp_millis())
            .arg(worker_id)
            .invoke_async(&mut conn)
            .await?;

        match fields {
            Some(fields) if !fields.is_empty() => {
                let claimed = ClaimedJob::from_job(job_from_fields(fields)?)?;
                debug!(
                    job_id = %claimed.lease.job_id,
                    attempt = claimed.lease.attempt,
                    worker_id = %worker_id,
                    "Claimed job"
                );
                Ok(Some(claimed))
            }
            _ => Ok(None),
        }
    }

    async fn ack(&self, lease: &Lease, result_blob_id: &BlobId) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let code: i64 = self
            .ack_script
            .key(self.job_key(&lease.job_id))
            .key(self.leases_key())
            .arg(lease.job_id.as_str())
            .arg(lease.attempt.to_string())
            .arg(result_blob_id.as_str())
            .arg(Utc::now().timestamp_millis())
            .arg(self.retention_secs())
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => {
                debug!(job_id = %lease.job_id, blob_id = %result_blob_id, "Acked job");
                Ok(())
            }
            0 => Err(QueueError::lease_lost(lease.job_id.as_str(), lease.attempt)),
            _ => Err(QueueError::unknown_job(lease.job_id.as_str())),
        }
    }

    async fn fail(&self, lease: &Lease, error: JobError) -> QueueResult<FailOutcome> {
        let error_json = serde_json::to_string(&error)?;
        let mut conn = self.conn().await?;

        let code: i64 = self
            .fail_script
            .key(self.job_key(&lease.job_id))
            .key(self.leases_key())
            .key(self.ready_key())
            .key(self.dead_key())
            .arg(lease.job_id.as_str())
            .arg(lease.attempt.to_string())
            .arg(error_json)
            .arg(Utc::now().timestamp_millis())
            .arg(self.retention_secs())
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(FailOutcome::Retrying {
                attempts: lease.attempt,
            }),
            2 => {
                warn!(job_id = %lease.job_id, error = %error, "Job dead-lettered");
                Ok(FailOutcome::DeadLettered)
            }
            0 => Err(QueueError::lease_lost(lease.job_id.as_str(), lease.attempt)),
            _ => Err(QueueError::unknown_job(lease.job_id.as_str())),
        }
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(fields).map(Some)
    }

    async fn reclaim_expired(&self) -> QueueResult<usize> {
        let (now_ms, prefix, lease_error, retention) = self.reclaim_args(Utc::now())?;
        let mut conn = self.conn().await?;

        let count: usize = self
            .reclaim_script
            .key(self.ready_key())
            .key(self.leases_key())
            .key(self.dead_key())
            .arg(now_ms)
            .arg(prefix)
            .arg(lease_error)
            .arg(retention)
            .invoke_async(&mut conn)
            .await?;

        if count > 0 {
            info!(count, "Reclaimed expired leases");
        }
        Ok(count)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.conn().await?;
        // Dead entries past their retention are trimmed lazily by the
        // reclaim script, so only count the ones still live.
        let (queued, processing, dead_lettered): (u64, u64, u64) = redis::pipe()
            .llen(self.ready_key())
            .zcard(self.leases_key())
            .zcount(self.dead_key(), format!("({}", now_ms), "+inf")
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queued,
            processing,
            dead_lettered,
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| QueueError::unavailable(e.to_string()))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

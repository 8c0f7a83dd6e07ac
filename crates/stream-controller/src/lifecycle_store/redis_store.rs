//! Redis-backed lifecycle store.
//!
//! State lives in `stream:{id}:state` (`live` or `ended`). A Lua script
//! checks and sets the state and publishes the transition JSON on
//! [`LIFECYCLE_CHANNEL`] in one step, so only the call that moved the
//! stream notifies. Ended streams are forgotten after
//! [`ENDED_STREAM_RETENTION`].

use super::{LifecycleStore, TransitionOutcome, TransitionSubscription, SUBSCRIPTION_BUFFER};
use crate::errors::StreamControllerError;
use crate::lifecycle::{StreamState, StreamTransition};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

/// Pub/sub channel carrying applied transitions.
pub const LIFECYCLE_CHANNEL: &str = "streams.lifecycle";

/// How long an ended stream id stays blocked from going live again.
pub const ENDED_STREAM_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Check-and-set a stream's state, publishing when it moves.
///
/// KEYS[1]: `stream:{id}:state`
/// ARGV[1]: target state, `live` or `ended`
/// ARGV[2]: channel
/// ARGV[3]: transition JSON
/// ARGV[4]: ended retention in millis
///
/// Returns `applied`, `unchanged`, or the blocking state (`ended`, or
/// `unknown` for a stream that never went live).
const TRANSITION_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    return 'unchanged'
end
if ARGV[1] == 'live' then
    if current then
        return current
    end
    redis.call('SET', KEYS[1], 'live')
else
    if current ~= 'live' then
        return current or 'unknown'
    end
    redis.call('SET', KEYS[1], 'ended', 'PX', ARGV[4])
end
redis.call('PUBLISH', ARGV[2], ARGV[3])
return 'applied'
";

fn state_key(stream_id: &str) -> String {
    format!("stream:{stream_id}:state")
}

fn parse_state(raw: &str) -> Option<StreamState> {
    match raw {
        "live" => Some(StreamState::Live),
        "ended" => Some(StreamState::Ended),
        _ => None,
    }
}

fn parse_outcome(raw: &str) -> TransitionOutcome {
    match raw {
        "applied" => TransitionOutcome::Applied,
        "unchanged" => TransitionOutcome::Unchanged,
        other => TransitionOutcome::Rejected {
            from: parse_state(other),
        },
    }
}

fn store_error(context: &str, e: &redis::RedisError) -> StreamControllerError {
    StreamControllerError::LifecycleStore(format!("{context}: {e}"))
}

/// Redis-backed [`LifecycleStore`].
#[derive(Clone)]
pub struct RedisLifecycleStore {
    client: Client,
    connection: MultiplexedConnection,
    transition_script: Script,
}

impl RedisLifecycleStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// `StreamControllerError::LifecycleStore` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StreamControllerError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log redis_url, it may carry credentials
            error!(
                target: "sc.stream.lifecycle",
                error = %e,
                "Failed to open Redis client"
            );
            store_error("Failed to open Redis client", &e)
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "sc.stream.lifecycle",
                    error = %e,
                    "Failed to connect to Redis"
                );
                store_error("Failed to connect to Redis", &e)
            })?;

        Ok(Self {
            client,
            connection,
            transition_script: Script::new(TRANSITION_SCRIPT),
        })
    }
}

#[async_trait]
impl LifecycleStore for RedisLifecycleStore {
    #[instrument(skip_all, fields(stream_id = %transition.stream_id, state = transition.state.as_str()))]
    async fn transition(
        &self,
        transition: &StreamTransition,
    ) -> Result<TransitionOutcome, StreamControllerError> {
        let payload = serde_json::to_string(transition)
            .map_err(|e| StreamControllerError::LifecycleStore(format!("Encode failed: {e}")))?;
        let mut conn = self.connection.clone();

        let raw: String = self
            .transition_script
            .key(state_key(&transition.stream_id))
            .arg(transition.state.as_str())
            .arg(LIFECYCLE_CHANNEL)
            .arg(payload)
            .arg(u64::try_from(ENDED_STREAM_RETENTION.as_millis()).unwrap_or(u64::MAX))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "sc.stream.lifecycle",
                    error = %e,
                    "Lifecycle transition script failed"
                );
                store_error("Lifecycle transition failed", &e)
            })?;

        Ok(parse_outcome(&raw))
    }

    async fn state(&self, stream_id: &str) -> Result<Option<StreamState>, StreamControllerError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .get(state_key(stream_id))
            .await
            .map_err(|e| store_error("Failed to read stream state", &e))?;
        Ok(raw.as_deref().and_then(parse_state))
    }

    async fn subscribe(&self) -> Result<TransitionSubscription, StreamControllerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| store_error("Failed to open pub/sub connection", &e))?;
        pubsub
            .subscribe(LIFECYCLE_CHANNEL)
            .await
            .map_err(|e| store_error("Failed to subscribe", &e))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(
                            target: "sc.stream.lifecycle",
                            error = %e,
                            "Dropping non-text lifecycle payload"
                        );
                        continue;
                    }
                };

                match serde_json::from_str::<StreamTransition>(&payload) {
                    Ok(transition) => {
                        if tx.send(transition).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            target: "sc.stream.lifecycle",
                            error = %e,
                            "Dropping malformed lifecycle transition"
                        );
                    }
                }
            }
            debug!(
                target: "sc.stream.lifecycle",
                "Lifecycle subscription closed"
            );
        });

        Ok(rx)
    }
}

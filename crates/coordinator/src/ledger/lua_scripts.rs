//! Lua scripts for conditional membership writes.
//!
//! Hash values are `<occurred_at_ms>:<server_id>`. Both scripts compare the
//! stored timestamp with the event's and only write when the event is not
//! older, so replicas racing on the same viewer settle last-writer-wins.
//! Redis drops the hash once its last field is removed; a join also refreshes
//! an idle expiry so a stream abandoned by crashed replicas ages out.

/// Record a join.
///
/// Arguments:
/// - KEYS[1]: Membership hash (`stream:{id}:viewers`)
/// - ARGV[1]: Viewer id (hash field)
/// - ARGV[2]: Event timestamp in millis
/// - ARGV[3]: Encoded entry to store
/// - ARGV[4]: Idle expiry in millis
///
/// Returns:
/// - 1: Written
/// - 0: Skipped (newer entry exists)
/// - -1: Error (invalid timestamp)
pub const RECORD_JOIN: &str = r#"
local at = tonumber(ARGV[2])
if at == nil then
    return -1
end

local current = redis.call('HGET', KEYS[1], ARGV[1])
if current then
    local current_at = tonumber(string.match(current, '^(%-?%d+):'))
    if current_at ~= nil and current_at > at then
        return 0
    end
end

redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 1
"#;

/// Record a leave.
///
/// Arguments:
/// - KEYS[1]: Membership hash (`stream:{id}:viewers`)
/// - ARGV[1]: Viewer id (hash field)
/// - ARGV[2]: Event timestamp in millis
///
/// Returns:
/// - 1: Removed
/// - 0: Skipped (absent or newer entry exists)
/// - -1: Error (invalid timestamp)
pub const RECORD_LEAVE: &str = r#"
local at = tonumber(ARGV[2])
if at == nil then
    return -1
end

local current = redis.call('HGET', KEYS[1], ARGV[1])
if not current then
    return 0
end

local current_at = tonumber(string.match(current, '^(%-?%d+):'))
if current_at ~= nil and current_at > at then
    return 0
end

return redis.call('HDEL', KEYS[1], ARGV[1])
"#;

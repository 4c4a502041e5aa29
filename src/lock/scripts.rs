/// Lua script for extending a lock held by a specific owner
///
/// The expiry is only reset when the key still holds the caller's token, so a
/// lock that lapsed and was taken over by another owner is left alone.
///
/// KEYS[1] = the lock key
/// ARGV[1] = owner token
/// ARGV[2] = expiry (milliseconds)
///
/// Returns: 1 if extended, 0 otherwise
pub const EXTEND_SCRIPT: &str = r#"
local key = KEYS[1]
local token = ARGV[1]
local expiry = tonumber(ARGV[2])

if redis.call('GET', key) == token then
    return redis.call('PEXPIRE', key, expiry)
end

return 0
"#;

/// Lua script for releasing a lock held by a specific owner
///
/// KEYS[1] = the lock key
/// ARGV[1] = owner token
///
/// Returns: 1 if released, 0 otherwise
pub const RELEASE_SCRIPT: &str = r#"
local key = KEYS[1]
local token = ARGV[1]

if redis.call('GET', key) == token then
    return redis.call('DEL', key)
end

return 0
"#;

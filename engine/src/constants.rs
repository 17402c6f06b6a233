use std::time::Duration;

// ======= Multistream =======

/// How often the multistream logs its status line regardless of activity.
pub const STATUS_PRINT_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum spacing between status lines triggered by availability changes.
pub const STATUS_CHANGE_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Bound applied when reading an upstream height for the status line.
pub const STATUS_HEIGHT_TIMEOUT: Duration = Duration::from_millis(500);

/// Capacity of the serialized membership-event ingress channel.
pub const EVENT_INGRESS_BUFFER: usize = 64;

/// Capacity of the multicast channels (status, state events, head flux).
/// Overflow drops the oldest item, so slow subscribers lag instead of
/// blocking the emitter.
pub const BROADCAST_BUFFER: usize = 16;

/// The rotation counter of the api-source selector wraps here to stay clear
/// of sign issues in downstream consumers.
pub const ROTATION_SEED_LIMIT: u32 = (i32::MAX / 2) as u32;

// ======= Rpc upstreams =======

/// Duration between connection attempts while an upstream endpoint is down.
pub const RPC_RETRY_CONNECTION_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between head polls on a native RPC upstream.
pub const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Blocks behind the best height before a polled upstream reports LAGGING.
pub const DEFAULT_LAG_THRESHOLD: u64 = 6;

// ======= Settings environment variables =======

pub const CONFIG_ROOT: &str = "CHAINMUX_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/chainmux";

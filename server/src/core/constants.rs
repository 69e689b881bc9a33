// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "FleetDiag";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "fleetdiag";

/// Config file name
pub const CONFIG_FILE_NAME: &str = "fleetdiag.json";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "FLEETDIAG_CONFIG";

/// Environment variable for server host
pub const ENV_HOST: &str = "FLEETDIAG_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "FLEETDIAG_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "FLEETDIAG_LOG";

/// Environment variable for cluster mode (development, testing, production)
pub const ENV_CLUSTER_MODE: &str = "CLUSTER_MODE";

/// Environment variable for initial consumer count per fault family
pub const ENV_WORKERS_PER_FAMILY: &str = "WORKERS_PER_FAMILY";

/// Environment variable for the broker connection URL
pub const ENV_BROKER_URL: &str = "BROKER_URL";

/// Environment variable enabling/disabling the diagnosis cluster
pub const ENV_CLUSTER_ENABLED: &str = "CLUSTER_ENABLED";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 5580;

/// Default request body limit (1 MiB)
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

// =============================================================================
// Exit Codes
// =============================================================================

/// Clean shutdown
pub const EXIT_OK: i32 = 0;

/// Configuration error
pub const EXIT_CONFIG: i32 = 1;

/// Broker unreachable at startup
pub const EXIT_BROKER_UNREACHABLE: i32 = 2;

/// Shutdown aborted by a second signal
pub const EXIT_ABORTED: i32 = 3;

// =============================================================================
// Streams and Consumer Groups
// =============================================================================

/// Stream of ingested vehicle sensor samples
pub const STREAM_RAW: &str = "motor_raw_data";

/// Stream of per-family fault scores produced by workers
pub const STREAM_RESULTS: &str = "fault_diagnosis_results";

/// Stream of composite per-vehicle health assessments
pub const STREAM_HEALTH: &str = "vehicle_health_assessments";

/// Stream carrying throughput heartbeat sentinels
pub const STREAM_METRICS: &str = "performance_metrics";

/// Stream of worker heartbeat registrations (registry namespace)
pub const STREAM_HEARTBEATS: &str = "worker_heartbeats";

/// Stream of cluster control commands (scaling)
pub const STREAM_CONTROL: &str = "cluster_control";

/// Aggregator consumer group on the results stream
pub const GROUP_AGGREGATION: &str = "result_aggregation";

/// Bridge consumer group on the results stream
pub const GROUP_BRIDGE_FAULT: &str = "frontend_bridge_fault";

/// Bridge consumer group on the health stream
pub const GROUP_BRIDGE_HEALTH: &str = "frontend_bridge_health";

/// Coordinator consumer group on the heartbeat stream
pub const GROUP_REGISTRY: &str = "coordinator_registry";

/// Worker pool consumer group on the control stream
pub const GROUP_POOL_CONTROL: &str = "worker_pool_control";

/// Per-family consumer group prefix on the raw stream
pub const GROUP_DIAGNOSIS_PREFIX: &str = "fault_diagnosis_";

/// Default capped retention per stream (approximate trim target)
pub const DEFAULT_STREAM_MAXLEN: u64 = 100_000;

// =============================================================================
// Worker Defaults
// =============================================================================

/// Heartbeat publication interval
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Registry TTL for a worker heartbeat. Must stay above
/// `HEARTBEAT_INTERVAL_SECS * 3` to tolerate transient delays.
pub const WORKER_TTL_SECS: u64 = 15;

/// Interval between stale-pending claim scans
pub const CLAIM_INTERVAL_SECS: u64 = 5;

/// Minimum idle time before a pending message may be claimed
pub const CLAIM_MIN_IDLE_MS: u64 = WORKER_TTL_SECS * 1000;

/// Maximum messages claimed per scan
pub const CLAIM_MAX_COUNT: usize = 100;

/// Blocking read timeout for the worker loop
pub const READ_BLOCK_MS: u64 = 1000;

/// Read batch size for the worker loop
pub const READ_BATCH: usize = 16;

/// Rolling window capacity per vehicle (samples)
pub const ROLLING_WINDOW_CAP: usize = 120;

/// Rolling window maximum sample age
pub const ROLLING_WINDOW_MAX_AGE_SECS: i64 = 300;

/// Success-rate floor below which a worker reports itself degraded
pub const DEGRADED_SUCCESS_RATE: f64 = 0.90;

/// Average-latency ceiling above which a worker reports itself degraded
pub const DEGRADED_LATENCY_MS: f64 = 250.0;

// =============================================================================
// Aggregator Defaults
// =============================================================================

/// Freshness window for per-family score slots
pub const AGGREGATOR_FRESHNESS_SECS: i64 = 120;

/// Minimum interval between published assessments per vehicle
pub const AGGREGATION_INTERVAL_MS: i64 = 200;

/// Composite-score change below which no new assessment is published
pub const AGGREGATION_HYSTERESIS: f64 = 0.05;

/// Bounded ring of recent critical assessments kept for the alerts API
pub const CRITICAL_RING_CAP: usize = 256;

// =============================================================================
// Coordinator Defaults
// =============================================================================

/// Load score weight: response time
pub const LOAD_WEIGHT_RESPONSE_TIME: f64 = 0.25;
/// Load score weight: success rate
pub const LOAD_WEIGHT_SUCCESS_RATE: f64 = 0.30;
/// Load score weight: CPU utilization
pub const LOAD_WEIGHT_CPU: f64 = 0.15;
/// Load score weight: memory utilization
pub const LOAD_WEIGHT_MEM: f64 = 0.15;
/// Load score weight: queue pressure
pub const LOAD_WEIGHT_QUEUE: f64 = 0.15;

/// Latency considered fully saturated when normalizing load scores
pub const LOAD_LATENCY_CEILING_MS: f64 = 500.0;

/// Queue length considered fully saturated when normalizing load scores
pub const LOAD_QUEUE_CEILING: f64 = 100.0;

/// Pending backlog that triggers a scale-up once sustained
pub const SCALE_UP_BACKLOG: u64 = 200;

/// Pending backlog under which a scale-down becomes possible.
/// Kept at least 2x below `SCALE_UP_BACKLOG` for hysteresis.
pub const SCALE_DOWN_BACKLOG: u64 = 50;

/// Seconds the backlog must stay above the up threshold
pub const SCALE_SUSTAIN_UP_SECS: u64 = 10;

/// Seconds the backlog must stay idle before a scale-down
pub const SCALE_SUSTAIN_DOWN_SECS: u64 = 30;

/// Cooldown between scaling decisions per family
pub const SCALE_COOLDOWN_SECS: u64 = 30;

/// Average utilization under which a pool counts as idle
pub const SCALE_IDLE_UTILIZATION: f64 = 0.2;

/// Minimum consumers per fault family
pub const MIN_CONSUMERS_PER_FAMILY: usize = 1;

/// Maximum consumers per fault family
pub const MAX_CONSUMERS_PER_FAMILY: usize = 8;

/// Coordinator observation tick
pub const COORDINATOR_SCAN_INTERVAL_SECS: u64 = 5;

/// Consecutive failures before a worker id is circuit-broken
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 3;

/// Window in which consecutive failures are counted
pub const CIRCUIT_WINDOW_SECS: i64 = 60;

/// Pending depth beyond which ingest starts rejecting with Throttled
pub const PENDING_HARD_CEILING: u64 = 5000;

// =============================================================================
// Frontend Bridge Defaults
// =============================================================================

/// Session queue depth at which coalescing drops begin
pub const SESSION_QUEUE_HIGH_WATER: usize = 256;

/// Session queue depth at which the subscriber is disconnected
pub const SESSION_QUEUE_HARD_LIMIT: usize = 1024;

/// Initial replay cache entries per (vehicle, stream) key
pub const REPLAY_CACHE_INITIAL: usize = 16;

/// Replay cache floor under sustained push pressure
pub const REPLAY_CACHE_MIN: usize = 4;

/// Replay cache ceiling when the bridge is idle
pub const REPLAY_CACHE_MAX: usize = 64;

/// Push latency above which the replay cache shrinks
pub const BRIDGE_PRESSURE_LATENCY_MS: u64 = 50;

/// Window for suppressing consecutive identical-status pushes
pub const BRIDGE_DEDUP_WINDOW_MS: i64 = 2000;

// =============================================================================
// Throughput Estimator Defaults
// =============================================================================

/// Default freshness window (minutes)
pub const THROUGHPUT_DEFAULT_WINDOW_MINUTES: u32 = 60;

/// Default floor for the freshness factor
pub const THROUGHPUT_DEFAULT_MIN_FACTOR: f64 = 0.3;

/// Default decay steepness
pub const THROUGHPUT_DEFAULT_STEEPNESS: f64 = 1.0;

/// Default base-rate multiplier
pub const THROUGHPUT_DEFAULT_BASE_MULTIPLIER: f64 = 6.0;

/// Window used for the base message rate
pub const THROUGHPUT_RATE_WINDOW_SECS: i64 = 60;

/// Auto-refresh sentinel interval
pub const AUTO_REFRESH_INTERVAL_SECS: u64 = 30;

// =============================================================================
// Shutdown
// =============================================================================

/// Total budget for graceful shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

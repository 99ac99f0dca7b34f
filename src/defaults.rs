use std::time::Duration;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// Paths
pub const AGENT_CONFIG_PATH: &str = "/etc/orchestrator/config.yaml";
pub const AGENT_DATA_DIR: &str = "/var/orchestrator";
pub const AGENT_LOG_DIR: &str = "/var/orchestrator/logs";
pub const AGENT_DEBUG_LOG_DIR: &str = "/var/orchestrator/debug";
pub const REGISTRY_FILE_NAME: &str = "runtime_vnics.json";
pub const NETMON_SOCKET_PATH: &str = "/var/orchestrator/netmon.sock";
pub const ENGINE_SOCKET_PATH: &str = "/var/run/docker.sock";

pub const LOG_FILE_PREFIX: &str = "orchestrator-logs";
pub const DEBUG_LOG_FILE_PREFIX: &str = "orchestrator-debug";

// Credentials (client side of the cloud mTLS channel)
pub const MTLS_DIR: &str = ".mtls";
pub const CLIENT_KEY_FILE: &str = "client.key";
pub const CLIENT_CERT_FILE: &str = "client.crt";

// Engine naming
pub const RUNTIME_IMAGE: &str = "registry.openplc.cloud/vplc/runtime:latest";
pub const INTERNAL_NETWORK_SUFFIX: &str = "_internal";
pub const MACVLAN_NETWORK_PREFIX: &str = "macvlan_";

// Runtime container control-plane API
pub const RUNTIME_API_PORT: u16 = 8443;

// Inbound topics
pub const TOPIC_CREATE_RUNTIME: &str = "create_new_runtime";
pub const TOPIC_DELETE_DEVICE: &str = "delete_device";
pub const TOPIC_INSPECT_DEVICE: &str = "inspect_device";
pub const TOPIC_DELETE_ORCHESTRATOR: &str = "delete_orchestrator";
pub const TOPIC_RUN_COMMAND: &str = "run_command";
pub const TOPIC_CONSUMPTION_DEVICE: &str = "get_consumption_device";
pub const TOPIC_CONSUMPTION_ORCHESTRATOR: &str = "get_consumption_orchestrator";
pub const TOPIC_CONNECT: &str = "connect";
pub const TOPIC_DISCONNECT: &str = "disconnect";

// Outbound topics
pub const TOPIC_HEARTBEAT: &str = "heartbeat";

// Timing
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const NETWORK_DEBOUNCE_WINDOW: Duration = Duration::from_secs(3);
pub const ENGINE_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const SESSION_BACKOFF_MIN: Duration = Duration::from_secs(1);
pub const SESSION_BACKOFF_MAX: Duration = Duration::from_secs(5);
pub const NETMON_RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub const DEFAULT_RECONFIGURE_CONCURRENCY: usize = 4;

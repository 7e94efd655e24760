//! Configuration types for gpulet

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Script execution configuration
    pub exec: ExecConfig,
    /// GPU probe configuration
    pub gpu: GpuConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            scheduler: SchedulerConfig::default(),
            exec: ExecConfig::default(),
            gpu: GpuConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::GpuletError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::GpuletError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::GpuletError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub rest_address: String,
    /// Port for the REST API server
    pub rest_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rest_address: "0.0.0.0".to_string(),
            rest_port: 9090,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scan interval while the queue is empty, in seconds
    pub idle_interval_secs: u64,
    /// Scan interval while tasks wait for devices, in seconds
    pub retry_interval_secs: u64,
    /// Admission policy for the pending queue
    pub admission: AdmissionPolicy,
    /// Timeout applied when a submission does not name one, in seconds
    pub default_timeout_secs: u64,
    /// Number of finished tasks kept for status queries
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 1,
            retry_interval_secs: 5,
            admission: AdmissionPolicy::EarliestFit,
            default_timeout_secs: 3600,
            history_limit: 256,
        }
    }
}

/// Policy for picking the next pending task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicy {
    /// Admit the earliest-submitted task whose device request fits
    EarliestFit,
    /// Admit strictly in submission order; a blocked head blocks the queue
    StrictFifo,
}

/// Script execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Interpreter for python scripts
    pub python_path: PathBuf,
    /// Interpreter for shell scripts
    pub shell_path: PathBuf,
    /// Bytes of child output retained for diagnostics
    pub output_cap_bytes: usize,
    /// Seconds between SIGTERM and SIGKILL when winding a child down
    pub kill_grace_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            shell_path: PathBuf::from("bash"),
            output_cap_bytes: 16 * 1024,
            kill_grace_secs: 10,
        }
    }
}

/// GPU probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuConfig {
    /// Inventory source
    pub probe: ProbeKind,
    /// Device count reported by the static probe
    pub static_count: u32,
    /// Utilization percentage at or above which a device counts as busy
    pub utilization_threshold: u32,
    /// Memory-used fraction at or above which a device counts as busy
    pub memory_threshold: f64,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Nvml,
            static_count: 0,
            utilization_threshold: 10,
            memory_threshold: 0.2,
        }
    }
}

/// GPU inventory source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Query devices through NVML
    Nvml,
    /// Serve a fixed count of idle virtual devices
    Static,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.api.rest_port, 9090);
        assert_eq!(config.scheduler.idle_interval_secs, 1);
        assert_eq!(config.scheduler.retry_interval_secs, 5);
        assert_eq!(config.scheduler.default_timeout_secs, 3600);
        assert_eq!(config.exec.kill_grace_secs, 10);
        assert_eq!(config.gpu.utilization_threshold, 10);
    }

    #[test]
    fn test_daemon_config_parse() {
        let toml_str = r#"
[api]
rest_address = "127.0.0.1"
rest_port = 8080

[scheduler]
idle_interval_secs = 2
retry_interval_secs = 10
admission = "strict-fifo"
default_timeout_secs = 600
history_limit = 64

[exec]
python_path = "/usr/bin/python3"
shell_path = "/bin/bash"
output_cap_bytes = 4096
kill_grace_secs = 5

[gpu]
probe = "static"
static_count = 4
utilization_threshold = 15
memory_threshold = 0.5

[logging]
level = "debug"
format = "text"
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api.rest_port, 8080);
        assert_eq!(config.scheduler.admission, AdmissionPolicy::StrictFifo);
        assert_eq!(config.gpu.probe, ProbeKind::Static);
        assert_eq!(config.gpu.static_count, 4);
        assert_eq!(config.exec.python_path, PathBuf::from("/usr/bin/python3"));
    }

    #[test]
    fn test_admission_policy_names() {
        let json = serde_json::to_string(&AdmissionPolicy::EarliestFit).unwrap();
        assert_eq!(json, "\"earliest-fit\"");
        let back: AdmissionPolicy = serde_json::from_str("\"strict-fifo\"").unwrap();
        assert_eq!(back, AdmissionPolicy::StrictFifo);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Runtime counters reported in every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub uptime_sec: u64,
    pub sessions_opened: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub active_sessions: usize,
    pub cpu_tasks: u64,
    pub worker_respawns: u64,
    pub queued_tasks: usize,
    pub decode_errors: u64,
    pub memory_bytes: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update memory usage from system
    pub fn update_memory(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if let Some(rest) = line.strip_prefix("VmRSS:") {
                        if let Some(Ok(kb)) = rest.split_whitespace().next().map(str::parse::<u64>) {
                            self.memory_bytes = kb * 1024;
                        }
                    }
                }
            }
        }
    }

    pub fn record_session_opened(&mut self) {
        self.sessions_opened += 1;
    }

    pub fn record_session_completed(&mut self) {
        self.sessions_completed += 1;
    }

    pub fn record_session_failed(&mut self) {
        self.sessions_failed += 1;
    }

    pub fn record_cpu_task(&mut self) {
        self.cpu_tasks += 1;
    }

    pub fn record_decode_errors(&mut self, total: u64) {
        self.decode_errors = total;
    }

    /// Percentage of finished sessions that ended without error.
    pub fn success_rate(&self) -> f64 {
        let finished = self.sessions_completed + self.sessions_failed;
        if finished == 0 {
            return 100.0;
        }
        (self.sessions_completed as f64 / finished as f64) * 100.0
    }

    pub fn set_uptime(&mut self, seconds: u64) {
        self.uptime_sec = seconds;
    }

    /// Heartbeat payload: every counter plus `successRate`.
    pub fn to_heartbeat(&self) -> Result<Value, serde_json::Error> {
        let mut data = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut data {
            map.insert("successRate".into(), json!(self.success_rate()));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.uptime_sec, 0);
        assert_eq!(metrics.sessions_opened, 0);
        assert_eq!(metrics.cpu_tasks, 0);
        assert_eq!(metrics.memory_bytes, 0);
    }

    #[test]
    fn test_record_sessions() {
        let mut metrics = Metrics::new();
        metrics.record_session_opened();
        metrics.record_session_opened();
        metrics.record_session_opened();
        metrics.record_session_completed();
        metrics.record_session_completed();
        metrics.record_session_failed();

        assert_eq!(metrics.sessions_opened, 3);
        assert_eq!(metrics.sessions_completed, 2);
        assert_eq!(metrics.sessions_failed, 1);
    }

    #[test]
    fn test_success_rate_no_sessions() {
        assert_eq!(Metrics::new().success_rate(), 100.0);
    }

    #[test]
    fn test_success_rate_mixed() {
        let mut metrics = Metrics::new();
        metrics.record_session_completed();
        metrics.record_session_failed();
        assert_eq!(metrics.success_rate(), 50.0);
    }

    #[test]
    fn test_decode_errors_track_total() {
        let mut metrics = Metrics::new();
        metrics.record_decode_errors(2);
        metrics.record_decode_errors(5);
        assert_eq!(metrics.decode_errors, 5);
    }

    #[test]
    fn test_serialization_camel_case() {
        let mut metrics = Metrics::new();
        metrics.record_cpu_task();
        metrics.set_uptime(42);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["cpuTasks"], 1);
        assert_eq!(json["uptimeSec"], 42);

        let back: Metrics = serde_json::from_value(json).unwrap();
        assert_eq!(back, metrics);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_update_memory() {
        let mut metrics = Metrics::new();
        metrics.update_memory();
        assert!(metrics.memory_bytes > 0);
    }

    #[test]
    fn test_heartbeat_reports_success_rate() {
        let mut metrics = Metrics::new();
        metrics.record_session_completed();
        metrics.record_session_completed();
        metrics.record_session_completed();
        metrics.record_session_failed();
        let data = metrics.to_heartbeat().unwrap();
        assert_eq!(data["successRate"], 75.0);
        assert_eq!(data["sessionsFailed"], 1);
    }
}

use std::{collections::BTreeMap, path::PathBuf};

/// Identifies one launch of the supervised process. Written into the run record only;
/// liveness is always decided from the OS process table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProcessState {
    /// `Failed` is recoverable: it accepts the same transitions as `Stopped`.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped | Failed, Starting)
                // Adopting an instance launched by an earlier invocation.
                | (Stopped | Failed, Running)
                | (Starting, Running)
                | (Starting | Running, Failed)
                | (Stopped | Starting | Running | Failed, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Truncate,
    Append,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    #[serde(default)]
    pub log_mode: LogMode,
    #[serde(default)]
    pub readiness_port: Option<u16>,
    #[serde(default)]
    pub run_as_user: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Command-line substring identifying a running instance. Defaults to the executable path.
    #[serde(default)]
    pub signature: Option<String>,
}

impl ProcessSpec {
    pub fn signature(&self) -> String {
        self.signature
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.executable.display().to_string())
    }

    pub fn run_record_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.run.json", self.log_path.display()))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub state: ProcessState,
    /// Unknown for instances adopted without a matching run record.
    pub started_at_unix_ms: Option<u64>,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub name: String,
    pub pid: u32,
    pub started_at_unix_ms: u64,
    pub agent_version: String,
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub signature: String,
    pub state: ProcessState,
    pub pids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ProcessSpec {
        ProcessSpec {
            name: "carla".to_string(),
            executable: PathBuf::from("/opt/carla/CarlaUE4.sh"),
            args: vec!["-RenderOffScreen".to_string()],
            working_dir: PathBuf::from("/opt/carla"),
            log_path: PathBuf::from("/var/log/carla/server.log"),
            log_mode: LogMode::Truncate,
            readiness_port: Some(2000),
            run_as_user: None,
            env: BTreeMap::new(),
            signature: None,
        }
    }

    #[test]
    fn run_id_is_non_empty() {
        let id = RunId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn signature_defaults_to_executable() {
        let s = spec();
        assert_eq!(s.signature(), "/opt/carla/CarlaUE4.sh");
    }

    #[test]
    fn blank_signature_falls_back_to_executable() {
        let mut s = spec();
        s.signature = Some("   ".to_string());
        assert_eq!(s.signature(), "/opt/carla/CarlaUE4.sh");

        s.signature = Some(" CarlaUE4-Linux-Shipping ".to_string());
        assert_eq!(s.signature(), "CarlaUE4-Linux-Shipping");
    }

    #[test]
    fn run_record_sits_next_to_log() {
        assert_eq!(
            spec().run_record_path(),
            PathBuf::from("/var/log/carla/server.log.run.json")
        );
    }

    #[test]
    fn lifecycle_transitions() {
        use ProcessState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Starting.can_transition_to(Failed));

        // Failed behaves like Stopped for a new start.
        assert!(Failed.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Running));

        assert!(!Stopped.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
    }
}

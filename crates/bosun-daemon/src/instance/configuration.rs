use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::{Allocations, Limits, StopConfiguration};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub requires_rebuild: bool,
}

/// Declarative instance settings owned by the control plane. Synced as a
/// partial JSON blob; every field needs a default so a partial update can be
/// decoded over whatever is already known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfiguration {
    pub uuid: Uuid,

    #[serde(default)]
    pub suspended: bool,

    /// The startup command executed inside the container, after variable
    /// substitution by the control plane.
    #[serde(default)]
    pub invocation: String,

    /// User defined environment variables. Values arrive as arbitrary JSON
    /// scalars and are stringified when the container is built.
    #[serde(default)]
    pub environment: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub build: Limits,

    #[serde(default)]
    pub allocations: Allocations,

    #[serde(default)]
    pub container: ContainerSettings,

    #[serde(default = "default_true")]
    pub crash_detection_enabled: bool,
}

impl Default for InstanceConfiguration {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            suspended: false,
            invocation: String::new(),
            environment: HashMap::new(),
            build: Limits::default(),
            allocations: Allocations::default(),
            container: ContainerSettings::default(),
            crash_detection_enabled: true,
        }
    }
}

impl InstanceConfiguration {
    /// Disk quota in bytes; the control plane speaks MiB.
    pub fn disk_limit_bytes(&self) -> i64 {
        self.build.disk_space * 1024 * 1024
    }

    /// Applies a partial settings blob on top of the current configuration.
    /// Unknown fields are ignored, absent fields keep their current value,
    /// and the instance identity can never be rewritten.
    pub fn merge(&mut self, settings: &serde_json::Value) -> anyhow::Result<()> {
        if let Some(incoming) = settings.get("uuid").and_then(|v| v.as_str()) {
            let incoming: Uuid = incoming.parse()?;
            if !self.uuid.is_nil() && incoming != self.uuid {
                anyhow::bail!(
                    "cannot apply configuration for {incoming} to instance {}",
                    self.uuid
                );
            }
        }

        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, settings);
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}

fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(slot) if slot.is_object() && value.is_object() => {
                        merge_json(slot, value);
                    }
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Runtime process details fetched alongside the settings: how to tell the
/// instance is up, how to stop it, and which output lines mean it died.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessConfiguration {
    #[serde(default)]
    pub startup: StartupConfiguration,
    #[serde(default)]
    pub stop: Option<StopConfiguration>,
    /// Regular expressions matched against console output while running.
    #[serde(default)]
    pub crash_detection: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupConfiguration {
    /// Substrings that mark the process as fully started.
    #[serde(default)]
    pub done: Vec<String>,
    #[serde(default)]
    pub strip_ansi: bool,
}

/// Optional install recipe shipped with the instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationConfiguration {
    pub container_image: String,
    pub entrypoint: String,
    pub script: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfigurationResponse {
    pub settings: serde_json::Value,
    #[serde(default)]
    pub process_configuration: ProcessConfiguration,
    #[serde(default)]
    pub installation: Option<InstallationConfiguration>,
}

impl ServerConfigurationResponse {
    pub fn uuid(&self) -> Option<Uuid> {
        self.settings
            .get("uuid")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

// Container spec validation
// Every check here runs before any side effect; a failed spec never reaches
// the store, the sandbox or the supervisor.

use crate::config::types::{ContainerSpec, EngineError, ResourceLimits, Result, VolumeBinding};
use std::collections::HashSet;
use std::path::Component;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn into_result(self) -> Result<Self> {
        if self.is_valid() {
            for warning in &self.warnings {
                log::warn!("Spec warning: {}", warning);
            }
            Ok(self)
        } else {
            Err(EngineError::Validation(self.errors.join("; ")))
        }
    }
}

/// Validate a container spec. Name uniqueness is checked by the engine inside
/// the store transaction, where the registry is authoritative.
pub fn validate_spec(spec: &ContainerSpec) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_name(&spec.name, &mut result);
    validate_image(spec, &mut result);
    validate_limit_values(&spec.resource_limits, &mut result);
    validate_volumes(&spec.volumes, &mut result);
    validate_env(spec, &mut result);

    result.into_result()
}

/// Validate a replacement limit set on its own
pub fn validate_limits(limits: &ResourceLimits) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();
    validate_limit_values(limits, &mut result);
    result.into_result()
}

fn validate_name(name: &str, result: &mut ValidationResult) {
    if name.trim().is_empty() {
        result.add_error("name must not be empty".to_string());
        return;
    }
    if name.len() > 128 {
        result.add_error(format!("name '{}' is longer than 128 characters", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        result.add_error(format!(
            "name '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            name
        ));
    }
}

fn validate_image(spec: &ContainerSpec, result: &mut ValidationResult) {
    if spec.image.as_os_str().is_empty() {
        result.add_error("image path must not be empty".to_string());
        return;
    }
    if spec.image.file_name().is_none() {
        result.add_error(format!(
            "image path {} does not name a file",
            spec.image.display()
        ));
    }
    if !spec.image.exists() {
        // The image may be provisioned between create and start
        result.add_warning(format!(
            "image {} does not exist yet",
            spec.image.display()
        ));
    }
}

fn validate_limit_values(limits: &ResourceLimits, result: &mut ValidationResult) {
    if let Some(cpu) = limits.cpu_percent {
        let ceiling = 100 * online_cpus();
        if cpu > ceiling {
            result.add_error(format!(
                "cpu_percent {} exceeds host capacity ({}% across {} CPUs)",
                cpu,
                ceiling,
                online_cpus()
            ));
        }
    }
    if let Some(memory) = limits.memory_mb {
        if memory > u64::MAX / (1024 * 1024 * 2) {
            result.add_error(format!("memory_mb {} is out of range", memory));
        }
    }
    if limits.max_processes == Some(0) {
        result.add_warning("max_processes=0 leaves no room for the payload itself".to_string());
    }
}

fn validate_volumes(volumes: &[VolumeBinding], result: &mut ValidationResult) {
    let mut seen = HashSet::new();
    for volume in volumes {
        if !volume.host_path.is_absolute() {
            result.add_error(format!(
                "volume host path {} must be absolute",
                volume.host_path.display()
            ));
        }
        if !volume.container_path.is_absolute() {
            result.add_error(format!(
                "volume container path {} must be absolute",
                volume.container_path.display()
            ));
        }
        if volume
            .container_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            result.add_error(format!(
                "volume container path {} must not contain '..'",
                volume.container_path.display()
            ));
        }
        if volume.container_path.parent().is_none() {
            result.add_error("volume cannot be bound over the container root".to_string());
        }
        if !seen.insert(volume.container_path.clone()) {
            result.add_error(format!(
                "container path {} is bound twice",
                volume.container_path.display()
            ));
        }
    }
}

fn validate_env(spec: &ContainerSpec, result: &mut ValidationResult) {
    for (key, value) in &spec.env {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            result.add_error(format!("invalid environment variable name '{}'", key));
        }
        if value.contains('\0') {
            result.add_error(format!("environment variable '{}' contains NUL", key));
        }
    }
    for arg in &spec.args {
        if arg.contains('\0') {
            result.add_error("arguments must not contain NUL bytes".to_string());
        }
    }
}

fn online_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ContainerSpec;

    #[test]
    fn test_valid_spec() {
        let spec = ContainerSpec::new("echo-bot", "/bin/sh")
            .with_volume(VolumeBinding::parse("/tmp:/scratch").unwrap())
            .with_env("BOT_TOKEN", "abc");
        assert!(validate_spec(&spec).is_ok());
    }

    #[test]
    fn test_empty_image_rejected() {
        let spec = ContainerSpec::new("bot", "");
        assert!(matches!(
            validate_spec(&spec),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_name_rejected() {
        assert!(validate_spec(&ContainerSpec::new("", "/bin/sh")).is_err());
        assert!(validate_spec(&ContainerSpec::new("my bot", "/bin/sh")).is_err());
    }

    #[test]
    fn test_duplicate_container_path_rejected() {
        let spec = ContainerSpec::new("bot", "/bin/sh")
            .with_volume(VolumeBinding::parse("/tmp:/data").unwrap())
            .with_volume(VolumeBinding::parse("/var/tmp:/data:ro").unwrap());
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_relative_and_escaping_paths_rejected() {
        let relative = ContainerSpec::new("bot", "/bin/sh")
            .with_volume(VolumeBinding::parse("data:/data").unwrap());
        assert!(validate_spec(&relative).is_err());

        let escaping = ContainerSpec::new("bot", "/bin/sh")
            .with_volume(VolumeBinding::parse("/tmp:/data/../../etc").unwrap());
        assert!(validate_spec(&escaping).is_err());
    }

    #[test]
    fn test_cpu_beyond_host_rejected() {
        let limits = ResourceLimits {
            cpu_percent: Some(100 * online_cpus() + 1),
            ..Default::default()
        };
        assert!(validate_limits(&limits).is_err());
    }

    #[test]
    fn test_env_with_equals_rejected() {
        let spec = ContainerSpec::new("bot", "/bin/sh").with_env("A=B", "c");
        assert!(validate_spec(&spec).is_err());
    }
}

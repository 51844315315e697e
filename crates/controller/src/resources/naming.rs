use crate::crds::{Build, SourceSpec};
use kube::ResourceExt;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const POD_INFIX: &str = "-pod-";
const HASH_LENGTH: usize = 6;

/// Prefix shared by every container the compiler emits
pub const CONTAINER_PREFIX: &str = "build-step-";
pub const UNNAMED_STEP_PREFIX: &str = "unnamed-";

pub struct ResourceNaming;

impl ResourceNaming {
    /// `<build>-pod-<hash>`, stable for a given build object
    pub fn pod_name(build: &Build) -> String {
        let name = build.name_any();
        let seed = build.uid().unwrap_or_else(|| {
            format!("{}/{}", build.namespace().unwrap_or_default(), name)
        });
        let hash = &Self::hash_string(&seed)[..HASH_LENGTH];

        let available = MAX_K8S_NAME_LENGTH - POD_INFIX.len() - HASH_LENGTH;
        let base = Self::truncate(&name, available);
        format!("{base}{POD_INFIX}{hash}")
    }

    /// `build-step-<name>`, or `build-step-unnamed-<index>` for anonymous steps
    pub fn step_container_name(step_name: &str, index: usize) -> String {
        if step_name.is_empty() {
            format!("{CONTAINER_PREFIX}{UNNAMED_STEP_PREFIX}{index}")
        } else {
            format!("{CONTAINER_PREFIX}{step_name}")
        }
    }

    /// Declared step name recovered from a container name; empty for unnamed steps
    pub fn step_name_from_container(container_name: &str) -> Option<String> {
        let name = container_name.strip_prefix(CONTAINER_PREFIX)?;
        match name.strip_prefix(UNNAMED_STEP_PREFIX) {
            Some(index) if index.parse::<usize>().is_ok() => Some(String::new()),
            _ => Some(name.to_string()),
        }
    }

    /// `build-step-<kind>-source-<name|index>`
    pub fn source_container_name(kind: &str, source: &SourceSpec, index: usize) -> String {
        match source.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => format!("{CONTAINER_PREFIX}{kind}-source-{name}"),
            None => format!("{CONTAINER_PREFIX}{kind}-source-{index}"),
        }
    }

    fn truncate(name: &str, limit: usize) -> &str {
        if name.len() <= limit {
            return name;
        }
        let mut end = limit;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name[..end].trim_end_matches(['-', '.'])
    }

    fn hash_string(value: &str) -> String {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::BuildSpec;

    fn build(name: &str, uid: &str) -> Build {
        let mut build = Build::new(name, BuildSpec::default());
        build.metadata.namespace = Some("default".to_string());
        build.metadata.uid = Some(uid.to_string());
        build
    }

    #[test]
    fn pod_name_is_deterministic_and_bounded() {
        let b = build("hello", "uid-1");
        let first = ResourceNaming::pod_name(&b);
        assert_eq!(first, ResourceNaming::pod_name(&b));
        assert!(first.starts_with("hello-pod-"));
        assert_eq!(first.len(), "hello-pod-".len() + HASH_LENGTH);

        assert_ne!(first, ResourceNaming::pod_name(&build("hello", "uid-2")));

        let long = build(&"a-very-long-build-name".repeat(5), "uid-3");
        let name = ResourceNaming::pod_name(&long);
        assert!(name.len() <= MAX_K8S_NAME_LENGTH, "{name} is too long");
        assert!(!name.contains("--"));
    }

    #[test]
    fn step_names_round_trip() {
        assert_eq!(ResourceNaming::step_container_name("compile", 0), "build-step-compile");
        assert_eq!(ResourceNaming::step_container_name("", 3), "build-step-unnamed-3");
        assert_eq!(
            ResourceNaming::step_name_from_container("build-step-compile").as_deref(),
            Some("compile")
        );
        assert_eq!(
            ResourceNaming::step_name_from_container("build-step-unnamed-3").as_deref(),
            Some("")
        );
        assert_eq!(ResourceNaming::step_name_from_container("sidecar"), None);
    }

    #[test]
    fn source_names_prefer_declared_name() {
        let named = SourceSpec {
            name: Some("app".to_string()),
            ..Default::default()
        };
        assert_eq!(
            ResourceNaming::source_container_name("git", &named, 0),
            "build-step-git-source-app"
        );
        assert_eq!(
            ResourceNaming::source_container_name("gcs", &SourceSpec::default(), 1),
            "build-step-gcs-source-1"
        );
    }
}

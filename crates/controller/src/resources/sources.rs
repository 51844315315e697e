use super::naming::ResourceNaming;
use super::{with_implicit_env, with_implicit_mounts, WORKSPACE_DIR};
use crate::crds::{GcsSourceSpec, GitSourceSpec, SourceKind, SourceSpec, ValidationError};
use crate::tasks::config::ImagesConfig;
use k8s_openapi::api::core::v1::Container;

/// Init container fetching `source` into the workspace
pub fn source_container(
    source: &SourceSpec,
    index: usize,
    images: &ImagesConfig,
) -> Result<Container, ValidationError> {
    let container = match source.kind()? {
        SourceKind::Git(git) => Container {
            name: ResourceNaming::source_container_name("git", source, index),
            image: Some(images.git_init.reference()),
            args: Some(git_args(git, source.target_path.as_deref())),
            ..Default::default()
        },
        SourceKind::Gcs(gcs) => Container {
            name: ResourceNaming::source_container_name("gcs", source, index),
            image: Some(images.gcs_fetcher.reference()),
            args: Some(gcs_args(gcs, source.target_path.as_deref())),
            ..Default::default()
        },
        SourceKind::Custom(custom) => {
            if !custom.name.is_empty() {
                return Err(ValidationError::CustomSourceNamed {
                    name: custom.name.clone(),
                });
            }
            Container {
                name: ResourceNaming::source_container_name("custom", source, index),
                ..custom.clone()
            }
        }
    };

    // Sources always see the workspace root; only steps get the sub-path
    Ok(with_implicit_mounts(with_implicit_env(container), None))
}

fn git_args(git: &GitSourceSpec, target_path: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-url".to_string(),
        git.url.clone(),
        "-revision".to_string(),
        git.revision.clone(),
    ];
    if let Some(path) = target_path.filter(|p| !p.is_empty()) {
        args.extend(["-path".to_string(), path.to_string()]);
    }
    args
}

fn gcs_args(gcs: &GcsSourceSpec, target_path: Option<&str>) -> Vec<String> {
    let dest = match target_path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(path) => format!("{WORKSPACE_DIR}/{path}"),
        None => WORKSPACE_DIR.to_string(),
    };
    vec![
        "--type".to_string(),
        gcs.source_type.to_string(),
        "--location".to_string(),
        gcs.location.clone(),
        "--dest_dir".to_string(),
        dest,
    ]
}

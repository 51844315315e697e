//! Rewrites step containers to run under the step entrypoint.
//!
//! Every step's command is replaced by `/tools/entrypoint`; the original
//! command line travels in the `ENTRYPOINT_OPTIONS` env var together with
//! the marker files that chain step *i* to step *i-1*.

use super::remote::{EntrypointResolver, RegistryAuth};
use crate::tasks::types::Result;
use build_entrypoint::{EntrypointOptions, OPTIONS_ENV_VAR};
use k8s_openapi::api::core::v1::{Container, EnvVar, VolumeMount};
use tracing::debug;

pub const TOOLS_VOLUME_NAME: &str = "tools";
pub const TOOLS_MOUNT_PATH: &str = "/tools";
pub const ENTRYPOINT_BINARY: &str = "/tools/entrypoint";
pub const PROCESS_LOG_FILE: &str = "/tools/process-log.txt";
pub const MARKER_FILE: &str = "/tools/marker-file.txt";

/// Marker written once step `index` has exited
pub fn post_run_file(index: usize) -> String {
    format!("{TOOLS_MOUNT_PATH}/{index}")
}

pub fn tools_mount() -> VolumeMount {
    VolumeMount {
        name: TOOLS_VOLUME_NAME.to_string(),
        mount_path: TOOLS_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

/// Options for step `index`: wait on the previous marker, write our own
pub fn options_for_step(index: usize, command_line: Vec<String>) -> EntrypointOptions {
    EntrypointOptions {
        args: command_line,
        process_log: PROCESS_LOG_FILE.to_string(),
        marker_file: MARKER_FILE.to_string(),
        should_wait_for_prev_step: index > 0,
        pre_run_file: index.checked_sub(1).map(post_run_file).unwrap_or_default(),
        should_run_post_run: true,
        post_run_file: post_run_file(index),
    }
}

/// Rewrite `steps` in place. Steps without a command run what their image would.
pub async fn redirect_steps(
    steps: &mut [Container],
    resolver: &EntrypointResolver,
    auth: &RegistryAuth,
) -> Result<()> {
    for (index, step) in steps.iter_mut().enumerate() {
        let command = step.command.take().unwrap_or_default();
        let args = step.args.take().unwrap_or_default();
        let command_line = if command.is_empty() {
            let image = step.image.as_deref().unwrap_or_default();
            let resolved = resolver.resolve(image, auth).await?;
            debug!("Step {} uses image entrypoint {:?}", step.name, resolved);
            resolved.command_line(args)
        } else {
            command.into_iter().chain(args).collect()
        };
        let options = options_for_step(index, command_line);

        step.command = Some(vec![ENTRYPOINT_BINARY.to_string()]);
        step.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: OPTIONS_ENV_VAR.to_string(),
            value: Some(options.to_json()?),
            ..Default::default()
        });
        step.volume_mounts
            .get_or_insert_with(Vec::new)
            .push(tools_mount());
    }
    Ok(())
}

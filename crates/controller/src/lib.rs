/*
 * 5D Labs Build Platform - Kubernetes Build Execution Engine
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Build controller library
//!
//! Compiles `Build` resources into pods whose step containers run one after
//! another, tracks those pods to completion and reports the outcome in the
//! build's status.

pub mod builder;
pub mod credentials;
pub mod crds;
pub mod resources;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use builder::{Builder, ClusterBuilder, CompletionRegistry};
pub use crds::{Build, BuildSpec, BuildStatus, BuildTemplate, ClusterBuildTemplate};
pub use resources::{make_pod, steps_from_pod, EntrypointResolver};
pub use tasks::build::status::build_status_from_pod;
pub use tasks::config::ControllerConfig;
pub use tasks::template::apply_template;

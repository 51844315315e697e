/*
 * 5D Labs Build Platform - Step Entrypoint
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

use build_entrypoint::{run, EntrypointOptions};
use tracing::error;

#[tokio::main]
async fn main() {
    // Step output owns stdout; entrypoint diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let options = match EntrypointOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid entrypoint configuration: {}", e);
            std::process::exit(1);
        }
    };

    let code = match run(&options).await {
        Ok(code) => code,
        Err(e) => {
            error!("Entrypoint failed: {}", e);
            1
        }
    };

    std::process::exit(code);
}

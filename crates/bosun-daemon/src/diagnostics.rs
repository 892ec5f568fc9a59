use std::path::Path;

use crate::config::Configuration;

/// Collects a plain-text report of everything support usually asks for:
/// daemon build, host details, container engine version and the rough shape
/// of the configuration (never its secrets).
pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    println!("bosun diagnostics");
    println!("=================");
    println!("daemon version: {}", env!("CARGO_PKG_VERSION"));
    println!("os: {} ({})", std::env::consts::OS, std::env::consts::ARCH);

    if let Ok(release) = std::fs::read_to_string("/proc/version") {
        println!("kernel: {}", release.trim());
    }

    match bollard::Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.version().await {
            Ok(version) => {
                println!(
                    "docker: {} (api {})",
                    version.version.unwrap_or_else(|| "unknown".to_string()),
                    version.api_version.unwrap_or_else(|| "unknown".to_string()),
                );
            }
            Err(e) => println!("docker: unreachable ({e})"),
        },
        Err(e) => println!("docker: client error ({e})"),
    }

    match Configuration::from_file(config_path) {
        Ok(config) => {
            println!("configuration: {}", config_path.display());
            println!("  api: {}:{}", config.api.host, config.api.port);
            println!(
                "  remote: {}",
                if config.remote.base_url.is_empty() {
                    "(not configured)"
                } else {
                    &config.remote.base_url
                }
            );
            println!("  data: {}", config.system.data.display());
            println!("  log_directory: {}", config.system.log_directory.display());
            println!(
                "  disk_check_interval: {}s",
                config.system.disk_check_interval
            );
        }
        Err(e) => println!("configuration: failed to read ({e})"),
    }

    Ok(())
}

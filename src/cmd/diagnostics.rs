//! Diagnostics command - displays system and Docker information

use anyhow::Result;
use bollard::Docker;
use sysinfo::System;

use workbench_daemon::config::Configuration;
use workbench_daemon::database::Database;

/// Run diagnostics and display system information
pub async fn run() -> Result<()> {
    println!("Workbench Daemon Diagnostics");
    println!("============================\n");

    println!("System Information:");
    println!("-------------------");

    let mut sys = System::new_all();
    sys.refresh_all();

    println!(
        "  OS: {} {}",
        System::name().unwrap_or_default(),
        System::os_version().unwrap_or_default()
    );
    println!("  Kernel: {}", System::kernel_version().unwrap_or_default());
    println!("  Hostname: {}", System::host_name().unwrap_or_default());
    println!("  CPUs: {}", sys.cpus().len());
    println!("  Total Memory: {} MB", sys.total_memory() / 1024 / 1024);
    println!("  Used Memory: {} MB", sys.used_memory() / 1024 / 1024);

    println!("\nDocker Information:");
    println!("-------------------");

    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.version().await {
            Ok(version) => {
                println!("  Version: {}", version.version.unwrap_or_default());
                println!("  API Version: {}", version.api_version.unwrap_or_default());
                println!(
                    "  OS/Arch: {}/{}",
                    version.os.unwrap_or_default(),
                    version.arch.unwrap_or_default()
                );
            }
            Err(e) => {
                println!("  Error getting version: {}", e);
            }
        },
        Err(e) => {
            println!("  Error connecting to Docker: {}", e);
            println!("  Make sure Docker is running and accessible.");
        }
    }

    println!("\nState Database:");
    println!("---------------");

    let config = Configuration::from_env();
    println!("  Path: {}", config.state_db);
    match Database::open(&config.state_db) {
        Ok(db) => {
            let conn = db.conn().await;
            match db.containers.list(&conn, true) {
                Ok(containers) => println!("  Containers on record: {}", containers.len()),
                Err(e) => println!("  Error listing containers: {}", e),
            }
        }
        Err(e) => println!("  Error opening database: {}", e),
    }

    println!("\nDiagnostics complete.");
    Ok(())
}

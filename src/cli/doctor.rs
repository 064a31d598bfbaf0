use std::path::Path;
use std::time::Duration;

use harbor_core::resolve_executable;
use tokio::process::Command;

use crate::server::config::AppConfig;
use crate::server::{load_config, user_config_path};

pub async fn run() -> anyhow::Result<()> {
    println!("🩺 Harbor Doctor\n");

    let mut all_ok = true;

    check_env_file();
    check_user_config();
    let config = match check_config() {
        Some(config) => config,
        None => {
            println!("\n⚠️  Configuration is invalid. Fix it before running other checks.");
            std::process::exit(1);
        }
    };
    all_ok &= check_binary(&config).await;
    all_ok &= check_listen_address(&config).await;

    println!();
    if all_ok {
        println!("✅ All checks passed! Ready to run Harbor.");
    } else {
        println!("⚠️  Some checks failed. Please fix the issues above.");
        std::process::exit(1);
    }

    Ok(())
}

fn check_env_file() {
    print!("Checking .env file... ");
    if Path::new(".env").exists() {
        println!("✅ Found");
    } else {
        println!("ℹ️  Not found (optional)");
    }
}

fn check_user_config() {
    print!("Checking user config... ");
    match user_config_path() {
        Some(path) if path.exists() => println!("✅ {}", path.display()),
        Some(path) => println!("ℹ️  {} not found (optional)", path.display()),
        None => println!("ℹ️  No config directory on this platform"),
    }
}

fn check_config() -> Option<AppConfig> {
    print!("Loading configuration... ");
    match load_config() {
        Ok(config) => {
            println!("✅ OK");
            Some(config)
        }
        Err(e) => {
            println!("❌ {:#}", e);
            None
        }
    }
}

async fn check_binary(config: &AppConfig) -> bool {
    let binary = config.instances.default_binary();
    print!("Resolving {} ({})... ", binary.label, binary.path.display());

    let path = match resolve_executable(&binary.path) {
        Ok(path) => path,
        Err(e) => {
            println!("❌ {}", e);
            println!("  Install it or set HARBOR_INSTANCES__BINARY to its path");
            return false;
        }
    };
    println!("✅ {}", path.display());

    if let Some(version) = &binary.version {
        println!("  ℹ️  Configured version: {}", version);
        return true;
    }

    print!("  Checking version... ");
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new(&path).arg("--version").kill_on_drop(true).output(),
    )
    .await;
    match output {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            println!("✅ {}", version.trim());
        }
        Ok(Ok(output)) => println!("⚠️  exited with {}", output.status),
        Ok(Err(e)) => println!("⚠️  {}", e),
        Err(_) => println!("⚠️  timed out"),
    }
    true
}

async fn check_listen_address(config: &AppConfig) -> bool {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    print!("Checking {} is free... ", addr);
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(_) => {
            println!("✅ Available");
            true
        }
        Err(e) => {
            println!("❌ {}", e);
            println!("  Another Harbor may be running; change HARBOR_SERVER__PORT");
            false
        }
    }
}

//! `keymirror check`: validate the configuration and summarize it.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use keymirror_core::{Config, EtcdCredentials};

use super::load_config;

/// Arguments for `keymirror check`.
#[derive(Args, Debug)]
pub struct CheckArgs {}

impl CheckArgs {
    pub fn run(self, config_path: &Path) -> Result<()> {
        let config = load_config(config_path)?;
        println!(
            "{} {}",
            "Configuration OK:".green().bold(),
            config_path.display()
        );
        print_summary(&config);
        Ok(())
    }
}

fn print_summary(config: &Config) {
    let fs = &config.filesystem;
    let etcd = &config.etcd_client;

    println!(
        "  mirror:   {} (files {}, directories {})",
        fs.slash_path,
        fs.files_permission,
        fs.directories_permission
    );
    println!("  prefix:   {}", etcd.prefix);
    println!("  etcd:     {}", etcd.endpoints.join(", "));
    let auth = match etcd.credentials() {
        EtcdCredentials::ClientCert { .. } => "client certificate".to_string(),
        EtcdCredentials::Password { username, .. } => format!("password ({username})"),
    };
    println!("  auth:     {auth}");

    if config.grpc_notifications.is_empty() {
        println!("  notify:   none");
    }
    for target in &config.grpc_notifications {
        let filter = if target.filter.is_empty() {
            "*"
        } else {
            target.filter.as_str()
        };
        println!(
            "  notify:   {} filter={} trim_key_path={} tls={} max_chunk_size={}",
            target.endpoint,
            filter,
            target.trim_key_path,
            target.uses_tls(),
            target.max_chunk_size
        );
    }

    if config.notification_command.is_empty() {
        println!("  command:  none");
    } else {
        println!(
            "  command:  {} (retries {})",
            config.notification_command.join(" "),
            config.notification_command_retries
        );
    }
}

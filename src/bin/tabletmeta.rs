// Copyright 2023 The TabletMeta Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tabletmeta::cluster::{CoordinationLayout, Coordinator, EtcdCoordinator};
use tabletmeta::metadata::{CoordinationBackend, Extent, TabletStateBackend};
use tabletmeta::retry::RetryPolicy;
use tabletmeta::service_uri::ServiceUri;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints write-ahead logs recorded for root tablet.
    RootLogs,
    /// Prints address of server hosting root tablet.
    RootLocation,
    /// Prints files in root tablet directory.
    RootFiles,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Coordination service uri, e.g. etcd://etcd-cluster/tabletmeta.
    #[arg(long = "cluster.uri")]
    cluster_uri: String,
    /// Root path of this instance in coordination service.
    #[arg(long = "cluster.root", default_value = "/tabletmeta")]
    cluster_root: String,
    /// Filesystem holding tablet files, e.g. hdfs://namenode:9000/tabletmeta.
    #[arg(long = "fs.uri", default_value = "memory://files")]
    fs_uri: String,
    /// Directory of root tablet files in filesystem.
    #[arg(long = "fs.root-tablet-dir", default_value = "/!0/root_tablet")]
    root_tablet_dir: String,
    /// Backoff between retries of failed requests, in milliseconds.
    #[arg(long = "retry.backoff-ms", default_value_t = 1000)]
    retry_backoff_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_level(true).with_file(true).with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cluster_uri: ServiceUri = args.cluster_uri.parse()?;
    let fs_uri: ServiceUri = args.fs_uri.parse()?;

    let coordinator: Arc<dyn Coordinator> = Arc::new(EtcdCoordinator::connect(&cluster_uri).await?);
    let fs = tabletmeta::fs::open(fs_uri)?;
    let policy = RetryPolicy::default().with_backoff(Duration::from_millis(args.retry_backoff_ms));
    let layout = CoordinationLayout::new(args.cluster_root.as_str());
    info!("inspecting root tablet under {}", layout.root());
    let backend = CoordinationBackend::new(coordinator.clone(), layout, fs, args.root_tablet_dir, policy);

    match args.command {
        Command::RootLogs => {
            for entry in backend.log_entries(&Extent::root()).await? {
                println!("{} {} {}", entry.timestamp, entry.name(), entry.log_set.join(";"));
            }
        },
        Command::RootLocation => {
            let path = backend.layout().root_tablet_location();
            match coordinator.get_data(&path).await? {
                None => println!("root tablet is not hosted"),
                Some(data) => println!("{}", String::from_utf8_lossy(&data)),
            }
        },
        Command::RootFiles => {
            for (path, value) in backend.root_files().await? {
                println!("{path} {} {}", value.size(), value.entries());
            }
        },
    }
    Ok(())
}

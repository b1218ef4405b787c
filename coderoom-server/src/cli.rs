//! Command-line arguments and their mapping onto [`ServerConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use coderoom_collab::server::{ServerConfig, StorageBackend, DEFAULT_PORT};
use coderoom_collab::store::{StoreOptions, WriteOrdering, PLACEHOLDER_BODY};

#[derive(Parser, Debug)]
#[command(
    name = "coderoom",
    version,
    about = "Room-based live code sharing server"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the WebSocket server
    Serve(ServeArgs),

    /// List stored rooms, or show one room's snapshot
    Inspect {
        /// Room to show; all stored rooms when omitted
        room: Option<String>,

        /// Print the full body instead of its length
        #[arg(long)]
        body: bool,
    },

    /// Overwrite a room's stored body
    Reset {
        room: String,

        /// New body; the placeholder when omitted
        code: Option<String>,

        /// Read the new body from a file
        #[arg(long, conflicts_with = "code")]
        file: Option<PathBuf>,
    },

    /// Delete expired entries from the RocksDB store
    Purge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    Memory,
    Rocksdb,
    Disabled,
}

#[derive(Args, Debug)]
pub struct StorageArgs {
    /// Persistence backend
    #[arg(long, global = true, value_enum, default_value = "rocksdb", env = "CODEROOM_STORAGE")]
    pub storage: StorageKind,

    /// RocksDB directory
    #[arg(long, global = true, default_value = "coderoom-data", env = "CODEROOM_DATA")]
    pub data_dir: PathBuf,
}

impl StorageArgs {
    pub fn backend(&self) -> StorageBackend {
        match self.storage {
            StorageKind::Memory => StorageBackend::Memory,
            StorageKind::Rocksdb => StorageBackend::RocksDb {
                path: self.data_dir.clone(),
            },
            StorageKind::Disabled => StorageBackend::Disabled,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0", env = "CODEROOM_BIND")]
    pub bind: String,

    /// Port to listen on
    #[arg(long, short, default_value_t = DEFAULT_PORT, env = "PORT")]
    pub port: u16,

    /// Hours a snapshot survives without writes
    #[arg(long, default_value_t = 24)]
    pub ttl_hours: u64,

    /// Body served for empty rooms
    #[arg(long, default_value = PLACEHOLDER_BODY)]
    pub placeholder: String,

    /// Serialize snapshot writes per room
    #[arg(long)]
    pub serialize_writes: bool,

    /// Do not ask existing members for their buffer when someone joins
    #[arg(long)]
    pub no_peer_snapshot: bool,

    /// Outbound frames buffered per connection
    #[arg(long, default_value_t = 256)]
    pub outbound_capacity: usize,
}

impl ServeArgs {
    pub fn to_config(&self, storage: &StorageArgs) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.bind, self.port),
            outbound_capacity: self.outbound_capacity.max(1),
            storage: storage.backend(),
            store: StoreOptions {
                ttl: Duration::from_secs(self.ttl_hours.saturating_mul(60 * 60)),
                placeholder: self.placeholder.clone(),
                write_ordering: if self.serialize_writes {
                    WriteOrdering::Serialized
                } else {
                    WriteOrdering::Racy
                },
            },
            request_peer_snapshot: !self.no_peer_snapshot,
            ..ServerConfig::default()
        }
    }
}

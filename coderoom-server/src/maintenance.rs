//! Offline room maintenance against the persistent store.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use coderoom_collab::storage::{RocksConfig, RocksGateway};
use coderoom_collab::store::{StoreOptions, StoredRoom, VersionedDocumentStore};

use crate::cli::{StorageArgs, StorageKind};

/// Open the RocksDB store named by the storage flags.
pub fn open_gateway(storage: &StorageArgs) -> anyhow::Result<Arc<RocksGateway>> {
    if storage.storage != StorageKind::Rocksdb {
        bail!("maintenance commands need --storage rocksdb");
    }
    let gateway = RocksGateway::open(RocksConfig::at(storage.data_dir.clone()))
        .with_context(|| format!("opening store at {}", storage.data_dir.display()))?;
    Ok(Arc::new(gateway))
}

pub async fn inspect(
    store: &VersionedDocumentStore,
    room: Option<&str>,
    show_body: bool,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match room {
        Some(room) => {
            let stored = store.inspect(room).await?;
            if stored.body.is_none() {
                bail!("room {room} has no stored body");
            }
            print_room(&stored, show_body, out)?;
        }
        None => {
            let rooms = store.stored_rooms().await?;
            if rooms.is_empty() {
                writeln!(out, "no stored rooms")?;
            }
            for room in rooms {
                let stored = store.inspect(&room).await?;
                print_room(&stored, false, out)?;
            }
        }
    }
    Ok(())
}

fn print_room(room: &StoredRoom, show_body: bool, out: &mut impl Write) -> anyhow::Result<()> {
    let body = room.body.as_deref().unwrap_or_default();
    writeln!(
        out,
        "{}\tv{}\t{}\t{} chars",
        room.room_id,
        room.version.map_or_else(|| "?".to_string(), |v| v.to_string()),
        room.language.as_deref().unwrap_or("-"),
        body.chars().count()
    )?;
    if show_body {
        writeln!(out, "{body}")?;
    }
    Ok(())
}

/// Overwrite a room's body; returns the new version.
pub async fn reset(
    store: &VersionedDocumentStore,
    room: &str,
    code: Option<String>,
    file: Option<&Path>,
) -> anyhow::Result<u64> {
    let body = match (code, file) {
        (Some(code), _) => code,
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => store.placeholder().to_string(),
    };
    let version = store.reset(room, &body).await?;
    log::info!("Room {room} reset to v{version} ({} bytes)", body.len());
    Ok(version)
}

pub fn store_over(gateway: Arc<RocksGateway>) -> VersionedDocumentStore {
    VersionedDocumentStore::new(gateway, StoreOptions::default())
}

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use gantry_common::types::{ByteRange, ByteStream, DiskUsage, HealthStatus, KeyContext};
use sysinfo::Disks;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, Take};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DriverError, DriverResult};
use crate::traits::{DataDriver, ExactSizeStream};

pub const FILE_BACKEND_NAME: &str = "file";

const TMP_DIR_NAME: &str = ".gantry.tmp";
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Blobs as flat files under one directory, named by random UUID keys.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root_dir: PathBuf,
}

impl FileBackend {
    pub async fn new(root_dir: PathBuf) -> DriverResult<Self> {
        fs::create_dir_all(&root_dir).await?;
        fs::create_dir_all(root_dir.join(TMP_DIR_NAME)).await?;
        Ok(Self { root_dir })
    }

    fn object_path(&self, key: &str) -> DriverResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root_dir.join(key))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(TMP_DIR_NAME).join(key)
    }

    async fn write_tmp(&self, tmp_path: &Path, stream: ByteStream, size: u64) -> DriverResult<()> {
        let mut file = fs::File::create(tmp_path).await?;
        let mut body = ExactSizeStream::new(stream, size);
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl DataDriver for FileBackend {
    fn name(&self) -> &str {
        FILE_BACKEND_NAME
    }

    async fn put(
        &self,
        stream: ByteStream,
        size: u64,
        _ctx: &KeyContext,
        request_id: &str,
    ) -> DriverResult<String> {
        let key = Uuid::new_v4().simple().to_string();
        let tmp_path = self.tmp_path(&key);

        if let Err(err) = self.write_tmp(&tmp_path, stream, size).await {
            if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                warn!(request_id, path = %tmp_path.display(), error = %cleanup, "failed to remove partial upload");
            }
            return Err(err);
        }

        fs::rename(&tmp_path, self.object_path(&key)?).await?;
        debug!(request_id, key = %key, size, "stored object on disk");
        Ok(key)
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        _request_id: &str,
    ) -> DriverResult<ByteStream> {
        let path = self.object_path(key)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|err| map_key_io_error(key, err))?;
        let size = file.metadata().await?.len();

        let (start, len) = match range {
            None => (0, size),
            Some(range) => match range.clamp_to(size) {
                Some(range) => (range.start, range.len()),
                None => return Ok(stream::empty::<std::io::Result<Bytes>>().boxed()),
            },
        };
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }

        Ok(stream::try_unfold(file.take(len), read_chunk).boxed())
    }

    async fn delete(&self, key: &str, _request_id: &str) -> DriverResult<()> {
        let path = self.object_path(key)?;
        fs::remove_file(path)
            .await
            .map_err(|err| map_key_io_error(key, err))
    }

    async fn healthcheck(&self, _request_id: &str) -> HealthStatus {
        match fs::metadata(&self.root_dir).await {
            Ok(metadata) if metadata.is_dir() => HealthStatus::ok(),
            Ok(_) => HealthStatus::error(format!(
                "{} is not a directory",
                self.root_dir.display()
            )),
            Err(err) => HealthStatus::error(err.to_string()),
        }
    }

    async fn disk_usage(&self, _request_id: &str) -> DriverResult<Option<DiskUsage>> {
        let root = fs::canonicalize(&self.root_dir).await?;
        let usage = tokio::task::spawn_blocking(move || disk_usage_for(&root))
            .await
            .map_err(std::io::Error::other)?;
        Ok(usage)
    }
}

async fn read_chunk(mut reader: Take<fs::File>) -> std::io::Result<Option<(Bytes, Take<fs::File>)>> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    if reader.read_buf(&mut buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some((buf.freeze(), reader)))
}

/// Usage of the disk whose mount point is the longest prefix of `path`.
fn disk_usage_for(path: &Path) -> Option<DiskUsage> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| {
            // sysinfo reports only the space available to unprivileged
            // users, so reserved blocks are not counted as free
            let available = disk.available_space();
            DiskUsage {
                total: disk.total_space(),
                free: available,
                available,
            }
        })
}

fn validate_key(key: &str) -> DriverResult<()> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(DriverError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn map_key_io_error(key: &str, err: std::io::Error) -> DriverError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DriverError::NotFound(key.to_string())
    } else {
        DriverError::Io(err)
    }
}

//! File transfer over a borrowed connection

use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::transport::{Connection, Upload};
use crate::{Error, SshResult, TransportError};

/// Copy local files into `remote_dir`
///
/// # Arguments
///
/// * `local_paths` - Files to copy
/// * `remote_names` - Names to create remotely, one per local file; defaults
///   to each local file name
/// * `remote_dir` - Target directory, empty for the remote default
/// * `mode` - Four octal digits, e.g. `0644`
pub async fn copy_files(
    connection: &dyn Connection,
    local_paths: &[PathBuf],
    remote_names: Option<&[String]>,
    remote_dir: &str,
    mode: &str,
) -> SshResult {
    let result = match build_uploads(local_paths, remote_names, mode).await {
        Ok(uploads) => put(connection, uploads, remote_dir, mode).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            debug!(host = %connection.host(), files = local_paths.len(), remote_dir, "Copied files");
            SshResult::ok()
        }
        Err(e) => {
            error!(
                host = %connection.host(),
                local = ?local_paths,
                remote = ?remote_names,
                remote_dir,
                error = %e,
                "Failed to copy files"
            );
            SshResult::failure(Error::Transfer(e))
        }
    }
}

/// Copy an in-memory buffer to `remote_dir/remote_name` with mode `0600`
pub async fn copy_bytes(
    connection: &dyn Connection,
    data: &[u8],
    remote_name: &str,
    remote_dir: &str,
) -> SshResult {
    let upload = Upload {
        remote_name: remote_name.to_string(),
        data: data.to_vec(),
    };

    match put(connection, vec![upload], remote_dir, crate::config::DEFAULT_BYTES_MODE).await {
        Ok(()) => {
            debug!(host = %connection.host(), remote_name, remote_dir, bytes = data.len(), "Copied bytes");
            SshResult::ok()
        }
        Err(e) => {
            error!(
                host = %connection.host(),
                remote_name,
                remote_dir,
                error = %e,
                "Failed to copy bytes"
            );
            SshResult::failure(Error::Transfer(e))
        }
    }
}

async fn put(
    connection: &dyn Connection,
    uploads: Vec<Upload>,
    remote_dir: &str,
    mode: &str,
) -> Result<(), TransportError> {
    let mut client = connection.transfer_client().await?;
    client.put(uploads, remote_dir, mode).await
}

async fn build_uploads(
    local_paths: &[PathBuf],
    remote_names: Option<&[String]>,
    mode: &str,
) -> Result<Vec<Upload>, TransportError> {
    validate_mode(mode)?;

    if let Some(names) = remote_names {
        if names.len() != local_paths.len() {
            return Err(TransportError::InvalidArgument(format!(
                "{} remote names given for {} local files",
                names.len(),
                local_paths.len()
            )));
        }
    }

    let mut uploads = Vec::with_capacity(local_paths.len());
    for (i, path) in local_paths.iter().enumerate() {
        let remote_name = match remote_names {
            Some(names) => names[i].clone(),
            None => file_name(path)?,
        };
        let data = tokio::fs::read(path).await?;
        uploads.push(Upload { remote_name, data });
    }
    Ok(uploads)
}

fn file_name(path: &Path) -> Result<String, TransportError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            TransportError::InvalidArgument(format!("{} has no file name", path.display()))
        })
}

/// Modes are exactly four octal digits
pub fn validate_mode(mode: &str) -> Result<(), TransportError> {
    if mode.len() == 4 && mode.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        Ok(())
    } else {
        Err(TransportError::InvalidArgument(format!(
            "invalid mode '{}', expected four octal digits",
            mode
        )))
    }
}

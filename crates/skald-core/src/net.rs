//! Blocking HTTP adapter shared by grabbers and the downloader.
//!
//! One client per handle: common user-agent, common timeouts. Downloads land
//! in a `.part` temp file first and are renamed into place only when
//! complete, so an aborted fetch never leaves a half-written artwork behind.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{Result, SkaldError};

const CHUNK_SIZE: usize = 8192;

pub struct HttpClient {
    client: reqwest::blocking::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(NetworkConfig::REQUEST_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| SkaldError::Network {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(e),
            })?;
        Ok(Self { client })
    }

    /// GET a JSON document.
    pub fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| SkaldError::Network {
                message: format!("request failed: {e}"),
                source: Some(e),
            })?;
        response.json().map_err(|e| SkaldError::Network {
            message: format!("invalid JSON payload: {e}"),
            source: Some(e),
        })
    }

    /// Fetch `url` into `dest`. Cancellation is honoured between chunks; a
    /// cancelled fetch removes its temp file and reports `Cancelled`.
    pub fn save_to_disk(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if dest.exists() {
            debug!(dest = %dest.display(), "destination already present");
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SkaldError::Io {
                message: format!("cannot create download directory: {e}"),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let mut response = self
            .client
            .get(url)
            .timeout(NetworkConfig::DOWNLOAD_REQUEST_TIMEOUT)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| SkaldError::Download {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let tmp_path = {
            let mut name = dest.as_os_str().to_os_string();
            name.push(NetworkConfig::DOWNLOAD_TEMP_SUFFIX);
            std::path::PathBuf::from(name)
        };

        let result = (|| -> Result<()> {
            let mut tmp = File::create(&tmp_path)?;
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                cancel.check()?;
                let n = response.read(&mut buf).map_err(|e| SkaldError::Download {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;
                if n == 0 {
                    break;
                }
                tmp.write_all(&buf[..n])?;
            }
            tmp.flush()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                std::fs::rename(&tmp_path, dest)?;
                debug!(url, dest = %dest.display(), "saved");
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&tmp_path) {
                    warn!(tmp = %tmp_path.display(), "cannot remove temp file: {rm}");
                }
                Err(e)
            }
        }
    }
}

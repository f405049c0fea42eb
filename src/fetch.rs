//! Model file resolution and download from the DeepCell data portal.

use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;

use crate::credentials::{AccessToken, ModelSection};
use crate::errors::{MaskError, Result};

/// Endpoint that exchanges an asset key for a download URL.
pub const PORTAL_URL: &str = "https://users.deepcell.org/api/getData/";

/// Where the model file comes from, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A local file given on the command line or as `MODEL.PATH`.
    File(PathBuf),
    /// A portal asset, cached after the first download.
    Asset(String),
}

impl ModelSource {
    /// `--model-path` > `MODEL.PATH` > `MODEL.ASSET`.
    ///
    /// The portal only publishes Mesmer as a TensorFlow SavedModel, so there
    /// is no asset to fall back to when none of the three is set.
    pub fn resolve(cli_path: Option<&Path>, section: &ModelSection) -> Result<Self> {
        if let Some(path) = cli_path {
            return Ok(Self::File(path.to_path_buf()));
        }
        if let Some(path) = &section.path {
            return Ok(Self::File(path.clone()));
        }
        match &section.asset {
            Some(asset) if !asset.trim().is_empty() => Ok(Self::Asset(asset.clone())),
            _ => Err(MaskError::invalid_configuration(
                "no Mesmer ONNX model configured; pass --model-path, or set MODEL.PATH or \
                 MODEL.ASSET in the config file",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PortalAsset {
    url: String,
    size: Option<u64>,
}

/// Manages the model cache directory and downloads.
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Uses `<platform cache dir>/pymask/models`, falling back to `./.pymask/models`.
    pub fn new() -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .map(|base| base.join("pymask"))
            .unwrap_or_else(|| PathBuf::from(".pymask"))
            .join("models");
        Self::in_dir(cache_dir)
    }

    pub fn in_dir(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| MaskError::FileSystem {
            path: cache_dir.clone(),
            operation: "create model cache directory".to_string(),
            source: e,
        })?;
        Ok(Self { cache_dir })
    }

    /// Cache location of `asset`: its last path segment inside the cache.
    pub fn cached_path(&self, asset: &str) -> PathBuf {
        let name = asset.rsplit('/').find(|s| !s.is_empty()).unwrap_or(asset);
        self.cache_dir.join(name)
    }

    /// Returns a local path for `source`, downloading the asset if needed.
    pub fn model_path(&self, source: &ModelSource, token: &AccessToken) -> Result<PathBuf> {
        match source {
            ModelSource::File(path) => {
                if !path.is_file() {
                    return Err(MaskError::file_not_found("Model file", path));
                }
                Ok(path.clone())
            }
            ModelSource::Asset(asset) => {
                let path = self.cached_path(asset);
                if path.is_file() {
                    tracing::debug!(path = %path.display(), "using cached model");
                } else {
                    download_asset(asset, &path, token)?;
                }
                Ok(path)
            }
        }
    }
}

fn download_error(asset: &str) -> impl FnOnce(reqwest::Error) -> MaskError + '_ {
    move |e| MaskError::Download {
        asset: asset.to_string(),
        source: Box::new(e),
    }
}

/// Asks the portal for a signed URL, then streams the file to `path`.
fn download_asset(asset: &str, path: &Path, token: &AccessToken) -> Result<()> {
    tracing::info!("Downloading model {asset}");

    let client = reqwest::blocking::Client::new();
    let response = client
        .post(PORTAL_URL)
        .header("X-Api-Key", token.expose())
        .form(&[("s3_key", asset)])
        .send()
        .map_err(download_error(asset))?;

    if response.status() == reqwest::StatusCode::FORBIDDEN {
        return Err(MaskError::Download {
            asset: asset.to_string(),
            source: "the access token was rejected by the DeepCell portal".into(),
        });
    }
    let located: PortalAsset = response
        .error_for_status()
        .and_then(|r| r.json())
        .map_err(download_error(asset))?;

    let mut response = client
        .get(&located.url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(download_error(asset))?;

    let total_size = response.content_length().or(located.size).unwrap_or(0);
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .map_err(|e| MaskError::Download {
                asset: asset.to_string(),
                source: Box::new(e),
            })?
            .progress_chars("#>-"),
    );

    // a partial download must never sit at the cached path
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(dir)
        .map_err(|e| MaskError::FileSystem {
            path: dir.to_path_buf(),
            operation: "create temporary download file".to_string(),
            source: e,
        })?;
    let copied = {
        let mut writer = pb.wrap_write(temp.as_file_mut());
        std::io::copy(&mut response, &mut writer)
    };
    copied.map_err(|e| MaskError::FileSystem {
        path: temp.path().to_path_buf(),
        operation: "write model download".to_string(),
        source: e,
    })?;
    pb.finish_and_clear();

    temp.persist(path).map_err(|e| MaskError::FileSystem {
        path: path.to_path_buf(),
        operation: "move model into cache".to_string(),
        source: e.error,
    })?;
    tracing::info!(path = %path.display(), "cached model");

    Ok(())
}

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};
use sha2::{Digest, Sha256};

const PUBLISH_RETRY_ATTEMPTS_DEFAULT: usize = 5;
const PUBLISH_RETRY_DELAY_MS_DEFAULT: u64 = 5;

/// Fixed-delay bounded retry for the final rename.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: PUBLISH_RETRY_ATTEMPTS_DEFAULT,
            delay: Duration::from_millis(PUBLISH_RETRY_DELAY_MS_DEFAULT),
        }
    }
}

#[derive(Debug)]
pub struct RenameOutcome {
    pub attempts: usize,
    pub error: Option<io::Error>,
}

impl RenameOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Replaces `dst` with `src`, sleeping `policy.delay` between failed attempts.
/// Never sleeps after the last attempt and never panics on exhaustion.
pub fn replace_with_retries(src: &Path, dst: &Path, policy: RetryPolicy) -> RenameOutcome {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match fs::rename(src, dst) {
            Ok(()) => {
                return RenameOutcome {
                    attempts: attempt,
                    error: None,
                }
            }
            Err(err) => {
                last_error = Some(err);
                if attempt < attempts && !policy.delay.is_zero() {
                    thread::sleep(policy.delay);
                }
            }
        }
    }
    RenameOutcome {
        attempts,
        error: last_error,
    }
}

/// Sibling temp path in the same directory: `canvas.png` -> `canvas.png.tmp.png`.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let extension = final_path
        .extension()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("png");
    let mut name = final_path
        .file_name()
        .map(|value| value.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp.{extension}"));
    final_path.with_file_name(name)
}

#[derive(Debug, Clone)]
pub struct PublishReport {
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
    pub attempts: usize,
    pub published: bool,
    pub error: Option<String>,
    pub bytes: usize,
    pub sha256: String,
}

/// Writes rendered frames to a temp sibling and renames them over the output
/// path, so readers only ever see complete files.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    format: ImageFormat,
    retry: RetryPolicy,
}

impl OutputWriter {
    pub fn new(final_path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        let final_path = final_path.into();
        let format = ImageFormat::from_path(&final_path).unwrap_or(ImageFormat::Png);
        Self {
            temp_path: temp_path_for(&final_path),
            final_path,
            format,
            retry,
        }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Fails only when the frame cannot be encoded or the temp file cannot be
    /// written. Rename exhaustion is reported through `PublishReport`.
    pub fn publish(&self, image: &RgbImage) -> Result<PublishReport> {
        let mut encoded = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut encoded), self.format)
            .with_context(|| format!("failed to encode frame as {:?}", self.format))?;
        fs::write(&self.temp_path, &encoded)
            .with_context(|| format!("failed to write {}", self.temp_path.display()))?;

        let outcome = replace_with_retries(&self.temp_path, &self.final_path, self.retry);
        Ok(PublishReport {
            final_path: self.final_path.clone(),
            temp_path: self.temp_path.clone(),
            attempts: outcome.attempts,
            published: outcome.succeeded(),
            error: outcome.error.map(|err| err.to_string()),
            bytes: encoded.len(),
            sha256: hex::encode(Sha256::digest(&encoded)),
        })
    }
}

/// Opaque white canvas published in place of a render for empty prompts.
pub fn blank_canvas(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]))
}

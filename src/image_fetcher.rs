use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use image::imageops::FilterType;
use log::{debug, info, warn};

use crate::config::constants;
use crate::model::Device;

/// Side length the frame is resized to before cropping.
pub const RESIZE_SIZE: u32 = 256;

/// Side length of the square crop fed to embedding models.
pub const CROP_SIZE: u32 = 224;

/// Number of values in a preprocessed frame: 3 channels of `CROP_SIZE`².
pub const TENSOR_LEN: usize = 3 * (CROP_SIZE as usize) * (CROP_SIZE as usize);

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Device property that asks for frames to be flipped vertically.
pub const FLIP_PROPERTY: &str = "flipVertical";

/// Source of camera frames for one device.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Bind the source to a device's camera.
    async fn start(&self, device: &Device) -> Result<()>;

    /// Next frame as encoded image bytes, or `None` when no frame is available.
    async fn next_frame(&self) -> Result<Option<Vec<u8>>>;

    async fn stop(&self);
}

#[derive(Debug, Clone)]
struct Camera {
    url: String,
    flip_vertical: bool,
}

/// Snapshot fetching service with retry logic.
///
/// Downloads still frames from a device's snapshot URL (falling back to the
/// webcam URL) and retries transient failures a bounded number of times
/// before reporting an error to the caller.
pub struct SnapshotFetcher {
    client: reqwest::Client,
    camera: Mutex<Option<Camera>>,
    max_retries: u32,
    retry_delay: Duration,
    retry_count: AtomicU32,
}

impl SnapshotFetcher {
    /// Create a new SnapshotFetcher.
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Maximum number of attempts per frame
    /// * `retry_delay` - Base delay between attempts, doubled after each failure
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            camera: Mutex::new(None),
            max_retries: max_retries.max(1),
            retry_delay,
            retry_count: AtomicU32::new(0),
        }
    }

    fn camera(&self) -> Option<Camera> {
        self.camera
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Fetch a frame with automatic retry logic.
    ///
    /// # Errors
    ///
    /// Returns an error once every attempt has failed.
    pub async fn fetch_with_retry(&self, url: &str) -> Result<Vec<u8>> {
        let mut delay = self.retry_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_fetch(url).await {
                Ok(data) => {
                    let previous = self.retry_count.swap(0, Ordering::Relaxed);
                    if previous > 0 {
                        info!("Camera at {} recovered after {} failed attempt(s)", url, previous);
                    }
                    return Ok(data);
                }
                Err(e) => {
                    let failures = self.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
                    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                    warn!(
                        "{}: Failed to fetch snapshot from {} (attempt {}/{}, {} consecutive): {}",
                        timestamp, url, attempt, self.max_retries, failures, e
                    );

                    if attempt >= self.max_retries {
                        return Err(anyhow::anyhow!(
                            "Failed to fetch snapshot from {} after {} attempts: {}",
                            url,
                            attempt,
                            e
                        ));
                    }

                    debug!("Retrying snapshot fetch in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn attempt_fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "HTTP request failed with status: {}",
                response.status()
            ));
        }

        let data = response.bytes().await?;
        if data.is_empty() {
            return Err(anyhow::anyhow!("camera returned an empty body"));
        }
        Ok(data.to_vec())
    }

    /// Number of failed attempts since the last successful fetch.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Apply image transformations (e.g., flipping) to a fetched frame.
    ///
    /// # Arguments
    ///
    /// * `image_data` - Raw image bytes
    /// * `flip_vertical` - Whether to flip the image vertically
    ///
    /// # Returns
    ///
    /// Transformed image as bytes in the same format as the input
    pub fn apply_image_transformations(image_data: &[u8], flip_vertical: bool) -> Result<Vec<u8>> {
        if !flip_vertical {
            return Ok(image_data.to_vec());
        }

        let flipped_image = image::load_from_memory(image_data)?.flipv();

        let mut buffer = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut buffer);
        let format = image::guess_format(image_data).unwrap_or(image::ImageFormat::Jpeg);
        flipped_image.write_to(&mut cursor, format)?;

        Ok(buffer)
    }
}

impl Default for SnapshotFetcher {
    fn default() -> Self {
        Self::new(
            constants::MAX_RETRIES,
            Duration::from_millis(constants::RETRY_DELAY_MILLIS),
        )
    }
}

#[async_trait]
impl FrameSource for SnapshotFetcher {
    async fn start(&self, device: &Device) -> Result<()> {
        let url = device
            .camera_url()
            .ok_or_else(|| anyhow::anyhow!("device {} has no camera URL", device.id))?
            .to_string();
        let flip_vertical = device
            .properties
            .get(FLIP_PROPERTY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        info!("Sampling frames for device {} from {}", device.id, url);
        *self
            .camera
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Camera { url, flip_vertical });
        self.retry_count.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn next_frame(&self) -> Result<Option<Vec<u8>>> {
        let Some(camera) = self.camera() else {
            return Ok(None);
        };
        let data = self.fetch_with_retry(&camera.url).await?;
        let data = Self::apply_image_transformations(&data, camera.flip_vertical)?;
        Ok(Some(data))
    }

    async fn stop(&self) {
        self.camera
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Turn an encoded frame into a normalized `3 × 224 × 224` tensor in CHW order.
///
/// The frame is converted to grayscale, resized and cropped to fill
/// 256 × 256, centre-cropped to 224 × 224, replicated to three channels and
/// normalized with the ImageNet mean and standard deviation.
///
/// # Errors
///
/// Returns an error if the bytes are not a decodable image.
pub fn preprocess_frame(image_data: &[u8]) -> Result<Vec<f32>> {
    let offset = (RESIZE_SIZE - CROP_SIZE) / 2;
    let frame = image::load_from_memory(image_data)?
        .grayscale()
        .resize_to_fill(RESIZE_SIZE, RESIZE_SIZE, FilterType::Triangle)
        .crop_imm(offset, offset, CROP_SIZE, CROP_SIZE)
        .to_rgb8();

    let plane = (CROP_SIZE * CROP_SIZE) as usize;
    let mut tensor = vec![0.0f32; TENSOR_LEN];
    for (x, y, pixel) in frame.enumerate_pixels() {
        let index = (y * CROP_SIZE + x) as usize;
        for channel in 0..3 {
            let value = f32::from(pixel[channel]) / 255.0;
            tensor[channel * plane + index] = (value - MEAN[channel]) / STD[channel];
        }
    }
    Ok(tensor)
}

use anyhow::Result;
use candle_core::{Device, Tensor};
use image::{DynamicImage, RgbImage};

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Inverse of [`tensor_to_image`]: a (3, height, width) u8 tensor on `device`.
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let tensor = Tensor::from_vec(
        img.as_raw().clone(),
        (height as usize, width as usize, 3),
        device,
    )?
    .permute((2, 0, 1))?;
    Ok(tensor)
}

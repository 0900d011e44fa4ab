use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::{fs, io};

use base64::{prelude::BASE64_STANDARD, Engine};
use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::{GenerationError, RawOutput};

/// Edge length of every canonical image.
pub const CANONICAL_SIZE: u32 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Image => "png",
            Self::Video => "mp4",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Image => "image/png",
            Self::Video => "video/mp4",
        }
    }

    /// Accepts only names this module generates: 32 lowercase hex digits and a
    /// known extension. Everything else (including path separators) is rejected.
    pub fn parse_generated_name(name: &str) -> Option<Self> {
        let (stem, ext) = name.split_once('.')?;
        let hex = stem.len() == 32
            && stem
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        match ext {
            "png" if hex => Some(Self::Image),
            "mp4" if hex => Some(Self::Video),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportForm {
    /// Base64 string embedded in the response.
    Inline,
    /// File under the output directory, named by a random id.
    File,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CanonicalResult {
    Inline {
        media: MediaKind,
        data: String,
    },
    File {
        media: MediaKind,
        file_name: String,
        path: PathBuf,
    },
}

impl CanonicalResult {
    pub fn media(&self) -> MediaKind {
        match self {
            Self::Inline { media, .. } | Self::File { media, .. } => *media,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::File { file_name, .. } => Some(file_name),
            Self::Inline { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Normalizer {
    output_dir: PathBuf,
}

impl Normalizer {
    pub fn new(output_dir: impl AsRef<Path>) -> io::Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn normalize(
        &self,
        raw: RawOutput,
        form: TransportForm,
    ) -> Result<CanonicalResult, GenerationError> {
        let (media, bytes) = match raw {
            RawOutput::Pixels(image) => (MediaKind::Image, encode_png(&canonical_image(&image)?)?),
            RawOutput::Video(video) => {
                if video.bytes.is_empty() {
                    return Err(GenerationError::DegenerateOutput("empty video stream".into()));
                }
                (MediaKind::Video, video.bytes)
            }
            RawOutput::Latent(_) => {
                return Err(GenerationError::ComputationFailed(
                    "intermediate latent reached normalization".into(),
                ))
            }
        };

        match form {
            TransportForm::Inline => Ok(CanonicalResult::Inline {
                media,
                data: BASE64_STANDARD.encode(&bytes),
            }),
            TransportForm::File => {
                let file_name = format!("{}.{}", Uuid::new_v4().simple(), media.extension());
                let path = self.output_dir.join(&file_name);
                fs::write(&path, &bytes)?;
                debug!(path = %path.display(), bytes = bytes.len(), "wrote canonical result");
                Ok(CanonicalResult::File {
                    media,
                    file_name,
                    path,
                })
            }
        }
    }
}

/// A sample whose every byte is zero carries no signal.
pub fn is_blank(image: &DynamicImage) -> bool {
    image.as_bytes().iter().all(|&b| b == 0)
}

/// RGB, `CANONICAL_SIZE` square. Transparent regions are flattened onto white.
pub fn canonical_image(image: &DynamicImage) -> Result<RgbImage, GenerationError> {
    if is_blank(image) {
        return Err(GenerationError::DegenerateOutput(format!(
            "{}x{} sample is entirely zero",
            image.width(),
            image.height()
        )));
    }
    let rgb = if image.color().has_alpha() {
        flatten_onto_white(image)
    } else {
        image.to_rgb8()
    };
    if rgb.dimensions() == (CANONICAL_SIZE, CANONICAL_SIZE) {
        return Ok(rgb);
    }
    Ok(image::imageops::resize(
        &rgb,
        CANONICAL_SIZE,
        CANONICAL_SIZE,
        FilterType::Lanczos3,
    ))
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u32 * a as u32 + 255 * (255 - a as u32)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, GenerationError> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, Rgba, RgbaImage};

    use super::*;
    use crate::EncodedVideo;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([x as u8, y as u8, 90])
        }))
    }

    #[test]
    fn blank_sample_is_degenerate() {
        let dir = tempfile::tempdir().unwrap();
        let normalizer = Normalizer::new(dir.path()).unwrap();
        let err = normalizer
            .normalize(
                RawOutput::Pixels(DynamicImage::new_rgb8(512, 512)),
                TransportForm::File,
            )
            .unwrap_err();
        assert!(matches!(err, GenerationError::DegenerateOutput(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn non_square_input_becomes_canonical_square() {
        let img = canonical_image(&gradient(640, 360)).unwrap();
        assert_eq!(img.dimensions(), (CANONICAL_SIZE, CANONICAL_SIZE));

        let tall = canonical_image(&gradient(300, 1500)).unwrap();
        assert_eq!(tall.dimensions(), (CANONICAL_SIZE, CANONICAL_SIZE));
    }

    #[test]
    fn transparent_pixels_flatten_to_white() {
        let cut = RgbaImage::from_fn(4, 4, |x, _| {
            if x < 2 {
                Rgba([10, 20, 30, 255])
            } else {
                Rgba([10, 20, 30, 0])
            }
        });
        let img = canonical_image(&DynamicImage::ImageRgba8(cut)).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(img.get_pixel(1023, 1023), &Rgb([255, 255, 255]));
    }

    #[test]
    fn file_transport_uses_random_png_name() {
        let dir = tempfile::tempdir().unwrap();
        let normalizer = Normalizer::new(dir.path()).unwrap();
        let first = normalizer
            .normalize(RawOutput::Pixels(gradient(64, 32)), TransportForm::File)
            .unwrap();
        let second = normalizer
            .normalize(RawOutput::Pixels(gradient(64, 32)), TransportForm::File)
            .unwrap();

        let name = first.file_name().unwrap();
        assert_eq!(MediaKind::parse_generated_name(name), Some(MediaKind::Image));
        assert_ne!(name, second.file_name().unwrap());

        let written = image::open(dir.path().join(name)).unwrap();
        assert_eq!(written.color(), image::ColorType::Rgb8);
        assert_eq!((written.width(), written.height()), (1024, 1024));
    }

    #[test]
    fn inline_transport_is_base64_png() {
        let dir = tempfile::tempdir().unwrap();
        let normalizer = Normalizer::new(dir.path()).unwrap();
        let result = normalizer
            .normalize(RawOutput::Pixels(gradient(8, 8)), TransportForm::Inline)
            .unwrap();
        let CanonicalResult::Inline { media, data } = result else {
            panic!("expected inline result");
        };
        assert_eq!(media, MediaKind::Image);
        let bytes = BASE64_STANDARD.decode(data).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), CANONICAL_SIZE);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn video_passes_through_as_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let normalizer = Normalizer::new(dir.path()).unwrap();
        let clip = b"\0\0\0\x18ftypmp42".to_vec();
        let result = normalizer
            .normalize(
                RawOutput::Video(EncodedVideo { bytes: clip.clone() }),
                TransportForm::File,
            )
            .unwrap();
        assert_eq!(result.media(), MediaKind::Video);
        assert!(result.file_name().unwrap().ends_with(".mp4"));
        let CanonicalResult::File { path, .. } = result else {
            unreachable!()
        };
        assert_eq!(fs::read(path).unwrap(), clip);

        let empty = normalizer.normalize(
            RawOutput::Video(EncodedVideo { bytes: Vec::new() }),
            TransportForm::File,
        );
        assert!(matches!(empty, Err(GenerationError::DegenerateOutput(_))));
    }

    #[test]
    fn generated_names_are_strict() {
        assert_eq!(
            MediaKind::parse_generated_name("0123456789abcdef0123456789abcdef.mp4"),
            Some(MediaKind::Video)
        );
        for bad in [
            "../secret.png",
            "0123456789abcdef0123456789abcdef.png.exe",
            "0123456789ABCDEF0123456789ABCDEF.png",
            "short.png",
            "0123456789abcdef0123456789abcdef.gif",
        ] {
            assert_eq!(MediaKind::parse_generated_name(bad), None, "{bad}");
        }
    }
}

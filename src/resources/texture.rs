//! Texture decoding, upload and per-owner caching

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::{imageops::FilterType, DynamicImage, GenericImageView};

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::resources::mesh::TextureRole;

/// Channel layout of a decoded image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    R,
    Rgb,
    Rgba,
}

impl ChannelLayout {
    pub fn from_channel_count(channels: u8) -> Option<Self> {
        match channels {
            1 => Some(ChannelLayout::R),
            3 => Some(ChannelLayout::Rgb),
            4 => Some(ChannelLayout::Rgba),
            _ => None,
        }
    }

    /// GPU format the pixels are uploaded as. RGB has no 24-bit GPU format
    /// and is widened to RGBA with opaque alpha.
    pub fn texture_format(&self) -> TextureFormat {
        match self {
            ChannelLayout::R => TextureFormat::R8Unorm,
            ChannelLayout::Rgb | ChannelLayout::Rgba => TextureFormat::Rgba8Unorm,
        }
    }
}

/// Decoded image ready for upload; `pixels` is tightly packed in the layout's
/// upload format.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub layout: ChannelLayout,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn from_dynamic(img: DynamicImage, path: &Path) -> RenderResult<Self> {
        let channels = img.color().channel_count();
        let layout = ChannelLayout::from_channel_count(channels).ok_or_else(|| {
            RenderError::TextureDecodeFailure {
                path: path.to_path_buf(),
                reason: format!("unsupported channel count {}", channels),
            }
        })?;
        let (width, height) = img.dimensions();
        let pixels = match layout {
            ChannelLayout::R => img.to_luma8().into_raw(),
            ChannelLayout::Rgb | ChannelLayout::Rgba => img.to_rgba8().into_raw(),
        };
        Ok(Self {
            width,
            height,
            layout,
            pixels,
        })
    }

    /// Solid color RGBA image
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            width,
            height,
            layout: ChannelLayout::Rgba,
            pixels: rgba.repeat((width * height) as usize),
        }
    }

    pub fn format(&self) -> TextureFormat {
        self.layout.texture_format()
    }

    /// Same texels expanded to four channels
    pub fn into_rgba(self) -> Self {
        match self.layout {
            ChannelLayout::R => Self {
                width: self.width,
                height: self.height,
                layout: ChannelLayout::Rgba,
                pixels: self.pixels.iter().flat_map(|&l| [l, l, l, 255]).collect(),
            },
            ChannelLayout::Rgb | ChannelLayout::Rgba => self,
        }
    }

    /// Number of levels in a full mip chain down to 1x1
    pub fn mip_level_count(&self) -> u32 {
        32 - self.width.max(self.height).max(1).leading_zeros()
    }

    /// Full mip chain, base level first
    pub fn mip_chain(&self) -> Vec<(u32, u32, Vec<u8>)> {
        let mut levels = vec![(self.width, self.height, self.pixels.clone())];
        let (mut w, mut h) = (self.width, self.height);
        for _ in 1..self.mip_level_count() {
            w = (w / 2).max(1);
            h = (h / 2).max(1);
            let pixels = match self.layout {
                ChannelLayout::R => image::GrayImage::from_raw(self.width, self.height, self.pixels.clone())
                    .map(|img| image::imageops::resize(&img, w, h, FilterType::Triangle).into_raw()),
                ChannelLayout::Rgb | ChannelLayout::Rgba => {
                    image::RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
                        .map(|img| image::imageops::resize(&img, w, h, FilterType::Triangle).into_raw())
                }
            };
            match pixels {
                Some(pixels) => levels.push((w, h, pixels)),
                None => break,
            }
        }
        levels
    }
}

/// Decodes image files. Implemented over the filesystem for the application
/// and over memory in tests.
pub trait ImageSource {
    fn decode(&mut self, path: &Path) -> RenderResult<DecodedImage>;
}

/// Filesystem image decoder backed by the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct FileImageSource;

impl ImageSource for FileImageSource {
    fn decode(&mut self, path: &Path) -> RenderResult<DecodedImage> {
        let img = image::open(path).map_err(|e| RenderError::TextureDecodeFailure {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        DecodedImage::from_dynamic(img, path)
    }
}

/// Bindable texture: texture, view and the sampler carrying its wrap/filter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRef {
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
    pub sampler: SamplerHandle,
}

/// Cache entry
#[derive(Debug, Clone)]
pub struct CachedTexture {
    pub path: String,
    pub role: TextureRole,
    pub texture: TextureRef,
    pub width: u32,
    pub height: u32,
}

/// Six cubemap face paths
#[derive(Debug, Clone)]
pub struct CubemapFaces {
    pub right: PathBuf,
    pub left: PathBuf,
    pub top: PathBuf,
    pub bottom: PathBuf,
    pub front: PathBuf,
    pub back: PathBuf,
}

impl CubemapFaces {
    /// `right.<ext>`, `left.<ext>`, ... inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>, extension: &str) -> Self {
        let dir = dir.as_ref();
        let face = |name: &str| dir.join(format!("{}.{}", name, extension));
        Self {
            right: face("right"),
            left: face("left"),
            top: face("top"),
            bottom: face("bottom"),
            front: face("front"),
            back: face("back"),
        }
    }

    /// Faces in upload order: +X, -X, +Y, -Y, +Z, -Z
    pub fn ordered(&self) -> [&Path; 6] {
        [
            &self.right,
            &self.left,
            &self.top,
            &self.bottom,
            &self.front,
            &self.back,
        ]
    }
}

/// Uploaded cubemap
#[derive(Debug, Clone)]
pub struct Cubemap {
    pub texture: TextureRef,
    pub face_size: (u32, u32),
    /// Indices (upload order) of faces filled with the placeholder
    pub placeholder_faces: Vec<usize>,
}

/// Placeholder texel for cubemap faces that failed to decode
pub const MISSING_FACE_COLOR: [u8; 4] = [0, 0, 0, 255];

/// View `texture`, destroying it if the view cannot be created
fn view_or_release<B: GraphicsBackend>(
    backend: &mut B,
    texture: TextureHandle,
    dimension: TextureViewDimension,
) -> RenderResult<TextureViewHandle> {
    backend.create_texture_view(texture, dimension).map_err(|e| {
        backend.destroy_texture(texture);
        RenderError::from(e)
    })
}

/// Deduplicating texture cache scoped to one owner.
///
/// Keys are source path strings: a second `load` of the same path returns the
/// first handle without decoding or uploading again. Failed loads are not
/// cached, so each attempt reports its own diagnostic.
pub struct TextureCache<S: ImageSource = FileImageSource> {
    source: S,
    entries: Vec<CachedTexture>,
    index: HashMap<String, usize>,
    cubemaps: HashMap<String, Cubemap>,
    repeat_sampler: Option<SamplerHandle>,
    clamp_sampler: Option<SamplerHandle>,
}

impl TextureCache<FileImageSource> {
    pub fn from_files() -> Self {
        Self::new(FileImageSource)
    }
}

impl<S: ImageSource> TextureCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            entries: Vec::new(),
            index: HashMap::new(),
            cubemaps: HashMap::new(),
            repeat_sampler: None,
            clamp_sampler: None,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in load order
    pub fn entries(&self) -> &[CachedTexture] {
        &self.entries
    }

    pub fn get(&self, path: &Path) -> Option<TextureRef> {
        self.index
            .get(path.to_string_lossy().as_ref())
            .map(|&i| self.entries[i].texture)
    }

    /// Load a 2D texture with a full mip chain, repeat wrapping and trilinear
    /// filtering, or return the cached handle for `path`.
    pub fn load<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        path: &Path,
        role: TextureRole,
    ) -> RenderResult<TextureRef> {
        let key = path.to_string_lossy().into_owned();
        if let Some(&i) = self.index.get(&key) {
            return Ok(self.entries[i].texture);
        }

        let image = self.source.decode(path)?;
        self.insert(backend, key, role, &image)
    }

    /// A 1x1 texture of a fixed color, cached under `name`
    pub fn solid_color<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        name: &str,
        rgba: [u8; 4],
    ) -> RenderResult<TextureRef> {
        let key = format!("<solid:{}>", name);
        if let Some(&i) = self.index.get(&key) {
            return Ok(self.entries[i].texture);
        }
        self.insert(backend, key, TextureRole::Diffuse, &DecodedImage::solid(1, 1, rgba))
    }

    fn insert<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        key: String,
        role: TextureRole,
        image: &DecodedImage,
    ) -> RenderResult<TextureRef> {
        let sampler = match self.repeat_sampler {
            Some(sampler) => sampler,
            None => {
                let sampler = backend.create_sampler(&SamplerDescriptor::repeat("Texture Sampler"))?;
                self.repeat_sampler = Some(sampler);
                sampler
            }
        };

        let levels = image.mip_chain();
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(key.clone()),
            width: image.width,
            height: image.height,
            mip_levels: levels.len() as u32,
            format: image.format(),
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;
        for (level, (w, h, pixels)) in levels.iter().enumerate() {
            backend.write_texture(
                texture,
                TextureRegion {
                    mip_level: level as u32,
                    layer: 0,
                    width: *w,
                    height: *h,
                },
                pixels,
            );
        }
        let view = view_or_release(backend, texture, TextureViewDimension::D2)?;

        let texture = TextureRef {
            texture,
            view,
            sampler,
        };
        log::debug!(
            "Loaded texture {} ({}x{}, {} mips)",
            key,
            image.width,
            image.height,
            levels.len()
        );
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(CachedTexture {
            path: key,
            role,
            texture,
            width: image.width,
            height: image.height,
        });
        Ok(texture)
    }

    /// Load six faces into one cubemap with clamped, linear sampling.
    ///
    /// A face that fails to decode, or whose size differs from the first good
    /// face, is filled with [`MISSING_FACE_COLOR`] and reported; the cubemap
    /// still loads. If every face fails the cubemap is a 1x1 placeholder.
    pub fn load_cubemap<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        faces: &CubemapFaces,
    ) -> RenderResult<Cubemap> {
        let paths = faces.ordered();
        let key = paths
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join("|");
        if let Some(cubemap) = self.cubemaps.get(&key) {
            return Ok(cubemap.clone());
        }

        let mut decoded: Vec<Option<DecodedImage>> = Vec::with_capacity(6);
        for path in paths {
            match self.source.decode(path) {
                Ok(image) => decoded.push(Some(image.into_rgba())),
                Err(e) => {
                    log::warn!("Cubemap face unavailable, using placeholder: {}", e);
                    decoded.push(None);
                }
            }
        }

        let (width, height) = decoded
            .iter()
            .flatten()
            .map(|img| (img.width, img.height))
            .next()
            .unwrap_or((1, 1));

        let mut placeholder_faces = Vec::new();
        let face_pixels: Vec<Vec<u8>> = decoded
            .into_iter()
            .enumerate()
            .map(|(i, face)| match face {
                Some(img) if (img.width, img.height) == (width, height) => img.pixels,
                Some(img) => {
                    log::warn!(
                        "Cubemap face {:?} is {}x{}, expected {}x{}; using placeholder",
                        paths[i],
                        img.width,
                        img.height,
                        width,
                        height
                    );
                    placeholder_faces.push(i);
                    DecodedImage::solid(width, height, MISSING_FACE_COLOR).pixels
                }
                None => {
                    placeholder_faces.push(i);
                    DecodedImage::solid(width, height, MISSING_FACE_COLOR).pixels
                }
            })
            .collect();

        let sampler = match self.clamp_sampler {
            Some(sampler) => sampler,
            None => {
                let sampler = backend.create_sampler(&SamplerDescriptor::clamped("Cubemap Sampler"))?;
                self.clamp_sampler = Some(sampler);
                sampler
            }
        };

        let texture = backend.create_texture(&TextureDescriptor {
            label: Some("Skybox Cubemap".into()),
            width,
            height,
            layers: 6,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;
        for (layer, pixels) in face_pixels.iter().enumerate() {
            backend.write_texture(
                texture,
                TextureRegion {
                    mip_level: 0,
                    layer: layer as u32,
                    width,
                    height,
                },
                pixels,
            );
        }
        let view = view_or_release(backend, texture, TextureViewDimension::Cube)?;

        let cubemap = Cubemap {
            texture: TextureRef {
                texture,
                view,
                sampler,
            },
            face_size: (width, height),
            placeholder_faces,
        };
        self.cubemaps.insert(key, cubemap.clone());
        Ok(cubemap)
    }

    /// Release every texture, view and sampler the cache created
    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        let cubes = self.cubemaps.drain().map(|(_, c)| c.texture);
        let textures: Vec<TextureRef> = self
            .entries
            .drain(..)
            .map(|e| e.texture)
            .chain(cubes)
            .collect();
        for texture in textures {
            backend.destroy_texture_view(texture.view);
            backend.destroy_texture(texture.texture);
        }
        for sampler in [self.repeat_sampler.take(), self.clamp_sampler.take()]
            .into_iter()
            .flatten()
        {
            backend.destroy_sampler(sampler);
        }
        self.index.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{RecordedCommand, RecordingBackend, ResourceKind};

    /// In-memory image source counting decode calls
    #[derive(Default)]
    pub(crate) struct MemorySource {
        pub images: HashMap<PathBuf, DecodedImage>,
        pub decode_calls: usize,
    }

    impl MemorySource {
        pub fn with(mut self, path: &str, image: DecodedImage) -> Self {
            self.images.insert(PathBuf::from(path), image);
            self
        }
    }

    impl ImageSource for MemorySource {
        fn decode(&mut self, path: &Path) -> RenderResult<DecodedImage> {
            self.decode_calls += 1;
            self.images
                .get(path)
                .cloned()
                .ok_or_else(|| RenderError::TextureDecodeFailure {
                    path: path.to_path_buf(),
                    reason: "no such image".into(),
                })
        }
    }

    #[test]
    fn second_load_returns_cached_handle_without_decoding() {
        let mut backend = RecordingBackend::new(64, 64);
        let source = MemorySource::default().with("rock.png", DecodedImage::solid(4, 4, [9, 9, 9, 255]));
        let mut cache = TextureCache::new(source);

        let first = cache
            .load(&mut backend, Path::new("rock.png"), TextureRole::Diffuse)
            .unwrap();
        let second = cache
            .load(&mut backend, Path::new("rock.png"), TextureRole::Diffuse)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.source().decode_calls, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(backend.live_count(ResourceKind::Texture), 1);
    }

    #[test]
    fn failed_load_reports_and_is_not_cached() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut cache = TextureCache::new(MemorySource::default());

        let err = cache
            .load(&mut backend, Path::new("missing.png"), TextureRole::Specular)
            .unwrap_err();
        assert!(matches!(err, RenderError::TextureDecodeFailure { .. }));
        assert!(!err.is_fatal());
        assert!(cache.is_empty());

        let _ = cache.load(&mut backend, Path::new("missing.png"), TextureRole::Specular);
        assert_eq!(cache.source().decode_calls, 2);
    }

    #[test]
    fn uploads_full_mip_chain() {
        let mut backend = RecordingBackend::new(64, 64);
        let source = MemorySource::default().with("a.png", DecodedImage::solid(8, 2, [1, 2, 3, 255]));
        let mut cache = TextureCache::new(source);
        let tex = cache
            .load(&mut backend, Path::new("a.png"), TextureRole::Diffuse)
            .unwrap();

        let desc = backend.texture_descriptor(tex.texture).unwrap();
        assert_eq!(desc.mip_levels, 4);
        let levels: Vec<(u32, u32)> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::WriteTexture { region, .. } => Some((region.width, region.height)),
                _ => None,
            })
            .collect();
        assert_eq!(levels, vec![(8, 2), (4, 1), (2, 1), (1, 1)]);
    }

    #[test]
    fn single_channel_images_stay_single_channel() {
        let img = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(2, 2, image::Luma([7])));
        let decoded = DecodedImage::from_dynamic(img, Path::new("h.png")).unwrap();
        assert_eq!(decoded.layout, ChannelLayout::R);
        assert_eq!(decoded.format(), TextureFormat::R8Unorm);
        assert_eq!(decoded.pixels, vec![7; 4]);
    }

    #[test]
    fn two_channel_images_are_rejected() {
        let img = DynamicImage::ImageLumaA8(image::GrayAlphaImage::new(2, 2));
        let err = DecodedImage::from_dynamic(img, Path::new("la.png")).unwrap_err();
        assert!(matches!(err, RenderError::TextureDecodeFailure { .. }));
    }

    #[test]
    fn missing_cubemap_face_gets_placeholder() {
        let mut backend = RecordingBackend::new(64, 64);
        let faces = CubemapFaces::in_dir("sky", "png");
        let mut source = MemorySource::default();
        for (i, path) in faces.ordered().iter().enumerate() {
            // Leave "top" out
            if i != 2 {
                source.images.insert(path.to_path_buf(), DecodedImage::solid(4, 4, [50, 60, 70, 255]));
            }
        }
        let mut cache = TextureCache::new(source);
        let cubemap = cache.load_cubemap(&mut backend, &faces).unwrap();

        assert_eq!(cubemap.placeholder_faces, vec![2]);
        assert_eq!(cubemap.face_size, (4, 4));
        let layers: Vec<u32> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::WriteTexture { region, .. } => Some(region.layer),
                _ => None,
            })
            .collect();
        assert_eq!(layers, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(
            backend.view_target(cubemap.texture.view).map(|(_, d)| d),
            Some(TextureViewDimension::Cube)
        );
    }

    #[rstest::rstest]
    #[case::texture_2d(false)]
    #[case::cubemap(true)]
    fn failed_view_releases_its_texture(#[case] cubemap: bool) {
        let mut backend = RecordingBackend::new(64, 64).fail_nth(ResourceKind::TextureView, 0);
        let source = MemorySource::default().with("a.png", DecodedImage::solid(2, 2, [0; 4]));
        let mut cache = TextureCache::new(source);
        let failed = if cubemap {
            cache.load_cubemap(&mut backend, &CubemapFaces::in_dir("none", "png")).is_err()
        } else {
            cache.load(&mut backend, Path::new("a.png"), TextureRole::Diffuse).is_err()
        };
        assert!(failed);
        assert!(cache.is_empty());
        assert_eq!(backend.live_count(ResourceKind::Texture), 0);

        cache.destroy(&mut backend);
        assert!(backend.live_resources().is_empty());
        assert!(backend.double_destroys().is_empty());
    }

    #[test]
    fn destroy_releases_everything() {
        let mut backend = RecordingBackend::new(64, 64);
        let source = MemorySource::default().with("a.png", DecodedImage::solid(2, 2, [0; 4]));
        let mut cache = TextureCache::new(source);
        cache.load(&mut backend, Path::new("a.png"), TextureRole::Diffuse).unwrap();
        cache.load_cubemap(&mut backend, &CubemapFaces::in_dir("none", "png")).unwrap();
        cache.solid_color(&mut backend, "white", [255; 4]).unwrap();

        cache.destroy(&mut backend);
        assert!(backend.live_resources().is_empty());
        assert!(backend.double_destroys().is_empty());
    }
}

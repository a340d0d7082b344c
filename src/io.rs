//! Frame sources and sinks
//!
//! Stages never touch the filesystem directly: they read frames by name from an
//! [`ImageSource`] and hand results to an [`OutputSink`]. Layered output goes
//! to a multi-page TIFF through the `tiff` crate, since `image` encodes a
//! single page only.

use crate::errors::{Result, StackError};
use crate::types::{Frame, PixelData};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::compression::DeflateLevel;
use tiff::encoder::{Compression, Rational, TiffEncoder, TiffValue};
use tiff::tags::ResolutionUnit;

/// Print resolution stored with every layer
const LAYER_DPI: u32 = 72;

pub trait ImageSource {
    fn read(&self, name: &str) -> Result<Frame>;
}

pub trait OutputSink {
    fn write(&mut self, name: &str, frame: &Frame) -> Result<()>;

    /// Write `layers` as one file, first frame at the bottom
    fn write_layers(&mut self, name: &str, layers: &[Frame]) -> Result<()>;
}

/// Decode one frame with the `image` crate
pub fn read_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path).map_err(|e| StackError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Frame::from_dynamic(image)
}

fn write_page<W, C>(encoder: &mut TiffEncoder<W>, frame: &Frame, data: &[C::Inner]) -> tiff::TiffResult<()>
where
    W: Write + Seek,
    C: ColorType,
    [C::Inner]: TiffValue,
{
    let mut page = encoder.new_image::<C>(frame.width(), frame.height())?;
    page.resolution(
        ResolutionUnit::Inch,
        Rational {
            n: LAYER_DPI,
            d: 1,
        },
    );
    page.write_data(data)
}

/// Encode `layers` as a deflate-compressed multi-page TIFF. All layers must
/// share shape and bit depth.
pub fn encode_layers<W: Write + Seek>(writer: W, layers: &[Frame]) -> Result<()> {
    let first = layers.first().ok_or(StackError::InsufficientFrames {
        required: 1,
        provided: 0,
    })?;
    let meta = first.meta();
    let failed = |e: tiff::TiffError| StackError::Write {
        path: PathBuf::from("<layers>"),
        reason: e.to_string(),
    };

    let mut encoder = TiffEncoder::new(writer)
        .map_err(failed)?
        .with_compression(Compression::Deflate(DeflateLevel::Balanced));
    for layer in layers {
        meta.validate(layer)?;
        let written = match (layer.data(), layer.channels()) {
            (PixelData::U8(d), 1) => write_page::<_, colortype::Gray8>(&mut encoder, layer, d),
            (PixelData::U8(d), _) => write_page::<_, colortype::RGB8>(&mut encoder, layer, d),
            (PixelData::U16(d), 1) => write_page::<_, colortype::Gray16>(&mut encoder, layer, d),
            (PixelData::U16(d), _) => write_page::<_, colortype::RGB16>(&mut encoder, layer, d),
        };
        written.map_err(failed)?;
    }
    Ok(())
}

/// Decode every page of a layered TIFF
pub fn read_layers(path: &Path) -> Result<Vec<Frame>> {
    let failed = |reason: String| StackError::Load {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(|e| failed(e.to_string()))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| failed(e.to_string()))?;

    let mut layers = Vec::new();
    loop {
        let (w, h) = decoder.dimensions().map_err(|e| failed(e.to_string()))?;
        let channels = match decoder.colortype().map_err(|e| failed(e.to_string()))? {
            tiff::ColorType::Gray(_) => 1,
            tiff::ColorType::RGB(_) => 3,
            other => return Err(failed(format!("unsupported layer colour type {:?}", other))),
        };
        let layer = match decoder.read_image().map_err(|e| failed(e.to_string()))? {
            DecodingResult::U8(d) => Frame::from_u8(w, h, channels, d)?,
            DecodingResult::U16(d) => Frame::from_u16(w, h, channels, d)?,
            _ => return Err(failed("unsupported layer sample format".to_string())),
        };
        layers.push(layer);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| failed(e.to_string()))?;
    }
    Ok(layers)
}

/// Reads frames from a directory with the `image` crate
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageSource for DirectorySource {
    fn read(&self, name: &str) -> Result<Frame> {
        read_frame(&self.root.join(name))
    }
}

/// Writes frames into a directory, creating it on first use. The format
/// follows the file extension.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    written: Vec<String>,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            written: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn written(&self) -> &[String] {
        &self.written
    }
}

impl DirectorySink {
    fn prepare(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StackError::Write {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        Ok(path)
    }
}

impl OutputSink for DirectorySink {
    fn write(&mut self, name: &str, frame: &Frame) -> Result<()> {
        let path = self.prepare(name)?;
        let image = frame.to_dynamic()?;
        image.save(&path).map_err(|e| StackError::Write {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        log::debug!("Wrote {:?}", path);
        self.written.push(name.to_string());
        Ok(())
    }

    fn write_layers(&mut self, name: &str, layers: &[Frame]) -> Result<()> {
        let path = self.prepare(name)?;
        let file = File::create(&path).map_err(|e| StackError::Write {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        encode_layers(BufWriter::new(file), layers).map_err(|e| match e {
            StackError::Write { reason, .. } => StackError::Write {
                path: path.clone(),
                reason,
            },
            other => other,
        })?;
        log::debug!("Wrote {} layers to {:?}", layers.len(), path);
        self.written.push(name.to_string());
        Ok(())
    }
}

/// In-memory frame store; serves as both source and sink
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    frames: BTreeMap<String, Frame>,
    layers: BTreeMap<String, Vec<Frame>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, frame: Frame) {
        self.frames.insert(name.into(), frame);
    }

    pub fn get(&self, name: &str) -> Option<&Frame> {
        self.frames.get(name)
    }

    pub fn layers(&self, name: &str) -> Option<&[Frame]> {
        self.layers.get(name).map(Vec::as_slice)
    }

    /// Sorted frame names
    pub fn names(&self) -> Vec<String> {
        self.frames.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl ImageSource for MemoryStore {
    fn read(&self, name: &str) -> Result<Frame> {
        self.frames.get(name).cloned().ok_or_else(|| StackError::Load {
            path: PathBuf::from(name),
            reason: "no such frame".to_string(),
        })
    }
}

impl OutputSink for MemoryStore {
    fn write(&mut self, name: &str, frame: &Frame) -> Result<()> {
        self.frames.insert(name.to_string(), frame.clone());
        Ok(())
    }

    fn write_layers(&mut self, name: &str, layers: &[Frame]) -> Result<()> {
        self.layers.insert(name.to_string(), layers.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let frame = Frame::from_u8(2, 2, 1, vec![1, 2, 3, 4]).unwrap();
        let mut store = MemoryStore::new();
        store.write("a.png", &frame).unwrap();
        assert_eq!(store.read("a.png").unwrap(), frame);
        assert!(matches!(store.read("b.png"), Err(StackError::Load { .. })));
    }

    #[test]
    fn test_directory_sink_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let frame = Frame::from_u16(3, 2, 3, (0..18).map(|v| v * 1000).collect()).unwrap();

        let mut sink = DirectorySink::new(dir.path().join("out"));
        sink.write("f.png", &frame).unwrap();
        assert_eq!(sink.written(), &["f.png".to_string()]);

        let source = DirectorySource::new(dir.path().join("out"));
        assert_eq!(source.read("f.png").unwrap(), frame);
    }

    #[test]
    fn test_layers_written_as_tiff_pages() {
        let dir = tempfile::tempdir().unwrap();
        let layers: Vec<Frame> = (0..3u16)
            .map(|k| Frame::from_u16(4, 3, 3, (0..36).map(|v| v * 100 + k).collect()).unwrap())
            .collect();

        let mut sink = DirectorySink::new(dir.path().join("layers"));
        sink.write_layers("stack.tif", &layers).unwrap();

        let back = read_layers(&dir.path().join("layers").join("stack.tif")).unwrap();
        assert_eq!(back, layers);
    }

    #[test]
    fn test_mixed_layers_rejected() {
        let layers = vec![
            Frame::from_u8(2, 2, 1, vec![0; 4]).unwrap(),
            Frame::from_u8(3, 2, 1, vec![0; 6]).unwrap(),
        ];
        let err = encode_layers(std::io::Cursor::new(Vec::new()), &layers).unwrap_err();
        assert!(matches!(err, StackError::ShapeMismatch { .. }));
        let err = encode_layers(std::io::Cursor::new(Vec::new()), &[]).unwrap_err();
        assert!(matches!(err, StackError::InsufficientFrames { .. }));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path());
        assert!(matches!(source.read("nope.png"), Err(StackError::Load { .. })));
    }
}

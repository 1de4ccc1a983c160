use crate::error::{Result, StarganError};
use crate::labels::{LabelKind, RawLabels};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// Seed of the shuffle that decides which attribute-list rows are held out.
const SPLIT_SEED: u64 = 1234;

/// A batch of images in `[-1, 1]` with their raw domain labels.
#[derive(Clone, Debug)]
pub struct Batch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: RawLabels,
}

impl<B: Backend> Batch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A restartable stream of batches. `Ok(None)` marks the end of a pass.
pub trait DataSource<B: Backend> {
    fn next_batch(&mut self) -> Result<Option<Batch<B>>>;

    /// Rewind to the start of a new pass, reshuffling if the source shuffles.
    fn restart(&mut self);
}

/// Draw the next batch, restarting the source once when the pass is exhausted.
pub fn next_or_restart<B: Backend, S: DataSource<B> + ?Sized>(source: &mut S) -> Result<Batch<B>> {
    if let Some(batch) = source.next_batch()? {
        return Ok(batch);
    }
    source.restart();
    source.next_batch()?.ok_or(StarganError::EmptyDataSource)
}

/// Pre-built batches replayed in order.
#[derive(Clone, Debug)]
pub struct MemorySource<B: Backend> {
    batches: Vec<Batch<B>>,
    cursor: usize,
}

impl<B: Backend> MemorySource<B> {
    pub fn new(batches: Vec<Batch<B>>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl<B: Backend> DataSource<B> for MemorySource<B> {
    fn next_batch(&mut self) -> Result<Option<Batch<B>>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }

    fn restart(&mut self) {
        self.cursor = 0;
    }
}

/// Which part of an attribute list a source reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Settings for decoding and assembling image batches.
#[derive(Config, Debug)]
pub struct LoaderConfig {
    pub image_size: u32,
    #[config(default = 16)]
    pub batch_size: usize,
    /// Side of the centered square cropped before resizing.
    #[config(default = 178)]
    pub crop_size: u32,
    /// Random horizontal flips and per-pass shuffling.
    #[config(default = true)]
    pub augment: bool,
    /// Attribute-list rows held out for evaluation.
    #[config(default = 2000)]
    pub test_size: usize,
    #[config(default = 42)]
    pub seed: u64,
}

#[derive(Clone, Debug)]
enum EntryLabel {
    Attributes(Vec<f32>),
    Class(i64),
}

#[derive(Clone, Debug)]
struct Entry {
    path: PathBuf,
    label: EntryLabel,
}

/// Image files on disk with attribute rows or class-folder labels.
pub struct ImageSource<B: Backend> {
    entries: Vec<Entry>,
    order: Vec<usize>,
    cursor: usize,
    kind: LabelKind,
    width: usize,
    class_names: Vec<String>,
    config: LoaderConfig,
    rng: StdRng,
    device: B::Device,
}

impl<B: Backend> ImageSource<B> {
    /// Attribute-list dataset: a count line, a header of attribute names, then
    /// `file v1 v2 ...` rows with values of 1 or -1.
    pub fn attribute_list(
        image_dir: &Path,
        attr_path: &Path,
        selected_attrs: &[String],
        split: Split,
        config: LoaderConfig,
        device: &B::Device,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(attr_path)?;
        let mut rows = parse_attribute_list(&text, selected_attrs).map_err(|reason| StarganError::Dataset {
            path: attr_path.to_path_buf(),
            reason,
        })?;
        rows.shuffle(&mut StdRng::seed_from_u64(SPLIT_SEED));

        let test_size = config.test_size.min(rows.len());
        let rows = match split {
            Split::Test => rows.into_iter().take(test_size).collect::<Vec<_>>(),
            Split::Train => rows.into_iter().skip(test_size).collect(),
        };
        let entries = rows
            .into_iter()
            .map(|(file, values)| Entry {
                path: image_dir.join(file),
                label: EntryLabel::Attributes(values),
            })
            .collect();

        Ok(Self::from_entries(
            entries,
            LabelKind::Binary,
            selected_attrs.len(),
            selected_attrs.to_vec(),
            config,
            device,
        ))
    }

    /// Class-folder dataset: one sub-directory per class, labelled by sorted name order.
    pub fn class_folders(root: &Path, config: LoaderConfig, device: &B::Device) -> Result<Self> {
        let pattern = root.join("*");
        let mut class_dirs: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|err| StarganError::config(format!("invalid dataset path: {err}")))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_dir())
            .collect();
        class_dirs.sort();
        if class_dirs.is_empty() {
            return Err(StarganError::Dataset {
                path: root.to_path_buf(),
                reason: "no class directories".to_string(),
            });
        }

        let mut entries = Vec::new();
        let mut class_names = Vec::with_capacity(class_dirs.len());
        for (class, dir) in class_dirs.iter().enumerate() {
            class_names.push(
                dir.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
            let mut files: Vec<PathBuf> = glob::glob(&dir.join("*").to_string_lossy())
                .map_err(|err| StarganError::config(format!("invalid dataset path: {err}")))?
                .filter_map(|entry| entry.ok())
                .filter(|path| is_image_file(path))
                .collect();
            files.sort();
            entries.extend(files.into_iter().map(|path| Entry {
                path,
                label: EntryLabel::Class(class as i64),
            }));
        }

        let width = class_names.len();
        Ok(Self::from_entries(
            entries,
            LabelKind::Categorical,
            width,
            class_names,
            config,
            device,
        ))
    }

    fn from_entries(
        entries: Vec<Entry>,
        kind: LabelKind,
        width: usize,
        class_names: Vec<String>,
        config: LoaderConfig,
        device: &B::Device,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let mut source = Self {
            order: (0..entries.len()).collect(),
            entries,
            cursor: 0,
            kind,
            width,
            class_names,
            config,
            rng,
            device: device.clone(),
        };
        source.restart();
        source
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attribute names or class directory names, in label order.
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn load_batch(&mut self, indices: &[usize]) -> Result<Batch<B>> {
        let batch_size = indices.len();
        let image_size = self.config.image_size as usize;
        let mut pixels = Vec::with_capacity(batch_size * 3 * image_size * image_size);
        let mut attributes = Vec::new();
        let mut classes = Vec::new();

        for &idx in indices {
            let entry = &self.entries[idx];
            let img = image::open(&entry.path)
                .map_err(|err| StarganError::Dataset {
                    path: entry.path.clone(),
                    reason: err.to_string(),
                })?
                .to_rgb8();
            let mut img = resize_image(
                &center_crop(&img, self.config.crop_size),
                self.config.image_size,
                self.config.image_size,
            );
            if self.config.augment && self.rng.gen_bool(0.5) {
                img = image::imageops::flip_horizontal(&img);
            }
            pixels.append(&mut image_to_chw(&img));

            match &entry.label {
                EntryLabel::Attributes(values) => attributes.extend_from_slice(values),
                EntryLabel::Class(class) => classes.push(*class),
            }
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, 3, image_size, image_size]),
            &self.device,
        );
        let labels = match self.kind {
            LabelKind::Binary => RawLabels::Binary {
                values: attributes,
                width: self.width,
            },
            LabelKind::Categorical => RawLabels::Categorical(classes),
        };
        Ok(Batch { images, labels })
    }
}

impl<B: Backend> DataSource<B> for ImageSource<B> {
    fn next_batch(&mut self) -> Result<Option<Batch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.config.batch_size.max(1)).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        self.load_batch(&indices).map(Some)
    }

    fn restart(&mut self) {
        self.cursor = 0;
        if self.config.augment {
            self.order.shuffle(&mut self.rng);
        }
    }
}

/// Parse attribute-list text into `(file, selected values as 0/1)` rows.
fn parse_attribute_list(
    text: &str,
    selected_attrs: &[String],
) -> std::result::Result<Vec<(String, Vec<f32>)>, String> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    lines.next().ok_or("missing count line")?;
    let header: Vec<&str> = lines.next().ok_or("missing attribute header")?.split_whitespace().collect();
    let columns = selected_attrs
        .iter()
        .map(|name| {
            header
                .iter()
                .position(|attr| attr == name)
                .ok_or_else(|| format!("unknown attribute {name}"))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    lines
        .map(|line| {
            let mut fields = line.split_whitespace();
            let file = fields.next().ok_or("empty row")?.to_string();
            let values: Vec<&str> = fields.collect();
            if values.len() != header.len() {
                return Err(format!(
                    "row for {file} has {} values, header has {}",
                    values.len(),
                    header.len()
                ));
            }
            let selected = columns
                .iter()
                .map(|&col| if values[col] == "1" { 1.0 } else { 0.0 })
                .collect();
            Ok((file, selected))
        })
        .collect()
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp"))
        .unwrap_or(false)
}

/// Crop the centered `size` square, or the largest square that fits.
fn center_crop(img: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    let side = size.min(width).min(height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    image::imageops::crop_imm(img, x, y, side, side).to_image()
}

fn resize_image(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    image::imageops::resize(img, width, height, image::imageops::FilterType::CatmullRom)
}

/// Convert RGB image data to CHW floats normalized to [-1, 1].
fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for y in 0..height {
        for x in 0..width {
            let pixel = img.get_pixel(x, y).0;
            let idx = (y * width + x) as usize;
            for channel in 0..3 {
                out[channel * hw + idx] = (pixel[channel] as f32 / 127.5) - 1.0;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;

    type TestBackend = NdArray<f32>;

    fn memory_batch(value: f32) -> Batch<TestBackend> {
        let device = Default::default();
        Batch {
            images: Tensor::ones([2, 3, 4, 4], &device).mul_scalar(value),
            labels: RawLabels::Categorical(vec![0, 1]),
        }
    }

    fn write_image(path: &Path, size: u32, value: u8) {
        RgbImage::from_pixel(size, size, Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn exhausted_source_restarts_once() {
        let mut source = MemorySource::new(vec![memory_batch(0.0), memory_batch(1.0)]);
        assert!(source.next_batch().unwrap().is_some());
        assert!(source.next_batch().unwrap().is_some());
        assert!(source.next_batch().unwrap().is_none());

        let batch = next_or_restart(&mut source).unwrap();
        assert_eq!(batch.images.into_data().to_vec::<f32>().unwrap()[0], 0.0);
    }

    #[test]
    fn empty_source_after_restart_is_an_error() {
        let mut source = MemorySource::<TestBackend>::new(Vec::new());
        assert!(matches!(
            next_or_restart(&mut source),
            Err(StarganError::EmptyDataSource)
        ));
    }

    #[test]
    fn parses_selected_attribute_columns() {
        let text = "2\nBlack_Hair Male Young\na.jpg 1 -1 1\nb.jpg -1 1 -1\n";
        let selected = vec!["Young".to_string(), "Black_Hair".to_string()];
        let rows = parse_attribute_list(text, &selected).unwrap();
        assert_eq!(rows[0], ("a.jpg".to_string(), vec![1.0, 1.0]));
        assert_eq!(rows[1], ("b.jpg".to_string(), vec![0.0, 0.0]));
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let text = "1\nMale\na.jpg 1\n";
        assert!(parse_attribute_list(text, &["Bald".to_string()]).is_err());
    }

    #[test]
    fn attribute_list_holds_out_test_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut text = String::from("5\nMale Young\n");
        for idx in 0..5 {
            let file = format!("{idx}.png");
            write_image(&dir.path().join(&file), 12, 200);
            text.push_str(&format!("{file} 1 -1\n"));
        }
        let attr_path = dir.path().join("attrs.txt");
        std::fs::write(&attr_path, text).unwrap();

        let selected = vec!["Male".to_string(), "Young".to_string()];
        let config = LoaderConfig::new(8).with_batch_size(2).with_crop_size(10).with_test_size(2);
        let device = Default::default();
        let mut train = ImageSource::<TestBackend>::attribute_list(
            dir.path(),
            &attr_path,
            &selected,
            Split::Train,
            config.clone(),
            &device,
        )
        .unwrap();
        let test = ImageSource::<TestBackend>::attribute_list(
            dir.path(),
            &attr_path,
            &selected,
            Split::Test,
            config,
            &device,
        )
        .unwrap();
        assert_eq!(train.len(), 3);
        assert_eq!(test.len(), 2);

        let batch = train.next_batch().unwrap().unwrap();
        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        match batch.labels {
            RawLabels::Binary { values, width } => {
                assert_eq!(width, 2);
                assert_eq!(values, vec![1.0, 0.0, 1.0, 0.0]);
            }
            other => panic!("unexpected labels {other:?}"),
        }
        assert_eq!(train.next_batch().unwrap().unwrap().len(), 1);
        assert!(train.next_batch().unwrap().is_none());
    }

    #[test]
    fn class_folders_are_labelled_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        for (class, value) in [("happy", 255u8), ("angry", 0u8)] {
            std::fs::create_dir(dir.path().join(class)).unwrap();
            write_image(&dir.path().join(class).join("face.png"), 4, value);
        }
        let config = LoaderConfig::new(4).with_batch_size(4).with_augment(false);
        let device = Default::default();
        let mut source = ImageSource::<TestBackend>::class_folders(dir.path(), config, &device).unwrap();
        assert_eq!(source.class_names(), &["angry".to_string(), "happy".to_string()]);

        let batch = source.next_batch().unwrap().unwrap();
        let pixels = batch.images.into_data().to_vec::<f32>().unwrap();
        assert!(matches!(batch.labels, RawLabels::Categorical(ref classes) if classes == &vec![0, 1]));
        assert_eq!(pixels[0], -1.0);
        assert_eq!(pixels[pixels.len() - 1], 1.0);
    }
}

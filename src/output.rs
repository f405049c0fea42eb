use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use num_traits::AsPrimitive;
use tempfile::NamedTempFile;

use crate::config::Compartment;
use crate::errors::{MaskError, Result};
use crate::prediction::{Prediction, NUCLEAR_CHANNEL, WHOLE_CELL_CHANNEL};

/// Scale applied to predictions in the combined color layout before the
/// truncating cast to `u8`.
pub const COMBINED_SCALE: f32 = 255.999;

/// Where the caller asked the output to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    /// Name the output after the source image, compartment and resolution.
    Derived,
    Single(PathBuf),
    /// Explicit `(nuclear, whole-cell)` paths for separate output.
    Pair(PathBuf, PathBuf),
}

impl OutputSpec {
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        match paths {
            [] => Ok(Self::Derived),
            [single] => Ok(Self::Single(single.clone())),
            [nuclear, whole_cell] => Ok(Self::Pair(nuclear.clone(), whole_cell.clone())),
            _ => Err(MaskError::invalid_configuration(format!(
                "at most two output paths can be given, got {}",
                paths.len()
            ))),
        }
    }
}

/// Per-pixel transform applied to the prediction for one output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendering {
    /// One prediction channel cast to 8-bit grayscale.
    Grayscale { channel: usize },
    /// Red = 0, green = channel 0, blue = channel 1, scaled by [`COMBINED_SCALE`].
    Combined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub path: PathBuf,
    pub rendering: Rendering,
}

/// The validated set of files a run will write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    targets: Vec<OutputTarget>,
}

impl OutputPlan {
    /// Resolves `spec` against the source image into concrete targets.
    ///
    /// All cardinality checks happen here, before inference, so an unusable
    /// combination never leaves files behind.
    pub fn resolve(
        spec: &OutputSpec,
        source: &Path,
        compartment: Compartment,
        separate: bool,
        resolution: f64,
    ) -> Result<Self> {
        if separate && compartment != Compartment::Both {
            tracing::warn!(
                compartment = %compartment,
                "--separate only applies to `--compartment both`; writing a single file"
            );
        }
        let separate = separate && compartment == Compartment::Both;

        let targets = match (spec, compartment, separate) {
            (OutputSpec::Pair(nuclear, whole_cell), Compartment::Both, true) => {
                if nuclear == whole_cell {
                    return Err(MaskError::invalid_configuration(format!(
                        "the nuclear and whole-cell outputs are both {}",
                        nuclear.display()
                    )));
                }
                separate_targets(nuclear.clone(), whole_cell.clone())
            }
            (OutputSpec::Pair(..), _, _) => {
                return Err(MaskError::invalid_configuration(
                    "two output paths require `--compartment both` and `--separate`",
                ))
            }
            (_, Compartment::Both, true) => {
                let base = BaseName::resolve(spec, source, compartment, resolution)?;
                let source_stem = file_stem(source)?;
                separate_targets(
                    base.with_infix(&format!("nuclear_{source_stem}")),
                    base.with_infix(&format!("whole-cell_{source_stem}")),
                )
            }
            (_, Compartment::Both, false) => vec![OutputTarget {
                path: BaseName::resolve(spec, source, compartment, resolution)?.path(),
                rendering: Rendering::Combined,
            }],
            (_, Compartment::Nuclear | Compartment::WholeCell, _) => vec![OutputTarget {
                path: BaseName::resolve(spec, source, compartment, resolution)?.path(),
                rendering: Rendering::Grayscale { channel: 0 },
            }],
        };

        Ok(Self { targets })
    }

    pub fn targets(&self) -> &[OutputTarget] {
        &self.targets
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.targets.iter().map(|t| t.path.clone()).collect()
    }

    /// Renders and writes every target.
    ///
    /// Each image is encoded into a temporary file next to its target, and the
    /// temporaries are only renamed into place once all of them succeeded.
    pub fn write(&self, prediction: &Prediction) -> Result<Vec<PathBuf>> {
        let rendered = self
            .targets
            .iter()
            .map(|target| render(prediction, target.rendering).map(|image| (target, image)))
            .collect::<Result<Vec<_>>>()?;

        let mut staged = Vec::with_capacity(rendered.len());
        for (target, image) in &rendered {
            let existed = target.path.exists();
            staged.push((target, existed, encode_to_temp(image, &target.path)?));
        }

        let mut written: Vec<(PathBuf, bool)> = Vec::with_capacity(staged.len());
        for (target, existed, temp) in staged {
            if let Err(e) = temp.persist(&target.path) {
                roll_back(&written);
                return Err(MaskError::FileSystem {
                    path: target.path.clone(),
                    operation: "rename output into place".to_string(),
                    source: e.error,
                });
            }
            tracing::info!(path = %target.path.display(), "wrote mask");
            written.push((target.path.clone(), existed));
        }

        Ok(written.into_iter().map(|(path, _)| path).collect())
    }
}

/// Removes outputs this run created. Files that already existed have been
/// overwritten and are left alone.
fn roll_back(written: &[(PathBuf, bool)]) {
    for (path, existed) in written {
        if *existed {
            tracing::warn!(path = %path.display(), "kept overwritten output of a failed run");
            continue;
        }
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output");
        }
    }
}

fn separate_targets(nuclear: PathBuf, whole_cell: PathBuf) -> Vec<OutputTarget> {
    vec![
        OutputTarget {
            path: nuclear,
            rendering: Rendering::Grayscale {
                channel: NUCLEAR_CHANNEL,
            },
        },
        OutputTarget {
            path: whole_cell,
            rendering: Rendering::Grayscale {
                channel: WHOLE_CELL_CHANNEL,
            },
        },
    ]
}

/// A single output path split into the parts separate naming builds on.
///
/// Kept apart so a resolution like `0.5` in a derived stem is never mistaken
/// for an extension.
struct BaseName {
    parent: PathBuf,
    stem: String,
    extension: Option<String>,
}

impl BaseName {
    fn resolve(
        spec: &OutputSpec,
        source: &Path,
        compartment: Compartment,
        resolution: f64,
    ) -> Result<Self> {
        let (path, stem) = match spec {
            OutputSpec::Single(path) => (path.as_path(), file_stem(path)?),
            // `{:?}` keeps a trailing `.0` on whole numbers, so 1.0 stays "1.0".
            _ => (
                source,
                format!("{}_{compartment}_{resolution:?}", file_stem(source)?),
            ),
        };
        Ok(Self {
            parent: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            stem,
            extension: path
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned()),
        })
    }

    fn path(&self) -> PathBuf {
        self.with_stem(&self.stem)
    }

    /// `<parent>/<stem>_<infix><suffix>`
    fn with_infix(&self, infix: &str) -> PathBuf {
        self.with_stem(&format!("{}_{infix}", self.stem))
    }

    fn with_stem(&self, stem: &str) -> PathBuf {
        match &self.extension {
            Some(ext) => self.parent.join(format!("{stem}.{ext}")),
            None => self.parent.join(stem),
        }
    }
}

/// `<source-parent>/<source-stem>_<compartment>_<resolution><source-suffix>`
pub fn derived_path(source: &Path, compartment: Compartment, resolution: f64) -> Result<PathBuf> {
    Ok(BaseName::resolve(&OutputSpec::Derived, source, compartment, resolution)?.path())
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| {
            MaskError::invalid_configuration(format!("{} has no file name", path.display()))
        })
}

/// Builds the image for one target.
pub fn render(prediction: &Prediction, rendering: Rendering) -> Result<DynamicImage> {
    let (height, width) = prediction.dimensions();
    let (width, height) = (width as u32, height as u32);

    match rendering {
        Rendering::Grayscale { channel } => {
            let samples = prediction
                .channel(channel)
                .iter()
                .map(|&v| -> u8 { v.as_() })
                .collect::<Vec<_>>();
            GrayImage::from_raw(width, height, samples)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| buffer_error("grayscale mask"))
        }
        Rendering::Combined => {
            let green = prediction.channel(0);
            let blue = prediction.channel(1);
            let mut image = RgbImage::new(width, height);
            for (x, y, pixel) in image.enumerate_pixels_mut() {
                let (row, col) = (y as usize, x as usize);
                *pixel = Rgb([
                    0,
                    (green[[row, col]] * COMBINED_SCALE).as_(),
                    (blue[[row, col]] * COMBINED_SCALE).as_(),
                ]);
            }
            Ok(DynamicImage::ImageRgb8(image))
        }
    }
}

fn buffer_error(what: &str) -> MaskError {
    MaskError::ImageProcessing {
        path: "unknown".to_string(),
        operation: format!("build {what}"),
        source: "sample count does not match image dimensions".into(),
    }
}

/// Unknown or missing extensions are written as PNG.
pub fn output_format(path: &Path) -> ImageFormat {
    ImageFormat::from_path(path)
        .ok()
        .filter(|f| f.writing_enabled())
        .unwrap_or(ImageFormat::Png)
}

fn encode_to_temp(image: &DynamicImage, path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| MaskError::FileSystem {
        path: dir.clone(),
        operation: "create output directory".to_string(),
        source: e,
    })?;

    let mut temp = tempfile::Builder::new()
        .prefix(".pymask-")
        .tempfile_in(&dir)
        .map_err(|e| MaskError::FileSystem {
            path: dir.clone(),
            operation: "create temporary file".to_string(),
            source: e,
        })?;

    let mut writer = BufWriter::new(temp.as_file_mut());
    image
        .write_to(&mut writer, output_format(path))
        .map_err(|e| MaskError::ImageProcessing {
            path: path.display().to_string(),
            operation: "encode mask".to_string(),
            source: Box::new(e),
        })?;
    writer.flush()?;
    drop(writer);

    Ok(temp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::prelude::*;
    use tempfile::TempDir;

    fn prediction(whole_cell: f32, nuclear: f32) -> Prediction {
        let batch = Array4::from_shape_fn((1, 2, 3, 2), |(_, _, _, c)| {
            if c == 0 {
                whole_cell
            } else {
                nuclear
            }
        });
        Prediction::from_batch(batch).unwrap()
    }

    fn resolve(spec: &OutputSpec, compartment: Compartment, separate: bool) -> Result<OutputPlan> {
        OutputPlan::resolve(spec, Path::new("/data/cell.png"), compartment, separate, 0.5)
    }

    #[test]
    fn test_spec_from_paths() {
        assert_eq!(OutputSpec::from_paths(&[]).unwrap(), OutputSpec::Derived);
        assert_eq!(
            OutputSpec::from_paths(&["a.png".into()]).unwrap(),
            OutputSpec::Single("a.png".into())
        );
        assert_eq!(
            OutputSpec::from_paths(&["a.png".into(), "b.png".into()]).unwrap(),
            OutputSpec::Pair("a.png".into(), "b.png".into())
        );
        assert!(matches!(
            OutputSpec::from_paths(&["a".into(), "b".into(), "c".into()]),
            Err(MaskError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_derived_name() -> Result<()> {
        let plan = resolve(&OutputSpec::Derived, Compartment::Both, false)?;
        assert_eq!(
            plan.targets(),
            &[OutputTarget {
                path: PathBuf::from("/data/cell_both_0.5.png"),
                rendering: Rendering::Combined,
            }]
        );
        Ok(())
    }

    #[test]
    fn test_derived_name_keeps_decimal_on_whole_resolution() -> Result<()> {
        let path = derived_path(Path::new("imgs/cell.tif"), Compartment::WholeCell, 1.0)?;
        assert_eq!(path, PathBuf::from("imgs/cell_whole-cell_1.0.tif"));
        Ok(())
    }

    #[test]
    fn test_separate_names_for_extensionless_source() -> Result<()> {
        let plan = OutputPlan::resolve(
            &OutputSpec::Derived,
            Path::new("data/cell"),
            Compartment::Both,
            true,
            0.5,
        )?;
        assert_eq!(
            plan.paths(),
            vec![
                PathBuf::from("data/cell_both_0.5_nuclear_cell"),
                PathBuf::from("data/cell_both_0.5_whole-cell_cell"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_single_compartment_reads_channel_zero() -> Result<()> {
        for compartment in [Compartment::Nuclear, Compartment::WholeCell] {
            let plan = resolve(&OutputSpec::Single("out.png".into()), compartment, false)?;
            assert_eq!(
                plan.targets(),
                &[OutputTarget {
                    path: PathBuf::from("out.png"),
                    rendering: Rendering::Grayscale { channel: 0 },
                }]
            );
        }
        Ok(())
    }

    #[test]
    fn test_separate_ignored_for_single_compartment() -> Result<()> {
        let plan = resolve(&OutputSpec::Derived, Compartment::Nuclear, true)?;
        assert_eq!(plan.paths(), vec![PathBuf::from("/data/cell_nuclear_0.5.png")]);
        Ok(())
    }

    #[test]
    fn test_separate_derives_two_names() -> Result<()> {
        let plan = resolve(&OutputSpec::Derived, Compartment::Both, true)?;
        assert_eq!(
            plan.targets(),
            &[
                OutputTarget {
                    path: PathBuf::from("/data/cell_both_0.5_nuclear_cell.png"),
                    rendering: Rendering::Grayscale { channel: 1 },
                },
                OutputTarget {
                    path: PathBuf::from("/data/cell_both_0.5_whole-cell_cell.png"),
                    rendering: Rendering::Grayscale { channel: 0 },
                },
            ]
        );

        let plan = resolve(&OutputSpec::Single("out/mask.tif".into()), Compartment::Both, true)?;
        assert_eq!(
            plan.paths(),
            vec![
                PathBuf::from("out/mask_nuclear_cell.tif"),
                PathBuf::from("out/mask_whole-cell_cell.tif"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_pair_used_verbatim() -> Result<()> {
        let spec = OutputSpec::Pair("n.png".into(), "w.png".into());
        let plan = resolve(&spec, Compartment::Both, true)?;
        assert_eq!(plan.paths(), vec![PathBuf::from("n.png"), PathBuf::from("w.png")]);
        Ok(())
    }

    #[test]
    fn test_pair_rejected_outside_separate_both() {
        let spec = OutputSpec::Pair("n.png".into(), "w.png".into());
        for (compartment, separate) in [
            (Compartment::Both, false),
            (Compartment::Nuclear, true),
            (Compartment::WholeCell, false),
        ] {
            assert!(matches!(
                resolve(&spec, compartment, separate),
                Err(MaskError::InvalidConfiguration { .. })
            ));
        }
    }

    #[test]
    fn test_pair_with_same_path_rejected() {
        let spec = OutputSpec::Pair("mask.png".into(), "mask.png".into());
        assert!(matches!(
            resolve(&spec, Compartment::Both, true),
            Err(MaskError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_combined_rendering_scales_and_truncates() -> Result<()> {
        let image = render(&prediction(1.0, 0.5), Rendering::Combined)?.into_rgb8();
        assert_eq!(image.dimensions(), (3, 2));
        assert!(image.pixels().all(|p| *p == Rgb([0, 255, 127])));
        Ok(())
    }

    #[test]
    fn test_grayscale_rendering_casts_without_scaling() -> Result<()> {
        let image = render(&prediction(3.7, 0.9), Rendering::Grayscale { channel: 0 })?;
        let image = image.as_luma8().unwrap();
        assert!(image.pixels().all(|p| p.0 == [3]));

        let image = render(&prediction(3.7, 300.0), Rendering::Grayscale { channel: 1 })?;
        assert!(image.as_luma8().unwrap().pixels().all(|p| p.0 == [255]));
        Ok(())
    }

    #[test]
    fn test_output_format_falls_back_to_png() {
        assert_eq!(output_format(Path::new("a.tif")), ImageFormat::Tiff);
        assert_eq!(output_format(Path::new("a")), ImageFormat::Png);
        assert_eq!(output_format(Path::new("a_both_0.5")), ImageFormat::Png);
    }

    #[test]
    fn test_write_creates_directories_and_leaves_no_temporaries() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let nested = temp_dir.path().join("masks").join("run1");
        let spec = OutputSpec::Pair(nested.join("n.png"), nested.join("w.png"));
        let source = temp_dir.path().join("cell.png");
        let plan = OutputPlan::resolve(&spec, &source, Compartment::Both, true, 0.5)?;

        let written = plan.write(&prediction(0.0, 1.0))?;
        assert_eq!(written, plan.paths());

        let nuclear = image::open(nested.join("n.png"))?.into_luma8();
        assert!(nuclear.pixels().all(|p| p.0 == [1]));
        let whole_cell = image::open(nested.join("w.png"))?.into_luma8();
        assert!(whole_cell.pixels().all(|p| p.0 == [0]));

        let entries = fs::read_dir(&nested)?.count();
        assert_eq!(entries, 2);
        Ok(())
    }

    fn pymask_temporaries(dir: &Path) -> Result<usize> {
        Ok(fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".pymask-"))
            .count())
    }

    #[test]
    fn test_failed_encode_writes_nothing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"not a directory")?;
        let nuclear = temp_dir.path().join("n.png");
        let spec = OutputSpec::Pair(nuclear.clone(), blocker.join("w.png"));
        let source = temp_dir.path().join("cell.png");
        let plan = OutputPlan::resolve(&spec, &source, Compartment::Both, true, 0.5)?;

        assert!(plan.write(&prediction(0.0, 1.0)).is_err());
        assert!(!nuclear.exists());
        assert_eq!(pymask_temporaries(temp_dir.path())?, 0);
        Ok(())
    }

    #[test]
    fn test_failed_rename_removes_new_outputs_only() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let nuclear = temp_dir.path().join("n.png");
        // a non-empty directory cannot be replaced by a file
        let whole_cell = temp_dir.path().join("w.png");
        fs::create_dir(&whole_cell)?;
        fs::write(whole_cell.join("keep"), b"")?;
        let spec = OutputSpec::Pair(nuclear.clone(), whole_cell.clone());
        let source = temp_dir.path().join("cell.png");
        let plan = OutputPlan::resolve(&spec, &source, Compartment::Both, true, 0.5)?;

        assert!(matches!(
            plan.write(&prediction(0.0, 1.0)),
            Err(MaskError::FileSystem { .. })
        ));
        assert!(!nuclear.exists());
        assert_eq!(pymask_temporaries(temp_dir.path())?, 0);

        fs::write(&nuclear, b"previous")?;
        assert!(plan.write(&prediction(0.0, 1.0)).is_err());
        assert!(nuclear.is_file());
        Ok(())
    }
}

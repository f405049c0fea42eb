use clap::{ArgAction, Parser};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::MaskError;

/// Order of the color channels in the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorOrder {
    #[default]
    Rgb,
    Bgr,
}

impl ColorOrder {
    /// Source channels fed to the model, in model order.
    pub const fn channel_indices(self) -> [usize; 2] {
        match self {
            Self::Rgb => [2, 1],
            Self::Bgr => [0, 1],
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rgb => "RGB",
            Self::Bgr => "BGR",
        }
    }
}

impl FromStr for ColorOrder {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RGB" => Ok(Self::Rgb),
            "BGR" => Ok(Self::Bgr),
            _ => Err(MaskError::invalid_configuration(format!(
                "unknown color order `{s}`, expected one of `RGB`, `BGR`"
            ))),
        }
    }
}

impl fmt::Display for ColorOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Biological structure a mask represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compartment {
    Nuclear,
    WholeCell,
    #[default]
    Both,
}

impl Compartment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nuclear => "nuclear",
            Self::WholeCell => "whole-cell",
            Self::Both => "both",
        }
    }
}

impl FromStr for Compartment {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nuclear" => Ok(Self::Nuclear),
            "whole-cell" => Ok(Self::WholeCell),
            "both" => Ok(Self::Both),
            _ => Err(MaskError::invalid_configuration(format!(
                "unknown compartment `{s}`, expected one of `nuclear`, `whole-cell`, `both`"
            ))),
        }
    }
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate nuclear and whole-cell masks for a microscopy image.
#[derive(Parser, Debug, Clone)]
#[command(name = "pymask", version, about, long_about = None)]
pub struct Config {
    /// Image to generate a mask for
    pub image_file: PathBuf,

    /// Output file. Repeat (`-o nuclear.png -o whole-cell.png`) to name both
    /// files with `--separate` and `--compartment both`. If omitted, the name is
    /// derived from the input filename, compartment and resolution.
    #[arg(short, long, action = ArgAction::Append, value_name = "PATH")]
    pub output: Vec<PathBuf>,

    /// Order of the color channels in the source image
    #[arg(short = 'l', long = "colororder", default_value = "RGB", value_parser = parse_color_order)]
    pub color_order: ColorOrder,

    #[arg(short, long, default_value = "both", value_parser = parse_compartment)]
    pub compartment: Compartment,

    /// Write one file per compartment instead of a combined color image
    #[arg(short, long)]
    pub separate: bool,

    /// Physical pixel size in microns per pixel
    #[arg(short, long, default_value_t = 0.5, value_parser = check_resolution)]
    pub resolution: f64,

    /// Config file holding the DeepCell access token
    /// (default: ~/.config/pymask.toml)
    #[arg(long = "config", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Local ONNX export of the Mesmer model; skips the model download
    #[arg(long, value_name = "PATH")]
    pub model_path: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long)]
    pub debug: bool,

    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }
}

fn parse_color_order(s: &str) -> Result<ColorOrder, String> {
    s.parse().map_err(|e: MaskError| e.to_string())
}

fn parse_compartment(s: &str) -> Result<Compartment, String> {
    s.parse().map_err(|e: MaskError| e.to_string())
}

fn check_resolution(s: &str) -> Result<f64, String> {
    let resolution: f64 = s
        .parse()
        .map_err(|_| format!("`{s}` is not a number"))?;
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(format!("resolution must be a positive number, got {s}"));
    }
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["pymask", "cell.png"]).unwrap();
        assert_eq!(config.image_file, PathBuf::from("cell.png"));
        assert!(config.output.is_empty());
        assert_eq!(config.color_order, ColorOrder::Rgb);
        assert_eq!(config.compartment, Compartment::Both);
        assert!(!config.separate);
        assert_eq!(config.resolution, 0.5);
        assert_eq!(config.config_file, None);
        assert!(!config.debug);
        assert_eq!(config.verbose, 0);
    }

    #[test]
    fn test_short_flags() {
        let config = Config::try_parse_from([
            "pymask", "cell.tif", "-o", "mask.png", "-l", "bgr", "-c", "nuclear", "-s", "-r",
            "0.65", "-vv",
        ])
        .unwrap();
        assert_eq!(config.output, vec![PathBuf::from("mask.png")]);
        assert_eq!(config.color_order, ColorOrder::Bgr);
        assert_eq!(config.compartment, Compartment::Nuclear);
        assert!(config.separate);
        assert_eq!(config.resolution, 0.65);
        assert_eq!(config.verbose, 2);
    }

    #[test]
    fn test_output_accepts_pair() {
        let config =
            Config::try_parse_from(["pymask", "cell.png", "-s", "-o", "n.png", "-o", "w.png"])
                .unwrap();
        assert_eq!(
            config.output,
            vec![PathBuf::from("n.png"), PathBuf::from("w.png")]
        );
    }

    #[test]
    fn test_output_before_image_file() {
        let config = Config::try_parse_from(["pymask", "-o", "mask.png", "cell.png"]).unwrap();
        assert_eq!(config.output, vec![PathBuf::from("mask.png")]);
        assert_eq!(config.image_file, PathBuf::from("cell.png"));
    }

    #[test]
    fn test_output_takes_one_value_per_flag() {
        assert!(Config::try_parse_from(["pymask", "-o", "n.png", "w.png", "cell.png"]).is_err());

        // the count is checked when the output layout is resolved
        let config = Config::try_parse_from([
            "pymask", "cell.png", "-o", "a.png", "-o", "b.png", "-o", "c.png",
        ])
        .unwrap();
        assert_eq!(config.output.len(), 3);
    }

    #[test]
    fn test_rejects_unknown_values() {
        assert!(Config::try_parse_from(["pymask", "cell.png", "-l", "GBR"]).is_err());
        assert!(Config::try_parse_from(["pymask", "cell.png", "-c", "cytoplasm"]).is_err());
        assert!(Config::try_parse_from(["pymask", "cell.png", "-r", "0"]).is_err());
        assert!(Config::try_parse_from(["pymask", "cell.png", "-r", "-1.5"]).is_err());
        assert!(Config::try_parse_from(["pymask", "cell.png", "-r", "abc"]).is_err());
    }

    #[test]
    fn test_parse_color_order() {
        assert_eq!("RGB".parse::<ColorOrder>().unwrap(), ColorOrder::Rgb);
        assert_eq!("bgr".parse::<ColorOrder>().unwrap(), ColorOrder::Bgr);
        assert!(matches!(
            "BRG".parse::<ColorOrder>(),
            Err(MaskError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_compartment_names() {
        for compartment in [Compartment::Nuclear, Compartment::WholeCell, Compartment::Both] {
            assert_eq!(
                compartment.as_str().parse::<Compartment>().unwrap(),
                compartment
            );
        }
        assert_eq!(Compartment::WholeCell.to_string(), "whole-cell");
    }
}

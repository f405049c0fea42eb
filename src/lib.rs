pub mod channels;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod fetch;
pub mod logging;
pub mod model;
pub mod output;
pub mod prediction;
pub mod source;
pub mod traits;

pub mod mocks;

use std::path::PathBuf;

pub use config::{ColorOrder, Compartment, Config};
pub use credentials::{AccessToken, Environment, Settings};
pub use errors::{MaskError, Result};
pub use model::MesmerModel;
pub use output::{OutputPlan, OutputSpec};
pub use prediction::Prediction;
pub use source::SourceImage;
pub use traits::*;

use crate::channels::select_channels;
use crate::fetch::{ModelCache, ModelSource};

/// One fully validated mask generation request.
#[derive(Debug, Clone)]
pub struct MaskJob {
    pub image_file: PathBuf,
    pub color_order: ColorOrder,
    pub compartment: Compartment,
    pub resolution: f64,
    pub output: OutputPlan,
}

impl MaskJob {
    /// Validates `config` into a job. Fails before any config or token lookup
    /// if the source image does not exist.
    pub fn from_config(config: &Config) -> Result<Self> {
        if !config.image_file.is_file() {
            return Err(MaskError::file_not_found("Source image", &config.image_file));
        }
        if !config.resolution.is_finite() || config.resolution <= 0.0 {
            return Err(MaskError::invalid_configuration(format!(
                "resolution must be a positive number, got {}",
                config.resolution
            )));
        }

        let spec = OutputSpec::from_paths(&config.output)?;
        let output = OutputPlan::resolve(
            &spec,
            &config.image_file,
            config.compartment,
            config.separate,
            config.resolution,
        )?;

        Ok(Self {
            image_file: config.image_file.clone(),
            color_order: config.color_order,
            compartment: config.compartment,
            resolution: config.resolution,
            output,
        })
    }
}

/// Runs the load, select, predict and write steps against a model.
pub struct MaskGenerator<M: SegmentationModel> {
    model: M,
}

impl<M: SegmentationModel> MaskGenerator<M> {
    pub const fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Returns the paths written, in plan order.
    pub fn generate(&self, job: &MaskJob) -> Result<Vec<PathBuf>> {
        let source = SourceImage::load(&job.image_file)?;
        let batch = select_channels(&source, job.color_order)?;

        tracing::info!(
            image = %job.image_file.display(),
            compartment = %job.compartment,
            image_mpp = job.resolution,
            model_mpp = self.model.model_mpp(),
            "generating mask"
        );
        let raw = self
            .model
            .predict(batch.view(), job.resolution, job.compartment)?;
        let prediction = Prediction::from_batch(raw)?;

        let (height, width) = source.dimensions();
        if prediction.dimensions() != (height, width) {
            return Err(MaskError::Validation {
                field: "prediction".to_string(),
                reason: format!(
                    "is {:?} but the source image is {:?}",
                    prediction.dimensions(),
                    (height, width)
                ),
            });
        }

        job.output.write(&prediction)
    }
}

/// A validated job together with the resolved credentials, ready for the model.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub job: MaskJob,
    pub settings: Settings,
    pub model_source: ModelSource,
}

/// Everything that can fail before the model is loaded: the source image,
/// the output layout, the access token, then the model source.
pub fn prepare(config: &Config, env: &Environment) -> Result<PreparedRun> {
    let job = MaskJob::from_config(config)?;
    let settings = Settings::resolve(config.config_file.as_deref(), env)?;
    let model_source = ModelSource::resolve(config.model_path.as_deref(), &settings.model)?;

    Ok(PreparedRun {
        job,
        settings,
        model_source,
    })
}

/// Full run: prepare, load the Mesmer model, generate and write the masks.
pub fn run(config: &Config, env: &Environment) -> Result<Vec<PathBuf>> {
    let prepared = prepare(config, env)?;

    let cache = ModelCache::new()?;
    let model_path = cache.model_path(&prepared.model_source, &prepared.settings.access_token)?;
    let model = MesmerModel::new(&model_path, config.device_id)?;

    MaskGenerator::new(model).generate(&prepared.job)
}

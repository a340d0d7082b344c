//! Configuration management for focusstack
//!
//! A configuration file describes a batch of jobs. Each job names its working
//! directory, its input subdirectory and an ordered list of stages; stage
//! options fall back to the engine defaults when omitted.

use crate::errors::{Result, StackError};
use crate::focus_stack::{
    AlignConfig, AlignmentEngine, BalanceConfig, BalanceEngine, DepthMapConfig, DepthMapStack,
    FrameActions, FrameSelection, JobRunner, MaskNoise, MaskNoiseConfig, MultiLayer, NoiseConfig,
    NoiseDetection, SequenceConfig, StackJob,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    pub jobs: Vec<JobConfig>,
}

/// One job: a working directory and the stages applied to its input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub working_dir: PathBuf,
    /// Input subdirectory of `working_dir`
    pub input: String,
    #[serde(default)]
    pub selection: FrameSelection,
    pub stages: Vec<StageConfig>,
}

/// Stage options, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    /// Hot pixel map of the input, which the next stage reads again
    NoiseMap {
        name: String,
        output: String,
        #[serde(default)]
        noise: NoiseConfig,
    },
    /// Hot pixel repair, alignment and/or balance driven by the sequencer
    Actions {
        name: String,
        output: String,
        #[serde(default)]
        sequence: SequenceConfig,
        /// `noise_map` is relative to the job's working directory
        #[serde(default)]
        mask_noise: Option<MaskNoiseConfig>,
        #[serde(default)]
        align: Option<AlignConfig>,
        #[serde(default)]
        balance: Option<BalanceConfig>,
    },
    DepthMap {
        name: String,
        output: String,
        #[serde(default)]
        output_name: Option<String>,
        #[serde(default)]
        depth_map: DepthMapConfig,
    },
    /// Every input frame as one page of a TIFF; the next stage reads the same input
    MultiLayer {
        name: String,
        output: String,
        #[serde(default)]
        output_name: Option<String>,
    },
}

impl StageConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::NoiseMap { name, .. }
            | Self::Actions { name, .. }
            | Self::DepthMap { name, .. }
            | Self::MultiLayer { name, .. } => name,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::NoiseMap { noise, .. } => noise.validate(),
            Self::Actions {
                mask_noise,
                align,
                balance,
                ..
            } => {
                if mask_noise.is_none() && align.is_none() && balance.is_none() {
                    return Err(StackError::configuration(
                        format!("stages.{}", self.name()),
                        "no actions",
                    ));
                }
                if let Some(mask_noise) = mask_noise {
                    mask_noise.validate()?;
                }
                if let Some(align) = align {
                    align.validate()?;
                }
                if let Some(balance) = balance {
                    balance.validate()?;
                }
                Ok(())
            }
            Self::DepthMap { depth_map, .. } => depth_map.validate(),
            Self::MultiLayer { .. } => Ok(()),
        }
    }
}

impl JobConfig {
    /// The usual chain: align and balance into `aligned`, then stack into `stacked`.
    pub fn standard(
        name: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        input: impl Into<String>,
        align: bool,
        balance: bool,
    ) -> Self {
        let mut stages = Vec::new();
        if align || balance {
            stages.push(StageConfig::Actions {
                name: "align".to_string(),
                output: "aligned".to_string(),
                sequence: SequenceConfig::default(),
                mask_noise: None,
                align: align.then(AlignConfig::default),
                balance: balance.then(BalanceConfig::default),
            });
        }
        stages.push(StageConfig::DepthMap {
            name: "stack".to_string(),
            output: "stacked".to_string(),
            output_name: None,
            depth_map: DepthMapConfig::default(),
        });
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            input: input.into(),
            selection: FrameSelection::default(),
            stages,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StackError::configuration("jobs.name", "empty"));
        }
        if self.stages.is_empty() {
            return Err(StackError::configuration(format!("jobs.{}.stages", self.name), "empty"));
        }
        if self.selection.resample == 0 {
            return Err(StackError::configuration("resample", 0));
        }
        self.stages.iter().try_for_each(StageConfig::validate)
    }

    pub fn build(&self) -> Result<StackJob> {
        self.validate()?;
        let mut job = StackJob::new(&self.name, &self.working_dir, &self.input)
            .with_selection(self.selection.clone());
        for stage in &self.stages {
            match stage {
                StageConfig::NoiseMap {
                    name,
                    output,
                    noise,
                } => {
                    job.push_stage(Box::new(NoiseDetection::new(name, output, noise.clone())?));
                }
                StageConfig::Actions {
                    name,
                    output,
                    sequence,
                    mask_noise,
                    align,
                    balance,
                } => {
                    let mut actions = FrameActions::new(name, output, sequence.clone());
                    if let Some(mask_noise) = mask_noise {
                        let mut mask_noise = mask_noise.clone();
                        mask_noise.noise_map = self.working_dir.join(&mask_noise.noise_map);
                        actions.push(Box::new(MaskNoise::new(mask_noise)?));
                    }
                    if let Some(align) = align {
                        actions.push(Box::new(AlignmentEngine::new(align.clone())?));
                    }
                    if let Some(balance) = balance {
                        actions.push(Box::new(BalanceEngine::new(balance.clone())?));
                    }
                    job.push_stage(Box::new(actions));
                }
                StageConfig::DepthMap {
                    name,
                    output,
                    output_name,
                    depth_map,
                } => {
                    let mut stack = DepthMapStack::new(name, output, depth_map.clone())?;
                    if let Some(file) = output_name {
                        stack = stack.with_output_name(file);
                    }
                    job.push_stage(Box::new(stack));
                }
                StageConfig::MultiLayer {
                    name,
                    output,
                    output_name,
                } => {
                    let mut layers = MultiLayer::new(name, output);
                    if let Some(file) = output_name {
                        layers = layers.with_output_name(file);
                    }
                    job.push_stage(Box::new(layers));
                }
            }
        }
        Ok(job)
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            jobs: vec![JobConfig::standard("example", "./stack", "frames", true, true)],
        }
    }
}

impl StackConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| StackError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: StackConfig = toml::from_str(&contents).map_err(|e| StackError::Load {
            path: path.to_path_buf(),
            reason: format!("invalid configuration: {}", e),
        })?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StackError::Write {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(|e| StackError::Write {
            path: path.to_path_buf(),
            reason: format!("failed to serialize config: {}", e),
        })?;

        fs::write(path, toml_string).map_err(|e| StackError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("focusstack.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(StackError::configuration("jobs", "empty"));
        }
        self.jobs.iter().try_for_each(JobConfig::validate)
    }

    /// Build a runner holding every configured job
    pub fn runner(&self) -> Result<JobRunner> {
        self.validate()?;
        let mut runner = JobRunner::new();
        for job in &self.jobs {
            runner.add(job.build()?);
        }
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focus_stack::{BorderMode, CorrectionKind, WeightMode};

    #[test]
    fn test_default_config() {
        let config = StackConfig::default();
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].stages.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = StackConfig::default();
        config.jobs[0].stages.clear();
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        if let StageConfig::DepthMap { depth_map, .. } = &mut config.jobs[0].stages[1] {
            depth_map.temperature = 0.0;
        }
        assert!(matches!(config.validate(), Err(StackError::Configuration { .. })));

        assert!(StackConfig { jobs: Vec::new() }.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("focusstack.toml");

        let mut config = StackConfig::default();
        if let StageConfig::Actions { align: Some(align), .. } = &mut config.jobs[0].stages[0] {
            align.border_mode = BorderMode::Constant;
        }
        config.save_to_file(&path).unwrap();

        let loaded = StackConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_toml_format() {
        let toml_string = r#"
            [[jobs]]
            name = "bugs"
            working_dir = "/data/bugs"
            input = "raw"

            [[jobs.stages]]
            kind = "actions"
            name = "align"
            output = "aligned"
            align = { transform = "homography" }
            balance = { correction = "match_hist", channel = "rgb" }

            [[jobs.stages]]
            kind = "depth_map"
            name = "stack"
            output = "stacked"
            depth_map = { map_type = "average", levels = 5 }
        "#;
        let config: StackConfig = toml::from_str(toml_string).unwrap();
        assert!(config.validate().is_ok());
        match &config.jobs[0].stages[0] {
            StageConfig::Actions {
                align: Some(align),
                balance: Some(balance),
                sequence,
                ..
            } => {
                assert_eq!(align.match_threshold, 0.75);
                assert_eq!(balance.correction, CorrectionKind::MatchHist);
                assert!(sequence.step_mode);
            }
            other => panic!("unexpected stage {:?}", other),
        }
        match &config.jobs[0].stages[1] {
            StageConfig::DepthMap { depth_map, .. } => {
                assert_eq!(depth_map.map_type, WeightMode::Average);
                assert_eq!(depth_map.levels, 5);
                assert_eq!(depth_map.kernel_size, 5);
            }
            other => panic!("unexpected stage {:?}", other),
        }
    }

    #[test]
    fn test_unknown_option_value_rejected() {
        let toml_string = r#"
            [[jobs]]
            name = "j"
            working_dir = "."
            input = "in"
            [[jobs.stages]]
            kind = "depth_map"
            name = "stack"
            output = "out"
            depth_map = { energy = "variance" }
        "#;
        assert!(toml::from_str::<StackConfig>(toml_string).is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = StackConfig::load_from_file("nonexistent_file.toml");
        assert_eq!(result.unwrap(), StackConfig::default());
    }

    #[test]
    fn test_build_job() {
        let job = JobConfig::standard("j", ".", "in", false, true).build().unwrap();
        assert_eq!(job.stage_count(), 2);
        let job = JobConfig::standard("j", ".", "in", false, false).build().unwrap();
        assert_eq!(job.stage_count(), 1);
    }

    #[test]
    fn test_noise_stages_from_toml() {
        let toml_string = r#"
            [[jobs]]
            name = "sensor"
            working_dir = "/data/sensor"
            input = "raw"

            [[jobs.stages]]
            kind = "noise_map"
            name = "noise"
            output = "noise-map"
            noise = { channel_thresholds = [10, 12, 14] }

            [[jobs.stages]]
            kind = "actions"
            name = "clean"
            output = "cleaned"
            mask_noise = { method = "median" }

            [[jobs.stages]]
            kind = "multi_layer"
            name = "layers"
            output = "layers"
        "#;
        let config: StackConfig = toml::from_str(toml_string).unwrap();
        assert!(config.validate().is_ok());
        match &config.jobs[0].stages[0] {
            StageConfig::NoiseMap { noise, .. } => {
                assert_eq!(noise.channel_thresholds, vec![10, 12, 14]);
                assert_eq!(noise.file_name, "hot_pixels.png");
            }
            other => panic!("unexpected stage {:?}", other),
        }
        match &config.jobs[0].stages[1] {
            StageConfig::Actions {
                mask_noise: Some(mask_noise),
                align: None,
                ..
            } => {
                assert_eq!(mask_noise.method, crate::focus_stack::Interpolation::Median);
                assert_eq!(mask_noise.kernel_size, 3);
            }
            other => panic!("unexpected stage {:?}", other),
        }
        assert_eq!(config.jobs[0].build().unwrap().stage_count(), 3);

        let mut config = config;
        if let StageConfig::Actions { mask_noise: Some(mask_noise), .. } =
            &mut config.jobs[0].stages[1]
        {
            mask_noise.kernel_size = 4;
        }
        assert!(config.validate().is_err());
    }
}

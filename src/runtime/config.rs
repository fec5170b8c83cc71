use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_ANNOTATION_MARKER: &str = "data-overlay-annotation";
pub const DEFAULT_AUXILIARY_MARKER: &str = "data-overlay-anchor";
pub const DEFAULT_TILE_CLASS: &str = "title-card";
pub const DEFAULT_NAVIGATION_EVENTS: [&str; 2] = ["popstate", "locationchange"];
pub const DEFAULT_ALTERNATE_PATH: &str = "/watch";
pub const DEFAULT_CLEANUP_BATCH_SIZE: usize = 20;
const DEFAULT_URL_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_ANNOTATION_MAX_AGE_SECS: u64 = 10 * 60;
const DEFAULT_HYGIENE_INTERVAL_SECS: u64 = 60;

/// Runtime configuration for the overlay engine.
///
/// All instances must be constructed via [`EngineConfig::builder`] or [`EngineConfig::new`]
/// so invariants are validated before any component observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    annotation_marker: String,
    auxiliary_marker: String,
    tile_classes: Vec<String>,
    navigation_events: Vec<String>,
    alternate_paths: Vec<String>,
    url_poll_interval: Duration,
    cleanup_batch_size: usize,
    metrics_interval: Duration,
    annotation_max_age: Duration,
    hygiene_interval: Duration,
}

pub struct EngineConfigParams {
    pub annotation_marker: String,
    pub auxiliary_marker: String,
    pub tile_classes: Vec<String>,
    pub navigation_events: Vec<String>,
    pub alternate_paths: Vec<String>,
    pub url_poll_interval: Duration,
    pub cleanup_batch_size: usize,
    pub metrics_interval: Duration,
    pub annotation_max_age: Duration,
    pub hygiene_interval: Duration,
}

impl EngineConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: EngineConfigParams) -> Result<Self> {
        let EngineConfigParams {
            annotation_marker,
            auxiliary_marker,
            tile_classes,
            navigation_events,
            alternate_paths,
            url_poll_interval,
            cleanup_batch_size,
            metrics_interval,
            annotation_max_age,
            hygiene_interval,
        } = params;

        let config = Self {
            annotation_marker: trimmed_string(annotation_marker),
            auxiliary_marker: trimmed_string(auxiliary_marker),
            tile_classes: trimmed_all(tile_classes),
            navigation_events: trimmed_all(navigation_events),
            alternate_paths: trimmed_all(alternate_paths),
            url_poll_interval,
            cleanup_batch_size,
            metrics_interval,
            annotation_max_age,
            hygiene_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Attribute that marks every rendered annotation element.
    pub fn annotation_marker(&self) -> &str {
        &self.annotation_marker
    }

    /// Attribute left on anchors by the related anchor affordance.
    pub fn auxiliary_marker(&self) -> &str {
        &self.auxiliary_marker
    }

    /// Classes identifying content tiles in added nodes.
    pub fn tile_classes(&self) -> &[String] {
        &self.tile_classes
    }

    /// The two SPA navigation events routed into navigation handling.
    pub fn navigation_events(&self) -> &[String] {
        &self.navigation_events
    }

    /// Path prefixes of pages that use an alternate presentation.
    pub fn alternate_paths(&self) -> &[String] {
        &self.alternate_paths
    }

    pub fn url_poll_interval(&self) -> Duration {
        self.url_poll_interval
    }

    /// Elements removed between two yields to the host.
    pub fn cleanup_batch_size(&self) -> usize {
        self.cleanup_batch_size
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Age after which the hygiene pass prunes an annotation.
    pub fn annotation_max_age(&self) -> Duration {
        self.annotation_max_age
    }

    /// Interval between scheduled hygiene passes.
    pub fn hygiene_interval(&self) -> Duration {
        self.hygiene_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        ensure_attribute_name(&self.annotation_marker, "annotation_marker")?;
        ensure_attribute_name(&self.auxiliary_marker, "auxiliary_marker")?;
        if self.annotation_marker == self.auxiliary_marker {
            bail!("annotation_marker and auxiliary_marker must differ");
        }

        if self.tile_classes.is_empty() {
            bail!("tile_classes must contain at least one class");
        }
        for class in &self.tile_classes {
            ensure_token(class, "tile_classes")?;
        }

        if self.navigation_events.len() != 2 {
            bail!(
                "navigation_events must name exactly two events, got {}",
                self.navigation_events.len()
            );
        }
        for event in &self.navigation_events {
            ensure_token(event, "navigation_events")?;
        }
        let distinct: HashSet<&String> = self.navigation_events.iter().collect();
        if distinct.len() != self.navigation_events.len() {
            bail!("navigation_events must be distinct");
        }

        for path in &self.alternate_paths {
            if !path.starts_with('/') {
                bail!("alternate_paths entries must start with '/', got {path:?}");
            }
        }

        if self.url_poll_interval.is_zero() {
            bail!("url_poll_interval must be greater than 0");
        }

        if self.cleanup_batch_size == 0 {
            bail!("cleanup_batch_size must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.annotation_max_age.is_zero() {
            bail!("annotation_max_age must be greater than 0");
        }

        if self.hygiene_interval.is_zero() {
            bail!("hygiene_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            annotation_marker: DEFAULT_ANNOTATION_MARKER.to_owned(),
            auxiliary_marker: DEFAULT_AUXILIARY_MARKER.to_owned(),
            tile_classes: vec![DEFAULT_TILE_CLASS.to_owned()],
            navigation_events: DEFAULT_NAVIGATION_EVENTS
                .iter()
                .map(|event| (*event).to_owned())
                .collect(),
            alternate_paths: vec![DEFAULT_ALTERNATE_PATH.to_owned()],
            url_poll_interval: Duration::from_millis(DEFAULT_URL_POLL_INTERVAL_MS),
            cleanup_batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
            annotation_max_age: Duration::from_secs(DEFAULT_ANNOTATION_MAX_AGE_SECS),
            hygiene_interval: Duration::from_secs(DEFAULT_HYGIENE_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EngineConfigBuilder {
    annotation_marker: Option<String>,
    auxiliary_marker: Option<String>,
    tile_classes: Option<Vec<String>>,
    navigation_events: Option<Vec<String>>,
    alternate_paths: Option<Vec<String>>,
    url_poll_interval: Option<Duration>,
    cleanup_batch_size: Option<usize>,
    metrics_interval: Option<Duration>,
    annotation_max_age: Option<Duration>,
    hygiene_interval: Option<Duration>,
}

impl EngineConfigBuilder {
    pub fn annotation_marker(mut self, attribute: impl Into<String>) -> Self {
        self.annotation_marker = Some(attribute.into());
        self
    }

    pub fn auxiliary_marker(mut self, attribute: impl Into<String>) -> Self {
        self.auxiliary_marker = Some(attribute.into());
        self
    }

    pub fn tile_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tile_classes = Some(classes.into_iter().map(Into::into).collect());
        self
    }

    pub fn navigation_events(mut self, first: impl Into<String>, second: impl Into<String>) -> Self {
        self.navigation_events = Some(vec![first.into(), second.into()]);
        self
    }

    pub fn alternate_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternate_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn url_poll_interval(mut self, interval: Duration) -> Self {
        self.url_poll_interval = Some(interval);
        self
    }

    pub fn cleanup_batch_size(mut self, size: usize) -> Self {
        self.cleanup_batch_size = Some(size);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn annotation_max_age(mut self, max_age: Duration) -> Self {
        self.annotation_max_age = Some(max_age);
        self
    }

    pub fn hygiene_interval(mut self, interval: Duration) -> Self {
        self.hygiene_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let params = EngineConfigParams {
            annotation_marker: self.annotation_marker.unwrap_or(defaults.annotation_marker),
            auxiliary_marker: self.auxiliary_marker.unwrap_or(defaults.auxiliary_marker),
            tile_classes: self.tile_classes.unwrap_or(defaults.tile_classes),
            navigation_events: self.navigation_events.unwrap_or(defaults.navigation_events),
            alternate_paths: self.alternate_paths.unwrap_or(defaults.alternate_paths),
            url_poll_interval: self.url_poll_interval.unwrap_or(defaults.url_poll_interval),
            cleanup_batch_size: self
                .cleanup_batch_size
                .unwrap_or(defaults.cleanup_batch_size),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
            annotation_max_age: self
                .annotation_max_age
                .unwrap_or(defaults.annotation_max_age),
            hygiene_interval: self.hygiene_interval.unwrap_or(defaults.hygiene_interval),
        };

        EngineConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn trimmed_all(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(trimmed_string).collect()
}

fn ensure_token(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{field} cannot contain empty entries");
    }
    if value.chars().any(char::is_whitespace) {
        bail!("{field} entries cannot contain whitespace, got {value:?}");
    }
    Ok(())
}

fn ensure_attribute_name(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{field} cannot be empty");
    }
    if value.chars().any(|c| c.is_whitespace() || c == '=' || c == '"') {
        bail!("{field} is not a valid attribute name: {value:?}");
    }
    Ok(())
}

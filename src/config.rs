//! VM configuration.

use std::env;
use std::str::FromStr;

/// Default bound on the call stack.
pub const DEFAULT_MAX_FRAMES: usize = 1024;

/// Default number of live heap objects before the first collection.
pub const DEFAULT_GC_THRESHOLD: usize = 1024;

/// Tunables for one [`crate::vm::Vm`] instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum number of frames, including the module frame.
    pub max_frames: usize,
    /// Live-object count that triggers the first collection. Doubles after
    /// every collection.
    pub gc_threshold: usize,
    /// Collect before every allocating instruction.
    pub gc_stress: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            gc_stress: false,
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `MARROW_MAX_FRAMES`, `MARROW_GC_THRESHOLD`
    /// and `MARROW_GC_STRESS`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max_frames) = env_var("MARROW_MAX_FRAMES") {
            config.max_frames = max_frames;
        }
        if let Some(threshold) = env_var("MARROW_GC_THRESHOLD") {
            config.gc_threshold = threshold;
        }
        if let Ok(stress) = env::var("MARROW_GC_STRESS") {
            config.gc_stress = matches!(stress.as_str(), "1" | "true" | "yes");
        }
        config
    }

    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.max(1);
        self
    }

    pub fn gc_threshold(mut self, threshold: usize) -> Self {
        self.gc_threshold = threshold.max(1);
        self
    }

    pub fn gc_stress(mut self, stress: bool) -> Self {
        self.gc_stress = stress;
        self
    }
}

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_clamps_to_one() {
        let config = VmConfig::new().max_frames(0).gc_threshold(0).gc_stress(true);
        assert_eq!(config.max_frames, 1);
        assert_eq!(config.gc_threshold, 1);
        assert!(config.gc_stress);
    }

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.max_frames, DEFAULT_MAX_FRAMES);
        assert_eq!(config.gc_threshold, DEFAULT_GC_THRESHOLD);
        assert!(!config.gc_stress);
    }
}

//! Configuration for CFG construction, body extraction and ISIL lowering.
//!
//! Provides centralized configuration with sensible defaults. Every section
//! is `#[serde(default)]` so partial JSON documents are accepted.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{IsilError, Result};

/// Master configuration for an analysis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Control-flow graph construction budgets and edge policy.
    pub cfg: CfgConfig,
    /// Raw method body extraction limits.
    pub extraction: ExtractionConfig,
    /// ISIL lowering options.
    pub lowering: LoweringConfig,
    /// Analyze methods on the rayon pool instead of sequentially.
    pub parallel: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cfg: CfgConfig::default(),
            extraction: ExtractionConfig::default(),
            lowering: LoweringConfig::default(),
            parallel: true,
        }
    }
}

impl AnalysisConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AnalysisConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize this configuration as pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.cfg.max_blocks == 0 {
            return Err(IsilError::InvalidConfig(
                "cfg.max_blocks must be at least 1".to_string(),
            ));
        }
        if self.cfg.max_instructions == 0 {
            return Err(IsilError::InvalidConfig(
                "cfg.max_instructions must be at least 1".to_string(),
            ));
        }
        if self.extraction.scan_limit == 0 || self.extraction.max_body_size == 0 {
            return Err(IsilError::InvalidConfig(
                "extraction limits must be non-zero".to_string(),
            ));
        }
        if self.extraction.scan_limit > self.extraction.max_body_size {
            return Err(IsilError::InvalidConfig(format!(
                "extraction.scan_limit ({}) exceeds extraction.max_body_size ({})",
                self.extraction.scan_limit, self.extraction.max_body_size
            )));
        }
        Ok(())
    }
}

/// Control-flow graph construction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CfgConfig {
    /// Maximum number of basic blocks per method.
    pub max_blocks: usize,
    /// Maximum number of decoded instructions per method.
    pub max_instructions: usize,
    /// Close the current block after every call and add a call-return edge.
    pub calls_end_blocks: bool,
    /// End blocks at calls into helpers known never to return.
    pub stop_at_no_return_calls: bool,
}

impl Default for CfgConfig {
    fn default() -> Self {
        Self {
            max_blocks: 4096,
            max_instructions: 100_000,
            calls_end_blocks: false,
            stop_at_no_return_calls: true,
        }
    }
}

/// Raw method body extraction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Upper bound on a body whose size the loader supplied.
    pub max_body_size: usize,
    /// Upper bound on bytes scanned when the body size has to be discovered.
    pub scan_limit: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_body_size: 1024 * 1024,
            scan_limit: 64 * 1024,
        }
    }
}

/// ISIL lowering configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoweringConfig {
    /// Attach key function roles to calls whose target is a known helper.
    pub tag_key_function_calls: bool,
    /// Emit explicit `Nop` nodes for padding/no-op instructions.
    pub emit_nops: bool,
    /// Lower jumps that leave the method as call + return.
    pub expand_tail_calls: bool,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            tag_key_function_calls: true,
            emit_nops: false,
            expand_tail_calls: true,
        }
    }
}

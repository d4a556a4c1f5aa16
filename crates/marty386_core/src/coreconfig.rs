/*
    Marty386
    x86 instruction emulation core

    Copyright 2025 The Marty386 Authors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    ---------------------------------------------------------------------------

    coreconfig.rs

    Definition of the CoreConfig trait, which provides an interface for the
    core to retrieve configuration options, and CpuConfig, a TOML-backed
    implementation of it.

*/

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::cpu_common::{BackendType, CpuModel, RepMode, TraceMode};

pub const DEFAULT_MAX_BLOCK_INSTRUCTIONS: usize = 32;

pub trait CoreConfig {
    fn get_cpu_model(&self) -> CpuModel;
    fn get_cpu_backend(&self) -> BackendType;
    fn get_cpu_rep_mode(&self) -> RepMode;
    fn get_cpu_trace_mode(&self) -> Option<TraceMode>;
    fn get_cpu_trace_on(&self) -> bool;
    fn get_cpu_trace_file(&self) -> Option<PathBuf>;
    fn get_fpu_enabled(&self) -> bool;
    fn get_max_block_instructions(&self) -> usize;
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub backend: BackendType,
    pub rep_mode: RepMode,
    pub trace_mode: Option<TraceMode>,
    pub trace_file: Option<PathBuf>,
    pub fpu: bool,
    pub max_block_instructions: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            model: CpuModel::default(),
            backend: BackendType::default(),
            rep_mode: RepMode::default(),
            trace_mode: None,
            trace_file: None,
            fpu: true,
            max_block_instructions: DEFAULT_MAX_BLOCK_INSTRUCTIONS,
        }
    }
}

/// Configuration files wrap the cpu options in a [cpu] table.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cpu: CpuConfig,
}

impl CpuConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(text).context("Failed to parse cpu configuration")?;
        if file.cpu.max_block_instructions == 0 {
            anyhow::bail!("max_block_instructions must be greater than zero");
        }
        Ok(file.cpu)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Couldn't read configuration file: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid configuration file: {}", path.display()))
    }
}

impl CoreConfig for CpuConfig {
    fn get_cpu_model(&self) -> CpuModel {
        self.model
    }
    fn get_cpu_backend(&self) -> BackendType {
        self.backend
    }
    fn get_cpu_rep_mode(&self) -> RepMode {
        self.rep_mode
    }
    fn get_cpu_trace_mode(&self) -> Option<TraceMode> {
        self.trace_mode
    }
    fn get_cpu_trace_on(&self) -> bool {
        matches!(self.trace_mode, Some(TraceMode::Instruction))
    }
    fn get_cpu_trace_file(&self) -> Option<PathBuf> {
        self.trace_file.clone()
    }
    fn get_fpu_enabled(&self) -> bool {
        self.fpu
    }
    fn get_max_block_instructions(&self) -> usize {
        self.max_block_instructions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let text = r#"
            [cpu]
            model = "Intel80386"
            backend = "Recompiler"
            rep_mode = "Single"
            trace_mode = "Instruction"
            fpu = false
        "#;
        let config = CpuConfig::from_toml(text).unwrap();
        assert_eq!(config.get_cpu_model(), CpuModel::Intel80386);
        assert_eq!(config.get_cpu_backend(), BackendType::Recompiler);
        assert_eq!(config.get_cpu_rep_mode(), RepMode::Single);
        assert!(config.get_cpu_trace_on());
        assert!(!config.get_fpu_enabled());
        assert_eq!(config.get_max_block_instructions(), DEFAULT_MAX_BLOCK_INSTRUCTIONS);
    }

    #[test]
    fn test_defaults() {
        let config = CpuConfig::from_toml("").unwrap();
        assert_eq!(config.get_cpu_model(), CpuModel::Intel80486);
        assert_eq!(config.get_cpu_backend(), BackendType::FastInterpreter);
        assert_eq!(config.get_cpu_rep_mode(), RepMode::Batch);
        assert!(config.get_fpu_enabled());
        assert!(!config.get_cpu_trace_on());
    }

    #[test]
    fn test_bad_config() {
        assert!(CpuConfig::from_toml("[cpu]\nmodel = \"Z80\"").is_err());
        assert!(CpuConfig::from_toml("[cpu]\nmax_block_instructions = 0").is_err());
    }
}

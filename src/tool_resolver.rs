//! # Tool Path Resolver
//!
//! Finds the external tools (`ffmpeg`, `ffprobe`, `exiftool`) the pipeline
//! delegates to. Explicit overrides from the configuration win, then the
//! system `PATH` is searched.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const FFMPEG: &str = "ffmpeg";
pub const FFPROBE: &str = "ffprobe";
pub const EXIFTOOL: &str = "exiftool";

/// Tool path resolver with per-tool overrides
#[derive(Debug, Clone, Default)]
pub struct ToolResolver {
    overrides: HashMap<String, PathBuf>,
}

impl ToolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resolver from the tool overrides in `config`
    pub fn from_config(config: &Config) -> Self {
        let mut resolver = Self::new();
        let overrides = [
            (FFMPEG, &config.ffmpeg_path),
            (FFPROBE, &config.ffprobe_path),
            (EXIFTOOL, &config.exiftool_path),
        ];
        for (name, path) in overrides {
            if let Some(path) = path {
                resolver.set_override(name, path.clone());
            }
        }
        resolver
    }

    pub fn set_override(&mut self, tool_name: &str, path: PathBuf) {
        debug!("Tool override: {} -> {}", tool_name, path.display());
        self.overrides.insert(tool_name.to_string(), path);
    }

    /// Resolve the path to a specific tool
    pub fn resolve(&self, tool_name: &str) -> Option<PathBuf> {
        if let Some(path) = self.overrides.get(tool_name) {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("Configured {} path does not exist: {}", tool_name, path.display());
        }

        let found = Self::find_in_system_path(tool_name);
        if found.is_none() {
            debug!("Tool not found: {}", tool_name);
        }
        found
    }

    /// Resolve a tool or fail with `MissingDependency`
    pub fn require(&self, tool_name: &str) -> Result<PathBuf> {
        self.resolve(tool_name).ok_or_else(|| {
            PipelineError::MissingDependency(format!("{} not found (configure its path or add it to PATH)", tool_name))
        })
    }

    /// Path to invoke: the resolved one, or the bare name so spawn errors surface
    pub fn command(&self, tool_name: &str) -> PathBuf {
        self.resolve(tool_name).unwrap_or_else(|| PathBuf::from(tool_name))
    }

    /// Find tool in system PATH
    fn find_in_system_path(tool_name: &str) -> Option<PathBuf> {
        let extension = if cfg!(windows) { ".exe" } else { "" };
        let tool_with_ext = format!("{}{}", tool_name, extension);

        env::split_paths(&env::var_os("PATH")?)
            .map(|dir| dir.join(&tool_with_ext))
            .find(|path| Self::is_executable(path))
    }

    fn is_executable(path: &Path) -> bool {
        path.is_file()
    }
}

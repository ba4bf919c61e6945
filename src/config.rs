// Copyright 2025 Fernando Borretti
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::read_to_string;
use std::path::Path;
use std::path::PathBuf;

use cardsmith_core::config::PipelineConfig;
use serde::Deserialize;

use crate::error::Fallible;
use crate::error::fail;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "cardsmith.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub generator: GeneratorConfig,
    pub store: StoreConfig,
}

/// The external program that answers capability requests. It receives the
/// request on stdin and must print its answer on stdout.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: PathBuf::from("cardsmith.db"),
        }
    }
}

impl Config {
    /// Load the given file, or the default file if it exists, or defaults.
    pub fn load(path: Option<&str>) -> Fallible<Self> {
        let config = match path {
            Some(path) => {
                let path = Path::new(path);
                if !path.exists() {
                    return fail(format!("config file {} does not exist.", path.display()));
                }
                Self::parse(&read_to_string(path)?)?
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::parse(&read_to_string(DEFAULT_CONFIG_FILE)?)?
            }
            None => Config::default(),
        };
        config.pipeline.validate()?;
        if config.generator.command.trim().is_empty() {
            return fail("generator.command must not be empty.");
        }
        Ok(config)
    }

    pub fn parse(text: &str) -> Fallible<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use cardsmith_core::registry::CardFormat;
    use cardsmith_core::registry::ContentModule;

    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() -> Fallible<()> {
        let config = Config::parse("")?;
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.generator.command, "claude");
        assert_eq!(config.store.path, PathBuf::from("cardsmith.db"));
        Ok(())
    }

    #[test]
    fn test_sections() -> Fallible<()> {
        let config = Config::parse(
            r#"
            [pipeline]
            max_attempts = 5
            default_format = "cloze"

            [pipeline.formats]
            code = ["basic"]

            [generator]
            command = "llm"
            args = ["--model", "local"]

            [store]
            path = "/tmp/runs.db"
            "#,
        )?;
        assert_eq!(config.pipeline.max_attempts, 5);
        assert_eq!(config.pipeline.default_format, CardFormat::Cloze);
        assert_eq!(config.pipeline.formats_for(ContentModule::Code), vec![CardFormat::Basic]);
        assert_eq!(config.generator.args, vec!["--model", "local"]);
        assert_eq!(config.store.path, PathBuf::from("/tmp/runs.db"));
        Ok(())
    }

    #[test]
    fn test_unknown_section_is_an_error() {
        assert!(Config::parse("[server]\nport = 1").is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(Config::load(Some("/definitely/not/here.toml")).is_err());
    }
}

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

//! A text generator backed by an external command.

use std::process::Stdio;

use cardsmith_core::capability::GenerationRequest;
use cardsmith_core::capability::TextGenerator;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::GeneratorConfig;
use crate::error::Fallible;
use crate::error::fail;

/// Runs the configured command once per request, writing the prompt to its
/// stdin. The child is killed if the call is dropped, which is what
/// happens when the orchestrator's timeout fires.
pub struct CommandGenerator {
    command: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        CommandGenerator {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

pub fn render_prompt(request: &GenerationRequest) -> String {
    format!("{}\n\n{}\n", request.instruction, request.input)
}

impl TextGenerator for CommandGenerator {
    async fn generate(&self, request: GenerationRequest) -> Fallible<String> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(render_prompt(&request).as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return fail(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8(output.stdout)?)
    }
}

//! Command line assembly
//!
//! `[execshell] <selfpath>/<selfexec> [flags sorted by key] [inputdir] [outputdir]`
//!
//! Flags are ordered by parameter name, not declaration order, so the same
//! parameter set always yields the same invocation.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CharmError, Result};
use crate::params::{ParameterValue, TypedValue};
use crate::record::PluginDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Single string for a remote shell, quoting where needed
    pub fn to_shell_string(&self) -> String {
        self.argv()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./=:,@%+-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Builder for a plugin invocation
pub struct CommandBuilder<'a> {
    plugin: &'a PluginDescriptor,
    parameters: Vec<ParameterValue>,
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(plugin: &'a PluginDescriptor) -> Self {
        Self {
            plugin,
            parameters: Vec::new(),
            input_dir: None,
            output_dir: None,
        }
    }

    pub fn parameters(mut self, values: &[ParameterValue]) -> Self {
        self.parameters = values.to_vec();
        self
    }

    pub fn input_dir(mut self, dir: Option<&Path>) -> Self {
        self.input_dir = dir.map(Path::to_path_buf);
        self
    }

    pub fn output_dir(mut self, dir: Option<&Path>) -> Self {
        self.output_dir = dir.map(Path::to_path_buf);
        self
    }

    pub fn build(mut self) -> Result<CommandLine> {
        if self.plugin.selfexec.trim().is_empty() {
            return Err(CharmError::config(format!(
                "plugin '{}' has no executable (selfexec)",
                self.plugin.name
            )));
        }
        let exec = Path::new(&self.plugin.selfpath)
            .join(&self.plugin.selfexec)
            .to_string_lossy()
            .to_string();

        let mut argv: Vec<String> = self
            .plugin
            .execshell
            .split_whitespace()
            .map(str::to_string)
            .collect();
        argv.push(exec);

        self.parameters.sort_by(|a, b| a.name.cmp(&b.name));
        for param in &self.parameters {
            let def = self.plugin.parameter(&param.name).ok_or_else(|| {
                CharmError::validation(format!(
                    "plugin '{}' declares no parameter '{}'",
                    self.plugin.name, param.name
                ))
            })?;
            if def.param_type != param.value.param_type() {
                return Err(CharmError::validation(format!(
                    "parameter '{}' is declared {} but holds {}",
                    param.name,
                    def.param_type,
                    param.value.param_type()
                )));
            }
            match &param.value {
                TypedValue::Boolean(true) => argv.push(def.flag()),
                TypedValue::Boolean(false) => {}
                value => {
                    argv.push(def.flag());
                    argv.push(value.to_string());
                }
            }
        }

        for dir in [&self.input_dir, &self.output_dir].into_iter().flatten() {
            argv.push(dir.to_string_lossy().to_string());
        }

        let program = argv.remove(0);
        Ok(CommandLine {
            program,
            args: argv,
        })
    }
}

//! The canonical dashboard pipeline as data.
//!
//! Layer order is base, working directory, manifest copy, dependency
//! install, source copy. Everything above the source copy only changes when
//! the manifest does, so editing the app never reinstalls dependencies.

use crate::builder::parser::{Instruction, PortSpec, Protocol, Recipe, RunCommand};
use crate::config::Config;
use crate::ports::ServeEndpoint;

/// Inputs for the default dashboard recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardRecipe {
    /// Base runtime reference
    pub base: String,
    /// Absolute working directory inside the image
    pub workdir: String,
    /// Dependency manifest path, relative to the build context
    pub manifest: String,
    /// Application entry file, relative to the working directory
    pub entry: String,
    /// Dashboard runner invocation preceding the entry file
    pub runner: Vec<String>,
    pub endpoint: ServeEndpoint,
}

impl Default for DashboardRecipe {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DashboardRecipe {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config.default_base.clone(),
            workdir: "/app".to_string(),
            manifest: config.manifest_path.clone(),
            entry: "app.py".to_string(),
            runner: vec!["streamlit".to_string(), "run".to_string()],
            endpoint: config.endpoint(),
        }
    }

    /// Install command for the manifest. `--no-cache-dir` keeps the package
    /// cache out of the layer.
    pub fn install_command(&self) -> String {
        format!("pip install --no-cache-dir -r {}", self.manifest)
    }

    /// Full launch argument vector: runner, entry file, bind flags.
    pub fn launch_argv(&self) -> Vec<String> {
        let mut argv = self.runner.clone();
        argv.push(self.entry.clone());
        argv.extend(self.endpoint.bind_flags());
        argv
    }

    pub fn into_recipe(self) -> Recipe {
        let instructions = vec![
            Instruction::From { image: self.base.clone(), platform: None },
            Instruction::Workdir { path: self.workdir.clone() },
            Instruction::Copy { sources: vec![self.manifest.clone()], destination: ".".to_string(), chown: None },
            Instruction::Run { command: RunCommand::Shell(self.install_command()) },
            Instruction::Copy { sources: vec![".".to_string()], destination: ".".to_string(), chown: None },
            Instruction::Expose { ports: vec![PortSpec { port: self.endpoint.port, protocol: Protocol::Tcp }] },
            Instruction::Cmd { command: RunCommand::Exec(self.launch_argv()) },
        ];

        Recipe { base: self.base, instructions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::parser::parse_recipe;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_default_recipe_text() {
        let text = DashboardRecipe::default().into_recipe().render();
        let expected = "FROM python:3.11-slim\n\
WORKDIR /app\n\
COPY requirements.txt .\n\
RUN pip install --no-cache-dir -r requirements.txt\n\
COPY . .\n\
EXPOSE 8501\n\
CMD [\"streamlit\", \"run\", \"app.py\", \"--server.port=8501\", \"--server.address=0.0.0.0\"]\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_rendered_recipe_parses_back() {
        let recipe = DashboardRecipe::default().into_recipe();
        assert_eq!(parse_recipe(&recipe.render()).unwrap(), recipe);
    }

    #[test]
    fn test_port_flows_into_expose_and_cmd() {
        let recipe = DashboardRecipe {
            endpoint: ServeEndpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9100),
            ..DashboardRecipe::default()
        };
        let text = recipe.into_recipe().render();
        assert!(text.contains("EXPOSE 9100\n"));
        assert!(text.contains("--server.port=9100"));
        assert!(!text.contains("8501"));
    }
}

//! Shared fixtures: a store, a local base runtime and a dashboard project.

#![allow(dead_code)]

use slipway_core::builder::{build_image_with, BuildOptions, BuildReport, LocalBaseSource};
use slipway_core::config::IsolationMode;
use slipway_core::{Config, ImageReference, StorePaths};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const IMAGE: &str = "dash:test";

pub struct Fixture {
    pub temp: TempDir,
    pub paths: StorePaths,
    pub config: Config,
}

impl Fixture {
    /// A project whose install step appends a line to `install.log` outside
    /// the build context, so re-executions can be counted.
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let paths = StorePaths::new(temp.path().join("store"));
        let config = Config { isolation: IsolationMode::Host, ..Config::default() };

        let base = temp.path().join("bases/testbase/1/rootfs");
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::write(base.join("etc/os-release"), "ID=test\n").unwrap();

        let fixture = Self { temp, paths, config };
        fs::create_dir_all(fixture.context()).unwrap();
        fixture.write("requirements.txt", "streamlit==1.30.0\npandas>=2.0\n");
        fixture.write("app.py", "import streamlit as st\nst.title('Sales')\n");
        fixture.write_recipe(&format!(
            "RUN echo installed >> {log} && mkdir -p site && cp requirements.txt site/installed.txt",
            log = fixture.install_log().display()
        ));
        fixture
    }

    pub fn context(&self) -> PathBuf {
        self.temp.path().join("project")
    }

    pub fn bases(&self) -> PathBuf {
        self.temp.path().join("bases")
    }

    pub fn install_log(&self) -> PathBuf {
        self.temp.path().join("install.log")
    }

    /// Number of times the install step has executed.
    pub fn installs(&self) -> usize {
        fs::read_to_string(self.install_log()).map(|s| s.lines().count()).unwrap_or(0)
    }

    pub fn write(&self, name: &str, content: &str) {
        let path = self.context().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn remove(&self, name: &str) {
        fs::remove_file(self.context().join(name)).unwrap();
    }

    /// Dashboard recipe with `install` as the dependency install step.
    pub fn write_recipe(&self, install: &str) {
        self.write_recipe_with_cmd(install, r#"CMD ["sh", "app.sh"]"#);
    }

    pub fn write_recipe_with_cmd(&self, install: &str, cmd: &str) {
        let recipe = format!(
            "FROM testbase:1\nWORKDIR /app\nCOPY requirements.txt .\n{install}\nCOPY . .\nEXPOSE 8501\n{cmd}\n"
        );
        self.write("Dockerfile", &recipe);
    }

    pub fn reference(&self) -> ImageReference {
        ImageReference::parse(IMAGE).unwrap()
    }

    pub async fn build(&self) -> slipway_core::Result<BuildReport> {
        let options = BuildOptions::new(self.context(), self.reference());
        let mut base = LocalBaseSource::new(self.bases());
        build_image_with(options, &self.config, &self.paths, &mut base, None).await
    }
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path).unwrap_or_default().lines().map(String::from).collect()
}

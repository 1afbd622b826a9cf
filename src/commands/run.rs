// Copyright (c) 2024 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::{fs::File, io::BufReader, os::unix::io::IntoRawFd, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

use crate::{
    engine::{registered, CommonConfig, Engine},
    starter::{launch, ImageFd, ImageFile},
    utils::StageErr,
};

/// Run a container and wait for it to exit
#[derive(Parser, Debug)]
pub struct Run {
    /// Container configuration in JSON.
    #[arg(short, long)]
    pub config: PathBuf,
    /// Engine name, overrides the configuration.
    #[arg(short, long)]
    pub engine: Option<String>,
    /// Container id, overrides the configuration.
    #[arg(long)]
    pub id: Option<String>,
    /// Image kept open by the master until host cleanup.
    #[arg(long)]
    pub image: Option<PathBuf>,
    /// Process arguments, override the configuration.
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl Run {
    fn common_config(&self) -> Result<CommonConfig> {
        let file = File::open(&self.config)
            .with_context(|| StageErr::OpenFile(self.config.display().to_string()))?;
        let mut common: CommonConfig = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", self.config.display()))?;

        if let Some(engine) = &self.engine {
            common.engine_name = engine.clone();
        }
        if let Some(id) = &self.id {
            common.container_id = id.clone();
        }
        if self.image.is_some() {
            common.image = self.image.clone();
        }
        if !self.args.is_empty() {
            common.args = self.args.clone();
        }
        Ok(common)
    }

    fn open_image(common: &CommonConfig) -> Result<Option<Box<dyn ImageFile>>> {
        match &common.image {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| StageErr::OpenFile(path.display().to_string()))?;
                Ok(Some(Box::new(ImageFd(file.into_raw_fd()))))
            }
            None => Ok(None),
        }
    }

    pub fn run(&self) -> Result<()> {
        let common = self.common_config()?;
        let image = Self::open_image(&common)?;
        debug!(
            "Looking up {} engine in {:?}",
            common.engine_name,
            registered().collect::<Vec<_>>()
        );
        let engine = Engine::new(common)?;
        match launch(engine, image)? {}
    }
}

#[cfg(test)]
mod tests {
    use std::fs::write;

    use super::*;
    use crate::utils::test_utils::fixture_dir;

    const CONFIG: &str = r#"{
        "engineName": "native",
        "containerID": "c1",
        "args": ["/bin/true"],
        "engineConfig": {"namespaces": ["pid"]}
    }"#;

    #[test]
    fn test_run_args() {
        let run = Run::try_parse_from([
            "run", "--config", "c.json", "-e", "fakeroot", "--", "/bin/sh", "-c", "true",
        ])
        .unwrap();
        assert_eq!(run.config, PathBuf::from("c.json"));
        assert_eq!(run.engine.as_deref(), Some("fakeroot"));
        assert_eq!(run.args, vec!["/bin/sh", "-c", "true"]);

        assert!(Run::try_parse_from(["run"]).is_err());
    }

    #[test]
    fn test_common_config_overrides() {
        let dir = fixture_dir("run_common_config");
        let path = dir.join("config.json");
        write(&path, CONFIG).unwrap();

        let run = Run::try_parse_from(["run", "--config", path.to_str().unwrap()]).unwrap();
        let common = run.common_config().unwrap();
        assert_eq!(common.engine_name, "native");
        assert_eq!(common.args, vec!["/bin/true"]);

        let run = Run::try_parse_from([
            "run",
            "--config",
            path.to_str().unwrap(),
            "--id",
            "c2",
            "--",
            "/bin/false",
        ])
        .unwrap();
        let common = run.common_config().unwrap();
        assert_eq!(common.container_id, "c2");
        assert_eq!(common.args, vec!["/bin/false"]);
        assert_eq!(common.engine_config["namespaces"][0], "pid");
    }

    #[test]
    fn test_common_config_errors() {
        let dir = fixture_dir("run_common_config_errors");
        let run = Run::try_parse_from(["run", "-c", dir.join("missing.json").to_str().unwrap()])
            .unwrap();
        assert!(run
            .common_config()
            .unwrap_err()
            .to_string()
            .starts_with("Failed to open"));

        let path = dir.join("bad.json");
        write(&path, "{\"engineName\": \"native\"}").unwrap();
        let run = Run::try_parse_from(["run", "-c", path.to_str().unwrap()]).unwrap();
        assert!(run
            .common_config()
            .unwrap_err()
            .to_string()
            .starts_with("Failed to parse"));
    }

    #[test]
    fn test_unknown_engine() {
        let dir = fixture_dir("run_unknown_engine");
        let path = dir.join("config.json");
        write(&path, CONFIG).unwrap();
        let run = Run::try_parse_from(["run", "-c", path.to_str().unwrap(), "-e", "oci"]).unwrap();
        let err = run.run().unwrap_err();
        assert_eq!(err.to_string(), "no engine registered with name oci");
    }
}

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

use std::{
    fs::{File, OpenOptions},
    io::{stderr, Write},
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
    process::exit,
    sync::Mutex,
};

use anyhow::{Context, Result};
use chrono::Local;
use log::{error, set_boxed_logger, set_max_level, Level, LevelFilter, Log, Metadata, Record};
use nix::unistd::{getpid, gettid};

use super::StageErr;

/// Exit code of a process which hit a fatal error.
pub const FATAL_EXIT_CODE: i32 = 255;

fn open_log_file(path: &PathBuf) -> Result<File> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o640)
        .open(path)
        .with_context(|| StageErr::OpenFile(path.to_string_lossy().to_string()))
}

fn level_from_env() -> Level {
    match std::env::var("OZSTAGE_LOG_LEVEL") {
        Ok(level) => match level.to_lowercase().as_str() {
            "error" => Level::Error,
            "warn" => Level::Warn,
            "info" => Level::Info,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            _ => Level::Info,
        },
        _ => Level::Info,
    }
}

struct Logger {
    handler: Mutex<Box<dyn Write + Send>>,
    level: Level,
}

impl Logger {
    fn new(path: &Option<PathBuf>, level: Level) -> Result<Self> {
        let handler = match path {
            Some(p) => Box::new(open_log_file(p)?) as Box<dyn Write + Send>,
            None => Box::new(stderr()) as Box<dyn Write + Send>,
        };
        Ok(Self {
            handler: Mutex::new(handler),
            level,
        })
    }

    fn format(record: &Record) -> String {
        format!(
            "{}: [{}][{}][{}: {}]:{}: {}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S:%9f"),
            getpid(),
            gettid(),
            record.file().unwrap_or(""),
            record.line().unwrap_or(0),
            record.level(),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let fmt_msg = Self::format(record);
        // A poisoned lock only means another thread panicked while logging.
        let mut handler = match self.handler.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = handler.write_all(fmt_msg.as_bytes()) {
            eprintln!("Failed to log message: {:?}", e);
        }
    }

    fn flush(&self) {
        if let Ok(mut handler) = self.handler.lock() {
            let _ = handler.flush();
        }
    }
}

pub fn init(path: &Option<PathBuf>, debug: bool) -> Result<()> {
    let log_level = if debug {
        Level::Debug
    } else {
        level_from_env()
    };

    let logger = Box::new(Logger::new(path, log_level)?);
    set_boxed_logger(logger)
        .map(|_| set_max_level(LevelFilter::Trace))
        .with_context(|| "Logger has been already set")?;
    Ok(())
}

/// Log `err` with its whole context chain and terminate with the fatal exit code.
pub fn fatal(err: &anyhow::Error) -> ! {
    error!("{:#}", err);
    log::logger().flush();
    exit(FATAL_EXIT_CODE);
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{read_to_string, remove_file},
        path::Path,
    };

    use log::info;
    use nix::{
        sys::wait::{waitpid, WaitStatus},
        unistd::{fork, ForkResult},
    };
    use rusty_fork::rusty_fork_test;

    use super::*;

    rusty_fork_test! {
        #[test]
        fn test_logger_init() {
            let path = PathBuf::from("/tmp/ozstage-logger-init.log");
            let _ = remove_file(&path);

            init(&Some(path.clone()), false).unwrap();
            info!("container stage ready");
            log::logger().flush();

            let content = read_to_string(&path).unwrap();
            assert!(content.contains(":INFO: container stage ready"));
            assert!(content.contains(&format!("[{}]", getpid())));
            // A second logger can't be installed.
            assert!(init(&None, true).is_err());
            remove_file(Path::new(&path)).unwrap();
        }

        #[test]
        fn test_logger_level() {
            let path = PathBuf::from("/tmp/ozstage-logger-level.log");
            let _ = remove_file(&path);

            std::env::set_var("OZSTAGE_LOG_LEVEL", "warn");
            init(&Some(path.clone()), false).unwrap();
            info!("hidden message");
            log::warn!("visible message");
            log::logger().flush();

            let content = read_to_string(&path).unwrap();
            assert!(!content.contains("hidden message"));
            assert!(content.contains(":WARN: visible message"));
            remove_file(Path::new(&path)).unwrap();
        }

        #[test]
        fn test_fatal_exit_code() {
            // SAFETY: the child only logs and exits.
            match unsafe { fork() }.unwrap() {
                ForkResult::Child => fatal(&anyhow::anyhow!("unrecoverable")),
                ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
                    WaitStatus::Exited(_, code) => assert_eq!(code, FATAL_EXIT_CODE),
                    status => panic!("Unexpected child status {:?}", status),
                },
            }
        }
    }
}

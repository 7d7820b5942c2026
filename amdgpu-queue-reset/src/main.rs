// AMD GPU queue reset verification harness
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    convert::TryFrom,
    ffi::OsString,
    path::{Path, PathBuf},
    process::exit,
    time::Duration,
};

use amdgpu_queue_reset::{
    catalog::OutcomeRule, device::IpType, list_tests, ring::SubmitPath, start_background,
    start_deadlock_suite, start_harness, BackgroundMode, ConfigError, DriverKind, HarnessConfig,
    Timing, DEFAULT_DEVICE,
};
use clap::{Parser, ValueEnum};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use log::{error, info};
use serde::Deserialize;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
enum CliError {
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Which side of the launcher/background split this process is.
#[derive(ValueEnum, Debug, Copy, Clone, Default, Eq, PartialEq)]
enum ProcessRole {
    #[default]
    Launcher,
    /// Submits good jobs for a launcher; started by the launcher itself.
    Background,
}

#[derive(ValueEnum, Debug, Copy, Clone, Default, Eq, PartialEq)]
enum Suite {
    /// Fault injection rounds with a recovery monitor.
    #[default]
    QueueReset,
    /// Hang and deadlock scenarios, one ring at a time.
    Deadlock,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None, args_override_self = true)]
struct HarnessArgs {
    /// DRM render node of the GPU under test.
    #[clap(short, long, default_value = DEFAULT_DEVICE)]
    device: PathBuf,

    /// Driver behind the device
    #[clap(long, value_enum, default_value = "amdgpu")]
    driver: DriverKind,

    /// How good jobs reach the GPU
    #[clap(short, long, value_enum, default_value = "kernel")]
    submit_path: SubmitPath,

    /// Comma separated list of IP blocks to inject faults into
    #[clap(
        short,
        long,
        value_enum,
        value_delimiter = ',',
        default_values = ["gfx", "compute", "dma"]
    )]
    ips: Vec<IpType>,

    /// Comma separated list of catalog entries, all of them if omitted
    #[clap(short, long, value_delimiter = ',')]
    tests: Vec<String>,

    #[clap(long, value_enum, default_value = "queue-reset")]
    suite: Suite,

    /// Comma separated list of hang scenarios, all of them if omitted
    #[clap(long, value_delimiter = ',')]
    scenarios: Vec<String>,

    /// How long the monitor waits for a reset, in milliseconds
    #[clap(long, default_value_t = 30_000)]
    reset_timeout_ms: u64,

    #[clap(long, default_value_t = 10)]
    monitor_poll_ms: u64,

    #[clap(long, default_value_t = 100)]
    role_poll_ms: u64,

    /// Where the good job submitter runs
    #[clap(long, value_enum, default_value = "process")]
    background: BackgroundMode,

    #[clap(long, value_enum, default_value = "launcher", hide = true)]
    role: ProcessRole,

    /// Print the rounds and scenarios that would run and exit
    #[clap(long)]
    list: bool,

    /// YAML file whose settings take precedence over the command line
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    device: Option<PathBuf>,
    driver: Option<DriverKind>,
    submit_path: Option<SubmitPath>,
    ips: Option<Vec<IpType>>,
    tests: Option<Vec<String>>,
    scenarios: Option<Vec<String>>,
    reset_timeout_ms: Option<u64>,
    monitor_poll_ms: Option<u64>,
    role_poll_ms: Option<u64>,
    background: Option<BackgroundMode>,
    sysfs_root: Option<PathBuf>,
    debugfs_root: Option<PathBuf>,
    #[serde(default)]
    outcome_rules: Vec<OutcomeRule>,
}

impl HarnessArgs {
    fn parse_config(&self) -> Result<ConfigFile, CliError> {
        match &self.config {
            Some(path) => Figment::new()
                .merge(Yaml::file(path))
                .extract()
                .map_err(|e| CliError::ConfigParse(Box::new(e))),
            None => Ok(ConfigFile::default()),
        }
    }
}

/// Everything a run needs after the file and the command line are merged.
#[derive(Debug)]
struct Settings {
    config: HarnessConfig,
    scenarios: Vec<String>,
}

impl TryFrom<&HarnessArgs> for Settings {
    type Error = CliError;

    fn try_from(args: &HarnessArgs) -> Result<Self, CliError> {
        let file = args.parse_config()?;
        let ms = |file: Option<u64>, arg: u64| Duration::from_millis(file.unwrap_or(arg));
        let timing = Timing {
            reset_timeout: ms(file.reset_timeout_ms, args.reset_timeout_ms),
            monitor_poll: ms(file.monitor_poll_ms, args.monitor_poll_ms),
            role_poll: ms(file.role_poll_ms, args.role_poll_ms),
        };

        let mut config = HarnessConfig::new(
            file.driver.unwrap_or(args.driver),
            file.device.unwrap_or_else(|| args.device.clone()),
            file.submit_path.unwrap_or(args.submit_path),
            file.ips.unwrap_or_else(|| args.ips.clone()),
            file.tests.as_deref().unwrap_or(&args.tests),
            timing,
            file.background.unwrap_or(args.background),
        )?
        .with_outcome_rules(&file.outcome_rules)?;
        if let Some(root) = file.sysfs_root {
            config = config.with_sysfs_root(root);
        }
        if let Some(root) = file.debugfs_root {
            config = config.with_debugfs_root(root);
        }

        Ok(Self {
            config,
            scenarios: file.scenarios.unwrap_or_else(|| args.scenarios.clone()),
        })
    }
}

fn run(args: &HarnessArgs, settings: &Settings) -> i32 {
    if args.list {
        for line in list_tests(&settings.config) {
            println!("{line}");
        }
        return 0;
    }

    let result = match (args.role, args.suite) {
        (ProcessRole::Background, _) => start_background(&settings.config).map(|()| 0),
        (ProcessRole::Launcher, Suite::QueueReset) => {
            let child_args: Vec<OsString> = std::env::args_os().skip(1).collect();
            start_harness(&settings.config, &child_args).map(|summary| {
                for report in &summary.reports {
                    println!("{report}");
                }
                println!("{summary}");
                summary.exit_code()
            })
        }
        (ProcessRole::Launcher, Suite::Deadlock) => {
            start_deadlock_suite(&settings.config, &settings.scenarios).map(|summary| {
                for (scenario, result) in &summary.results {
                    match result {
                        Ok(result) => println!("{scenario}: {result:?}"),
                        Err(e) => println!("{scenario}: {e}"),
                    }
                }
                println!("{summary}");
                summary.exit_code()
            })
        }
    };

    result.unwrap_or_else(|e| {
        error!("{e}");
        1
    })
}

fn main() {
    env_logger::init();

    let args = HarnessArgs::parse();
    let settings = match Settings::try_from(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };
    if let Some(path) = args.config.as_deref().map(Path::display) {
        info!("Settings from {path} override the command line");
    }

    exit(run(&args, &settings));
}

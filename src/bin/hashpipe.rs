// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Host binary entry point: install logging, register bundled modules,
// parse the CLI, run the pipeline.

use std::process::ExitCode;

use hashpipe::{parse_args, register_module, HostConfig, ParsedCli};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    for descriptor in hashpipe::modules::all() {
        if let Err(e) = register_module(descriptor) {
            eprintln!("hashpipe: {e}");
            return ExitCode::FAILURE;
        }
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = match parse_args(&args, HostConfig::default()) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("hashpipe: {e}");
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        ParsedCli::Help(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        ParsedCli::List(names) => {
            for name in names {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
        ParsedCli::Run(host) => match host.run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("hashpipe: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

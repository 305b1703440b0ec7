//
// brexos2pmc8 - PMC8 protocol bridge for the Bresser EXOS-2 GoTo mount
// Copyright (c) 2024 the brexos2pmc8 developers
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Command-line argument parsing.
//!

mod cmdline {
    pub const DEVICE: &str = "device";
    pub const PORT: &str = "port";
    pub const CONSOLE: &str = "cli";
    pub const ENABLE_LOGGING: &str = "log";
}

pub struct Args {
    pub device: String,
    pub port: u16,
    pub console: bool,
    pub logging: bool
}

impl Default for Args {
    fn default() -> Args {
        Args{
            device: "/dev/ttyUSB0".to_string(),
            port: 8888,
            console: false,
            logging: false
        }
    }
}

pub fn parse_command_line<I: Iterator<Item=String>>(stream: I) -> Args {
    const ALLOWED_OPTIONS: [&str; 4] = [
        cmdline::DEVICE,
        cmdline::PORT,
        cmdline::CONSOLE,
        cmdline::ENABLE_LOGGING
    ];

    // values given per option; a switch with no values gets an empty list
    let mut options = std::collections::HashMap::<String, Vec<String>>::new();
    let mut last_option: Option<String> = None;

    for arg in stream.skip(1) {
        if let Some(name) = arg.strip_prefix("--") {
            if !ALLOWED_OPTIONS.contains(&name) {
                eprintln!("Unrecognized option: --{}.", name);
                return Args::default();
            }

            options.entry(name.to_string()).or_default();
            last_option = Some(name.to_string());
        } else if let Some(name) = &last_option {
            options.entry(name.clone()).or_default().push(arg);
        } else {
            eprintln!("Stray argument: {}.", arg);
            return Args::default();
        }
    }

    let defaults = Args::default();

    Args{
        device: options.get(cmdline::DEVICE)
            .and_then(|values| values.last().cloned())
            .unwrap_or(defaults.device),
        port: options.get(cmdline::PORT)
            .and_then(|values| values.last())
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.port),
        console: options.contains_key(cmdline::CONSOLE),
        logging: options.contains_key(cmdline::ENABLE_LOGGING)
    }
}

//
// brexos2pmc8 - PMC8 protocol bridge for the Bresser EXOS-2 GoTo mount
// Copyright (c) 2024 the brexos2pmc8 developers
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Entry point of the `brexos2pmc8` executable.
//!

mod args;
mod cli;
mod mount;
mod pmc8;

fn init_logging(log_to_file: bool) {
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![
        simplelog::TermLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto
        )
    ];

    if log_to_file {
        let file_name = format!("brexos2pmc8_{}.log", chrono::Local::now().format("%Y-%m-%d_%H%M%S"));
        match std::fs::File::create(&file_name) {
            Ok(file) => loggers.push(simplelog::WriteLogger::new(
                simplelog::LevelFilter::Debug,
                simplelog::Config::default(),
                file
            )),

            Err(e) => eprintln!("Failed to create log file {}: {}.", file_name, e)
        }
    }

    if simplelog::CombinedLogger::init(loggers).is_err() {
        eprintln!("Failed to initialize logging.");
    }
}

fn main() {
    let args = args::parse_command_line(std::env::args());
    init_logging(args.logging);

    log::info!("connecting to mount on {}", args.device);

    let mut mount = match mount::connect(&args.device) {
        Ok(mount) => mount,
        Err(e) => {
            eprintln!("Cannot connect to mount: {:?}", e);
            std::process::exit(1);
        }
    };

    mount.start_manager();

    if args.console {
        cli::run(&mount);
    } else {
        let mut server = pmc8::Pmc8Server::new(&mount);
        if let Err(e) = server.run(args.port) {
            log::error!("PMC8 server failed: {}", e);
            std::process::exit(1);
        }
    }
}

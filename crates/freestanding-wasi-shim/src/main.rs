//! A freestanding runner for the WASI shim, for offline development.
//!
//! ## About
//!
//! The WASM binary to execute is passed with the `--program` flag, and the
//! host directory served to it as `/` with `--root`.  The program's standard
//! output and error go to those of this process, and the program's exit code
//! becomes this process's exit code.
//!
//! To see verbose output of what is happening, set `RUST_LOG=info` before
//! executing.  With `--strace`, every host call is logged under the `strace`
//! target.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction};
use log::*;
use std::{fs, path::PathBuf, time::Instant};
use wasi_shim::{execute, HostFileSystem, Options};

////////////////////////////////////////////////////////////////////////////////
// Constants.
////////////////////////////////////////////////////////////////////////////////

/// About freestanding-wasi-shim.
const ABOUT: &str = "freestanding-wasi-shim: runs a WASM program against the WASI shim, serving \
                     a host directory as the program's flat filesystem.  This can be used to \
                     test and develop WASM programs offline.";
/// The name of the application.
const APPLICATION_NAME: &str = "freestanding-wasi-shim";
/// The authors list.
const AUTHORS: &str = "The Veracruz Development Team.";
/// Application version number.
const VERSION: &str = env!("CARGO_PKG_VERSION");

////////////////////////////////////////////////////////////////////////////////
// Command line options and parsing.
////////////////////////////////////////////////////////////////////////////////

/// A struct capturing all of the command line options passed to the program.
struct CommandLineOptions {
    /// The WASM program to execute.
    program: PathBuf,
    /// The host directory served as `/`.
    root: PathBuf,
    /// The runtime options handed to the shim.
    options: Options,
}

/// Splits `VAR=VAL`.
fn parse_environment_variable(entry: &str) -> Result<(String, String)> {
    let n = entry
        .find('=')
        .ok_or_else(|| anyhow!("Expecting VAR=VAL for --env, but found '{}'", entry))?;
    Ok((entry[0..n].to_string(), entry[n + 1..].to_string()))
}

/// Parses the command line options, building a `CommandLineOptions` struct out
/// of them.  If required options are not present, or if any options are
/// malformed, this will abort the program.
fn parse_command_line() -> Result<CommandLineOptions> {
    let matches = clap::Command::new(APPLICATION_NAME)
        .version(VERSION)
        .author(AUTHORS)
        .about(ABOUT)
        .arg(
            Arg::new("program")
                .short('p')
                .long("program")
                .value_name("FILE")
                .help("The WASM program to execute.")
                .required(true),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("DIRECTORY")
                .help("The host directory served to the program as `/`.")
                .default_value("."),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help(
                    "A JSON file of runtime options.  Options given on the command line are \
                     applied on top of it.",
                ),
        )
        .arg(
            Arg::new("stdin-file")
                .long("stdin-file")
                .value_name("FILE")
                .help("A file whose contents are queued on the program's stdin."),
        )
        .arg(
            Arg::new("arg")
                .long("arg")
                .value_name("ARG")
                .help("A command-line argument for the program.  May be repeated.")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .help("Specify an environment variable and value (VAR=VAL).")
                .value_name("VAR=VAL")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("disable-clock")
                .long("disable-clock")
                .help(
                    "Make clock functions (`clock_getres()`, `clock_gettime()`) fail and report \
                     file timestamps as zero.",
                )
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("strace")
                .long("strace")
                .help("Enable strace-like output for WASI calls.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    info!("Parsed command line.");

    let program = matches
        .get_one::<String>("program")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("No program provided"))?;
    let root = matches
        .get_one::<String>("root")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut options = match matches.get_one::<String>("config") {
        Some(path) => {
            info!("Loading options from '{}'.", path);
            Options::from_json(&fs::read_to_string(path)?)?
        }
        None => Options::default(),
    };
    if let Some(path) = matches.get_one::<String>("stdin-file") {
        options.stdin.extend(fs::read(path)?);
    }
    if let Some(args) = matches.get_many::<String>("arg") {
        options.program_arguments.extend(args.cloned());
    }
    if let Some(entries) = matches.get_many::<String>("env") {
        for entry in entries {
            options
                .environment_variables
                .push(parse_environment_variable(entry)?);
        }
    }
    if matches.get_flag("disable-clock") {
        options.enable_clock = false;
    }
    if matches.get_flag("strace") {
        options.enable_strace = true;
    }

    Ok(CommandLineOptions {
        program,
        root,
        options,
    })
}

/// Entry: reads the command line, loads the program and runs it, exiting
/// with the program's exit code.
fn main() -> Result<()> {
    env_logger::init();
    let cmdline = parse_command_line()?;
    info!("Command line read successfully.");

    let program = fs::read(&cmdline.program)
        .map_err(|e| anyhow!("Failed to read program {:?}: {}", cmdline.program, e))?;
    info!(
        "Serving {:?} as the root directory of {:?}.",
        cmdline.root, cmdline.program
    );

    let main_time = Instant::now();
    let exit_code = execute(HostFileSystem::new(cmdline.root), program, cmdline.options)?;
    info!(
        "Program returned {} in {} micro seconds.",
        exit_code,
        main_time.elapsed().as_micros()
    );

    std::process::exit(exit_code as i32);
}

use std::path::Path;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use vm::{Machine, load_image};

const USAGE: &str = "usage: um-vm <image> [--jit | --print-ir]

Runs a big-endian 32-bit word bytecode image.

options:
  --jit        translate instructions to native code (default)
  --print-ir   emit intermediate representation instead of running
               (not part of this build)
  -h, --help   print this help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Jit,
    PrintIr,
}

#[derive(Debug, PartialEq, Eq)]
struct CliConfig {
    image: Option<String>,
    backend: Backend,
    help: bool,
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut config = CliConfig { image: None, backend: Backend::Jit, help: false };
    for arg in args {
        match arg.as_str() {
            "--jit" => config.backend = Backend::Jit,
            "--print-ir" => config.backend = Backend::PrintIr,
            "-h" | "--help" => config.help = true,
            other if other.starts_with('-') => {
                return Err(format!("unknown option: {other}"));
            }
            path => {
                if config.image.is_some() {
                    return Err(format!("unexpected extra argument: {path}"));
                }
                config.image = Some(path.to_string());
            }
        }
    }
    Ok(config)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match parse_cli_args(&args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    if config.help {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }
    if config.backend == Backend::PrintIr {
        eprintln!("the --print-ir backend is not part of this build\n\n{USAGE}");
        return ExitCode::from(2);
    }
    let Some(image) = config.image else {
        eprintln!("missing image path\n\n{USAGE}");
        return ExitCode::from(2);
    };

    let words = match load_image(Path::new(&image)) {
        Ok(words) => words,
        Err(err) => {
            tracing::error!(%image, %err, "failed to load image");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(%image, words = words.len(), "loaded image");

    let mut machine = match Machine::new(&words) {
        Ok(machine) => machine,
        Err(err) => {
            tracing::error!(%err, "failed to initialize the machine");
            return ExitCode::FAILURE;
        }
    };
    match machine.run() {
        Ok(status) => ExitCode::from(status as u8),
        Err(err) => {
            tracing::error!(%err, "machine stopped with a fault");
            ExitCode::FAILURE
        }
    }
}

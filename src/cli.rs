use std::env;
use std::process;

/// Options given on the command line
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliArgs {
    /// Path to log file (None for stdout)
    pub log_file: Option<String>,
    /// Path to the JSON config file
    pub config_file: String,
    /// Run a single poll cycle and exit
    pub once: bool,
}

/// What the command line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Run(CliArgs),
    Help,
    Version,
}

/// Prints usage instructions for the program.
pub fn print_usage() {
    println!(
        "Usage: {} [-h] [-v] [-o] [-l logfile] config_file",
        crate::PROGRAM_NAME
    );
    println!("  -h          show this help");
    println!("  -v          show version");
    println!("  -o          run one poll cycle and exit");
    println!("  -l logfile  append log lines to logfile instead of stdout");
    println!(
        "Credentials may be supplied via {} and {}.",
        crate::config::ENV_USER,
        crate::config::ENV_PASSWORD
    );
}

/// Parses an argument list (without the program name)
///
/// # Errors
/// A message describing the first invalid or missing argument.
pub fn parse_from<I>(args: I) -> Result<CliCommand, String>
where
    I: IntoIterator<Item = String>,
{
    let mut log_file = None;
    let mut config_file = None;
    let mut once = false;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => return Ok(CliCommand::Help),
            "-v" => return Ok(CliCommand::Version),
            "-o" => once = true,
            "-l" => {
                log_file = Some(
                    args.next()
                        .ok_or_else(|| "Missing log file argument".to_string())?,
                )
            }
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config_file.is_none() {
                    config_file = Some(arg);
                } else {
                    return Err(format!("Unexpected argument: {}", arg));
                }
            }
        }
    }

    let config_file = config_file.ok_or_else(|| "Missing config file argument".to_string())?;
    Ok(CliCommand::Run(CliArgs {
        log_file,
        config_file,
        once,
    }))
}

/// Parses process arguments, exiting on `-h`, `-v` or invalid input
pub fn parse_args() -> CliArgs {
    match parse_from(env::args().skip(1)) {
        Ok(CliCommand::Run(args)) => args,
        Ok(CliCommand::Help) => {
            print_usage();
            process::exit(0);
        }
        Ok(CliCommand::Version) => {
            println!("{} version {}", crate::PROGRAM_NAME, crate::PROGRAM_VERSION);
            process::exit(0);
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            print_usage();
            process::exit(1);
        }
    }
}

const USAGE: &str = "\
Archivist — self-hosted backup orchestrator

USAGE:
    archivist [OPTIONS]

OPTIONS:
    -h, --help               Print this help message and exit
    -v, --version            Print version and exit
        --root <DIR>         Root data directory            [/data]
        --port <PORT>        HTTP listen port               [8080]
        --log-level <LEVEL>  Log level                      [info]

ENVIRONMENT:
    ARCHIVIST_ROOT           Root data directory            [/data]
    ARCHIVIST_PORT           HTTP listen port               [8080]
    ARCHIVIST_LOG_LEVEL      Log level (debug, info, warn, error)

LAYOUT (under the root directory):
    config/config.json       Backends, tasks, and settings
    config/archivist.db      Execution history database
    temp/                    Scratch space for archive artifacts
    sources/                 Default location for relative source paths
";

pub fn print_usage() {
    print!("{USAGE}");
}

pub fn print_version(version: &str) {
    println!("archivist {version}");
}

fn handle_cli_flags_from_args(args: &[String], version: &str) -> bool {
    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return true;
            }
            "-v" | "--version" => {
                print_version(version);
                return true;
            }
            _ => {}
        }
    }
    false
}

/// Check CLI args for --help/-h or --version/-v.
/// Returns `true` if a flag was handled (caller should exit).
pub fn handle_cli_flags(version: &str) -> bool {
    let args: Vec<String> = std::env::args().skip(1).collect();
    handle_cli_flags_from_args(&args, version)
}

#[cfg(test)]
mod tests {
    use super::handle_cli_flags_from_args;

    #[test]
    fn handle_cli_flags_recognizes_help() {
        let args = vec!["--help".to_string()];
        assert!(handle_cli_flags_from_args(&args, "1.0.0"));
    }

    #[test]
    fn handle_cli_flags_recognizes_version() {
        let args = vec!["-v".to_string()];
        assert!(handle_cli_flags_from_args(&args, "1.0.0"));
    }

    #[test]
    fn handle_cli_flags_ignores_unrelated_args() {
        let args = vec!["--root".to_string(), "/data".to_string()];
        assert!(!handle_cli_flags_from_args(&args, "1.0.0"));
    }
}

//! Command-line argument parsing for duskbell

/// Parse command line arguments
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Args {
    pub watch: bool,
    pub validate: bool,
    pub dry_run: bool,
    pub preview: bool,
    pub help: bool,
}

pub fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from(&args)
}

/// Parse an argv-style list (first element is the program name)
pub fn parse_args_from(args: &[String]) -> Args {
    let mut result = Args::default();

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--once" => result.watch = false,
            "--watch" => result.watch = true,
            "--validate" => result.validate = true,
            "--dry-run" => result.dry_run = true,
            "--preview" => result.preview = true,
            "--help" | "-h" => result.help = true,
            _ => {}
        }
    }

    result
}

pub fn print_help() {
    println!("duskbell - weekly sunset-relative notifications\n");
    println!("USAGE:");
    println!("    duskbell [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --once          Check every rule once and exit (default)");
    println!("    --watch         Keep running, checking before each scheduled minute");
    println!("    --dry-run       Log messages instead of delivering them; cache is not saved");
    println!("    --preview       Print the next announced time for each rule and exit");
    println!("    --validate      Validate configuration and rules, then exit");
    println!("    --help, -h      Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    DUSKBELL_RULES                Rules file (default: channels.json)");
    println!("    DUSKBELL_CACHE                Dedupe cache file (default: .cache.json)");
    println!("    DUSKBELL_NOTIFY_CMD           Delivery command, run once per due rule");
    println!("    DUSKBELL_NOTIFY_TIMEOUT_SECS  Per-attempt delivery timeout (default: 30)");
    println!("    DUSKBELL_POLL_SECS            Max sleep between checks in --watch (default: 300)");
}

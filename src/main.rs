#![warn(
    clippy::explicit_into_iter_loop,
    clippy::explicit_iter_loop,
    clippy::if_then_some_else_none,
    clippy::implicit_clone,
    clippy::redundant_else,
    clippy::single_match_else,
    clippy::try_err,
    clippy::unreadable_literal
)]

use std::process::ExitCode;

use ctenv::cli;

fn main() -> ExitCode {
    let args = cli::parse();
    cli::init_logging(args.verbose, args.quiet);
    match cli::run(args) {
        // The runtime child's exit code is ours, including 128+N for
        // signal deaths.
        Ok(code) => ExitCode::from((code & 0xff) as u8),
        Err(err) => {
            let mut causes = err.chain();
            eprintln!("error: {}", causes.next().expect("error chains are never empty"));
            for cause in causes {
                eprintln!("  caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}

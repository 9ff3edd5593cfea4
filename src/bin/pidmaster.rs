use std::process::ExitCode;

fn main() -> ExitCode {
    pidmaster::pm::logging::init();
    pidmaster::pm::cli::run()
}

use std::process::ExitCode;

fn main() -> ExitCode {
    crmsight_cli::run()
}

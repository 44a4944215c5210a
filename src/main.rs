use std::process::ExitCode;

fn main() -> ExitCode {
    match snapferry::run() {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("snapferry: {e:#}");
            ExitCode::FAILURE
        }
    }
}

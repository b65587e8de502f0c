use std::process::ExitCode;

fn main() -> ExitCode {
    match heaprun::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn main() {
    if let Err(error) = run() {
        libknit::error::report_error_and_exit(&error)
    }
}

fn run() -> libknit::error::Result {
    let action = libknit::args::Action::parse(std::env::args().skip(1))?;
    libknit::run(&action)
}

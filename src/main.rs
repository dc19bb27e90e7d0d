use faketree::config::types::SETUP_EXIT_CODE;

fn main() {
    match faketree::cli::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            log::error!("FAILED: {err:#}");
            std::process::exit(SETUP_EXIT_CODE);
        }
    }
}
